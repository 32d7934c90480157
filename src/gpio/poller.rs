// Copyright (c) 2017-2018 Rene van der Meer
//
// Permission is hereby granted, free of charge, to any person obtaining a
// copy of this software and associated documentation files (the "Software"),
// to deal in the Software without restriction, including without limitation
// the rights to use, copy, modify, merge, publish, distribute, sublicense,
// and/or sell copies of the Software, and to permit persons to whom the
// Software is furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in
// all copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL
// THE AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
// FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
// DEALINGS IN THE SOFTWARE.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::gpio::epoll::{epoll_event, Epoll, EventFd, EPOLLERR, EPOLLET, EPOLLIN, EPOLLPRI};
use crate::gpio::{Error, Level, Result, TriggerState};

// Readiness events are identified by pin number. The stop signal uses an id
// that can't collide with a pin.
const STOP_ID: u64 = u64::MAX;
const MAX_EVENTS: usize = 16;

/// Receives readiness descriptors of pins with edge detection enabled.
///
/// [`GpioPort`] registers its value descriptor and [`TriggerState`] after edge
/// detection is fully configured, and deregisters after the descriptor has been
/// closed and the pin unexported. Implementations typically watch the
/// descriptors on a separate thread, so `register` and `deregister` must be
/// safe to call while that thread is waiting.
///
/// A descriptor that was closed before `deregister` is called should be treated
/// as "stop watching", not as an error. Its descriptor number may already
/// belong to another file by then, so implementations should only read from it through
/// [`TriggerState::while_watching`], which `GpioPort` disarms before closing.
///
/// [`GpioPort`]: struct.GpioPort.html
/// [`TriggerState`]: struct.TriggerState.html
/// [`TriggerState::while_watching`]: struct.TriggerState.html#method.while_watching
pub trait EventRegistry: fmt::Debug + Send + Sync {
    /// Starts watching `value` for readiness on behalf of `pin`.
    fn register(&self, pin: u8, value: RawFd, trigger: Arc<TriggerState>) -> Result<()>;

    /// Stops watching `pin`.
    fn deregister(&self, pin: u8);
}

#[derive(Debug)]
struct Registration {
    fd: RawFd,
    trigger: Arc<TriggerState>,
}

#[derive(Debug)]
struct Shared {
    poll: Epoll,
    registrations: Mutex<HashMap<u8, Registration>>,
}

impl Shared {
    fn registrations(&self) -> MutexGuard<'_, HashMap<u8, Registration>> {
        self.registrations.lock().unwrap_or_else(|e| e.into_inner())
    }

    // Handles a readiness event on `pin` that occurred at `now`. Returns the
    // level passed to the callback if the trigger was accepted. Unknown pins,
    // closing descriptors and failed reads are skipped.
    fn dispatch<C>(&self, pin: u8, now: Instant, callback: &mut C) -> Option<Level>
    where
        C: FnMut(u8, Level),
    {
        let (fd, trigger) = match self.registrations().get(&pin) {
            Some(registration) => (registration.fd, registration.trigger.clone()),
            None => return None,
        };

        // Reading the value also clears the pending event
        let level = match trigger.while_watching(|| read_level(fd)) {
            Some(Ok(level)) => level,
            Some(Err(e)) => {
                debug!("Stopped watching pin {}: {}", pin, e);
                return None;
            }
            None => {
                trace!("Skipping event for closed pin {}", pin);
                return None;
            }
        };

        if !trigger.accept(now) {
            return None;
        }

        trace!("Pin {} triggered ({})", pin, level);
        callback(pin, level);

        Some(level)
    }
}

/// Watches the value descriptors of any number of pins on a single background
/// thread, and executes a callback for every accepted edge trigger.
///
/// Each readiness event is run through the pin's [`TriggerState`] before the
/// callback is called with the pin number and its current logic level, so
/// spurious initial events and events within the bounce time are filtered out.
///
/// The thread is stopped when `EventPoller` goes out of scope.
///
/// [`TriggerState`]: struct.TriggerState.html
pub struct EventPoller {
    shared: Arc<Shared>,
    poll_thread: Option<thread::JoinHandle<Result<()>>>,
    tx: EventFd,
}

impl EventPoller {
    /// Starts the poller thread.
    ///
    /// The callback closure or function pointer is called with the pin number
    /// and the pin's [`Level`] at the time the trigger was read. It runs on the
    /// poller thread, so slow callbacks delay triggers on all other pins.
    ///
    /// [`Level`]: enum.Level.html
    pub fn new<C>(mut callback: C) -> Result<EventPoller>
    where
        C: FnMut(u8, Level) + Send + 'static,
    {
        let shared = Arc::new(Shared {
            poll: Epoll::new()?,
            registrations: Mutex::new(HashMap::new()),
        });

        // rx becomes readable when stop() calls notify()
        let tx = EventFd::new()?;
        shared.poll.add(tx.fd(), STOP_ID, EPOLLERR | EPOLLET | EPOLLIN)?;

        let poll_thread = thread::spawn({
            let shared = shared.clone();
            move || -> Result<()> {
                let mut events = [epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
                loop {
                    let num_events = shared.poll.wait(&mut events, None)?;
                    for event in &events[0..num_events] {
                        let id = event.u64;
                        if id == STOP_ID {
                            return Ok(()); // stop() asked us to exit
                        }

                        shared.dispatch(id as u8, Instant::now(), &mut callback);
                    }
                }
            }
        });

        debug!("Started event poller thread");

        Ok(EventPoller {
            shared,
            poll_thread: Some(poll_thread),
            tx,
        })
    }

    /// Returns `true` if `pin` is currently registered.
    pub fn is_registered(&self, pin: u8) -> bool {
        self.shared.registrations().contains_key(&pin)
    }

    /// Stops the poller thread, and blocks until it exits.
    ///
    /// Normally, this method is automatically called when `EventPoller` goes out
    /// of scope.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(poll_thread) = self.poll_thread.take() {
            self.tx.notify()?;

            match poll_thread.join() {
                Ok(r) => r?,
                Err(_) => return Err(Error::ThreadPanic),
            }

            debug!("Stopped event poller thread");
        }

        Ok(())
    }
}

impl EventRegistry for EventPoller {
    fn register(&self, pin: u8, value: RawFd, trigger: Arc<TriggerState>) -> Result<()> {
        let mut registrations = self.shared.registrations();

        // Triggering an edge sets error and priority
        self.shared
            .poll
            .add(value, u64::from(pin), EPOLLERR | EPOLLET | EPOLLPRI)?;
        registrations.insert(pin, Registration { fd: value, trigger });
        debug!("Registered pin {} (fd {})", pin, value);

        Ok(())
    }

    fn deregister(&self, pin: u8) {
        // The kernel drops the descriptor from the epoll interest list when
        // it's closed, so only our bookkeeping needs to be updated. Calling
        // EPOLL_CTL_DEL here could hit a recycled descriptor number.
        if self.shared.registrations().remove(&pin).is_some() {
            debug!("Deregistered pin {}", pin);
        }
    }
}

impl Drop for EventPoller {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!("Failed to stop event poller thread: {}", e);
        }
    }
}

impl fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPoller")
            .field("shared", &self.shared)
            .field("poll_thread", &self.poll_thread)
            .field("tx", &self.tx)
            .finish()
    }
}

fn read_level(fd: RawFd) -> io::Result<Level> {
    let mut buffer = [0u8; 1];

    let len = parse_retval!(unsafe {
        libc::pread(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), 0)
    })?;

    if len == 0 {
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    match &buffer {
        b"0" => Ok(Level::Low),
        _ => Ok(Level::High),
    }
}
