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

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

pub(crate) use libc::{epoll_event, EPOLLERR, EPOLLET, EPOLLIN, EPOLLPRI};

pub(crate) type Result<T> = std::result::Result<T, io::Error>;

// Wakes up the poller thread while it's blocked in epoll_wait().
#[derive(Debug)]
pub(crate) struct EventFd {
    fd: RawFd,
}

impl EventFd {
    pub(crate) fn new() -> Result<EventFd> {
        Ok(EventFd {
            fd: parse_retval!(unsafe {
                libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE | libc::EFD_CLOEXEC)
            })?,
        })
    }

    pub(crate) fn notify(&self) -> Result<()> {
        let buffer: u64 = 1;

        parse_retval!(unsafe {
            libc::write(
                self.fd,
                &buffer as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        })?;

        Ok(())
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for EventFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[derive(Debug)]
pub(crate) struct Epoll {
    fd: RawFd,
}

impl Epoll {
    pub(crate) fn new() -> Result<Epoll> {
        Ok(Epoll {
            fd: parse_retval!(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?,
        })
    }

    pub(crate) fn add(&self, fd: RawFd, id: u64, event_mask: i32) -> Result<()> {
        let mut event = epoll_event {
            events: event_mask as u32,
            u64: id,
        };

        parse_retval!(unsafe { libc::epoll_ctl(self.fd, libc::EPOLL_CTL_ADD, fd, &mut event) })?;

        Ok(())
    }

    pub(crate) fn wait(
        &self,
        events: &mut [epoll_event],
        timeout: Option<Duration>,
    ) -> Result<usize> {
        if events.is_empty() {
            return Ok(0);
        }

        let timeout: i32 = if let Some(duration) = timeout {
            duration.as_millis().min(i32::MAX as u128) as i32
        } else {
            -1
        };

        loop {
            match parse_retval!(unsafe {
                libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as i32, timeout)
            }) {
                Ok(num_events) => return Ok(num_events as usize),
                // Retry when a signal handler interrupted the wait
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_wakes_epoll() {
        let poll = Epoll::new().unwrap();
        let event_fd = EventFd::new().unwrap();
        poll.add(event_fd.fd(), 7, EPOLLIN | EPOLLET).unwrap();

        let mut events = [epoll_event { events: 0, u64: 0 }; 4];
        assert_eq!(
            poll.wait(&mut events, Some(Duration::from_millis(0))).unwrap(),
            0
        );

        event_fd.notify().unwrap();
        assert_eq!(
            poll.wait(&mut events, Some(Duration::from_millis(100))).unwrap(),
            1
        );

        let id = events[0].u64;
        assert_eq!(id, 7);
    }

    #[test]
    fn regular_files_are_rejected() {
        let file = tempfile::tempfile().unwrap();
        let poll = Epoll::new().unwrap();

        use std::os::unix::io::AsRawFd;
        assert!(poll.add(file.as_raw_fd(), 0, EPOLLPRI | EPOLLERR).is_err());
    }
}
