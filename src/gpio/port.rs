// Copyright (c) 2017-2019 Rene van der Meer
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

use std::fmt;
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use super::mem::{GPCLR0, GPEDS0, GPFEN0, GPFSEL0, GPHEN0, GPLEN0, GPLEV0, GPREN0, GPSET0};
use super::sysfs::{Direction, Sysfs};
use super::{
    Edge, EventRegistry, Level, Mode, PullUpDown, RegisterMap, Result, TriggerState, GPIO_MAX_PINS,
};

// The datasheet asks for 150 cycles between setting and clearing a GPEDS bit.
const EVENT_CLEAR_SPINS: u32 = 150;

/// Progress of a pin through the sysfs edge detection lifecycle.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum SysfsState {
    /// The pin isn't exported by this port.
    Unexported,
    /// The pin is exported, but its direction hasn't been set yet.
    Exported,
    /// The pin's direction has been written to sysfs.
    DirectionSet,
    /// The pin's edge is configured and its value descriptor is open.
    EdgeMonitoring,
}

impl fmt::Display for SysfsState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            SysfsState::Unexported => write!(f, "Unexported"),
            SysfsState::Exported => write!(f, "Exported"),
            SysfsState::DirectionSet => write!(f, "DirectionSet"),
            SysfsState::EdgeMonitoring => write!(f, "EdgeMonitoring"),
        }
    }
}

/// A single GPIO pin.
///
/// `GpioPort` offers two ways to work with a pin. Register-level methods like
/// [`set_value`], [`value`] and [`event_detected`] directly access the GPIO
/// registers, and can be called from tight loops. [`add_edge_detect`] and
/// [`remove_edge_detect`] configure edge detection through sysfs, and hand the
/// pin's value descriptor to an [`EventRegistry`] so another thread can wait for
/// edges without busy-polling.
///
/// The pin's mode and pull-up/pull-down state are applied when the port is
/// constructed. When the port goes out of scope, any active edge detection is
/// removed and, if [`reset_on_drop`] is set to `true` (default), the pin is reset
/// to [`Input`] with its pull-up/pull-down resistors disabled.
///
/// Register-level methods rely on the [`RegisterMap`] for locking. [`GpioMem`]
/// serializes read-modify-writes per register word, and holds the shared
/// pull-up/pull-down control register for the entire pull-up/pull-down
/// sequence, so ports can be configured from different threads.
///
/// [`set_value`]: #method.set_value
/// [`value`]: #method.value
/// [`event_detected`]: #method.event_detected
/// [`add_edge_detect`]: #method.add_edge_detect
/// [`remove_edge_detect`]: #method.remove_edge_detect
/// [`EventRegistry`]: trait.EventRegistry.html
/// [`reset_on_drop`]: #method.set_reset_on_drop
/// [`Input`]: enum.Mode.html#variant.Input
/// [`RegisterMap`]: trait.RegisterMap.html
/// [`GpioMem`]: struct.GpioMem.html
#[derive(Debug)]
pub struct GpioPort {
    pin: u8,
    direction: Mode,
    pull: PullUpDown,
    edge: Edge,
    state: SysfsState,
    value: Option<File>,
    trigger: Arc<TriggerState>,
    regs: Arc<dyn RegisterMap>,
    sysfs: Sysfs,
    events: Option<Arc<dyn EventRegistry>>,
    reset_on_drop: bool,
}

impl GpioPort {
    /// Constructs a new `GpioPort`, and applies `pull` and `mode` to the pin.
    ///
    /// `regs` and `events` are shared with the other ports of the same manager.
    /// If `events` is `None`, edge detection can still be configured, but nobody
    /// will be watching the value descriptor.
    ///
    /// # Panics
    ///
    /// Panics if `pin` isn't a valid BCM GPIO number (0-53).
    pub fn new(
        pin: u8,
        mode: Mode,
        pull: PullUpDown,
        regs: Arc<dyn RegisterMap>,
        sysfs: Sysfs,
        events: Option<Arc<dyn EventRegistry>>,
    ) -> GpioPort {
        assert!(pin < GPIO_MAX_PINS, "invalid GPIO pin number {}", pin);

        let mut port = GpioPort {
            pin,
            direction: mode,
            pull,
            edge: Edge::None,
            state: SysfsState::Unexported,
            value: None,
            trigger: Arc::new(TriggerState::new()),
            regs,
            sysfs,
            events,
            reset_on_drop: true,
        };

        port.set_pullupdown(pull);
        port.set_direction(mode);

        port
    }

    /// Returns the GPIO pin number.
    ///
    /// Pins are addressed by their BCM numbers, rather than their physical location.
    #[inline]
    pub fn pin(&self) -> u8 {
        self.pin
    }

    /// Sets the pin's mode to input, output or one of the alternate functions.
    pub fn set_direction(&mut self, mode: Mode) {
        let offset = GPFSEL0 + self.pin as usize / 10;
        let shift = (self.pin % 10) * 3;

        self.regs
            .modify(offset, 0b111 << shift, (mode as u32) << shift);
        self.direction = mode;
    }

    /// Reads the pin's mode from the function select register.
    pub fn direction(&self) -> Mode {
        let offset = GPFSEL0 + self.pin as usize / 10;
        let shift = (self.pin % 10) * 3;

        Mode::from_bits((self.regs.read(offset) >> shift) as u8 & 0b111)
    }

    /// Returns the mode that was last successfully applied through
    /// [`set_direction`] or [`set_direction_persisted`].
    ///
    /// [`set_direction`]: #method.set_direction
    /// [`set_direction_persisted`]: #method.set_direction_persisted
    pub fn configured_direction(&self) -> Mode {
        self.direction
    }

    /// Sets the pin's output state.
    #[inline]
    pub fn set_value(&self, level: Level) {
        let offset = match level {
            Level::Low => GPCLR0,
            Level::High => GPSET0,
        } + self.pin as usize / 32;

        self.regs.write(offset, 1 << (self.pin % 32));
    }

    /// Reads the pin's logic level.
    #[inline]
    pub fn value(&self) -> Level {
        let offset = GPLEV0 + self.pin as usize / 32;

        Level::from((self.regs.read(offset) >> (self.pin % 32)) as u8 & 0b1)
    }

    /// Returns `true` if the pin's event detect status bit is set, and clears it.
    pub fn event_detected(&self) -> bool {
        let offset = GPEDS0 + self.pin as usize / 32;

        if self.regs.read(offset) & (1 << (self.pin % 32)) != 0 {
            self.clear_event_detect();
            true
        } else {
            false
        }
    }

    /// Clears the pin's event detect status bit.
    ///
    /// Busy-waits for a short, fixed time between setting and clearing the bit.
    pub fn clear_event_detect(&self) {
        let offset = GPEDS0 + self.pin as usize / 32;

        // GPEDS is write-1-to-clear. Only our own bit is written, so events
        // latched on the other pins in this register survive.
        self.regs.write(offset, 1 << (self.pin % 32));
        short_wait();
        self.regs.write(offset, 0);
    }

    /// Enables or disables rising edge detection in the GPREN register.
    pub fn set_rising_event(&self, enable: bool) {
        self.set_detect_enable(GPREN0, enable);
    }

    /// Enables or disables falling edge detection in the GPFEN register.
    pub fn set_falling_event(&self, enable: bool) {
        self.set_detect_enable(GPFEN0, enable);
    }

    /// Enables or disables high level detection in the GPHEN register.
    pub fn set_high_event(&self, enable: bool) {
        self.set_detect_enable(GPHEN0, enable);
    }

    /// Enables or disables low level detection in the GPLEN register.
    pub fn set_low_event(&self, enable: bool) {
        self.set_detect_enable(GPLEN0, enable);
    }

    fn set_detect_enable(&self, register: usize, enable: bool) {
        let offset = register + self.pin as usize / 32;
        let bit = 1 << (self.pin % 32);

        self.regs.modify(offset, bit, if enable { bit } else { 0 });

        // Don't report an event that was latched under the old configuration
        self.clear_event_detect();
    }

    /// Configures the built-in pull-up/pull-down resistors.
    pub fn set_pullupdown(&mut self, pull: PullUpDown) {
        self.regs.set_pullupdown(self.pin, pull);
        self.pull = pull;
    }

    /// Returns the pull-up/pull-down state that was last applied.
    pub fn pullupdown(&self) -> PullUpDown {
        self.pull
    }

    /// Returns `true` if the pin's sysfs directory exists.
    pub fn is_exported(&self) -> bool {
        self.sysfs.is_exported(self.pin)
    }

    /// Returns the pin's position in the sysfs edge detection lifecycle.
    pub fn sysfs_state(&self) -> SysfsState {
        self.state
    }

    /// Exports the pin through sysfs.
    ///
    /// Succeeds without writing anything if the pin is already exported.
    pub fn export(&mut self) -> Result<()> {
        self.sysfs.export(self.pin)?;

        if self.state == SysfsState::Unexported {
            self.state = SysfsState::Exported;
        }

        Ok(())
    }

    /// Unexports the pin through sysfs.
    ///
    /// Failures are logged, but otherwise ignored.
    pub fn unexport(&mut self) {
        match self.sysfs.unexport(self.pin) {
            Ok(()) => self.state = SysfsState::Unexported,
            Err(e) => warn!("Failed to unexport pin {}: {}", self.pin, e),
        }
    }

    /// Writes the pin's direction to sysfs.
    ///
    /// Right after a pin is exported, its `direction` file may not be writable
    /// until udev has updated the permissions. Opening the file is retried for
    /// up to 1 second, after which [`Error::PermissionTimeout`] is returned.
    ///
    /// [`Error::PermissionTimeout`]: enum.Error.html#variant.PermissionTimeout
    pub fn set_direction_persisted(&mut self, direction: Direction) -> Result<()> {
        self.sysfs.set_direction(self.pin, direction)?;

        self.direction = match direction {
            Direction::In => Mode::Input,
            Direction::Out => Mode::Output,
        };

        if self.state != SysfsState::EdgeMonitoring {
            self.state = SysfsState::DirectionSet;
        }

        Ok(())
    }

    /// Writes the pin's edge to sysfs.
    pub fn set_edge_persisted(&mut self, edge: Edge) -> Result<()> {
        self.sysfs.set_edge(self.pin, edge)?;
        self.edge = edge;

        Ok(())
    }

    /// Returns the edge that was last successfully written to sysfs.
    pub fn edge(&self) -> Edge {
        self.edge
    }

    /// Opens the pin's sysfs `value` file for non-blocking reads.
    ///
    /// The returned file is meant to be watched for readiness by an event
    /// poller, rather than read in a blocking manner.
    pub fn open_readiness_descriptor(&self) -> Result<File> {
        self.sysfs.open_value(self.pin)
    }

    /// Returns the raw value descriptor while edge detection is active.
    pub fn value_fd(&self) -> Option<RawFd> {
        self.value.as_ref().map(|value| value.as_raw_fd())
    }

    /// Returns the debounce and trigger state shared with the event poller.
    pub fn trigger_state(&self) -> &Arc<TriggerState> {
        &self.trigger
    }

    /// Returns the debounce window.
    pub fn bounce_time(&self) -> Duration {
        self.trigger.bounce_time()
    }

    /// Changes the debounce window without reconfiguring edge detection.
    pub fn set_bounce_time(&self, bounce_time: Duration) {
        self.trigger.set_bounce_time(bounce_time);
    }

    /// Configures edge detection through sysfs, and registers the pin's value
    /// descriptor with the event poller.
    ///
    /// The pin is exported, its direction is set to input, its value file is
    /// opened and its edge is set. If any of these steps fails, the steps that
    /// already completed are undone, and the pin is unexported before the error
    /// is returned.
    ///
    /// Any existing edge detection on this port is removed first.
    ///
    /// `add_edge_detect` may block for up to 1 second while waiting for the
    /// `direction` file to become writable, so avoid calling it from
    /// latency-sensitive code.
    pub fn add_edge_detect(&mut self, edge: Edge, bounce_time: Duration) -> Result<()> {
        if self.value.is_some() {
            self.remove_edge_detect();
        }

        self.export()?;

        if let Err(e) = self.set_direction_persisted(Direction::In) {
            warn!("Failed to set pin {} direction: {}", self.pin, e);
            self.unexport();
            return Err(e);
        }

        let value = match self.open_readiness_descriptor() {
            Ok(value) => value,
            Err(e) => {
                warn!("Failed to open pin {} value file: {}", self.pin, e);
                self.unexport();
                return Err(e);
            }
        };

        if let Err(e) = self.set_edge_persisted(edge) {
            warn!("Failed to set pin {} edge: {}", self.pin, e);
            drop(value);
            self.unexport();
            return Err(e);
        }

        self.trigger.arm(bounce_time);

        if let Some(ref events) = self.events {
            if let Err(e) = events.register(self.pin, value.as_raw_fd(), self.trigger.clone()) {
                warn!("Failed to register pin {} with poller: {}", self.pin, e);
                if let Err(e) = self.set_edge_persisted(Edge::None) {
                    warn!("Failed to disable pin {} edge: {}", self.pin, e);
                }
                self.trigger.disarm();
                drop(value);
                self.unexport();
                return Err(e);
            }
        }

        self.value = Some(value);
        self.state = SysfsState::EdgeMonitoring;
        debug!(
            "Pin {} edge detection enabled ({}, {:?} bounce time)",
            self.pin, edge, bounce_time
        );

        Ok(())
    }

    /// Removes edge detection.
    ///
    /// The edge is disabled, the value descriptor is closed, the pin is
    /// unexported and finally deregistered from the event poller, in that order.
    /// Failures are logged, but otherwise ignored.
    pub fn remove_edge_detect(&mut self) {
        if let Err(e) = self.set_edge_persisted(Edge::None) {
            warn!("Failed to disable pin {} edge: {}", self.pin, e);
        }

        // The poller may still hold an event for this descriptor number
        self.trigger.disarm();
        if self.value.take().is_some() && self.state == SysfsState::EdgeMonitoring {
            self.state = SysfsState::DirectionSet;
        }

        self.unexport();

        if let Some(ref events) = self.events {
            events.deregister(self.pin);
        }

        debug!("Pin {} edge detection removed", self.pin);
    }

    /// Returns the value of `reset_on_drop`.
    pub fn reset_on_drop(&self) -> bool {
        self.reset_on_drop
    }

    /// When enabled, resets the pin's mode to [`Input`] and disables the
    /// built-in pull-up/pull-down resistors when the port goes out of scope.
    /// By default, this is set to `true`.
    ///
    /// ## Note
    ///
    /// Drop methods aren't called when a process is abnormally terminated, for
    /// instance when a user presses <kbd>Ctrl</kbd> + <kbd>C</kbd>, and the `SIGINT` signal
    /// isn't caught. You can catch those using crates such as [`simple_signal`].
    ///
    /// [`Input`]: enum.Mode.html#variant.Input
    /// [`simple_signal`]: https://crates.io/crates/simple-signal
    pub fn set_reset_on_drop(&mut self, reset_on_drop: bool) {
        self.reset_on_drop = reset_on_drop;
    }
}

impl Drop for GpioPort {
    /// Removes edge detection if it's active, and resets the pin's mode and
    /// pull-up/pull-down state if `reset_on_drop` is set to `true` (default).
    fn drop(&mut self) {
        if self.value.is_some() {
            self.remove_edge_detect();
        }

        if !self.reset_on_drop {
            return;
        }

        self.set_pullupdown(PullUpDown::Off);
        self.set_direction(Mode::Input);
    }
}

impl PartialEq for GpioPort {
    fn eq(&self, other: &GpioPort) -> bool {
        self.pin == other.pin
    }
}

impl Eq for GpioPort {}

#[inline(always)]
fn short_wait() {
    for _ in 0..EVENT_CLEAR_SPINS {
        std::hint::spin_loop();
    }
}
