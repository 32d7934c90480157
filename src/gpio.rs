//! Interface for the GPIO peripheral.
//!
//! To ensure fast performance, `gpioport` controls the GPIO peripheral by directly
//! accessing the registers through either `/dev/gpiomem` or `/dev/mem`. Edge
//! detection for applications that would rather not busy-poll is configured
//! through the sysfs interface at `/sys/class/gpio`.
//!
//! ## Ports
//!
//! Each pin is represented by a [`GpioPort`], retrieved from a [`Gpio`] instance by
//! its BCM GPIO number through [`Gpio::get`]. The port's mode and pull-up/pull-down
//! state are applied immediately, and reset to [`Input`] without pull-up/pull-down
//! when the port goes out of scope.
//!
//! Ports don't own the register window or the event poller. Both are shared by
//! all ports of a [`Gpio`] instance, and can be swapped out for custom
//! implementations of [`RegisterMap`] and [`EventRegistry`] through
//! [`Gpio::with_parts`].
//!
//! ## Edge detection
//!
//! [`GpioPort::add_edge_detect`] exports the pin through sysfs, configures it as an
//! input, opens its value file and sets the requested edge. The value file is then
//! handed to the event poller, which calls the callback passed to
//! [`Gpio::with_events`] for every edge that isn't filtered out by the port's
//! bounce time. [`GpioPort::remove_edge_detect`] undoes all of the above.
//!
//! Both calls perform blocking file I/O, and `add_edge_detect` may wait for up to
//! 1 second for udev to update the permissions of a freshly exported pin.
//!
//! ## Examples
//!
//! ```no_run
//! use std::thread;
//! use std::time::Duration;
//!
//! use gpioport::gpio::{Gpio, Level, Mode, PullUpDown};
//!
//! # fn main() -> gpioport::gpio::Result<()> {
//! let gpio = Gpio::new()?;
//! let port = gpio.get(23, Mode::Output, PullUpDown::Off)?;
//!
//! port.set_value(Level::High);
//! thread::sleep(Duration::from_secs(1));
//! port.set_value(Level::Low);
//! # Ok(())
//! # }
//! ```
//!
//! [`GpioPort`]: struct.GpioPort.html
//! [`GpioPort::add_edge_detect`]: struct.GpioPort.html#method.add_edge_detect
//! [`GpioPort::remove_edge_detect`]: struct.GpioPort.html#method.remove_edge_detect
//! [`Gpio`]: struct.Gpio.html
//! [`Gpio::get`]: struct.Gpio.html#method.get
//! [`Gpio::with_events`]: struct.Gpio.html#method.with_events
//! [`Gpio::with_parts`]: struct.Gpio.html#method.with_parts
//! [`Input`]: enum.Mode.html#variant.Input
//! [`RegisterMap`]: trait.RegisterMap.html
//! [`EventRegistry`]: trait.EventRegistry.html

use std::error;
use std::fmt;
use std::io;
use std::ops::Not;
use std::path::PathBuf;
use std::result;
use std::str::FromStr;
use std::sync::Arc;

mod epoll;
#[cfg(test)]
mod fake;
#[cfg(any(feature = "embedded-hal", feature = "embedded-hal-0"))]
mod hal;
mod mem;
mod poller;
mod port;
mod sysfs;
mod trigger;

pub use self::mem::{GpioMem, RegisterMap, GPIO_OFFSET};
pub use self::poller::{EventPoller, EventRegistry};
pub use self::port::{GpioPort, SysfsState};
pub use self::sysfs::{Direction, Sysfs, SYSFS_GPIO_ROOT};
pub use self::trigger::TriggerState;

/// Number of GPIO pins on the BCM2835. The actual number of pins exposed through
/// the Pi's GPIO header depends on the model.
pub const GPIO_MAX_PINS: u8 = 54;

/// Errors that can occur when accessing the GPIO peripheral.
#[derive(Debug)]
pub enum Error {
    /// Pin is not available.
    ///
    /// The GPIO peripheral doesn't expose a GPIO pin with the specified number. Pins are
    /// addressed by their BCM GPIO numbers, rather than their physical location on the GPIO
    /// header.
    PinNotAvailable(u8),
    /// Permission denied when opening `/dev/gpiomem` or `/dev/mem` for read/write access.
    ///
    /// Make sure the user is a member of the `gpio` group when using `/dev/gpiomem`.
    /// `/dev/mem` typically requires superuser privileges.
    PermissionDenied(String),
    /// A sysfs control file couldn't be opened or written.
    ///
    /// Contains the path of the file and the underlying I/O error.
    ResourceUnavailable(PathBuf, io::Error),
    /// The pin's sysfs `direction` file didn't become writable in time.
    ///
    /// Freshly exported pins are owned by `root` until udev updates their
    /// permissions. Check the udev rules (`/etc/udev/rules.d/99-com.rules`) if this
    /// keeps happening.
    PermissionTimeout(u8),
    /// A write to a sysfs control file was cut short.
    ///
    /// Contains the number of bytes written, and the number of bytes expected.
    PartialWrite(usize, usize),
    /// Unknown edge name.
    InvalidEdge(String),
    /// I/O error.
    Io(io::Error),
    /// Thread panicked.
    ThreadPanic,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::PinNotAvailable(pin) => write!(f, "Pin {} is not available", pin),
            Error::PermissionDenied(ref path) => write!(f, "Permission denied: {}", path),
            Error::ResourceUnavailable(ref path, ref err) => {
                write!(f, "Can't access {}: {}", path.display(), err)
            }
            Error::PermissionTimeout(pin) => {
                write!(f, "Timed out waiting for pin {} direction permissions", pin)
            }
            Error::PartialWrite(written, expected) => {
                write!(f, "Partial write: {} of {} bytes", written, expected)
            }
            Error::InvalidEdge(ref edge) => write!(f, "Invalid edge: {}", edge),
            Error::Io(ref err) => write!(f, "I/O error: {}", err),
            Error::ThreadPanic => write!(f, "Thread panicked"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match *self {
            Error::ResourceUnavailable(_, ref err) | Error::Io(ref err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::Io(err)
    }
}

/// Result type returned from methods that can have `gpioport::gpio::Error`s.
pub type Result<T> = result::Result<T, Error>;

/// Pin modes.
///
/// The discriminants are the BCM2835 function select codes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Mode {
    Input = 0b000,
    Output = 0b001,
    Alt0 = 0b100,
    Alt1 = 0b101,
    Alt2 = 0b110,
    Alt3 = 0b111,
    Alt4 = 0b011,
    Alt5 = 0b010,
}

impl Mode {
    /// Converts a 3-bit function select code into a `Mode`.
    pub fn from_bits(bits: u8) -> Mode {
        match bits & 0b111 {
            0b000 => Mode::Input,
            0b001 => Mode::Output,
            0b100 => Mode::Alt0,
            0b101 => Mode::Alt1,
            0b110 => Mode::Alt2,
            0b111 => Mode::Alt3,
            0b011 => Mode::Alt4,
            _ => Mode::Alt5,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Mode::Input => write!(f, "In"),
            Mode::Output => write!(f, "Out"),
            Mode::Alt0 => write!(f, "Alt0"),
            Mode::Alt1 => write!(f, "Alt1"),
            Mode::Alt2 => write!(f, "Alt2"),
            Mode::Alt3 => write!(f, "Alt3"),
            Mode::Alt4 => write!(f, "Alt4"),
            Mode::Alt5 => write!(f, "Alt5"),
        }
    }
}

/// Pin logic levels.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[repr(u8)]
pub enum Level {
    Low = 0,
    High = 1,
}

impl From<bool> for Level {
    fn from(e: bool) -> Level {
        if e {
            Level::High
        } else {
            Level::Low
        }
    }
}

impl From<u8> for Level {
    fn from(value: u8) -> Self {
        if value == 0 {
            Level::Low
        } else {
            Level::High
        }
    }
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Level::Low => write!(f, "Low"),
            Level::High => write!(f, "High"),
        }
    }
}

impl Not for Level {
    type Output = Level;

    fn not(self) -> Level {
        match self {
            Level::Low => Level::High,
            Level::High => Level::Low,
        }
    }
}

/// Built-in pull-up/pull-down resistor states.
///
/// The discriminants are the BCM2835 GPPUD control codes.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum PullUpDown {
    Off = 0b00,
    PullDown = 0b01,
    PullUp = 0b10,
}

impl fmt::Display for PullUpDown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            PullUpDown::Off => write!(f, "Off"),
            PullUpDown::PullDown => write!(f, "PullDown"),
            PullUpDown::PullUp => write!(f, "PullUp"),
        }
    }
}

/// Edge detection conditions.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum Edge {
    None,
    Rising,
    Falling,
    Both,
}

impl Edge {
    /// Returns the name sysfs uses for this edge.
    pub fn as_str(self) -> &'static str {
        match self {
            Edge::None => "none",
            Edge::Rising => "rising",
            Edge::Falling => "falling",
            Edge::Both => "both",
        }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Edge {
    type Err = Error;

    fn from_str(s: &str) -> Result<Edge> {
        match s.trim_end_matches(|c| c == '\0' || c == '\n') {
            "none" => Ok(Edge::None),
            "rising" => Ok(Edge::Rising),
            "falling" => Ok(Edge::Falling),
            "both" => Ok(Edge::Both),
            other => Err(Error::InvalidEdge(other.to_string())),
        }
    }
}

/// Provides access to the Raspberry Pi's GPIO peripheral.
///
/// `Gpio` owns the register window and, when constructed through
/// [`with_events`], the event poller thread. Both are shared with every
/// [`GpioPort`] handed out by [`get`], and live until the last of them goes out
/// of scope.
///
/// [`with_events`]: #method.with_events
/// [`get`]: #method.get
/// [`GpioPort`]: struct.GpioPort.html
#[derive(Clone, Debug)]
pub struct Gpio {
    regs: Arc<dyn RegisterMap>,
    sysfs: Sysfs,
    events: Option<Arc<dyn EventRegistry>>,
}

impl Gpio {
    /// Constructs a new `Gpio` without an event poller.
    ///
    /// Ports retrieved from this instance support all register-level operations.
    /// Edge detection can be configured, but no thread watches for edges.
    pub fn new() -> Result<Gpio> {
        Ok(Gpio::with_parts(Arc::new(GpioMem::open()?), Sysfs::new(), None))
    }

    /// Constructs a new `Gpio`, and starts an event poller thread that calls
    /// `callback` for every edge trigger on any of its ports.
    ///
    /// The callback closure or function pointer is called with the pin number and
    /// the pin's [`Level`].
    ///
    /// [`Level`]: enum.Level.html
    pub fn with_events<C>(callback: C) -> Result<Gpio>
    where
        C: FnMut(u8, Level) + Send + 'static,
    {
        let regs = Arc::new(GpioMem::open()?);
        let events: Arc<dyn EventRegistry> = Arc::new(EventPoller::new(callback)?);

        Ok(Gpio::with_parts(regs, Sysfs::new(), Some(events)))
    }

    /// Constructs a new `Gpio` from custom parts.
    pub fn with_parts(
        regs: Arc<dyn RegisterMap>,
        sysfs: Sysfs,
        events: Option<Arc<dyn EventRegistry>>,
    ) -> Gpio {
        Gpio {
            regs,
            sysfs,
            events,
        }
    }

    /// Returns a [`GpioPort`] for the specified BCM GPIO number, configured with
    /// `mode` and `pull`.
    ///
    /// Keeping track of which pins are in use is up to the caller. Two ports for
    /// the same pin will overwrite each other's configuration.
    ///
    /// [`GpioPort`]: struct.GpioPort.html
    pub fn get(&self, pin: u8, mode: Mode, pull: PullUpDown) -> Result<GpioPort> {
        if pin >= GPIO_MAX_PINS {
            return Err(Error::PinNotAvailable(pin));
        }

        Ok(GpioPort::new(
            pin,
            mode,
            pull,
            self.regs.clone(),
            self.sysfs.clone(),
            self.events.clone(),
        ))
    }

    /// Returns the shared register window.
    pub fn register_map(&self) -> &Arc<dyn RegisterMap> {
        &self.regs
    }

    /// Returns the sysfs configuration handed to new ports.
    pub fn sysfs(&self) -> &Sysfs {
        &self.sysfs
    }

    /// Changes the sysfs configuration handed to ports retrieved after this call.
    pub fn set_sysfs(&mut self, sysfs: Sysfs) {
        self.sysfs = sysfs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use super::fake::FakeRegisters;

    #[test]
    fn mode_codes() {
        for bits in 0..8u8 {
            assert_eq!(Mode::from_bits(bits) as u8, bits);
        }
        assert_eq!(Mode::Alt0 as u8, 4);
    }

    #[test]
    fn edge_names() {
        for &edge in &[Edge::None, Edge::Rising, Edge::Falling, Edge::Both] {
            assert_eq!(edge.as_str().parse::<Edge>().unwrap(), edge);
        }

        assert_eq!("both\0".parse::<Edge>().unwrap(), Edge::Both);
        assert!(matches!(
            "sideways".parse::<Edge>(),
            Err(Error::InvalidEdge(ref name)) if name == "sideways"
        ));
    }

    #[test]
    fn level_conversions() {
        assert_eq!(Level::from(true), Level::High);
        assert_eq!(Level::from(0u8), Level::Low);
        assert_eq!(!Level::Low, Level::High);
    }

    #[test]
    fn get_checks_pin_range() {
        let gpio = Gpio::with_parts(Arc::new(FakeRegisters::new()), Sysfs::new(), None);

        assert!(matches!(
            gpio.get(GPIO_MAX_PINS, Mode::Input, PullUpDown::Off),
            Err(Error::PinNotAvailable(54))
        ));

        let port = gpio.get(17, Mode::Output, PullUpDown::Off).unwrap();
        assert_eq!(port.pin(), 17);
        assert_eq!(port.direction(), Mode::Output);
    }

    #[test]
    fn ports_share_register_map() {
        let regs = Arc::new(FakeRegisters::new());
        let gpio = Gpio::with_parts(regs.clone(), Sysfs::new(), None);

        let output = gpio.get(20, Mode::Output, PullUpDown::Off).unwrap();
        let input = gpio.get(21, Mode::Input, PullUpDown::PullUp).unwrap();

        output.set_value(Level::High);
        regs.drive(21, Level::High);

        assert_eq!(output.value(), Level::High);
        assert_eq!(input.value(), Level::High);
        assert_eq!(input.pullupdown(), PullUpDown::PullUp);
        assert_eq!(regs.peek(super::mem::GPFSEL0 + 2), 0b001);
    }
}
