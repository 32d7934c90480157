//! `gpioport` controls individual GPIO pins on the Raspberry Pi through two
//! complementary interfaces: direct access to the memory-mapped GPIO registers
//! for fast polling and driving of pins, and edge detection through the Linux
//! sysfs GPIO interface for applications that would rather be notified than
//! busy-poll.
//!
//! Both interfaces meet in [`GpioPort`], which represents a single pin. Ports
//! share a register window ([`RegisterMap`]) and, optionally, an edge event
//! poller ([`EventRegistry`]) owned by a manager such as [`Gpio`].
//!
//! `gpioport` requires Raspberry Pi OS or any similar, recent, Linux
//! distribution with the (legacy) sysfs GPIO interface enabled. Register access
//! assumes the BCM2835 register layout and pull-up/pull-down protocol used by
//! the BCM2835, BCM2836 and BCM2837 based models: the Raspberry Pi A, B, 2, 3,
//! Zero and the compute modules 1 and 3. The Raspberry Pi 4 (BCM2711) replaced
//! the pull-up/pull-down registers and isn't supported.
//!
//! [`GpioPort`]: gpio/struct.GpioPort.html
//! [`RegisterMap`]: gpio/trait.RegisterMap.html
//! [`EventRegistry`]: gpio/trait.EventRegistry.html
//! [`Gpio`]: gpio/struct.Gpio.html

// Used by rustdoc to link other crates to gpioport's docs
#![doc(html_root_url = "https://docs.rs/gpioport/0.1.0")]

#[macro_use]
mod macros;

pub mod gpio;
