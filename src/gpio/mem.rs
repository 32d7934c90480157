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
use std::fs::OpenOptions;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use libc::{self, c_void, off_t, size_t, MAP_FAILED, MAP_SHARED, O_SYNC, PROT_READ, PROT_WRITE};
use log::debug;

use crate::gpio::{Error, PullUpDown, Result};

const PATH_DEV_GPIOMEM: &str = "/dev/gpiomem";
const PATH_DEV_MEM: &str = "/dev/mem";

// The BCM2835 has 41 32-bit registers related to the GPIO (datasheet @ 6.1).
pub(crate) const GPIO_MEM_REGISTERS: usize = 41;
const GPIO_MEM_SIZE: usize = GPIO_MEM_REGISTERS * std::mem::size_of::<u32>();

/// Offset of the GPIO registers relative to the peripheral base address.
pub const GPIO_OFFSET: u64 = 0x20_0000;

// Register offsets in 32-bit words. Registers that cover more than 32 pins
// continue in the next word (e.g. GPSET1 = GPSET0 + 1).
pub(crate) const GPFSEL0: usize = 0x00 / std::mem::size_of::<u32>();
pub(crate) const GPSET0: usize = 0x1c / std::mem::size_of::<u32>();
pub(crate) const GPCLR0: usize = 0x28 / std::mem::size_of::<u32>();
pub(crate) const GPLEV0: usize = 0x34 / std::mem::size_of::<u32>();
pub(crate) const GPEDS0: usize = 0x40 / std::mem::size_of::<u32>();
pub(crate) const GPREN0: usize = 0x4c / std::mem::size_of::<u32>();
pub(crate) const GPFEN0: usize = 0x58 / std::mem::size_of::<u32>();
pub(crate) const GPHEN0: usize = 0x64 / std::mem::size_of::<u32>();
pub(crate) const GPLEN0: usize = 0x70 / std::mem::size_of::<u32>();
pub(crate) const GPPUD: usize = 0x94 / std::mem::size_of::<u32>();
pub(crate) const GPPUDCLK0: usize = 0x98 / std::mem::size_of::<u32>();

// Set-up and hold time for the GPPUD control signal. The datasheet mentions
// 150 cycles without stating which clock is used. At 250MHz or 400MHz, 5µs
// plus overhead is more than adequate.
const PUD_SETTLE_TIME: Duration = Duration::from_micros(5);

/// Indexed access to a window of 32-bit GPIO registers.
///
/// Offsets are expressed in 32-bit words relative to the start of the GPIO
/// register block (`GPFSEL0`). `read` and `write` are plain volatile accesses
/// without any locking. `modify` performs a masked read-modify-write, which
/// implementations may serialize per register word.
///
/// Writing to a register can't fail. Accessing an offset outside of the
/// register window is a programming error.
pub trait RegisterMap: fmt::Debug + Send + Sync {
    /// Reads the register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes `value` to the register at `offset`.
    fn write(&self, offset: usize, value: u32);

    /// Replaces the bits selected by `mask` with the corresponding bits of
    /// `bits`, leaving all other bits unchanged.
    fn modify(&self, offset: usize, mask: u32, bits: u32) {
        let reg_value = self.read(offset);
        self.write(offset, (reg_value & !mask) | (bits & mask));
    }

    /// Clocks `pull` into `pin` through the GPPUD/GPPUDCLK protocol.
    ///
    /// GPPUD is shared by all pins, so implementations that can be accessed
    /// from multiple threads should hold GPPUD and the pin's GPPUDCLK word for
    /// the entire sequence. The default implementation doesn't lock anything.
    fn set_pullupdown(&self, pin: u8, pull: PullUpDown) {
        pullupdown_sequence(self, pin, pull);
    }
}

fn pullupdown_sequence<R: RegisterMap + ?Sized>(regs: &R, pin: u8, pull: PullUpDown) {
    let offset = GPPUDCLK0 + pin as usize / 32;

    // Set the control signal in GPPUD.
    let reg_value = regs.read(GPPUD);
    regs.write(GPPUD, (reg_value & !0b11) | ((pull as u32) & 0b11));

    // Set-up time for the control signal.
    spin_sleep::sleep(PUD_SETTLE_TIME);

    // Clock the control signal into the selected pin.
    regs.write(offset, 1 << (pin % 32));

    // Hold time for the control signal.
    spin_sleep::sleep(PUD_SETTLE_TIME);

    // Remove the control signal and clock.
    regs.write(GPPUD, reg_value & !0b11);
    regs.write(offset, 0);
}

/// Spin locks for each GPIO register word.
#[derive(Debug)]
pub(crate) struct RegisterLocks {
    locks: [AtomicBool; GPIO_MEM_REGISTERS],
}

impl RegisterLocks {
    pub(crate) fn new() -> RegisterLocks {
        RegisterLocks {
            locks: lock_array!(GPIO_MEM_REGISTERS),
        }
    }

    fn try_lock(&self, offset: usize) -> bool {
        self.locks[offset]
            .compare_exchange_weak(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn lock(&self, offset: usize) {
        while !self.try_lock(offset) {
            std::hint::spin_loop();
        }
    }

    // Takes both locks or neither, so two callers locking the same pair in a
    // different order can't deadlock.
    pub(crate) fn lock_pair(&self, first: usize, second: usize) {
        loop {
            if self.try_lock(first) {
                if self.try_lock(second) {
                    return;
                }

                self.unlock(first);
            }

            std::hint::spin_loop();
        }
    }

    pub(crate) fn unlock(&self, offset: usize) {
        self.locks[offset].store(false, Ordering::SeqCst);
    }

    /// Runs the pull-up/pull-down sequence for `pin` on `regs` while holding
    /// the GPPUD and GPPUDCLK locks.
    pub(crate) fn set_pullupdown<R: RegisterMap + ?Sized>(
        &self,
        regs: &R,
        pin: u8,
        pull: PullUpDown,
    ) {
        let offset = GPPUDCLK0 + pin as usize / 32;

        self.lock_pair(GPPUD, offset);
        pullupdown_sequence(regs, pin, pull);
        self.unlock(offset);
        self.unlock(GPPUD);
    }
}

/// Memory-mapped GPIO registers.
///
/// `GpioMem` maps the GPIO register block through either `/dev/gpiomem` or
/// `/dev/mem`. Read-modify-write operations through [`modify`] are serialized
/// per register word, and the pull-up/pull-down sequence holds the shared
/// GPPUD register for its entire duration, so pins sharing a register can be
/// configured from different threads.
///
/// [`modify`]: trait.RegisterMap.html#method.modify
pub struct GpioMem {
    mem_ptr: *mut u32,
    locks: RegisterLocks,
}

impl fmt::Debug for GpioMem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpioMem")
            .field("mem_ptr", &self.mem_ptr)
            .field("locks", &self.locks)
            .finish()
    }
}

impl GpioMem {
    /// Maps the GPIO registers through `/dev/gpiomem`.
    ///
    /// On a typical Raspberry Pi OS installation, any user that's a member of the
    /// `gpio` group can access `/dev/gpiomem`.
    pub fn open() -> Result<GpioMem> {
        // Open /dev/gpiomem with read/write/sync flags. This might fail if
        // /dev/gpiomem doesn't exist, doesn't have the appropriate permissions,
        // or the current user is not a member of the gpio group.
        let gpiomem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(PATH_DEV_GPIOMEM)
            .map_err(|e| Self::map_open_error(e, PATH_DEV_GPIOMEM))?;

        let mem_ptr = Self::map(&gpiomem_file, 0)?;
        debug!("Mapped GPIO registers through {}", PATH_DEV_GPIOMEM);

        Ok(GpioMem {
            mem_ptr,
            locks: RegisterLocks::new(),
        })
    }

    /// Maps the GPIO registers through `/dev/mem`.
    ///
    /// `peripheral_base` is the physical base address of the SoC's peripherals
    /// (`0x2000_0000` on the BCM2835, `0x3f00_0000` on the BCM2836/BCM2837).
    /// Access to `/dev/mem` typically requires superuser privileges.
    pub fn open_devmem(peripheral_base: u64) -> Result<GpioMem> {
        let mem_file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(O_SYNC)
            .open(PATH_DEV_MEM)
            .map_err(|e| Self::map_open_error(e, PATH_DEV_MEM))?;

        let mem_ptr = Self::map(&mem_file, (peripheral_base + GPIO_OFFSET) as off_t)?;
        debug!(
            "Mapped GPIO registers through {} at {:#x}",
            PATH_DEV_MEM,
            peripheral_base + GPIO_OFFSET
        );

        Ok(GpioMem {
            mem_ptr,
            locks: RegisterLocks::new(),
        })
    }

    fn map_open_error(err: io::Error, path: &str) -> Error {
        if err.kind() == io::ErrorKind::PermissionDenied {
            Error::PermissionDenied(String::from(path))
        } else {
            Error::Io(err)
        }
    }

    fn map(file: &std::fs::File, offset: off_t) -> Result<*mut u32> {
        let mem_ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                GPIO_MEM_SIZE,
                PROT_READ | PROT_WRITE,
                MAP_SHARED,
                file.as_raw_fd(),
                offset,
            )
        };

        if mem_ptr == MAP_FAILED {
            return Err(Error::Io(io::Error::last_os_error()));
        }

        Ok(mem_ptr as *mut u32)
    }
}

impl RegisterMap for GpioMem {
    #[inline(always)]
    fn read(&self, offset: usize) -> u32 {
        debug_assert!(offset < GPIO_MEM_REGISTERS);

        unsafe { ptr::read_volatile(self.mem_ptr.add(offset)) }
    }

    #[inline(always)]
    fn write(&self, offset: usize, value: u32) {
        debug_assert!(offset < GPIO_MEM_REGISTERS);

        unsafe {
            ptr::write_volatile(self.mem_ptr.add(offset), value);
        }
    }

    fn modify(&self, offset: usize, mask: u32, bits: u32) {
        self.locks.lock(offset);

        let reg_value = self.read(offset);
        self.write(offset, (reg_value & !mask) | (bits & mask));

        self.locks.unlock(offset);
    }

    fn set_pullupdown(&self, pin: u8, pull: PullUpDown) {
        self.locks.set_pullupdown(self, pin, pull);
    }
}

impl Drop for GpioMem {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.mem_ptr as *mut c_void, GPIO_MEM_SIZE as size_t);
        }
    }
}

// Required because of the raw pointer to our memory-mapped file
unsafe impl Send for GpioMem {}
unsafe impl Sync for GpioMem {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_offsets_match_datasheet() {
        assert_eq!(GPSET0, 7);
        assert_eq!(GPCLR0, 10);
        assert_eq!(GPLEV0, 13);
        assert_eq!(GPEDS0, 16);
        assert_eq!(GPREN0, 19);
        assert_eq!(GPFEN0, 22);
        assert_eq!(GPHEN0, 25);
        assert_eq!(GPLEN0, 28);
        assert_eq!(GPPUD, 37);
        assert_eq!(GPPUDCLK0, 38);
        assert!(GPPUDCLK0 + 1 < GPIO_MEM_REGISTERS);
    }

    #[test]
    fn lock_pair_is_all_or_nothing() {
        use std::sync::atomic::AtomicBool;
        use std::sync::Arc;
        use std::thread;

        let locks = Arc::new(RegisterLocks::new());
        let done = Arc::new(AtomicBool::new(false));

        locks.lock(GPPUDCLK0);

        let waiter = thread::spawn({
            let locks = locks.clone();
            let done = done.clone();
            move || {
                locks.lock_pair(GPPUD, GPPUDCLK0);
                done.store(true, Ordering::SeqCst);
            }
        });

        // GPPUD must not stay locked while GPPUDCLK0 is unavailable
        thread::sleep(Duration::from_millis(10));
        locks.lock(GPPUD);
        assert!(!done.load(Ordering::SeqCst));
        locks.unlock(GPPUD);

        locks.unlock(GPPUDCLK0);
        waiter.join().unwrap();

        assert!(done.load(Ordering::SeqCst));
        assert!(!locks.try_lock(GPPUD));
        assert!(!locks.try_lock(GPPUDCLK0));
    }
}
