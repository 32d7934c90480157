//! Simulated BCM2835 GPIO register file for unit tests.

use std::sync::Mutex;

use super::mem::{
    RegisterLocks, RegisterMap, GPCLR0, GPEDS0, GPFEN0, GPHEN0, GPIO_MEM_REGISTERS, GPLEN0,
    GPLEV0, GPREN0, GPSET0,
};
use super::{Level, PullUpDown};

/// Register file that behaves like the hardware where it matters for tests.
///
/// - writing a 1 bit to GPSET/GPCLR drives the corresponding GPLEV bit
/// - GPEDS is write-1-to-clear, writing 0 bits has no effect
/// - [`drive`] simulates an external level change and latches GPEDS according
///   to the rising/falling/high/low enable registers
/// - the pull-up/pull-down sequence is locked the same way `GpioMem` locks it
///
/// [`drive`]: #method.drive
#[derive(Debug)]
pub(crate) struct FakeRegisters {
    regs: Mutex<[u32; GPIO_MEM_REGISTERS]>,
    writes: Mutex<Vec<(usize, u32)>>,
    locks: RegisterLocks,
}

impl FakeRegisters {
    pub(crate) fn new() -> FakeRegisters {
        FakeRegisters {
            regs: Mutex::new([0; GPIO_MEM_REGISTERS]),
            writes: Mutex::new(Vec::new()),
            locks: RegisterLocks::new(),
        }
    }

    /// Drives `pin` to `level` from the outside, as a button or sensor would.
    pub(crate) fn drive(&self, pin: u8, level: Level) {
        let bank = pin as usize / 32;
        let bit = 1u32 << (pin % 32);
        let mut regs = self.regs.lock().unwrap();

        let was_high = regs[GPLEV0 + bank] & bit != 0;
        let is_high = level == Level::High;

        let latched = (!was_high && is_high && regs[GPREN0 + bank] & bit != 0)
            || (was_high && !is_high && regs[GPFEN0 + bank] & bit != 0)
            || (is_high && regs[GPHEN0 + bank] & bit != 0)
            || (!is_high && regs[GPLEN0 + bank] & bit != 0);

        if is_high {
            regs[GPLEV0 + bank] |= bit;
        } else {
            regs[GPLEV0 + bank] &= !bit;
        }

        if latched {
            regs[GPEDS0 + bank] |= bit;
        }
    }

    /// Reads a register without any side effects.
    pub(crate) fn peek(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap()[offset]
    }

    /// Returns every `(offset, value)` written through `RegisterMap` so far,
    /// and clears the log.
    pub(crate) fn take_writes(&self) -> Vec<(usize, u32)> {
        std::mem::take(&mut *self.writes.lock().unwrap())
    }

    /// Overwrites a register without any side effects.
    pub(crate) fn poke(&self, offset: usize, value: u32) {
        self.regs.lock().unwrap()[offset] = value;
    }
}

impl RegisterMap for FakeRegisters {
    fn read(&self, offset: usize) -> u32 {
        self.regs.lock().unwrap()[offset]
    }

    fn write(&self, offset: usize, value: u32) {
        self.writes.lock().unwrap().push((offset, value));
        let mut regs = self.regs.lock().unwrap();

        match offset {
            o if o == GPSET0 || o == GPSET0 + 1 => regs[GPLEV0 + (o - GPSET0)] |= value,
            o if o == GPCLR0 || o == GPCLR0 + 1 => regs[GPLEV0 + (o - GPCLR0)] &= !value,
            o if o == GPEDS0 || o == GPEDS0 + 1 => regs[o] &= !value,
            o => regs[o] = value,
        }
    }

    fn set_pullupdown(&self, pin: u8, pull: PullUpDown) {
        self.locks.set_pullupdown(self, pin, pull);
    }
}
