// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! ACPI power-management timer and control registers. Grounded in the
//! source's `IoAcpiTmr`/`IoAcpiCnt` (`iodev_acpi.py`): the PM timer is a
//! free-running 32-bit counter that advances a fixed amount on every read
//! (the source ticks by a wall-clock-derived value; this platform has no
//! guest-visible timebase to drive it from, so it advances by a fixed step
//! instead, which is enough for firmware polling loops that only test for
//! forward progress). The PM control register is a 16-bit stub: guests write
//! sleep-state requests to it, but this platform never acts on them.

use crate::iodev::{self, MemoryHandler};

pub const ACPI_PM_TIMER_BASE: u16 = 0x608;
pub const ACPI_PM_TIMER_LEN: u16 = 4;
pub const ACPI_PM_CONTROL_BASE: u16 = 0x604;
pub const ACPI_PM_CONTROL_LEN: u16 = 2;

const PM_TIMER_STEP: u32 = 1000;

#[derive(Default)]
pub struct AcpiPmTimer {
    counter: u32,
}

impl AcpiPmTimer {
    pub fn new() -> Self {
        AcpiPmTimer::default()
    }
}

impl MemoryHandler for AcpiPmTimer {
    fn read32(&mut self, offset: u64) -> iodev::Result<u32> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 32));
        }
        let value = self.counter;
        self.counter = self.counter.wrapping_add(PM_TIMER_STEP);
        Ok(value)
    }
}

#[derive(Default)]
pub struct AcpiPmControl {
    value: u16,
}

impl AcpiPmControl {
    pub fn new() -> Self {
        AcpiPmControl::default()
    }
}

impl MemoryHandler for AcpiPmControl {
    fn read16(&mut self, offset: u64) -> iodev::Result<u16> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 16));
        }
        Ok(self.value)
    }

    fn write16(&mut self, offset: u64, value: u16) -> iodev::Result<()> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 16));
        }
        self.value = value;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pm_timer_advances_on_each_read() {
        let mut timer = AcpiPmTimer::new();
        let first = timer.read32(0).unwrap();
        let second = timer.read32(0).unwrap();
        assert_eq!(second, first.wrapping_add(PM_TIMER_STEP));
    }

    #[test]
    fn test_pm_control_roundtrips_without_side_effects() {
        let mut cnt = AcpiPmControl::new();
        cnt.write16(0, 0x2000).unwrap();
        assert_eq!(cnt.read16(0).unwrap(), 0x2000);
    }
}
