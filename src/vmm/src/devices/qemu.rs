// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! QEMU-compatible debug console and firmware-config stub. Grounded in the
//! source's `QemuDebugOutputDev`/`QemuFwCfg` (`iodev_qemu.py`): firmware
//! images written against QEMU probe for both even when running under a
//! different hypervisor, so this platform answers them the same way QEMU
//! itself would for a guest that never actually asks fw_cfg for anything.

use crate::devices::serial::PrefixedStdout;
use crate::iodev::{self, MemoryHandler};

pub const QEMU_DEBUG_BASE: u16 = 0x402;
pub const QEMU_DEBUG_LEN: u16 = 1;
pub const QEMU_FW_CFG_BASE: u16 = 0x510;
pub const QEMU_FW_CFG_LEN: u16 = 2;

/// Line-buffered debug console: each byte written is echoed to host stdout,
/// prefixed so it's distinguishable from UART output.
pub struct QemuDebugOutput {
    out: PrefixedStdout,
}

impl QemuDebugOutput {
    pub fn new() -> Self {
        QemuDebugOutput {
            out: PrefixedStdout::new("DBG: "),
        }
    }
}

impl Default for QemuDebugOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHandler for QemuDebugOutput {
    fn read8(&mut self, _offset: u64) -> iodev::Result<u8> {
        Ok(0xe9)
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 8));
        }
        use std::io::Write;
        let _ = self.out.write_all(&[value]);
        Ok(())
    }
}

/// QEMU firmware-config selector/data pair. This platform publishes no
/// fw_cfg entries, so the data register always reads back an empty buffer.
#[derive(Default)]
pub struct QemuFwCfg {
    selector: u16,
}

impl QemuFwCfg {
    pub fn new() -> Self {
        QemuFwCfg::default()
    }
}

impl MemoryHandler for QemuFwCfg {
    fn read16(&mut self, offset: u64) -> iodev::Result<u16> {
        match offset {
            0 => Ok(self.selector),
            _ => Err(iodev::Error::UnknownRegister(offset, 16)),
        }
    }

    fn write16(&mut self, offset: u64, value: u16) -> iodev::Result<()> {
        match offset {
            0 => {
                self.selector = value;
                Ok(())
            }
            _ => Err(iodev::Error::UnknownRegister(offset, 16)),
        }
    }

    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        match offset {
            1 => Ok(0),
            _ => Err(iodev::Error::UnknownRegister(offset, 8)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fw_cfg_selector_roundtrips() {
        let mut dev = QemuFwCfg::new();
        dev.write16(0, 0x19).unwrap();
        assert_eq!(dev.read16(0).unwrap(), 0x19);
    }

    #[test]
    fn test_fw_cfg_data_always_empty() {
        let mut dev = QemuFwCfg::new();
        assert_eq!(dev.read8(1).unwrap(), 0);
    }
}
