// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PCIe-style ECAM memory-mapped config window. Grounded in
//! `original_source/iodev_pci.py`'s `Ecam` handler: a flat `0x1000_0000`-byte
//! memory region at `0xB000_0000` where `bdf = (addr >> 12) & 0xFFFF` and
//! `reg = addr & 0xFFF`, supporting the full 8/16/32-bit width dispatch that the
//! legacy CF8/CFC pair restricts to 32-bit dword accesses.

use std::sync::{Arc, Mutex};

use super::{Bdf, PciSubsystem, CFG_SPACE_LEN};
use crate::iodev::{MemoryHandler, Result};

pub const ECAM_BASE: u64 = 0xB000_0000;
pub const ECAM_SIZE: u64 = 0x1000_0000;

pub struct Ecam {
    subsystem: Arc<Mutex<PciSubsystem>>,
}

impl Ecam {
    pub fn new(subsystem: Arc<Mutex<PciSubsystem>>) -> Self {
        Ecam { subsystem }
    }

    fn split(addr: u64) -> (Bdf, u64) {
        let bdf = Bdf(((addr / CFG_SPACE_LEN) & 0xFFFF) as u16);
        let reg = addr % CFG_SPACE_LEN;
        (bdf, reg)
    }
}

impl MemoryHandler for Ecam {
    fn read8(&mut self, offset: u64) -> Result<u8> {
        let (bdf, reg) = Self::split(offset);
        Ok(self.subsystem.lock().unwrap().cfg_read_width(bdf, reg, 8)? as u8)
    }

    fn read16(&mut self, offset: u64) -> Result<u16> {
        let (bdf, reg) = Self::split(offset);
        Ok(self.subsystem.lock().unwrap().cfg_read_width(bdf, reg, 16)? as u16)
    }

    fn read32(&mut self, offset: u64) -> Result<u32> {
        let (bdf, reg) = Self::split(offset);
        Ok(self.subsystem.lock().unwrap().cfg_read_width(bdf, reg, 32)? as u32)
    }

    fn write8(&mut self, offset: u64, value: u8) -> Result<()> {
        let (bdf, reg) = Self::split(offset);
        self.subsystem
            .lock()
            .unwrap()
            .cfg_write_width(bdf, reg, 8, value as u64)
    }

    fn write16(&mut self, offset: u64, value: u16) -> Result<()> {
        let (bdf, reg) = Self::split(offset);
        self.subsystem
            .lock()
            .unwrap()
            .cfg_write_width(bdf, reg, 16, value as u64)
    }

    fn write32(&mut self, offset: u64, value: u32) -> Result<()> {
        let (bdf, reg) = Self::split(offset);
        self.subsystem
            .lock()
            .unwrap()
            .cfg_write_width(bdf, reg, 32, value as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pci::{BarKind, BarSpec, PciConfig, PciFunction};

    struct Dummy {
        bdf: Bdf,
        cfg: PciConfig,
    }

    impl PciFunction for Dummy {
        fn bdf(&self) -> Bdf {
            self.bdf
        }
        fn config(&mut self) -> &mut PciConfig {
            &mut self.cfg
        }
    }

    #[test]
    fn test_ecam_address_split_and_dispatch() {
        let mut subsystem = PciSubsystem::new();
        let bdf = Bdf::new(0, 4, 0);
        subsystem.register(Arc::new(Mutex::new(Dummy {
            bdf,
            cfg: PciConfig::new(
                0x8086, 0x2922, 0x01, 0x06, 0x01, 0x00, 0, 0, 0,
                [None, None, None, None, None, None],
            ),
        })));
        let subsystem = Arc::new(Mutex::new(subsystem));

        let mut ecam = Ecam::new(subsystem);
        let addr = (bdf.as_u16() as u64) * CFG_SPACE_LEN;
        assert_eq!(ecam.read16(addr).unwrap(), 0x8086);
        assert_eq!(ecam.read16(addr + 2).unwrap(), 0x2922);
    }

    #[test]
    fn test_ecam_missing_bdf_reads_as_ones() {
        let subsystem = Arc::new(Mutex::new(PciSubsystem::new()));
        let mut ecam = Ecam::new(subsystem);
        assert_eq!(ecam.read32(CFG_SPACE_LEN * 5).unwrap(), 0xFFFF_FFFF);
    }
}
