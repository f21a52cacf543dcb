// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Debug-port / i8237 DMA page register window. Grounded in the source's
//! `Port80Device` (`iodev_pc.py`): port 0x80 is Linux's `io_delay.c` scratch
//! register (write accepted, discarded), port 0x87 is read as a fixed 0xFF by
//! `i8237.c` DMA-channel probing. The rest of the 16-byte window is
//! unmapped and reads/writes to it report as unknown registers.

use crate::iodev::register::{RegisterBacked, RegisterFile, RegisterSpec};
use crate::iodev::{self, MemoryHandler};

pub const PORT80_BASE: u16 = 0x80;
pub const PORT80_LEN: u16 = 16;

static SPECS: [RegisterSpec<Port80>; 2] = [
    RegisterSpec {
        offset: 0,
        width: 8,
        initial: 0,
        read_only: false,
        map_width: 0,
        get: None,
        set: Some(|_dev, _value| {}),
        after_set: None,
    },
    RegisterSpec {
        offset: 7,
        width: 8,
        initial: 0xff,
        read_only: true,
        map_width: 0,
        get: None,
        set: None,
        after_set: None,
    },
];

static REGFILE: RegisterFile<Port80> = RegisterFile::new(&SPECS);

pub struct Port80 {
    values: Vec<u64>,
}

impl RegisterBacked for Port80 {
    fn reg_values(&mut self) -> &mut [u64] {
        &mut self.values
    }
    fn reg_values_ref(&self) -> &[u64] {
        &self.values
    }
}

impl Port80 {
    pub fn new() -> Self {
        Port80 {
            values: RegisterFile::initial_values(&SPECS),
        }
    }
}

impl Default for Port80 {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHandler for Port80 {
    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        REGFILE.read(self, offset, 8).map(|v| v as u8)
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        REGFILE.write(self, offset, 8, value as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_delay_port_accepts_and_discards() {
        let mut dev = Port80::new();
        dev.write8(0, 0x42).unwrap();
        assert_eq!(dev.read8(0).unwrap(), 0);
    }

    #[test]
    fn test_dma_probe_port_reads_0xff() {
        let mut dev = Port80::new();
        assert_eq!(dev.read8(7).unwrap(), 0xff);
    }

    #[test]
    fn test_unmapped_offset_is_unknown_register() {
        let mut dev = Port80::new();
        assert!(dev.read8(3).is_err());
    }
}
