// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! PS/2-era "port 92" fast-A20/fast-reset register. Grounded in the source's
//! `Port92` (`iodev_pc.py`): a single byte register whose value is accepted
//! and stored but never interpreted — this platform has no A20 gate to mask
//! and no separate fast-reset path distinct from the keyboard-controller one
//! in `ps2`, so the write is inert.

use crate::iodev::register::{RegisterBacked, RegisterFile, RegisterSpec};
use crate::iodev::{self, MemoryHandler};

pub const PORT92_BASE: u16 = 0x92;
pub const PORT92_LEN: u16 = 1;

static SPECS: [RegisterSpec<Port92>; 1] = [RegisterSpec {
    offset: 0,
    width: 8,
    initial: 0,
    read_only: false,
    map_width: 0,
    get: None,
    set: Some(|_dev, _value| {}),
    after_set: None,
}];

static REGFILE: RegisterFile<Port92> = RegisterFile::new(&SPECS);

pub struct Port92 {
    values: Vec<u64>,
}

impl RegisterBacked for Port92 {
    fn reg_values(&mut self) -> &mut [u64] {
        &mut self.values
    }
    fn reg_values_ref(&self) -> &[u64] {
        &self.values
    }
}

impl Port92 {
    pub fn new() -> Self {
        Port92 {
            values: RegisterFile::initial_values(&SPECS),
        }
    }
}

impl Default for Port92 {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryHandler for Port92 {
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
    fn test_write_is_inert_read_stays_zero() {
        let mut dev = Port92::new();
        dev.write8(0, 0xff).unwrap();
        assert_eq!(dev.read8(0).unwrap(), 0);
    }
}
