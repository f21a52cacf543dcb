// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Memory-mapped system flash backing `fwvars`. Grounded in §6's system
//! flash protocol: a JEDEC/CFI-style command state machine layered over a
//! flat byte array, mapped at `0xFFC0_0000`. Firmware issues single-byte
//! commands by writing them anywhere in the mapped window; `0x10` arms a
//! single-byte program (the following write, at whatever offset, is the
//! datum persisted there), `0x50` clears the status register back to ready,
//! `0x70` switches reads to the status register, and `0xFF` returns reads to
//! plain array access. Every successful program is flushed to the backing
//! file immediately, since this is the only persistence the firmware's
//! variable store gets.

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write as IoWrite};
use std::path::PathBuf;

use crate::iodev::{self, MemoryHandler};

pub const FLASH_LEN: u64 = 2 * 1024 * 1024;

const CMD_SINGLE_BYTE_PROGRAM: u8 = 0x10;
const CMD_CLEAR_STATUS: u8 = 0x50;
const CMD_READ_STATUS: u8 = 0x70;
const CMD_READ_ARRAY: u8 = 0xff;

const STATUS_READY: u8 = 0x80;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Array,
    Status,
    ArmedForProgram,
}

pub struct SysFlash {
    data: Vec<u8>,
    mode: Mode,
    status: u8,
    backing_path: PathBuf,
}

impl SysFlash {
    /// `initial` seeds the array from the fwvars file read at startup;
    /// `backing_path` is where subsequent programs are persisted.
    pub fn new(initial: Vec<u8>, backing_path: PathBuf) -> Self {
        let mut data = initial;
        data.resize(FLASH_LEN as usize, 0xff);
        SysFlash {
            data,
            mode: Mode::Array,
            status: STATUS_READY,
            backing_path,
        }
    }

    fn persist_byte(&self, offset: u64, value: u8) -> std::io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.backing_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&[value])?;
        Ok(())
    }
}

impl MemoryHandler for SysFlash {
    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        match self.mode {
            Mode::Status => Ok(self.status),
            _ => self
                .data
                .get(offset as usize)
                .copied()
                .ok_or(iodev::Error::UnknownRegister(offset, 8)),
        }
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        if self.mode == Mode::ArmedForProgram {
            self.mode = Mode::Array;
            if let Some(slot) = self.data.get_mut(offset as usize) {
                *slot = value;
            }
            if self.persist_byte(offset, value).is_err() {
                self.status = 0x10;
            }
            return Ok(());
        }

        match value {
            CMD_SINGLE_BYTE_PROGRAM => self.mode = Mode::ArmedForProgram,
            CMD_CLEAR_STATUS => {
                self.status = STATUS_READY;
            }
            CMD_READ_STATUS => self.mode = Mode::Status,
            CMD_READ_ARRAY => self.mode = Mode::Array,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    fn scratch_file() -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("flash-test-{:?}", std::thread::current().id()));
        std::fs::write(&path, vec![0xffu8; FLASH_LEN as usize]).unwrap();
        path
    }

    #[test]
    fn test_array_read_default_mode() {
        let path = scratch_file();
        let mut flash = SysFlash::new(vec![0xaa; 16], path);
        assert_eq!(flash.read8(0).unwrap(), 0xaa);
    }

    #[test]
    fn test_status_register_mode() {
        let path = scratch_file();
        let mut flash = SysFlash::new(vec![], path);
        flash.write8(0, CMD_READ_STATUS).unwrap();
        assert_eq!(flash.read8(0).unwrap(), STATUS_READY);
        flash.write8(0, CMD_READ_ARRAY).unwrap();
    }

    #[test]
    fn test_single_byte_program_persists() {
        let path = scratch_file();
        let mut flash = SysFlash::new(vec![0u8; 16], path.clone());
        flash.write8(0, CMD_SINGLE_BYTE_PROGRAM).unwrap();
        flash.write8(4, 0x42).unwrap();
        assert_eq!(flash.read8(4).unwrap(), 0x42);

        let mut persisted = Vec::new();
        std::fs::File::open(&path).unwrap().read_to_end(&mut persisted).unwrap();
        assert_eq!(persisted[4], 0x42);
    }
}
