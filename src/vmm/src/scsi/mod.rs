// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! SCSI Architecture Model (SAM-4) service layer sitting behind virtio-scsi.
//! Grounded in the source's `ScsiCmd`/`ScsiResult`/`ScsiDevice`/
//! `ScsiBlockDevice`/`ScsiOpticalDevice`/`ScsiSubsystem` (`scsi.py`): a LUN is
//! anything implementing [`LogicalUnit`], the subsystem routes an
//! [`ExecuteCommand`] by 64-bit LUN id, and the base SPC command set
//! (INQUIRY, REQUEST SENSE, TEST UNIT READY) is provided once and shared by
//! the block and optical LUN kinds, each of which layers its own opcodes
//! (READ/WRITE/READ CAPACITY/MODE SENSE for block, READ TOC and GET
//! CONFIGURATION for optical) on top.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const STATUS_GOOD: u8 = 0x00;
pub const STATUS_CHECK_CONDITION: u8 = 0x02;

const SENSE_KEY_NO_SENSE: u8 = 0x0;
const SENSE_KEY_HW_ERROR: u8 = 0x4;
const SENSE_KEY_ILLEGAL_REQUEST: u8 = 0x5;

/// One canned sense-data template `(key, asc, ascq)`, matching the source's
/// `ScsiSenseTemplate`.
#[derive(Clone, Copy)]
pub struct SenseTemplate(u8, u8, u8);

pub const SENSE_INVALID_COMMAND_OPERATION_CODE: SenseTemplate = SenseTemplate(SENSE_KEY_ILLEGAL_REQUEST, 0x20, 0x00);
pub const SENSE_LBA_OUT_OF_RANGE: SenseTemplate = SenseTemplate(SENSE_KEY_ILLEGAL_REQUEST, 0x21, 0x00);
pub const SENSE_INVALID_FIELD_IN_CDB: SenseTemplate = SenseTemplate(SENSE_KEY_ILLEGAL_REQUEST, 0x24, 0x00);
pub const SENSE_LOGICAL_UNIT_NOT_SUPPORTED: SenseTemplate = SenseTemplate(SENSE_KEY_ILLEGAL_REQUEST, 0x25, 0x00);
pub const SENSE_LOGICAL_UNIT_FAILURE: SenseTemplate = SenseTemplate(SENSE_KEY_HW_ERROR, 0x3e, 0x01);
pub const SENSE_NONE: SenseTemplate = SenseTemplate(SENSE_KEY_NO_SENSE, 0x00, 0x00);

impl SenseTemplate {
    pub fn make(&self) -> Vec<u8> {
        let mut buf = vec![0u8; 18];
        buf[0] = 0x70;
        buf[2] = self.0 & 0xf;
        buf[7] = 10; // additional sense length
        buf[12] = self.1;
        buf[13] = self.2;
        buf
    }
}

/// Arguments to the SAM-4 Execute Command procedure call. `data_out` carries
/// guest-written bytes (WRITE-style commands); `data_in` is the buffer this
/// call fills for the guest to read back.
pub struct ScsiCmd<'a> {
    pub lun: u64,
    pub cdb: &'a [u8],
    pub data_out: &'a [u8],
    pub data_in_len: usize,
}

/// Result of a successful Execute Command call (a service response of
/// Command Complete; a transport-level failure is a different, non-SCSI
/// error surfaced by the virtio layer instead).
pub struct ScsiResult {
    pub status: u8,
    pub sense_data: Vec<u8>,
    pub data_in: Vec<u8>,
}

impl ScsiResult {
    pub fn good(data_in: Vec<u8>) -> Self {
        ScsiResult {
            status: STATUS_GOOD,
            sense_data: Vec::new(),
            data_in,
        }
    }

    pub fn check_condition(template: SenseTemplate) -> Self {
        ScsiResult {
            status: STATUS_CHECK_CONDITION,
            sense_data: template.make(),
            data_in: Vec::new(),
        }
    }
}

fn be32(buf: &[u8]) -> u32 {
    u32::from_be_bytes(buf.try_into().unwrap())
}

/// Shared INQUIRY/REQUEST SENSE identity a LUN kind publishes.
pub struct Identity {
    pub peripheral_device_type: u8,
    pub t10_vendor_id: &'static [u8; 8],
    pub vendor_id: &'static [u8; 8],
    pub product_id: &'static [u8; 16],
    pub product_rev: &'static [u8; 4],
    pub version_descriptors: [u16; 8],
}

/// One SCSI logical unit. The default-method dispatch in [`execute`]
/// provides TEST UNIT READY/REQUEST SENSE/INQUIRY; `execute_specific`
/// layers the LUN kind's own opcodes on top and falls back to the base set.
pub trait LogicalUnit: Send {
    fn identity(&self) -> Identity;
    fn last_sense(&mut self) -> &mut Option<Vec<u8>>;
    fn execute_specific(&mut self, req: &ScsiCmd) -> Option<ScsiResult>;

    fn execute(&mut self, req: &ScsiCmd) -> ScsiResult {
        let result = self
            .execute_specific(req)
            .unwrap_or_else(|| execute_base(self, req));
        *self.last_sense() = if result.sense_data.is_empty() {
            None
        } else {
            Some(result.sense_data.clone())
        };
        result
    }
}

fn execute_base<L: LogicalUnit + ?Sized>(lu: &mut L, req: &ScsiCmd) -> ScsiResult {
    match req.cdb[0] {
        0x00 => ScsiResult::good(Vec::new()), // TEST UNIT READY
        0x03 => handle_request_sense(lu, req),
        0x12 => handle_inquiry(lu, req),
        _ => ScsiResult::check_condition(SENSE_INVALID_COMMAND_OPERATION_CODE),
    }
}

fn handle_request_sense<L: LogicalUnit + ?Sized>(lu: &mut L, req: &ScsiCmd) -> ScsiResult {
    let use_descriptor_format = req.cdb[1] & 1 != 0;
    if use_descriptor_format {
        return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
    }
    let max_len = req.cdb[4] as usize;
    let sense = lu.last_sense().clone().unwrap_or_else(|| SENSE_NONE.make());
    let len = max_len.min(sense.len()).min(req.data_in_len);
    ScsiResult::good(sense[..len].to_vec())
}

fn handle_inquiry<L: LogicalUnit + ?Sized>(lu: &mut L, req: &ScsiCmd) -> ScsiResult {
    let evpd = req.cdb[1] & 1 != 0;
    let page = req.cdb[2];
    let identity = lu.identity();

    if evpd {
        return match page {
            0x00 => {
                let mut data = vec![identity.peripheral_device_type, 0x00, 0x00, 2];
                data.extend_from_slice(&[0x00, 0x83]);
                ScsiResult::good(data)
            }
            0x83 => {
                let mut ident = identity.t10_vendor_id.to_vec();
                ident.extend_from_slice(b"UNIT0001");
                let mut body = vec![2, 1, 0, ident.len() as u8];
                body.extend_from_slice(&ident);
                let eui64 = [0x11, 0x22, 0x33, 0x44, 0x11, 0x22, 0x33, 0x44];
                body.extend_from_slice(&[1, 2, 0, eui64.len() as u8]);
                body.extend_from_slice(&eui64);
                let mut data = vec![identity.peripheral_device_type, 0x83, 0x00, body.len() as u8];
                data.extend_from_slice(&body);
                ScsiResult::good(data)
            }
            _ => ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB),
        };
    }

    if page != 0 {
        return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
    }

    // Standard INQUIRY data, 96 bytes: header, vendor/product/rev, 20+2 NULs,
    // eight big-endian version descriptors, 22 trailing NULs.
    let mut data = vec![0u8; 96];
    data[0] = identity.peripheral_device_type;
    data[2] = 0x04; // version
    data[3] = 2; // response format
    data[4] = 0; // additional length
    data[8..16].copy_from_slice(identity.vendor_id);
    data[16..32].copy_from_slice(identity.product_id);
    data[32..36].copy_from_slice(identity.product_rev);
    for (i, descriptor) in identity.version_descriptors.iter().enumerate() {
        let off = 58 + i * 2;
        data[off..off + 2].copy_from_slice(&descriptor.to_be_bytes());
    }

    let len = data.len().min(req.data_in_len);
    ScsiResult::good(data[..len].to_vec())
}

/// Block storage LU backed by a plain file: READ(10), WRITE(10), READ
/// CAPACITY(10), WRITE SAME(10). MODE SENSE(6) is not supported and always
/// reports INVALID COMMAND OPERATION CODE, matching the source.
pub struct BlockLu {
    file: File,
    capacity: u64,
    writable: bool,
    last_sense: Option<Vec<u8>>,
}

pub const BLOCK_SIZE: u64 = 512;

impl BlockLu {
    pub fn open(path: &Path, writable: bool) -> std::io::Result<Self> {
        let file = OpenOptions::new().read(true).write(writable).open(path)?;
        let capacity = file.metadata()?.len();
        Ok(BlockLu {
            file,
            capacity,
            writable,
            last_sense: None,
        })
    }

    /// Shared READ CAPACITY (10) body; `block_size` is the LUN kind's own
    /// logical block size (512 for `BlockLu`, 2048 for `OpticalLu`), not
    /// always [`BLOCK_SIZE`].
    fn read_capacity_10_with_block_size(&mut self, req: &ScsiCmd, block_size: u64) -> ScsiResult {
        if req.cdb.len() < 10 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let lba = be32(&req.cdb[2..6]);
        if lba != 0 || req.cdb[8] & 1 != 0 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let num_lba = ((self.capacity / block_size).saturating_sub(1)).min(u32::MAX as u64) as u32;
        let mut data = Vec::with_capacity(8);
        data.extend_from_slice(&num_lba.to_be_bytes());
        data.extend_from_slice(&(block_size as u32).to_be_bytes());
        ScsiResult::good(data)
    }

    fn read_capacity_10(&mut self, req: &ScsiCmd) -> ScsiResult {
        self.read_capacity_10_with_block_size(req, BLOCK_SIZE)
    }

    /// Shared READ (10) body; `block_size` is the LUN kind's own logical
    /// block size, matching [`BlockLu::read_capacity_10_with_block_size`].
    fn read_10_with_block_size(&mut self, req: &ScsiCmd, block_size: u64) -> ScsiResult {
        if req.cdb.len() < 10 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let lba = be32(&req.cdb[2..6]) as u64;
        let xfer_len = u16::from_be_bytes([req.cdb[7], req.cdb[8]]) as u64;
        let len = (xfer_len * block_size) as usize;
        if (lba + xfer_len) * block_size > self.capacity {
            return ScsiResult::check_condition(SENSE_LBA_OUT_OF_RANGE);
        }
        let mut data = vec![0u8; len];
        if self.file.seek(SeekFrom::Start(lba * block_size)).is_err() || self.file.read_exact(&mut data).is_err() {
            return ScsiResult::check_condition(SENSE_LOGICAL_UNIT_FAILURE);
        }
        ScsiResult::good(data)
    }

    fn read_10(&mut self, req: &ScsiCmd) -> ScsiResult {
        self.read_10_with_block_size(req, BLOCK_SIZE)
    }

    fn write_10(&mut self, req: &ScsiCmd) -> ScsiResult {
        if !self.writable || req.cdb.len() < 10 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let lba = be32(&req.cdb[2..6]) as u64;
        if self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE)).is_err() || self.file.write_all(req.data_out).is_err() {
            return ScsiResult::check_condition(SENSE_LOGICAL_UNIT_FAILURE);
        }
        ScsiResult::good(Vec::new())
    }

    fn write_same_10(&mut self, req: &ScsiCmd) -> ScsiResult {
        if !self.writable || req.cdb.len() < 10 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let lba = be32(&req.cdb[2..6]) as u64;
        let xfer_len = u16::from_be_bytes([req.cdb[7], req.cdb[8]]) as u64;
        if req.data_out.len() < BLOCK_SIZE as usize {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let block = &req.data_out[..BLOCK_SIZE as usize];
        if self.file.seek(SeekFrom::Start(lba * BLOCK_SIZE)).is_err() {
            return ScsiResult::check_condition(SENSE_LOGICAL_UNIT_FAILURE);
        }
        for _ in 0..xfer_len {
            if self.file.write_all(block).is_err() {
                return ScsiResult::check_condition(SENSE_LOGICAL_UNIT_FAILURE);
            }
        }
        ScsiResult::good(Vec::new())
    }
}

impl LogicalUnit for BlockLu {
    fn identity(&self) -> Identity {
        Identity {
            peripheral_device_type: 0x00,
            t10_vendor_id: b"DEVEVER ",
            vendor_id: b"DEVEVER ",
            product_id: b"BLKDEV          ",
            product_rev: b"0   ",
            version_descriptors: [0x0080, 0x0600, 0, 0, 0, 0, 0, 0],
        }
    }

    fn last_sense(&mut self) -> &mut Option<Vec<u8>> {
        &mut self.last_sense
    }

    fn execute_specific(&mut self, req: &ScsiCmd) -> Option<ScsiResult> {
        Some(match req.cdb[0] {
            0x25 => self.read_capacity_10(req),
            0x28 => self.read_10(req),
            0x2a => self.write_10(req),
            0x41 => self.write_same_10(req),
            0x1a => ScsiResult::check_condition(SENSE_INVALID_COMMAND_OPERATION_CODE), // MODE SENSE (6)
            _ => return None,
        })
    }
}

/// Optical LU: read-only block device plus READ TOC/PMA/ATIP and GET
/// CONFIGURATION, the minimum an initrd's udev cdrom scanner needs to see
/// media present.
pub struct OpticalLu {
    block: BlockLu,
}

pub const OPTICAL_BLOCK_SIZE: u64 = 2048;

impl OpticalLu {
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(OpticalLu {
            block: BlockLu::open(path, false)?,
        })
    }

    fn read_toc_pma_atip(&mut self, req: &ScsiCmd) -> ScsiResult {
        let format = req.cdb[2] & 0xf;
        if format != 0 {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }
        let track_session_no = req.cdb[6];
        if track_session_no > 1 && track_session_no != 0xaa {
            return ScsiResult::check_condition(SENSE_INVALID_FIELD_IN_CDB);
        }

        let mut data = Vec::new();
        if track_session_no <= 1 {
            data.extend_from_slice(&[0, 0x14, 1, 0]);
            data.extend_from_slice(&0u32.to_be_bytes());
        }
        let lba = (self.block.capacity / OPTICAL_BLOCK_SIZE) as u32;
        data.extend_from_slice(&[0, 0x16, 0xaa, 0]);
        data.extend_from_slice(&lba.to_be_bytes());

        let mut resp = Vec::with_capacity(4 + data.len());
        resp.extend_from_slice(&(data.len() as u16).to_be_bytes());
        resp.extend_from_slice(&[1, 1]);
        resp.extend_from_slice(&data);
        ScsiResult::good(resp)
    }

    fn get_configuration(&mut self) -> ScsiResult {
        let mut data = Vec::new();
        data.extend_from_slice(&0u16.to_be_bytes());
        data.extend_from_slice(&0x0040u16.to_be_bytes()); // current profile: BD-ROM

        data.extend_from_slice(&0x0000u16.to_be_bytes());
        data.push(0x3);
        data.push(4);
        data.extend_from_slice(&0x0040u16.to_be_bytes());
        data.extend_from_slice(&[1, 0]);

        let len = (data.len() as u32) - 4;
        let mut resp = len.to_be_bytes().to_vec();
        resp.extend_from_slice(&data[4..]);
        ScsiResult::good(resp)
    }
}

impl LogicalUnit for OpticalLu {
    fn identity(&self) -> Identity {
        Identity {
            peripheral_device_type: 0x05,
            t10_vendor_id: b"DEVEVER ",
            vendor_id: b"DEVEVER ",
            product_id: b"OPTICAL         ",
            product_rev: b"0   ",
            version_descriptors: [0x0080, 0x0600, 0, 0, 0, 0, 0, 0],
        }
    }

    fn last_sense(&mut self) -> &mut Option<Vec<u8>> {
        self.block.last_sense()
    }

    fn execute_specific(&mut self, req: &ScsiCmd) -> Option<ScsiResult> {
        match req.cdb[0] {
            0x43 => Some(self.read_toc_pma_atip(req)),
            0x46 => Some(self.get_configuration()),
            0x25 => Some(self.block.read_capacity_10_with_block_size(req, OPTICAL_BLOCK_SIZE)),
            0x28 => Some(self.block.read_10_with_block_size(req, OPTICAL_BLOCK_SIZE)),
            _ => None,
        }
    }
}

/// Routes an Execute Command call to the registered LUN by 64-bit id,
/// matching the source's `ScsiSubsystem`.
#[derive(Default)]
pub struct ScsiSubsystem {
    luns: HashMap<u64, Box<dyn LogicalUnit>>,
}

pub const OPTICAL_LUN_ID: u64 = 0x0100_4000_0000_0000;
pub const DISK_LUN_ID: u64 = 0x0100_4001_0000_0000;

impl ScsiSubsystem {
    pub fn new() -> Self {
        ScsiSubsystem::default()
    }

    pub fn register(&mut self, id: u64, lun: Box<dyn LogicalUnit>) {
        self.luns.insert(id, lun);
    }

    pub fn execute(&mut self, req: &ScsiCmd) -> ScsiResult {
        match self.luns.get_mut(&req.lun) {
            Some(lun) => lun.execute(req),
            None => ScsiResult::check_condition(SENSE_LOGICAL_UNIT_NOT_SUPPORTED),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn scratch_disk(len: usize) -> std::path::PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("scsi-test-{:?}-{}", std::thread::current().id(), len));
        std::fs::File::create(&path).unwrap().write_all(&vec![0u8; len]).unwrap();
        path
    }

    #[test]
    fn test_test_unit_ready_always_good() {
        let path = scratch_disk(4096);
        let mut lu = BlockLu::open(&path, true).unwrap();
        let req = ScsiCmd { lun: 0, cdb: &[0x00, 0, 0, 0, 0, 0], data_out: &[], data_in_len: 0 };
        let result = lu.execute(&req);
        assert_eq!(result.status, STATUS_GOOD);
    }

    #[test]
    fn test_inquiry_reports_peripheral_type() {
        let path = scratch_disk(4096);
        let mut lu = BlockLu::open(&path, true).unwrap();
        let cdb = [0x12, 0, 0, 0, 36, 0];
        let req = ScsiCmd { lun: 0, cdb: &cdb, data_out: &[], data_in_len: 36 };
        let result = lu.execute(&req);
        assert_eq!(result.status, STATUS_GOOD);
        assert_eq!(result.data_in[0], 0x00);
    }

    #[test]
    fn test_read_capacity_10_reports_block_size() {
        let path = scratch_disk(4096);
        let mut lu = BlockLu::open(&path, true).unwrap();
        let cdb = [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let req = ScsiCmd { lun: 0, cdb: &cdb, data_out: &[], data_in_len: 8 };
        let result = lu.execute(&req);
        assert_eq!(be32(&result.data_in[4..8]), BLOCK_SIZE as u32);
    }

    #[test]
    fn test_inquiry_full_96_byte_layout() {
        let path = scratch_disk(4096);
        let mut lu = BlockLu::open(&path, true).unwrap();
        let cdb = [0x12, 0, 0, 0, 0x60, 0];
        let req = ScsiCmd { lun: 0, cdb: &cdb, data_out: &[], data_in_len: 0x60 };
        let result = lu.execute(&req);
        assert_eq!(result.status, STATUS_GOOD);
        assert_eq!(result.data_in.len(), 96);
        assert_eq!(&result.data_in[8..16], b"DEVEVER ");
        assert_eq!(&result.data_in[16..32], b"BLKDEV          ");
    }

    #[test]
    fn test_unknown_opcode_is_check_condition() {
        let path = scratch_disk(4096);
        let mut lu = BlockLu::open(&path, true).unwrap();
        let cdb = [0xde, 0, 0, 0, 0, 0];
        let req = ScsiCmd { lun: 0, cdb: &cdb, data_out: &[], data_in_len: 0 };
        let result = lu.execute(&req);
        assert_eq!(result.status, STATUS_CHECK_CONDITION);
    }

    #[test]
    fn test_optical_read_capacity_10_uses_2048_byte_blocks() {
        let path = scratch_disk(3 * OPTICAL_BLOCK_SIZE as usize);
        let mut lu = OpticalLu::open(&path).unwrap();
        let cdb = [0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let req = ScsiCmd { lun: 0, cdb: &cdb, data_out: &[], data_in_len: 8 };
        let result = lu.execute(&req);
        assert_eq!(result.status, STATUS_GOOD);
        assert_eq!(be32(&result.data_in[0..4]), 2); // N-1 blocks, N=3
        assert_eq!(be32(&result.data_in[4..8]), OPTICAL_BLOCK_SIZE as u32);
    }

    #[test]
    fn test_subsystem_routes_by_lun_id() {
        let path = scratch_disk(4096);
        let mut subsystem = ScsiSubsystem::new();
        subsystem.register(DISK_LUN_ID, Box::new(BlockLu::open(&path, true).unwrap()));

        let cdb = [0x00, 0, 0, 0, 0, 0];
        let good = subsystem.execute(&ScsiCmd { lun: DISK_LUN_ID, cdb: &cdb, data_out: &[], data_in_len: 0 });
        assert_eq!(good.status, STATUS_GOOD);

        let missing = subsystem.execute(&ScsiCmd { lun: 0xdead, cdb: &cdb, data_out: &[], data_in_len: 0 });
        assert_eq!(missing.status, STATUS_CHECK_CONDITION);
    }
}
