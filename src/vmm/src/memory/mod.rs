// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Guest-memory manager: maps host-anonymous memory as guest-physical slots via
//! `vm-memory`'s `GuestRegionMmap`, and exposes a scatter/gather extent view across
//! slot boundaries for the virtio-scsi data path. Slots are kept in an explicit
//! ordered `Vec` rather than handed to a single `GuestMemoryMmap`, because the
//! platform resets by clearing every slot and reinstantiating its address spaces
//! (see `Platform::reset`), and slot ids must stay stable and resettable
//! independently of `vm-memory`'s own region bookkeeping.

use std::convert::TryFrom;
use std::sync::Arc;

use vm_memory::mmap::MmapRegion;
use vm_memory::{Address, GuestAddress, GuestUsize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to map guest memory region: {0}")]
    Mmap(vm_memory::mmap::MmapRegionError),
    #[error("guest-physical range [{0:#x}, {0:#x}+{1:#x}) is not fully mapped")]
    Unmapped(u64, u64),
    #[error("new slot [{0:#x}, {0:#x}+{1:#x}) overlaps an existing slot")]
    Overlap(u64, u64),
    #[error("no memory slot with id {0}")]
    UnknownSlot(u32),
}

pub type Result<T> = std::result::Result<T, Error>;

/// A single guest-physical memory slot backing a host-anonymous mapping (or,
/// via [`MemoryManager::map_existing`], a caller-supplied host region).
pub struct MemorySlot {
    id: u32,
    gpa_base: u64,
    length: usize,
    read_only: bool,
    region: Arc<MmapRegion>,
}

impl MemorySlot {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn gpa_base(&self) -> u64 {
        self.gpa_base
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn host_base(&self) -> *mut u8 {
        self.region.as_ptr()
    }

    fn contains(&self, gpa: u64) -> bool {
        gpa >= self.gpa_base && gpa < self.gpa_base + self.length as u64
    }

    /// A host-side view `(host_ptr, len)` into this slot starting at `gpa`, clamped
    /// to at most `max_len` bytes and to the end of the slot.
    fn extent_from(&self, gpa: u64, max_len: usize) -> MemoryExtent {
        let offset = (gpa - self.gpa_base) as usize;
        let avail = self.length - offset;
        let len = avail.min(max_len);
        MemoryExtent {
            host_ptr: unsafe { self.region.as_ptr().add(offset) },
            len,
        }
    }
}

/// A `(host_ptr, len)` view into a slot. Slicing into sub-extents is just taking a
/// narrower `len`; lifetime is bounded by the parent slot, which callers must keep
/// alive (in practice, the lifetime of the `MemoryManager` across one vCPU exit).
#[derive(Clone, Copy)]
pub struct MemoryExtent {
    host_ptr: *mut u8,
    len: usize,
}

impl MemoryExtent {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// The caller must not hold this slice across a `vcpu.run()` call: guest
    /// memory is volatile, host-anonymous memory the guest may concurrently write.
    pub unsafe fn as_slice(&self) -> &[u8] {
        std::slice::from_raw_parts(self.host_ptr, self.len)
    }

    /// # Safety
    /// See [`MemoryExtent::as_slice`].
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.host_ptr, self.len)
    }
}

#[derive(Default)]
pub struct MemoryManager {
    slots: Vec<MemorySlot>,
    next_slot_id: u32,
}

impl MemoryManager {
    pub fn new() -> Self {
        MemoryManager::default()
    }

    fn check_no_overlap(&self, gpa: u64, length: u64) -> Result<()> {
        let end = gpa + length;
        for slot in &self.slots {
            let slot_end = slot.gpa_base + slot.length as u64;
            if gpa < slot_end && slot.gpa_base < end {
                return Err(Error::Overlap(gpa, length));
            }
        }
        Ok(())
    }

    /// Allocates a fresh anonymous host mapping (no-reserve semantics, matching
    /// `MAP_ANON|MAP_PRIVATE|MAP_NORESERVE`) and registers it as a guest-physical
    /// slot.
    pub fn map_new(&mut self, gpa: u64, length: GuestUsize, read_only: bool) -> Result<u32> {
        self.check_no_overlap(gpa, length)?;
        let region = MmapRegion::new(length as usize).map_err(Error::Mmap)?;
        let id = self.next_slot_id;
        self.next_slot_id += 1;

        self.slots.push(MemorySlot {
            id,
            gpa_base: gpa,
            length: length as usize,
            read_only,
            region: Arc::new(region),
        });

        Ok(id)
    }

    /// Registers a pre-existing host region (e.g. a file-backed mapping owned by
    /// the caller) as a guest-physical slot.
    pub fn map_existing(&mut self, gpa: u64, region: Arc<MmapRegion>, read_only: bool) -> Result<u32> {
        let length = region.len() as u64;
        self.check_no_overlap(gpa, length)?;
        let id = self.next_slot_id;
        self.next_slot_id += 1;

        self.slots.push(MemorySlot {
            id,
            gpa_base: gpa,
            length: length as usize,
            read_only,
            region,
        });

        Ok(id)
    }

    /// Tears down every slot and resets the slot-id counter, matching the
    /// platform's reset-time memory wipe.
    pub fn clear(&mut self) {
        self.slots.clear();
        self.next_slot_id = 0;
    }

    /// Tears down a single slot by id, releasing its host mapping without
    /// disturbing any other live slot or the id counter. Unlike [`Self::clear`],
    /// freed ids are not reused.
    pub fn teardown(&mut self, id: u32) -> Result<()> {
        let pos = self
            .slots
            .iter()
            .position(|slot| slot.id == id)
            .ok_or(Error::UnknownSlot(id))?;
        self.slots.remove(pos);
        Ok(())
    }

    /// First-match linear scan, matching the source's resolution order exactly
    /// (slots are expected never to overlap, so match order is not load-bearing
    /// in practice, but the scan order itself is part of the observable contract).
    pub fn resolve_slot(&self, gpa: u64) -> Option<&MemorySlot> {
        self.slots.iter().find(|slot| slot.contains(gpa))
    }

    pub fn resolve_extent(&self, gpa: u64) -> Option<MemoryExtent> {
        let slot = self.resolve_slot(gpa)?;
        Some(slot.extent_from(gpa, slot.length))
    }

    /// Scatter list bridging slot boundaries; fails if any byte in
    /// `[gpa, gpa+length)` is unmapped.
    pub fn resolve_extents(&self, gpa: u64, length: u64) -> Result<Vec<MemoryExtent>> {
        let mut extents = Vec::new();
        let mut cur = gpa;
        let mut remaining = length;

        while remaining > 0 {
            let slot = self
                .resolve_slot(cur)
                .ok_or(Error::Unmapped(gpa, length))?;
            let extent = slot.extent_from(cur, remaining as usize);
            if extent.is_empty() {
                return Err(Error::Unmapped(gpa, length));
            }
            cur += extent.len() as u64;
            remaining -= extent.len() as u64;
            extents.push(extent);
        }

        Ok(extents)
    }

    pub fn read(&self, gpa: u64, len: usize) -> Result<Vec<u8>> {
        let extents = self.resolve_extents(gpa, len as u64)?;
        let mut out = Vec::with_capacity(len);
        for extent in extents {
            out.extend_from_slice(unsafe { extent.as_slice() });
        }
        Ok(out)
    }

    pub fn write(&self, gpa: u64, bytes: &[u8]) -> Result<()> {
        let extents = self.resolve_extents(gpa, bytes.len() as u64)?;
        let mut off = 0usize;
        for extent in extents {
            let dst = unsafe { extent.as_mut_slice() };
            dst.copy_from_slice(&bytes[off..off + dst.len()]);
            off += dst.len();
        }
        Ok(())
    }
}

/// Convenience conversion matching the teacher's use of `GuestAddress` at call
/// sites that still want a typed address rather than a raw `u64`.
pub fn guest_address(gpa: u64) -> GuestAddress {
    GuestAddress(gpa)
}

pub fn checked_u32(value: u64) -> Option<u32> {
    u32::try_from(value).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_new_and_read_write_roundtrip() {
        let mut mm = MemoryManager::new();
        let id = mm.map_new(0x1000, 0x1000, false).unwrap();
        assert_eq!(id, 0);

        mm.write(0x1000, &[1, 2, 3, 4]).unwrap();
        let data = mm.read(0x1000, 4).unwrap();
        assert_eq!(data, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_resolve_extents_crosses_slots() {
        let mut mm = MemoryManager::new();
        mm.map_new(0x0000, 0x10, false).unwrap();
        mm.map_new(0x0010, 0x10, false).unwrap();

        mm.write(0x8, &[0xAA; 8]).unwrap();
        let extents = mm.resolve_extents(0x8, 16).unwrap();
        let total: usize = extents.iter().map(|e| e.len()).sum();
        assert_eq!(total, 16);
    }

    #[test]
    fn test_resolve_extents_fails_on_gap() {
        let mut mm = MemoryManager::new();
        mm.map_new(0x0000, 0x10, false).unwrap();
        mm.map_new(0x0020, 0x10, false).unwrap();

        assert!(mm.resolve_extents(0x8, 32).is_err());
    }

    #[test]
    fn test_clear_resets_slot_id_counter() {
        let mut mm = MemoryManager::new();
        mm.map_new(0x0, 0x10, false).unwrap();
        mm.map_new(0x10, 0x10, false).unwrap();
        mm.clear();
        let id = mm.map_new(0x0, 0x10, false).unwrap();
        assert_eq!(id, 0);
    }

    #[test]
    fn test_overlap_rejected() {
        let mut mm = MemoryManager::new();
        mm.map_new(0x0, 0x10, false).unwrap();
        assert!(mm.map_new(0x8, 0x10, false).is_err());
    }

    #[test]
    fn test_teardown_removes_one_slot_without_affecting_others() {
        let mut mm = MemoryManager::new();
        let a = mm.map_new(0x0, 0x10, false).unwrap();
        let b = mm.map_new(0x10, 0x10, false).unwrap();
        mm.write(0x10, &[7, 7, 7, 7]).unwrap();

        mm.teardown(a).unwrap();

        assert!(mm.resolve_slot(0x0).is_none());
        assert_eq!(mm.read(0x10, 4).unwrap(), vec![7, 7, 7, 7]);

        // The freed id is not handed back out, unlike `clear`'s reset behavior.
        let c = mm.map_new(0x20, 0x10, false).unwrap();
        assert_ne!(c, a);
        assert_ne!(c, b);
    }

    #[test]
    fn test_teardown_unknown_slot_errors() {
        let mut mm = MemoryManager::new();
        mm.map_new(0x0, 0x10, false).unwrap();
        assert!(mm.teardown(99).is_err());
    }
}
