// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Polymorphic memory-handler abstraction and address-space router. Grounded in
//! the source's `MemoryHandler`/`AddressSpace` (`iodev.py`), reimplemented here as
//! a plain trait object dispatcher rather than the source's class hierarchy: any
//! device that wants to sit on an I/O-port or MMIO bus implements
//! [`MemoryHandler`], and an [`AddressSpace`] is itself a [`MemoryHandler`] so it
//! can be mounted inside another (used for the PCI ECAM window, which nests a
//! per-function config-space handler inside the platform's top-level MMIO space).

use std::sync::{Arc, Mutex};

pub mod register;

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("no handler mapped at address {0:#x}")]
    NoMapping(u64),
    #[error("operation not implemented for this width")]
    NotImplemented,
    #[error("unknown register at offset {0:#x} (width {1})")]
    UnknownRegister(u64, u8),
    #[error("write of width {1} at offset {0:#x} hit only read-only registers")]
    ReadOnlyRegister(u64, u8),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Eight-entry-point contract every mapped device implements. Default bodies
/// return `NotImplemented`; the register-file framework overrides all eight.
pub trait MemoryHandler: Send {
    fn read8(&mut self, _offset: u64) -> Result<u8> {
        Err(Error::NotImplemented)
    }
    fn read16(&mut self, _offset: u64) -> Result<u16> {
        Err(Error::NotImplemented)
    }
    fn read32(&mut self, _offset: u64) -> Result<u32> {
        Err(Error::NotImplemented)
    }
    fn read64(&mut self, _offset: u64) -> Result<u64> {
        Err(Error::NotImplemented)
    }
    fn write8(&mut self, _offset: u64, _value: u8) -> Result<()> {
        Err(Error::NotImplemented)
    }
    fn write16(&mut self, _offset: u64, _value: u16) -> Result<()> {
        Err(Error::NotImplemented)
    }
    fn write32(&mut self, _offset: u64, _value: u32) -> Result<()> {
        Err(Error::NotImplemented)
    }
    fn write64(&mut self, _offset: u64, _value: u64) -> Result<()> {
        Err(Error::NotImplemented)
    }
}

pub type SharedHandler = Arc<Mutex<dyn MemoryHandler>>;

#[derive(Clone)]
struct Mount {
    base: u64,
    length: u64,
    handler: SharedHandler,
}

/// Handle returned by [`AddressSpace::mount`], letting the caller relocate a
/// mount later without tearing down and rebuilding the rest of the space —
/// needed for a PCI BAR, whose base moves whenever the guest reprograms it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MountId(usize);

/// Ordered sequence of mounted handlers; resolution is first-match. Cheap to
/// clone and shares one mount table (behind an `Arc<Mutex<_>>`) across every
/// clone, so a BAR rebase applied through one handle — e.g. the PCI config
/// path — is immediately visible through any other, including the vCPU
/// thread's own router clone.
#[derive(Default, Clone)]
pub struct AddressSpace {
    mounts: Arc<Mutex<Vec<Mount>>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        AddressSpace::default()
    }

    pub fn mount(&self, base: u64, length: u64, handler: SharedHandler) -> MountId {
        let mut mounts = self.mounts.lock().unwrap();
        mounts.push(Mount {
            base,
            length,
            handler,
        });
        MountId(mounts.len() - 1)
    }

    /// Relocates a previously mounted handler to a new base, e.g. after a PCI
    /// BAR write. The handler's length and identity are unchanged.
    pub fn rebase(&self, id: MountId, new_base: u64) {
        if let Some(mount) = self.mounts.lock().unwrap().get_mut(id.0) {
            mount.base = new_base;
        }
    }

    fn resolve(&self, addr: u64) -> Result<(SharedHandler, u64)> {
        self.mounts
            .lock()
            .unwrap()
            .iter()
            .find(|m| addr >= m.base && addr < m.base + m.length)
            .map(|m| (m.handler.clone(), addr - m.base))
            .ok_or(Error::NoMapping(addr))
    }

    pub fn read8(&self, addr: u64) -> Result<u8> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().read8(off)
    }

    pub fn read16(&self, addr: u64) -> Result<u16> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().read16(off)
    }

    pub fn read32(&self, addr: u64) -> Result<u32> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().read32(off)
    }

    pub fn read64(&self, addr: u64) -> Result<u64> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().read64(off)
    }

    pub fn write8(&self, addr: u64, value: u8) -> Result<()> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().write8(off, value)
    }

    pub fn write16(&self, addr: u64, value: u16) -> Result<()> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().write16(off, value)
    }

    pub fn write32(&self, addr: u64, value: u32) -> Result<()> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().write32(off, value)
    }

    pub fn write64(&self, addr: u64, value: u64) -> Result<()> {
        let (h, off) = self.resolve(addr)?;
        h.lock().unwrap().write64(off, value)
    }

    /// Width-generic read, used by the vCPU exit loop where the access width
    /// (1/2/4/8 bytes) is only known at runtime from the kernel's run page.
    pub fn read(&self, addr: u64, width: u8) -> Result<u64> {
        match width {
            8 => self.read8(addr).map(|v| v as u64),
            16 => self.read16(addr).map(|v| v as u64),
            32 => self.read32(addr).map(|v| v as u64),
            64 => self.read64(addr),
            _ => Err(Error::NotImplemented),
        }
    }

    /// Width-generic write; counterpart to [`AddressSpace::read`].
    pub fn write(&self, addr: u64, width: u8, value: u64) -> Result<()> {
        match width {
            8 => self.write8(addr, value as u8),
            16 => self.write16(addr, value as u16),
            32 => self.write32(addr, value as u32),
            64 => self.write64(addr, value),
            _ => Err(Error::NotImplemented),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Scratch(u8);
    impl MemoryHandler for Scratch {
        fn read8(&mut self, _offset: u64) -> Result<u8> {
            Ok(self.0)
        }
        fn write8(&mut self, _offset: u64, value: u8) -> Result<()> {
            self.0 = value;
            Ok(())
        }
    }

    #[test]
    fn test_first_match_resolution() {
        let space = AddressSpace::new();
        space.mount(0x10, 0x10, Arc::new(Mutex::new(Scratch(1))));
        space.mount(0x20, 0x10, Arc::new(Mutex::new(Scratch(2))));

        assert_eq!(space.read8(0x15).unwrap(), 1);
        assert_eq!(space.read8(0x25).unwrap(), 2);
    }

    #[test]
    fn test_miss_raises_no_mapping() {
        let space = AddressSpace::new();
        assert_eq!(space.read8(0x100).unwrap_err(), Error::NoMapping(0x100));
    }

    #[test]
    fn test_write_roundtrip() {
        let space = AddressSpace::new();
        space.mount(0x0, 0x10, Arc::new(Mutex::new(Scratch(0))));
        space.write8(0x4, 0x42).unwrap();
        assert_eq!(space.read8(0x4).unwrap(), 0x42);
    }

    #[test]
    fn test_rebase_moves_mount_and_is_visible_through_a_clone() {
        let space = AddressSpace::new();
        let id = space.mount(0x0, 0x10, Arc::new(Mutex::new(Scratch(7))));
        let cloned = space.clone();
        space.rebase(id, 0x100);
        assert_eq!(cloned.read8(0x108).unwrap(), 7);
        assert!(cloned.read8(0x8).is_err());
    }
}
