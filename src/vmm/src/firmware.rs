// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Loads the UEFI firmware code image into guest memory at the top of the 4 GiB
//! address space (with a reset-vector shadow copy at `1 MiB − 128 KiB`), and maps
//! the firmware-vars flash backing file at `0xFFC0_0000`. Mirrors the shape of the
//! teacher's `kernel::kernel_setup`, replacing ELF/bzImage loading with a flat
//! firmware-image blit since this platform boots OVMF-style firmware rather than a
//! pre-started Linux kernel.

use std::fs::File;
use std::io::Read as IoRead;
use std::path::Path;

use crate::memory::MemoryManager;
use crate::{Error, Result};

/// Top of the 32-bit physical address space.
const GUEST_PHYS_END_4G: u64 = 0x1_0000_0000;
/// Size of the reset-vector shadow copy kept at `1 MiB − 128 KiB`.
const RESET_VECTOR_SHADOW_SIZE: u64 = 128 * 1024;
const RESET_VECTOR_SHADOW_BASE: u64 = 0x0010_0000 - RESET_VECTOR_SHADOW_SIZE;

/// Address at which the writable fwvars flash is mapped.
pub const FWVARS_BASE: u64 = 0xFFC0_0000;

/// Reads the whole firmware code image into a buffer and writes it at the top of
/// 4 GiB, plus a shadow copy of its last 128 KiB at the legacy reset-vector
/// location, matching how real firmware expects to be visible from real mode.
pub fn load_firmware_code(memory: &MemoryManager, path: &Path) -> Result<()> {
    let mut file = File::open(path).map_err(Error::IO)?;
    let mut image = Vec::new();
    file.read_to_end(&mut image).map_err(Error::IO)?;

    let load_base = GUEST_PHYS_END_4G - image.len() as u64;
    memory.write(load_base, &image).map_err(Error::Memory)?;

    let shadow_len = RESET_VECTOR_SHADOW_SIZE.min(image.len() as u64) as usize;
    let shadow_src = &image[image.len() - shadow_len..];
    memory
        .write(RESET_VECTOR_SHADOW_BASE, shadow_src)
        .map_err(Error::Memory)?;

    Ok(())
}

/// Reads the full contents of the fwvars backing file, to seed the system-flash
/// device's in-memory array before guest writes start mutating it.
pub fn read_firmware_vars(path: &Path) -> Result<Vec<u8>> {
    let mut file = File::open(path).map_err(Error::IO)?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).map_err(Error::IO)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_vector_shadow_base() {
        assert_eq!(RESET_VECTOR_SHADOW_BASE, 0x000E_0000);
    }
}
