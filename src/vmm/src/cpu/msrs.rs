// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Boot/reset MSR entry construction. Grounded in `original_source/vmm.py`'s
//! `_resetVcpu` (the `addMsr(...)` sequence) and in the teacher's
//! `cpu::msrs::create_boot_msr_entries` (referenced from `cpu/mod.rs` though its
//! defining file was not itself part of the retrieved snapshot); the entries it
//! builds are the teacher's `kvm_bindings::Msrs` FAM wrapper, matching the
//! `set_msrs` contract `Vcpu::configure_msrs` already uses.

use kvm_bindings::{kvm_msr_entry, Msrs};

use super::msr_index::*;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to allocate MSR entry list: {0}")]
    Fam(vmm_sys_util::fam::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

fn entry(index: u32, data: u64) -> kvm_msr_entry {
    kvm_msr_entry {
        index,
        data,
        ..Default::default()
    }
}

/// The MSR set the reset-vector state assumes: SYSENTER/SYSCALL MSRs cleared,
/// TSC restarted at zero, and fast-string operations enabled.
pub fn create_reset_msr_entries() -> Result<Msrs> {
    let entries = vec![
        entry(MSR_IA32_SYSENTER_CS, 0),
        entry(MSR_IA32_SYSENTER_ESP, 0),
        entry(MSR_IA32_SYSENTER_EIP, 0),
        entry(MSR_STAR, 0),
        entry(MSR_CSTAR, 0),
        entry(MSR_KERNEL_GS_BASE, 0),
        entry(MSR_SYSCALL_MASK, 0),
        entry(MSR_LSTAR, 0),
        entry(MSR_IA32_TSC, 0),
        entry(MSR_IA32_MISC_ENABLE, MSR_IA32_MISC_ENABLE_FAST_STRING),
    ];

    Msrs::from_entries(&entries).map_err(Error::Fam)
}

/// Rebuilds an `Msrs` FAM struct from a captured `(index, value)` snapshot, used
/// to restore the host-derived MSR values taken right after vCPU creation.
pub fn msrs_from_snapshot(snapshot: &[(u32, u64)]) -> Result<Msrs> {
    let entries: Vec<kvm_msr_entry> = snapshot.iter().map(|&(i, v)| entry(i, v)).collect();
    Msrs::from_entries(&entries).map_err(Error::Fam)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_msr_entries_include_fast_string() {
        let msrs = create_reset_msr_entries().unwrap();
        let fast_string = msrs
            .as_slice()
            .iter()
            .find(|e| e.index == MSR_IA32_MISC_ENABLE)
            .unwrap();
        assert_eq!(fast_string.data, MSR_IA32_MISC_ENABLE_FAST_STRING);
    }

    #[test]
    fn test_snapshot_roundtrip_preserves_indices() {
        let snapshot = vec![(0x174u32, 5u64), (0x175, 6)];
        let msrs = msrs_from_snapshot(&snapshot).unwrap();
        assert_eq!(msrs.as_slice()[0].index, 0x174);
        assert_eq!(msrs.as_slice()[1].data, 6);
    }
}
