// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

#![cfg(target_arch = "x86_64")]

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, KVM_MAX_CPUID_ENTRIES};
use kvm_ioctls::{Kvm, VmFd};

mod config;
mod cpu;
mod devices;
mod firmware;
mod iodev;
pub mod logger;
mod memory;
mod pci;
mod platform;
mod scsi;
mod virtio;

pub use config::VMMConfig;

use cpu::{cpuid, Vcpu};
use memory::MemoryManager;
use platform::Platform;

/// Top of the 32-bit physical address space, where firmware code is loaded.
const GUEST_PHYS_END_4G: u64 = 0x1_0000_0000;

/// TSS address KVM reserves below 4 GiB for virtualized real-mode task
/// switches; kept well clear of the firmware image at the top of memory.
const KVM_TSS_ADDRESS: u64 = 0xFFFB_D000;

/// GSI line virtio-scsi asserts on notify-driven completion.
const VIRTIO_SCSI_IRQ: u8 = 11;

/// Legacy PIC line the PS/2 keyboard controller asserts on key events.
const PS2_KEYBOARD_IRQ: u8 = 1;

const KVM_MEM_READONLY: u32 = 1 << 2;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("error issuing an ioctl to KVM: {0}")]
    KvmIoctl(kvm_ioctls::Error),
    #[error("vCPU error: {0}")]
    Vcpu(cpu::Error),
    #[error("guest memory error: {0}")]
    Memory(memory::Error),
    #[error("I/O error: {0}")]
    IO(io::Error),
    #[error("configuration error: {0}")]
    Config(config::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Registers a freshly allocated guest-memory slot with both the in-process
/// [`MemoryManager`] and the kernel hypervisor's user-memory-region table, so
/// the two stay in lockstep: the manager resolves guest-physical addresses to
/// host pointers for device emulation, KVM uses the same mapping to satisfy
/// guest page-table walks directly.
fn map_and_register(vm_fd: &VmFd, memory: &Mutex<MemoryManager>, gpa: u64, length: u64, read_only: bool) -> Result<()> {
    let mut mm = memory.lock().unwrap();
    let slot_id = mm.map_new(gpa, length, read_only).map_err(Error::Memory)?;
    let slot = mm.resolve_slot(gpa).expect("slot was just inserted at this address");

    let region = kvm_userspace_memory_region {
        slot: slot_id,
        guest_phys_addr: gpa,
        memory_size: length,
        userspace_addr: slot.host_base() as u64,
        flags: if read_only { KVM_MEM_READONLY } else { 0 },
    };
    // Safety: `userspace_addr` comes from a live `MmapRegion` owned by `mm`
    // for at least as long as this slot stays registered.
    unsafe { vm_fd.set_user_memory_region(region) }.map_err(Error::KvmIoctl)?;
    Ok(())
}

/// Maps the guest's low RAM and the firmware-code image at the top of 4 GiB,
/// registering both with KVM. Called at boot and again on every reset, since
/// reset tears down and rebuilds every guest-memory slot.
fn map_guest_memory(vm_fd: &VmFd, memory: &Mutex<MemoryManager>, config: &VMMConfig) -> Result<()> {
    let ram_len = config.memory_mb as u64 * 1024 * 1024;
    map_and_register(vm_fd, memory, 0, ram_len, false)?;

    let fw_len = config.fwcode.size;
    map_and_register(vm_fd, memory, GUEST_PHYS_END_4G - fw_len, fw_len, true)?;

    Ok(())
}

/// Wires the platform's PS/2 controller back to this VMM instance: a keyboard
/// reset pulse sets `pending_reset` for [`VMM::run`] to notice between vCPU
/// exits, and key events assert IRQ1 on the in-kernel PIC.
fn wire_platform(vm_fd: &Arc<VmFd>, platform: &Platform, pending_reset: &Arc<AtomicBool>) {
    let flag = pending_reset.clone();
    let vm_fd_irq1 = vm_fd.clone();
    platform.wire_ps2(
        move || flag.store(true, Ordering::SeqCst),
        move || {
            let _ = vm_fd_irq1.set_irq_line(PS2_KEYBOARD_IRQ as u32, true);
            let _ = vm_fd_irq1.set_irq_line(PS2_KEYBOARD_IRQ as u32, false);
        },
    );
}

/// Owns the hypervisor handle, the single vCPU, the guest-memory manager, and
/// the platform (device map). A keyboard-triggered reset replaces `platform`
/// and re-points the vCPU at its fresh address spaces without tearing down
/// the VM or vCPU file descriptors themselves.
pub struct VMM {
    kvm: Kvm,
    vm_fd: Arc<VmFd>,
    memory: Arc<Mutex<MemoryManager>>,
    config: VMMConfig,
    platform: Platform,
    vcpu: Vcpu,
    pending_reset: Arc<AtomicBool>,
}

impl VMM {
    /// Brings up the hypervisor, the single vCPU, and the full device map per
    /// §4.8: open the kernel device, create the VM, in-kernel PIT and IRQ
    /// chip, load the firmware image, construct the platform, create the
    /// vCPU, snapshot its host-derived MSRs, program CPUID2 and the initial
    /// LAPIC LVT state, then reset it to the real-mode reset-vector state.
    pub fn new(config: VMMConfig) -> Result<Self> {
        logger::set_verbosity(config.verbose);

        let kvm = Kvm::new().map_err(Error::KvmIoctl)?;
        let vm_fd = Arc::new(kvm.create_vm().map_err(Error::KvmIoctl)?);

        vm_fd.set_tss_address(KVM_TSS_ADDRESS as usize).map_err(Error::KvmIoctl)?;
        vm_fd.create_pit2(kvm_pit_config::default()).map_err(Error::KvmIoctl)?;
        vm_fd.create_irq_chip().map_err(Error::KvmIoctl)?;

        let memory = Arc::new(Mutex::new(MemoryManager::new()));
        map_guest_memory(&vm_fd, &memory, &config)?;
        {
            let mm = memory.lock().unwrap();
            firmware::load_firmware_code(&mm, &config.fwcode.path)?;
        }

        let platform = Platform::new(&config, memory.clone(), vm_fd.clone(), VIRTIO_SCSI_IRQ)?;

        let mut vcpu = Vcpu::new(&vm_fd, 0, platform.io.clone(), platform.mmio.clone()).map_err(Error::Vcpu)?;

        let msr_list = kvm.get_msr_index_list().map_err(Error::KvmIoctl)?;
        vcpu.snapshot_msrs(msr_list.as_slice()).map_err(Error::Vcpu)?;

        let base_cpuid = kvm.get_supported_cpuid(KVM_MAX_CPUID_ENTRIES).map_err(Error::KvmIoctl)?;
        vcpu.configure_cpuid(&cpuid::build_guest_cpuid(&base_cpuid)).map_err(Error::Vcpu)?;
        vcpu.configure_lapic().map_err(Error::Vcpu)?;
        vcpu.reset().map_err(Error::Vcpu)?;

        let pending_reset = Arc::new(AtomicBool::new(false));
        wire_platform(&vm_fd, &platform, &pending_reset);

        Ok(VMM {
            kvm,
            vm_fd,
            memory,
            config,
            platform,
            vcpu,
            pending_reset,
        })
    }

    /// Implements the PS/2-triggered reset path (§4.8): clears the
    /// guest-memory manager, remaps and reloads firmware, reinstantiates the
    /// platform (reconstructing both address spaces and every device from
    /// scratch), rebinds the vCPU to them, and resets its architectural
    /// state. The vCPU file descriptor itself, and the rest of the VM, are
    /// left untouched.
    fn perform_reset(&mut self) -> Result<()> {
        self.memory.lock().unwrap().clear();
        map_guest_memory(&self.vm_fd, &self.memory, &self.config)?;
        {
            let mm = self.memory.lock().unwrap();
            firmware::load_firmware_code(&mm, &self.config.fwcode.path)?;
        }

        self.platform = Platform::new(&self.config, self.memory.clone(), self.vm_fd.clone(), VIRTIO_SCSI_IRQ)?;
        self.vcpu.rebind_address_spaces(self.platform.io.clone(), self.platform.mmio.clone());
        self.vcpu.reset().map_err(Error::Vcpu)?;

        wire_platform(&self.vm_fd, &self.platform, &self.pending_reset);
        Ok(())
    }

    /// Runs the vCPU until it halts or shuts down, servicing a pending reset
    /// request between exits so device emulation on the vCPU thread is never
    /// re-entered mid-step.
    pub fn run(&mut self) -> Result<()> {
        loop {
            if let cpu::StepOutcome::Halted = self.vcpu.step().map_err(Error::Vcpu)? {
                return Ok(());
            }
            if self.pending_reset.swap(false, Ordering::SeqCst) {
                self.perform_reset()?;
            }
        }
    }
}
