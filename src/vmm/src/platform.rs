// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Composes the guest-memory manager, I/O-port and MMIO address spaces, the
//! PCI subsystem, and every device in §6's guest-facing device map. Grounded
//! in `original_source/iodev_qemu.py`'s `Q35Platform` (the module that wires
//! one instance of every legacy device plus the PCI host bridge into a single
//! object), reshaped around the teacher's `AddressSpace`/`MemoryHandler`
//! plumbing instead of the source's class-based `IoDevice` registry.
//!
//! `Platform::new` is also the system-reset path (§4.8): the caller clears
//! the [`MemoryManager`] and calls `Platform::new` again, which reconstructs
//! both address spaces and every device from scratch.

use std::sync::{Arc, Mutex};

use kvm_ioctls::VmFd;

use crate::config::VMMConfig;
use crate::devices::{acpi, flash, port80, port92, ps2, qemu, rtc, serial, vga_stub};
use crate::firmware;
use crate::iodev::AddressSpace;
use crate::memory::MemoryManager;
use crate::pci::{ecam, legacy, Bdf, PciConfig, PciFunction, PciSubsystem};
use crate::scsi::{BlockLu, OpticalLu, ScsiSubsystem, DISK_LUN_ID, OPTICAL_LUN_ID};
use crate::virtio::VirtioScsi;
use crate::{Error, Result};

/// Ich9-style host bridge at BDF 0,0,0: a class-code-only PCI presence with
/// no BARs, matching what firmware expects to find when it walks bus 0.
struct HostBridge {
    config: PciConfig,
}

impl PciFunction for HostBridge {
    fn bdf(&self) -> Bdf {
        Bdf::new(0, 0, 0)
    }
    fn config(&mut self) -> &mut PciConfig {
        &mut self.config
    }
}

/// Ich9-style LPC/ISA bridge at BDF 0,31,0: likewise BAR-less, present only
/// so a PCI bus scan sees the conventional southbridge function.
struct IsaBridge {
    config: PciConfig,
}

impl PciFunction for IsaBridge {
    fn bdf(&self) -> Bdf {
        Bdf::new(0, 31, 0)
    }
    fn config(&mut self) -> &mut PciConfig {
        &mut self.config
    }
}

fn handler<T: crate::iodev::MemoryHandler + 'static>(device: T) -> Arc<Mutex<dyn crate::iodev::MemoryHandler>> {
    Arc::new(Mutex::new(device))
}

/// Owns every device and the two address spaces routing to them. Dropping a
/// `Platform` drops every device with it; the vCPU keeps its own clone of the
/// address spaces (cheap: handlers are `Arc`-shared) so device lifetime
/// follows the platform, not the vCPU.
pub struct Platform {
    pub io: AddressSpace,
    pub mmio: AddressSpace,
    pub scsi: Arc<Mutex<ScsiSubsystem>>,
    ps2: ps2::Ps2Controller,
}

impl Platform {
    /// Builds the full device map from scratch: legacy PC devices, the PCI
    /// host/ISA bridges, virtio-scsi, and whichever of `--disk`/`--optical`
    /// were supplied. `vm_fd` is threaded through for the virtio-scsi
    /// interrupt-assertion callback.
    pub fn new(config: &VMMConfig, memory: Arc<Mutex<MemoryManager>>, vm_fd: Arc<VmFd>, virtio_irq: u8) -> Result<Self> {
        let io = AddressSpace::new();
        let mmio = AddressSpace::new();

        let ps2 = ps2::Ps2Controller::new();
        io.mount(0x60, 0x4, handler(ps2.data_port()));
        io.mount(0x64, 0x1, handler(ps2.command_port()));

        let total_memory_bytes = config.memory_mb as u64 * 1024 * 1024;
        io.mount(rtc::RTC_BASE, rtc::RTC_LEN, handler(rtc::Rtc::new(total_memory_bytes)));

        io.mount(port80::PORT80_BASE as u64, port80::PORT80_LEN as u64, handler(port80::Port80::new()));
        io.mount(port92::PORT92_BASE as u64, port92::PORT92_LEN as u64, handler(port92::Port92::new()));

        io.mount(vga_stub::BOCHS_DISPLAY_BASE, vga_stub::BOCHS_DISPLAY_LEN, handler(vga_stub::BochsDisplay::new()));
        io.mount(vga_stub::VGA_ATTRIBUTE_BASE, vga_stub::VGA_ATTRIBUTE_LEN, handler(vga_stub::VgaAttribute::new()));

        io.mount(serial::COM1_BASE as u64, serial::UART_PORT_COUNT as u64, handler(serial::SerialPort::new("COM1: ", serial::COM1_IRQ).map_err(Error::IO)?));
        io.mount(serial::COM2_BASE as u64, serial::UART_PORT_COUNT as u64, handler(serial::SerialPort::new("COM2: ", serial::COM2_IRQ).map_err(Error::IO)?));
        io.mount(serial::COM3_BASE as u64, serial::UART_PORT_COUNT as u64, handler(serial::SerialPort::new("COM3: ", serial::COM3_IRQ).map_err(Error::IO)?));
        io.mount(serial::COM4_BASE as u64, serial::UART_PORT_COUNT as u64, handler(serial::SerialPort::new("COM4: ", serial::COM4_IRQ).map_err(Error::IO)?));

        io.mount(qemu::QEMU_DEBUG_BASE, qemu::QEMU_DEBUG_LEN, handler(qemu::QemuDebugOutput::new()));
        io.mount(qemu::QEMU_FW_CFG_BASE, qemu::QEMU_FW_CFG_LEN, handler(qemu::QemuFwCfg::new()));

        io.mount(acpi::ACPI_PM_CONTROL_BASE, acpi::ACPI_PM_CONTROL_LEN, handler(acpi::AcpiPmControl::new()));
        io.mount(acpi::ACPI_PM_TIMER_BASE, acpi::ACPI_PM_TIMER_LEN, handler(acpi::AcpiPmTimer::new()));

        let fwvars = firmware::read_firmware_vars(&config.fwvars.path)?;
        let flash = flash::SysFlash::new(fwvars, config.fwvars.path.clone());
        mmio.mount(firmware::FWVARS_BASE, flash::FLASH_LEN, handler(flash));

        let pci = Arc::new(Mutex::new(PciSubsystem::new()));
        pci.lock().unwrap().register(Arc::new(Mutex::new(HostBridge {
            config: PciConfig::new(0x8086, 0x29c0, 0x06, 0x00, 0x00, 0x00, 0, 0, 0, [None; 6]),
        })));
        pci.lock().unwrap().register(Arc::new(Mutex::new(IsaBridge {
            config: PciConfig::new(0x8086, 0x2918, 0x06, 0x01, 0x00, 0x00, 0, 0, 0, [None; 6]),
        })));

        io.mount(0xCF8, 0x8, handler(legacy::ConfigPortPair::new(pci.clone())));
        mmio.mount(ecam::ECAM_BASE, ecam::ECAM_SIZE, handler(ecam::Ecam::new(pci.clone())));

        let scsi = Arc::new(Mutex::new(ScsiSubsystem::new()));
        if let Some(disk) = &config.disk {
            let lu = BlockLu::open(&disk.path, true).map_err(Error::IO)?;
            scsi.lock().unwrap().register(DISK_LUN_ID, Box::new(lu));
        }
        if let Some(optical) = &config.optical {
            let lu = OpticalLu::open(&optical.path).map_err(Error::IO)?;
            scsi.lock().unwrap().register(OPTICAL_LUN_ID, Box::new(lu));
        }

        let irq_line = Box::new(move || {
            let _ = vm_fd.set_irq_line(virtio_irq as u32, true);
            let _ = vm_fd.set_irq_line(virtio_irq as u32, false);
        });
        let virtio_scsi = Arc::new(Mutex::new(VirtioScsi::new(Bdf::new(0, 2, 0), memory.clone(), scsi.clone(), irq_line)));

        // Mounted at base 0 until the guest programs BAR0; `cfg_bar_changed`
        // then relocates this same mount via `bind_mmio`'s stashed id.
        let mount_id = mmio.mount(0, crate::virtio::VIRTIO_SCSI_BAR_LEN as u64, virtio_scsi.clone());
        virtio_scsi.lock().unwrap().bind_mmio(mmio.clone(), mount_id);
        pci.lock().unwrap().register(virtio_scsi.clone());

        Ok(Platform { io, mmio, scsi, ps2 })
    }

    /// Wires the PS/2 controller's legacy keyboard-reset trigger and IRQ1 line
    /// to caller-provided callbacks (typically a vCPU reset flag and a KVM
    /// irqchip line assertion).
    pub fn wire_ps2<F: FnMut() + Send + 'static, G: Fn() + Send + 'static>(&self, reset_hook: F, irq1: G) {
        self.ps2.set_reset_hook(reset_hook);
        self.ps2.set_irq1(irq1);
    }
}
