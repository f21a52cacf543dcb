// SPDX-License-Identifier: Apache-2.0

//! PC legacy device emulators. Each submodule implements [`crate::iodev::MemoryHandler`]
//! and is mounted directly into the platform's I/O-port [`crate::iodev::AddressSpace`],
//! following the teacher's `devices::serial::LumperSerial` shape (an `EventFdTrigger`-driven
//! `vm-superio` device) generalized to the rest of the guest-facing device map in §6.

pub mod acpi;
pub mod flash;
pub mod port80;
pub mod port92;
pub mod ps2;
pub mod qemu;
pub mod rtc;
pub mod serial;
pub mod vga_stub;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
