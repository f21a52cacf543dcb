// SPDX-License-Identifier: Apache-2.0

//! 16550-style UART, one instance per COM port. Kept from the teacher's
//! `devices::serial::LumperSerial` (the `EventFdTrigger`/`vm_superio::Serial`
//! pairing); generalized to accept a port-specific line prefix on host stdout
//! and an IRQ line, since §6's device map wires up four UARTs (COM1..COM4)
//! rather than the teacher's single COM1, each sharing host stdout but
//! prefixing its output so interleaved guest writes stay distinguishable.

use std::io::{Error, Result};
use std::ops::Deref;

use vm_superio::serial::NoEvents;
use vm_superio::{Serial, Trigger};
use vmm_sys_util::eventfd::EventFd;

use crate::iodev::{self, MemoryHandler};

pub const COM1_BASE: u16 = 0x3f8;
pub const COM1_IRQ: u8 = 4;
pub const COM2_BASE: u16 = 0x2f8;
pub const COM2_IRQ: u8 = 3;
pub const COM3_BASE: u16 = 0x3e8;
pub const COM3_IRQ: u8 = 4;
pub const COM4_BASE: u16 = 0x2e8;
pub const COM4_IRQ: u8 = 3;

/// A 16550 register file spans 8 consecutive I/O ports.
pub const UART_PORT_COUNT: u16 = 8;

pub struct EventFdTrigger(EventFd);

impl Trigger for EventFdTrigger {
    type E = Error;

    fn trigger(&self) -> Result<()> {
        self.write(1)
    }
}

impl Deref for EventFdTrigger {
    type Target = EventFd;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl EventFdTrigger {
    pub fn new(flag: i32) -> Result<Self> {
        Ok(EventFdTrigger(EventFd::new(flag)?))
    }
    pub fn try_clone(&self) -> Result<Self> {
        Ok(EventFdTrigger((**self).try_clone()?))
    }
}

/// Prefixes every line written to host stdout with the owning COM port's
/// name, so output from COM1..COM4 doesn't interleave unreadably.
pub struct PrefixedStdout {
    prefix: &'static str,
    at_line_start: bool,
}

impl PrefixedStdout {
    pub(crate) fn new(prefix: &'static str) -> Self {
        PrefixedStdout { prefix, at_line_start: true }
    }
}

impl std::io::Write for PrefixedStdout {
    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut stdout = std::io::stdout();
        for &byte in buf {
            if self.at_line_start {
                std::io::Write::write_all(&mut stdout, self.prefix.as_bytes())?;
                self.at_line_start = false;
            }
            std::io::Write::write_all(&mut stdout, &[byte])?;
            if byte == b'\n' {
                self.at_line_start = true;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<()> {
        std::io::Write::flush(&mut std::io::stdout())
    }
}

pub struct SerialPort {
    eventfd: EventFdTrigger,
    pub serial: Serial<EventFdTrigger, NoEvents, PrefixedStdout>,
    pub irq: u8,
}

impl SerialPort {
    pub fn new(name: &'static str, irq: u8) -> Result<Self> {
        let eventfd = EventFdTrigger::new(libc::EFD_NONBLOCK)?;
        Ok(SerialPort {
            eventfd: eventfd.try_clone()?,
            serial: Serial::new(eventfd.try_clone()?, PrefixedStdout::new(name)),
            irq,
        })
    }

    pub fn eventfd(&self) -> Result<EventFd> {
        Ok(self.eventfd.try_clone()?.0)
    }
}

impl MemoryHandler for SerialPort {
    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        Ok(self.serial.read(offset as u8))
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        self.serial
            .write(offset as u8, value)
            .map_err(|_| iodev::Error::UnknownRegister(offset, 8))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_ports_do_not_error() {
        assert!(SerialPort::new("COM1: ", COM1_IRQ).is_ok());
        assert!(SerialPort::new("COM2: ", COM2_IRQ).is_ok());
    }
}
