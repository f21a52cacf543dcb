// SPDX-License-Identifier: Apache-2.0 OR BSD-3-Clause

//! Intel 8042 PS/2 keyboard controller. Grounded in the source's
//! `PS2Device`/`PS2Keyboard`/`PS2Io` (`iodev_pc.py`): a controller command
//! port (0x64) and data port (0x60) pair, a 32-bit-addressable controller
//! configuration byte, and a keyboard whose USB HID scancodes are
//! translated to PS/2 scan code set 2 before being queued for the guest.
//! The controller's "pulse output line" command is also this platform's
//! keyboard-triggered system reset path, so it takes a callback invoked when
//! that pulse requests a reset.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::iodev::{self, MemoryHandler};

const STATUS_OUTPUT_FULL: u8 = 1 << 0;
const STATUS_INPUT_FULL: u8 = 1 << 1;
const STATUS_SYSTEM_FLAG: u8 = 1 << 2;
const STATUS_COMMAND: u8 = 1 << 3;

const CONFIG_IRQ1_ENABLE: u8 = 1 << 0;
const CONFIG_TRANSLATE: u8 = 1 << 6;

const CMD_READ_CONFIG: u8 = 0x20;
const CMD_WRITE_CONFIG: u8 = 0x60;
const CMD_SELF_TEST: u8 = 0xaa;
const CMD_KEYBOARD_INTERFACE_TEST: u8 = 0xab;
const CMD_DISABLE_KEYBOARD: u8 = 0xad;
const CMD_ENABLE_KEYBOARD: u8 = 0xae;
const CMD_PULSE_OUTPUT_BASE: u8 = 0xf0;

const SELF_TEST_PASSED: u8 = 0x55;
const INTERFACE_TEST_PASSED: u8 = 0x00;

/// Awaiting a second byte for a two-part controller command.
#[derive(Clone, Copy, PartialEq, Eq)]
enum PendingCommand {
    None,
    WriteConfig,
}

struct Shared {
    status: u8,
    config: u8,
    pending: PendingCommand,
    output: VecDeque<u8>,
    reset_hook: Option<Box<dyn FnMut() + Send>>,
    irq1: Option<Box<dyn Fn() + Send>>,
    keyboard_enabled: bool,
}

impl Shared {
    fn push_output(&mut self, byte: u8) {
        self.output.push_back(byte);
        self.status |= STATUS_OUTPUT_FULL;
        if self.config & CONFIG_IRQ1_ENABLE != 0 {
            if let Some(cb) = &self.irq1 {
                cb();
            }
        }
    }

    fn pop_output(&mut self) -> u8 {
        let byte = self.output.pop_front().unwrap_or(0);
        if self.output.is_empty() {
            self.status &= !STATUS_OUTPUT_FULL;
        }
        byte
    }
}

/// Handle shared between the two port-mapped facades and held by whatever
/// drives guest key events.
#[derive(Clone)]
pub struct Ps2Controller {
    shared: Arc<Mutex<Shared>>,
}

impl Ps2Controller {
    pub fn new() -> Self {
        Ps2Controller {
            shared: Arc::new(Mutex::new(Shared {
                status: STATUS_SYSTEM_FLAG,
                config: CONFIG_IRQ1_ENABLE | CONFIG_TRANSLATE,
                pending: PendingCommand::None,
                output: VecDeque::new(),
                reset_hook: None,
                irq1: None,
                keyboard_enabled: true,
            })),
        }
    }

    pub fn set_reset_hook<F: FnMut() + Send + 'static>(&self, hook: F) {
        self.shared.lock().unwrap().reset_hook = Some(Box::new(hook));
    }

    pub fn set_irq1<F: Fn() + Send + 'static>(&self, hook: F) {
        self.shared.lock().unwrap().irq1 = Some(Box::new(hook));
    }

    /// Translates one USB HID keyboard usage ID into PS/2 scan code set 2
    /// and enqueues it, applying the 0xF0 break-code prefix on key release.
    /// Dropped entirely while the keyboard interface is disabled (0xAD).
    pub fn key_event(&self, usage: u8, pressed: bool) {
        let Some(set2) = translate_usb_to_set2(usage) else {
            return;
        };
        let mut shared = self.shared.lock().unwrap();
        if !shared.keyboard_enabled {
            return;
        }
        for &byte in set2 {
            if byte == 0xe0 {
                shared.push_output(byte);
                continue;
            }
            if !pressed {
                shared.push_output(0xf0);
            }
            shared.push_output(byte);
        }
    }

    pub fn data_port(&self) -> Ps2DataPort {
        Ps2DataPort(self.shared.clone())
    }

    pub fn command_port(&self) -> Ps2CommandPort {
        Ps2CommandPort(self.shared.clone())
    }
}

impl Default for Ps2Controller {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Ps2DataPort(Arc<Mutex<Shared>>);

impl MemoryHandler for Ps2DataPort {
    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 8));
        }
        Ok(self.0.lock().unwrap().pop_output())
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 8));
        }
        let mut shared = self.0.lock().unwrap();
        if shared.pending == PendingCommand::WriteConfig {
            shared.config = value;
            shared.pending = PendingCommand::None;
        }
        Ok(())
    }
}

pub struct Ps2CommandPort(Arc<Mutex<Shared>>);

impl MemoryHandler for Ps2CommandPort {
    fn read8(&mut self, offset: u64) -> iodev::Result<u8> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 8));
        }
        Ok(self.0.lock().unwrap().status | STATUS_COMMAND)
    }

    fn write8(&mut self, offset: u64, value: u8) -> iodev::Result<()> {
        if offset != 0 {
            return Err(iodev::Error::UnknownRegister(offset, 8));
        }
        let mut shared = self.0.lock().unwrap();
        match value {
            CMD_READ_CONFIG => {
                let config = shared.config;
                shared.push_output(config);
            }
            CMD_WRITE_CONFIG => shared.pending = PendingCommand::WriteConfig,
            CMD_SELF_TEST => shared.push_output(SELF_TEST_PASSED),
            CMD_KEYBOARD_INTERFACE_TEST => shared.push_output(INTERFACE_TEST_PASSED),
            CMD_DISABLE_KEYBOARD => shared.keyboard_enabled = false,
            CMD_ENABLE_KEYBOARD => shared.keyboard_enabled = true,
            cmd if (CMD_PULSE_OUTPUT_BASE..=0xff).contains(&cmd) => {
                // Low nibble carries the inverted pulse mask; bit 0 low means
                // "pulse the reset line", matching the legacy keyboard-controller
                // reset trick firmware still relies on.
                if cmd & 0x1 == 0 {
                    if let Some(hook) = &mut shared.reset_hook {
                        hook();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// USB HID keyboard usage IDs (as used by virtio-input-style event sources)
/// translated to PS/2 scan code set 2. Covers the letters, digits, and the
/// handful of control keys firmware and a console driver actually depend on;
/// an unrecognised usage is simply dropped.
fn translate_usb_to_set2(usage: u8) -> Option<&'static [u8]> {
    Some(match usage {
        0x04 => &[0x1c], // A
        0x05 => &[0x32], // B
        0x06 => &[0x21], // C
        0x07 => &[0x23], // D
        0x08 => &[0x24], // E
        0x09 => &[0x2b], // F
        0x0a => &[0x34], // G
        0x0b => &[0x33], // H
        0x0c => &[0x43], // I
        0x0d => &[0x3b], // J
        0x0e => &[0x42], // K
        0x0f => &[0x4b], // L
        0x10 => &[0x3a], // M
        0x11 => &[0x31], // N
        0x12 => &[0x44], // O
        0x13 => &[0x4d], // P
        0x14 => &[0x15], // Q
        0x15 => &[0x2d], // R
        0x16 => &[0x1b], // S
        0x17 => &[0x2c], // T
        0x18 => &[0x3c], // U
        0x19 => &[0x2a], // V
        0x1a => &[0x1d], // W
        0x1b => &[0x22], // X
        0x1c => &[0x35], // Y
        0x1d => &[0x1a], // Z
        0x1e => &[0x16], // 1
        0x1f => &[0x1e], // 2
        0x20 => &[0x26], // 3
        0x21 => &[0x25], // 4
        0x22 => &[0x2e], // 5
        0x23 => &[0x36], // 6
        0x24 => &[0x3d], // 7
        0x25 => &[0x3e], // 8
        0x26 => &[0x46], // 9
        0x27 => &[0x45], // 0
        0x28 => &[0x5a], // Enter
        0x29 => &[0x76], // Escape
        0x2a => &[0x66], // Backspace
        0x2b => &[0x0d], // Tab
        0x2c => &[0x29], // Space
        0x4f => &[0xe0, 0x74], // Right arrow
        0x50 => &[0xe0, 0x6b], // Left arrow
        0x51 => &[0xe0, 0x72], // Down arrow
        0x52 => &[0xe0, 0x75], // Up arrow
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_read_config_queues_response() {
        let ps2 = Ps2Controller::new();
        let mut cmd = ps2.command_port();
        let mut data = ps2.data_port();
        cmd.write8(0, CMD_READ_CONFIG).unwrap();
        let config = data.read8(0).unwrap();
        assert_eq!(config, CONFIG_IRQ1_ENABLE | CONFIG_TRANSLATE);
    }

    #[test]
    fn test_write_config_two_part_command() {
        let ps2 = Ps2Controller::new();
        let mut cmd = ps2.command_port();
        let mut data = ps2.data_port();
        cmd.write8(0, CMD_WRITE_CONFIG).unwrap();
        data.write8(0, 0x01).unwrap();
        cmd.write8(0, CMD_READ_CONFIG).unwrap();
        assert_eq!(data.read8(0).unwrap(), 0x01);
    }

    #[test]
    fn test_key_event_translation_and_status_bit() {
        let ps2 = Ps2Controller::new();
        let mut cmd = ps2.command_port();
        let mut data = ps2.data_port();
        ps2.key_event(0x04, true); // 'A' make code
        assert_eq!(cmd.read8(0).unwrap() & STATUS_OUTPUT_FULL, STATUS_OUTPUT_FULL);
        assert_eq!(data.read8(0).unwrap(), 0x1c);
    }

    #[test]
    fn test_key_release_emits_break_prefix() {
        let ps2 = Ps2Controller::new();
        let mut data = ps2.data_port();
        ps2.key_event(0x04, false);
        assert_eq!(data.read8(0).unwrap(), 0xf0);
        assert_eq!(data.read8(0).unwrap(), 0x1c);
    }

    #[test]
    fn test_disable_keyboard_drops_key_events_until_reenabled() {
        let ps2 = Ps2Controller::new();
        let mut cmd = ps2.command_port();
        let mut data = ps2.data_port();

        cmd.write8(0, CMD_DISABLE_KEYBOARD).unwrap();
        ps2.key_event(0x04, true); // 'A' make code
        assert_eq!(cmd.read8(0).unwrap() & STATUS_OUTPUT_FULL, 0);

        cmd.write8(0, CMD_ENABLE_KEYBOARD).unwrap();
        ps2.key_event(0x04, true);
        assert_eq!(data.read8(0).unwrap(), 0x1c);
    }

    #[test]
    fn test_pulse_output_with_reset_bit_clear_triggers_hook() {
        let ps2 = Ps2Controller::new();
        let triggered = Arc::new(AtomicBool::new(false));
        let flag = triggered.clone();
        ps2.set_reset_hook(move || flag.store(true, Ordering::SeqCst));
        let mut cmd = ps2.command_port();
        cmd.write8(0, 0xfe).unwrap(); // pulse, bit 0 clear => reset
        assert!(triggered.load(Ordering::SeqCst));
    }
}
