//! In-memory flash emulator for testing without hardware.
//!
//! `EmulatedFlash` answers SPI exchanges the way a real NOR flash does:
//! program only clears bits, page program wraps within the page, mutating
//! commands are ignored without a preceding write enable or while block
//! protect bits are set, and the chip reports busy for a configurable
//! number of status polls after each operation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::command::{parse_address, Command};
use crate::device::DeviceDescriptor;
use crate::id::JedecId;
use crate::sreg::StatusRegister;
use crate::{AnyhowResult, Connector, FlashAccess, UsbSelector};

/// Maximum SPI clock of the emulated bridge, as on an FT2232H.
pub const BRIDGE_MAX_FREQUENCY: u32 = 30_000_000;

/// Emulated flash chip on an emulated SPI bridge.
#[derive(Clone, Debug)]
pub struct EmulatedFlash {
    device: DeviceDescriptor,
    id: JedecId,
    data: Vec<u8>,
    status: u8,
    write_enabled: bool,
    status_write_enabled: bool,
    aai_address: Option<u32>,
    busy_cycles: u32,
    busy_remaining: u32,
    stuck_busy: bool,
    frequency: u32,
    max_transfer_size: usize,
    fail_after: Option<usize>,
    opcodes: Vec<u8>,
    handle: Option<OpenHandle>,
}

/// Counts itself in a shared number of open transports while alive.
#[derive(Debug)]
struct OpenHandle(Arc<AtomicUsize>);

impl OpenHandle {
    fn new(count: &Arc<AtomicUsize>) -> Self {
        count.fetch_add(1, Ordering::SeqCst);
        OpenHandle(count.clone())
    }
}

impl Clone for OpenHandle {
    fn clone(&self) -> Self {
        OpenHandle::new(&self.0)
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EmulatedFlash {
    /// Create an erased, unprotected chip matching `device`.
    pub fn new(device: DeviceDescriptor) -> Self {
        EmulatedFlash {
            device,
            id: device.id,
            data: vec![0xFF; device.size],
            status: 0,
            write_enabled: false,
            status_write_enabled: false,
            aai_address: None,
            busy_cycles: 1,
            busy_remaining: 0,
            stuck_busy: false,
            frequency: 0,
            max_transfer_size: 4096,
            fail_after: None,
            opcodes: Vec::new(),
            handle: None,
        }
    }

    /// Report `id` instead of the descriptor's ID.
    pub fn with_id(mut self, id: JedecId) -> Self {
        self.id = id;
        self
    }

    /// Set the initial status register, e.g. to power up with protect bits set.
    pub fn with_status(mut self, status: u8) -> Self {
        self.status = status & !(StatusRegister::BUSY | StatusRegister::WEL);
        self
    }

    /// Number of status polls which report busy after each operation.
    pub fn with_busy_cycles(mut self, cycles: u32) -> Self {
        self.busy_cycles = cycles;
        self
    }

    pub fn with_max_transfer_size(mut self, size: usize) -> Self {
        self.max_transfer_size = size;
        self
    }

    pub fn contents(&self) -> &[u8] {
        &self.data
    }

    pub fn contents_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn status(&self) -> StatusRegister {
        StatusRegister(self.status_byte())
    }

    pub fn frequency(&self) -> u32 {
        self.frequency
    }

    /// Opcodes of every exchange since creation or the last `clear_log()`.
    pub fn opcodes(&self) -> &[u8] {
        &self.opcodes
    }

    pub fn clear_log(&mut self) {
        self.opcodes.clear();
    }

    /// Fail every exchange after the next `n` succeed.
    pub fn fail_after(&mut self, n: usize) {
        self.fail_after = Some(n);
    }

    /// Keep reporting busy until cleared.
    pub fn set_stuck_busy(&mut self, stuck: bool) {
        self.stuck_busy = stuck;
    }

    fn is_busy(&self) -> bool {
        self.stuck_busy || self.busy_remaining > 0
    }

    fn status_byte(&self) -> u8 {
        let mut status = self.status;
        if self.write_enabled {
            status |= StatusRegister::WEL;
        }
        if self.is_busy() {
            status |= StatusRegister::BUSY;
        }
        status
    }

    fn is_protected(&self) -> bool {
        match self.device.lock {
            Some(lock) => self.status & lock.mask != 0,
            None => false,
        }
    }

    /// Consume the write enable latch, returning whether a mutating
    /// command may proceed.
    fn take_write_enable(&mut self) -> bool {
        let enabled = self.write_enabled;
        self.write_enabled = false;
        if enabled && self.is_protected() {
            log::trace!("Emulator: ignoring command, block protect bits set");
            return false;
        }
        enabled
    }

    fn start_busy(&mut self) {
        self.busy_remaining = self.busy_cycles;
    }

    fn program_byte(&mut self, address: usize, byte: u8) {
        let address = address % self.data.len();
        self.data[address] &= byte;
    }

    fn page_program(&mut self, address: u32, payload: &[u8]) {
        if !self.take_write_enable() {
            return;
        }
        let page = self.device.page_size;
        let base = (address as usize) - (address as usize % page);
        let column = address as usize % page;
        // Only the last page worth of data is retained by the chip.
        let skip = payload.len().saturating_sub(page);
        for (i, &byte) in payload.iter().enumerate().skip(skip) {
            self.program_byte(base + (column + i) % page, byte);
        }
        self.start_busy();
    }

    fn aai_program(&mut self, tx: &[u8]) {
        let (address, word) = match self.aai_address {
            None => {
                if !self.take_write_enable() {
                    return;
                }
                match (parse_address(&tx[1..]), tx.get(4..6)) {
                    (Some(address), Some(word)) => (address, word),
                    _ => return,
                }
            },
            Some(address) => match tx.get(1..3) {
                Some(word) => (address, word),
                None => return,
            },
        };
        if self.is_protected() {
            return;
        }
        self.program_byte(address as usize, word[0]);
        self.program_byte(address as usize + 1, word[1]);
        self.aai_address = Some(address + 2);
        // The write enable latch stays set for the whole AAI sequence.
        self.write_enabled = true;
        self.start_busy();
    }

    fn erase(&mut self, opcode: u8, tx: &[u8]) {
        let size = match self.device.erase_ops.iter().find(|op| op.opcode == opcode) {
            Some(op) => op.size,
            None => return,
        };
        let address = match parse_address(&tx[1..]) {
            Some(address) => address as usize % self.data.len(),
            None => return,
        };
        if !self.take_write_enable() {
            return;
        }
        let base = address - (address % size);
        self.data[base..base + size].iter_mut().for_each(|b| *b = 0xFF);
        self.start_busy();
    }

    fn chip_erase(&mut self) {
        if self.device.chip_erase.is_none() || !self.take_write_enable() {
            return;
        }
        self.data.iter_mut().for_each(|b| *b = 0xFF);
        self.start_busy();
    }

    fn write_status(&mut self, tx: &[u8]) {
        let enabled = self.write_enabled || self.status_write_enabled;
        self.write_enabled = false;
        self.status_write_enabled = false;
        if let (true, Some(&value)) = (enabled, tx.get(1)) {
            self.status = value & !(StatusRegister::BUSY | StatusRegister::WEL);
            self.start_busy();
        }
    }

    fn read(&self, address: Option<u32>, read_len: usize) -> Vec<u8> {
        let start = address.unwrap_or(0) as usize;
        (0..read_len).map(|i| self.data[(start + i) % self.data.len()]).collect()
    }

    fn identification(&self, read_len: usize) -> Vec<u8> {
        let mut id = vec![JedecId::CONTINUATION; self.id.manufacturer_bank as usize];
        id.push(self.id.manufacturer_id);
        id.extend(self.id.device_id.to_be_bytes());
        id.resize(read_len.max(id.len()), 0x00);
        id.truncate(read_len);
        id
    }

    fn execute(&mut self, tx: &[u8], read_len: usize) -> Vec<u8> {
        let opcode = tx[0];
        let command = Command::try_from(opcode).ok();

        if command == Some(Command::ReadStatusRegister) {
            let status = self.status_byte();
            self.busy_remaining = self.busy_remaining.saturating_sub(1);
            return vec![status; read_len];
        }
        if self.is_busy() {
            log::trace!("Emulator: ignoring 0x{:02X} while busy", opcode);
            return vec![0xFF; read_len];
        }
        if self.aai_address.is_some()
            && !matches!(command, Some(Command::AaiWordProgram) | Some(Command::WriteDisable))
        {
            log::trace!("Emulator: ignoring 0x{:02X} during AAI programming", opcode);
            return vec![0xFF; read_len];
        }

        match command {
            Some(Command::ReadJEDECID) => return self.identification(read_len),
            Some(Command::ReadData) => return self.read(parse_address(&tx[1..]), read_len),
            Some(Command::FastRead) => return self.read(parse_address(&tx[1..]), read_len),
            Some(Command::WriteEnable) => self.write_enabled = true,
            Some(Command::EnableWriteStatusRegister) => self.status_write_enabled = true,
            Some(Command::WriteDisable) => {
                self.write_enabled = false;
                self.aai_address = None;
            },
            Some(Command::WriteStatusRegister) => self.write_status(tx),
            Some(Command::PageProgram) => {
                if let Some(address) = parse_address(&tx[1..]) {
                    self.page_program(address, &tx[4..]);
                }
            },
            Some(Command::AaiWordProgram) => self.aai_program(tx),
            Some(Command::SectorErase) | Some(Command::BlockErase1) | Some(Command::BlockErase2) => {
                self.erase(opcode, tx)
            },
            Some(Command::ChipErase) | Some(Command::ChipEraseAlt) => self.chip_erase(),
            // Answered above, before the busy check.
            Some(Command::ReadStatusRegister) => (),
            None => log::trace!("Emulator: ignoring unknown opcode 0x{:02X}", opcode),
        }
        vec![0xFF; read_len]
    }
}

impl FlashAccess for EmulatedFlash {
    fn exchange(&mut self, data: &[u8], read_len: usize) -> AnyhowResult<Vec<u8>> {
        if let Some(remaining) = self.fail_after.as_mut() {
            if *remaining == 0 {
                anyhow::bail!("Emulated SPI transfer failure");
            }
            *remaining -= 1;
        }
        let opcode = match data.first() {
            Some(&opcode) => opcode,
            None => anyhow::bail!("Empty SPI transfer"),
        };
        self.opcodes.push(opcode);
        Ok(self.execute(data, read_len))
    }

    fn set_frequency(&mut self, frequency: u32) -> AnyhowResult<u32> {
        self.frequency = frequency.min(BRIDGE_MAX_FREQUENCY);
        Ok(self.frequency)
    }

    fn max_transfer_size(&self) -> usize {
        self.max_transfer_size
    }
}

/// Connector which opens `EmulatedFlash` instances at one USB location.
pub struct Emulator {
    template: EmulatedFlash,
    selector: Option<UsbSelector>,
    handles: Arc<AtomicUsize>,
}

impl Emulator {
    /// Every open returns a clone of `template`.
    pub fn new(template: EmulatedFlash) -> Self {
        Emulator { template, selector: None, handles: Arc::new(AtomicUsize::new(0)) }
    }

    /// Only accept opens at `selector`.
    pub fn at(mut self, selector: UsbSelector) -> Self {
        self.selector = Some(selector);
        self
    }

    /// Number of emulated transports currently open.
    pub fn open_handles(&self) -> usize {
        self.handles.load(Ordering::SeqCst)
    }
}

impl Connector for Emulator {
    type Access = EmulatedFlash;

    fn open(&mut self, selector: &UsbSelector) -> AnyhowResult<EmulatedFlash> {
        if let Some(expected) = self.selector {
            if expected != *selector {
                anyhow::bail!("No emulated device at {}", selector);
            }
        }
        let mut flash = self.template.clone();
        flash.handle = Some(OpenHandle::new(&self.handles));
        Ok(flash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry;

    fn w25q80() -> EmulatedFlash {
        EmulatedFlash::new(*registry::lookup(JedecId::new(0xEF, 0x4014)).unwrap()).with_busy_cycles(0)
    }

    fn send(flash: &mut EmulatedFlash, tx: &[u8]) {
        flash.exchange(tx, 0).unwrap();
    }

    #[test]
    fn test_identification() {
        let mut flash = w25q80();
        assert_eq!(flash.exchange(&[0x9F], 3).unwrap(), vec![0xEF, 0x40, 0x14]);
        let mut flash = w25q80().with_id(JedecId { manufacturer_bank: 1, ..JedecId::new(0x9D, 0x1234) });
        assert_eq!(flash.exchange(&[0x9F], 5).unwrap(), vec![0x7F, 0x9D, 0x12, 0x34, 0x00]);
    }

    #[test]
    fn test_program_requires_write_enable() {
        let mut flash = w25q80();
        send(&mut flash, &[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(flash.contents()[0], 0xFF);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(flash.contents()[0], 0x00);
        // Latch cleared after the operation.
        assert!(!flash.status().is_write_enabled());
    }

    #[test]
    fn test_program_clears_bits_only() {
        let mut flash = w25q80();
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x02, 0x00, 0x00, 0x10, 0b1100_1100]);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x02, 0x00, 0x00, 0x10, 0b1010_1010]);
        assert_eq!(flash.contents()[0x10], 0b1000_1000);
    }

    #[test]
    fn test_page_program_wraps_within_page() {
        let mut flash = w25q80();
        send(&mut flash, &[0x06]);
        let mut tx = vec![0x02, 0x00, 0x70, 0xFE];
        tx.extend(&[1, 2, 3, 4]);
        send(&mut flash, &tx);
        assert_eq!(&flash.contents()[0x70FE..0x7100], &[1, 2]);
        assert_eq!(&flash.contents()[0x7000..0x7002], &[3, 4]);
        assert_eq!(flash.contents()[0x7100], 0xFF);
    }

    #[test]
    fn test_sector_erase_and_busy() {
        let mut flash = w25q80().with_busy_cycles(2);
        flash.contents_mut()[0x7000..0x8000].iter_mut().for_each(|b| *b = 0);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x20, 0x00, 0x70, 0x10]);
        assert_eq!(flash.exchange(&[0x05], 1).unwrap()[0] & 1, 1);
        // Commands other than read status are ignored while busy.
        assert_eq!(flash.exchange(&[0x03, 0, 0, 0], 1).unwrap(), vec![0xFF]);
        assert_eq!(flash.exchange(&[0x05], 1).unwrap()[0] & 1, 1);
        assert_eq!(flash.exchange(&[0x05], 1).unwrap()[0] & 1, 0);
        assert!(flash.contents()[0x7000..0x8000].iter().all(|&b| b == 0xFF));
        assert_eq!(flash.contents()[0x6FFF], 0xFF);
    }

    #[test]
    fn test_protected_chip_ignores_mutation() {
        let mut flash = w25q80().with_status(0b0001_1100);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(flash.contents()[0], 0xFF);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x01, 0x00]);
        assert_eq!(flash.status(), StatusRegister(0));
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0x02, 0x00, 0x00, 0x00, 0x00]);
        assert_eq!(flash.contents()[0], 0x00);
    }

    #[test]
    fn test_aai_word_program() {
        let device = *registry::lookup(JedecId::new(0xBF, 0x2541)).unwrap();
        let mut flash = EmulatedFlash::new(device).with_busy_cycles(0);
        send(&mut flash, &[0x06]);
        send(&mut flash, &[0xAD, 0x00, 0x01, 0x00, 0x11, 0x22]);
        send(&mut flash, &[0xAD, 0x33, 0x44]);
        // Reads are refused until AAI mode is left.
        assert_eq!(flash.exchange(&[0x03, 0x00, 0x01, 0x00], 1).unwrap(), vec![0xFF]);
        send(&mut flash, &[0x04]);
        assert_eq!(&flash.contents()[0x100..0x105], &[0x11, 0x22, 0x33, 0x44, 0xFF]);
        assert!(!flash.status().is_write_enabled());
    }

    #[test]
    fn test_fault_injection() {
        let mut flash = w25q80();
        flash.fail_after(1);
        assert!(flash.exchange(&[0x05], 1).is_ok());
        assert!(flash.exchange(&[0x05], 1).is_err());
    }

    #[test]
    fn test_connector_tracks_handles() {
        let selector = UsbSelector::new(0x0403, 0x6010, 1);
        let mut emulator = Emulator::new(w25q80()).at(selector);
        assert!(emulator.open(&UsbSelector::new(0x0403, 0x6014, 1)).is_err());
        let a = emulator.open(&selector).unwrap();
        let b = emulator.open(&selector).unwrap();
        assert_eq!(emulator.open_handles(), 2);
        drop(a);
        assert_eq!(emulator.open_handles(), 1);
        drop(b);
        assert_eq!(emulator.open_handles(), 0);
    }
}
