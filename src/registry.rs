//! Table of supported flash devices, keyed by JEDEC ID.
//!
//! Devices absent from this table are refused: an incorrect sector size
//! or erase opcode would silently destroy data.

use core::time::Duration;

use crate::command::Command;
use crate::device::{DeviceDescriptor, EraseOp, LockControl, ProgramMode};
use crate::id::JedecId;
use crate::{Error, Result};

const MS: u64 = 1;
const S: u64 = 1000;

const fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

const WREN: u8 = Command::WriteEnable as u8;
const EWSR: u8 = Command::EnableWriteStatusRegister as u8;
const SE: u8 = Command::SectorErase as u8;
const BE32: u8 = Command::BlockErase1 as u8;
const BE64: u8 = Command::BlockErase2 as u8;
const CE: u8 = Command::ChipErase as u8;
const CE_ALT: u8 = Command::ChipEraseAlt as u8;

// Winbond W25Q and GigaDevice GD25Q share the same instruction set and timings.
const W25Q_ERASE: &[EraseOp] = &[
    EraseOp::new(4 << 10, SE, 400 * MS),
    EraseOp::new(32 << 10, BE32, 1600 * MS),
    EraseOp::new(64 << 10, BE64, 2 * S),
];
const W25Q_LOCK: LockControl = LockControl { mask: 0b0111_1100, write_enable: WREN, time_max: ms(15) };

const MX25L_ERASE: &[EraseOp] = &[
    EraseOp::new(4 << 10, SE, 300 * MS),
    EraseOp::new(64 << 10, BE64, 2 * S),
];
const MX25L_LOCK: LockControl = LockControl { mask: 0b0011_1100, write_enable: WREN, time_max: ms(40) };

const M25P_ERASE: &[EraseOp] = &[EraseOp::new(64 << 10, BE64, 3 * S)];
const M25P128_ERASE: &[EraseOp] = &[EraseOp::new(256 << 10, BE64, 6 * S)];
const M25P_LOCK: LockControl = LockControl { mask: 0b0001_1100, write_enable: WREN, time_max: ms(15) };

const S25FL_ERASE: &[EraseOp] = &[EraseOp::new(64 << 10, BE64, 3 * S)];
const S25FL_LOCK: LockControl = LockControl { mask: 0b0001_1100, write_enable: WREN, time_max: ms(50) };

const SST25_ERASE: &[EraseOp] = &[
    EraseOp::new(4 << 10, SE, 25 * MS),
    EraseOp::new(32 << 10, BE32, 25 * MS),
    EraseOp::new(64 << 10, BE64, 25 * MS),
];
// BP0-BP3; BPL (bit 7) is left alone.
const SST25_LOCK: LockControl = LockControl { mask: 0b0011_1100, write_enable: EWSR, time_max: ms(10) };

const AT25DF_ERASE: &[EraseOp] = &[
    EraseOp::new(4 << 10, SE, 200 * MS),
    EraseOp::new(32 << 10, BE32, 600 * MS),
    EraseOp::new(64 << 10, BE64, 950 * MS),
];

const fn w25q(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0xEF, device_id),
        name,
        size,
        page_size: 256,
        erase_ops: W25Q_ERASE,
        chip_erase: Some(CE),
        chip_erase_time_max: ms(chip_erase_s * S),
        page_program_time_max: ms(3),
        max_frequency: 104_000_000,
        max_read_frequency: 50_000_000,
        program_mode: ProgramMode::Page,
        lock: Some(W25Q_LOCK),
    }
}

const fn gd25q(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0xC8, device_id),
        max_frequency: 120_000_000,
        max_read_frequency: 80_000_000,
        ..w25q(device_id, name, size, chip_erase_s)
    }
}

const fn mx25l(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0xC2, device_id),
        name,
        size,
        page_size: 256,
        erase_ops: MX25L_ERASE,
        chip_erase: Some(CE_ALT),
        chip_erase_time_max: ms(chip_erase_s * S),
        page_program_time_max: ms(5),
        max_frequency: 86_000_000,
        max_read_frequency: 33_000_000,
        program_mode: ProgramMode::Page,
        lock: Some(MX25L_LOCK),
    }
}

const fn m25p(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0x20, device_id),
        name,
        size,
        page_size: 256,
        erase_ops: M25P_ERASE,
        chip_erase: Some(CE),
        chip_erase_time_max: ms(chip_erase_s * S),
        page_program_time_max: ms(5),
        max_frequency: 75_000_000,
        max_read_frequency: 20_000_000,
        program_mode: ProgramMode::Page,
        lock: Some(M25P_LOCK),
    }
}

const fn s25fl(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0x01, device_id),
        name,
        size,
        page_size: 256,
        erase_ops: S25FL_ERASE,
        chip_erase: Some(CE),
        chip_erase_time_max: ms(chip_erase_s * S),
        page_program_time_max: ms(3),
        max_frequency: 50_000_000,
        max_read_frequency: 33_000_000,
        program_mode: ProgramMode::Page,
        lock: Some(S25FL_LOCK),
    }
}

const fn sst25(device_id: u16, name: &'static str, size: usize) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0xBF, device_id),
        name,
        size,
        // Byte Program only; bulk data goes through AAI word program.
        page_size: 1,
        erase_ops: SST25_ERASE,
        chip_erase: Some(CE_ALT),
        chip_erase_time_max: ms(50),
        page_program_time_max: ms(1),
        max_frequency: 50_000_000,
        max_read_frequency: 25_000_000,
        program_mode: ProgramMode::AaiWord,
        lock: Some(SST25_LOCK),
    }
}

// Per-sector protection is not managed through block protect bits on these
// devices, so no lock control is declared.
const fn at25df(device_id: u16, name: &'static str, size: usize, chip_erase_s: u64) -> DeviceDescriptor {
    DeviceDescriptor {
        id: JedecId::new(0x1F, device_id),
        name,
        size,
        page_size: 256,
        erase_ops: AT25DF_ERASE,
        chip_erase: Some(CE_ALT),
        chip_erase_time_max: ms(chip_erase_s * S),
        page_program_time_max: ms(5),
        max_frequency: 66_000_000,
        max_read_frequency: 33_000_000,
        program_mode: ProgramMode::Page,
        lock: None,
    }
}

static DEVICES: &[DeviceDescriptor] = &[
    w25q(0x4014, "Winbond W25Q80", 1 << 20, 6),
    w25q(0x4015, "Winbond W25Q16", 2 << 20, 25),
    w25q(0x4016, "Winbond W25Q32", 4 << 20, 50),
    w25q(0x4017, "Winbond W25Q64", 8 << 20, 100),
    w25q(0x4018, "Winbond W25Q128", 16 << 20, 200),
    gd25q(0x4015, "GigaDevice GD25Q16", 2 << 20, 40),
    gd25q(0x4016, "GigaDevice GD25Q32", 4 << 20, 80),
    gd25q(0x4017, "GigaDevice GD25Q64", 8 << 20, 120),
    gd25q(0x4018, "GigaDevice GD25Q128", 16 << 20, 250),
    mx25l(0x2015, "Macronix MX25L1606E", 2 << 20, 30),
    mx25l(0x2016, "Macronix MX25L3205D", 4 << 20, 50),
    mx25l(0x2017, "Macronix MX25L6405D", 8 << 20, 100),
    mx25l(0x2018, "Macronix MX25L12805D", 16 << 20, 200),
    m25p(0x2015, "Numonyx M25P16", 2 << 20, 40),
    m25p(0x2016, "Numonyx M25P32", 4 << 20, 80),
    m25p(0x2017, "Numonyx M25P64", 8 << 20, 160),
    DeviceDescriptor { erase_ops: M25P128_ERASE, ..m25p(0x2018, "Numonyx M25P128", 16 << 20, 250) },
    s25fl(0x0214, "Spansion S25FL016A", 2 << 20, 100),
    s25fl(0x0215, "Spansion S25FL032A", 4 << 20, 100),
    s25fl(0x0216, "Spansion S25FL064A", 8 << 20, 150),
    sst25(0x258D, "SST SST25VF040B", 512 << 10),
    sst25(0x258E, "SST SST25VF080B", 1 << 20),
    sst25(0x2541, "SST SST25VF016B", 2 << 20),
    sst25(0x254A, "SST SST25VF032B", 4 << 20),
    at25df(0x4700, "Atmel AT25DF321", 4 << 20, 56),
    at25df(0x4800, "Atmel AT25DF641", 8 << 20, 112),
];

/// All supported devices.
pub fn devices() -> impl Iterator<Item = &'static DeviceDescriptor> {
    DEVICES.iter()
}

/// Find the descriptor for `id`, if the device is supported.
pub fn lookup(id: JedecId) -> Option<&'static DeviceDescriptor> {
    DEVICES.iter().find(|d| d.id == id)
}

/// Find the descriptor for `id`, failing with `Error::UnknownDevice`
/// if the device is not supported.
pub fn resolve(id: JedecId) -> Result<&'static DeviceDescriptor> {
    match lookup(id) {
        Some(device) => {
            log::debug!("Resolved {} as {}", id, device);
            Ok(device)
        },
        None => {
            log::error!("No descriptor for flash device {}", id);
            Err(Error::UnknownDevice { id })
        },
    }
}
