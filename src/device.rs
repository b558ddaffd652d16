use core::time::Duration;

use crate::command::Command;
use crate::id::JedecId;

/// An erase instruction supported by a device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct EraseOp {
    /// Number of bytes erased, and required alignment of the address.
    pub size: usize,
    /// Opcode for the erase instruction.
    pub opcode: u8,
    /// Maximum time for the erase to complete, from the datasheet.
    pub time_max: Duration,
}

impl EraseOp {
    pub const fn new(size: usize, opcode: u8, time_max_ms: u64) -> Self {
        EraseOp { size, opcode, time_max: Duration::from_millis(time_max_ms) }
    }
}

impl core::fmt::Display for EraseOp {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "Opcode 0x{:02X}: {} bytes, max {:?}", self.opcode, self.size, self.time_max)
    }
}

/// How data is programmed into the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProgramMode {
    /// Page Program (0x02) of up to `page_size` bytes per command.
    Page,
    /// SST Auto Address Increment word program (0xAD), two bytes per command,
    /// with Byte Program (0x02) for an unaligned first or trailing byte.
    AaiWord,
}

/// Program throughput class.
///
/// Callers sizing transfers (benchmarks, test patterns) should check this
/// instead of matching on device names.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Throughput {
    Normal,
    /// Only one or two bytes are programmed per SPI transaction.
    Slow,
}

/// Block protection control through the status register.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct LockControl {
    /// Block protect bits in the status register.
    pub mask: u8,
    /// Opcode which must precede Write Status Register.
    pub write_enable: u8,
    /// Maximum time for a status register write to complete.
    pub time_max: Duration,
}

/// Static description of a supported flash device.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub id: JedecId,
    pub name: &'static str,
    /// Total capacity in bytes.
    pub size: usize,
    /// Maximum number of bytes per Page Program command.
    pub page_size: usize,
    /// Erase instructions, sorted by size, smallest first.
    pub erase_ops: &'static [EraseOp],
    /// Chip erase opcode, if supported.
    pub chip_erase: Option<u8>,
    /// Maximum time for a chip erase to complete.
    pub chip_erase_time_max: Duration,
    /// Maximum time for a page program to complete.
    pub page_program_time_max: Duration,
    /// Maximum SPI clock frequency in Hz.
    pub max_frequency: u32,
    /// Maximum SPI clock frequency in Hz for the legacy Read Data command.
    /// Above this, Fast Read is used.
    pub max_read_frequency: u32,
    pub program_mode: ProgramMode,
    /// Block protection control, if the device supports it.
    pub lock: Option<LockControl>,
}

impl DeviceDescriptor {
    /// Smallest erase granularity in bytes.
    pub fn sector_size(&self) -> usize {
        self.erase_ops.first().map(|op| op.size).unwrap_or(self.size)
    }

    /// Largest erase granularity in bytes.
    pub fn block_size(&self) -> usize {
        self.erase_ops.last().map(|op| op.size).unwrap_or(self.size)
    }

    pub fn supports_bulk_erase(&self) -> bool {
        self.chip_erase.is_some()
    }

    pub fn supports_lock(&self) -> bool {
        self.lock.is_some()
    }

    pub fn throughput(&self) -> Throughput {
        match self.program_mode {
            ProgramMode::Page => Throughput::Normal,
            ProgramMode::AaiWord => Throughput::Slow,
        }
    }

    /// Opcode to use for write-enable before program and erase.
    pub fn write_enable_opcode(&self) -> u8 {
        Command::WriteEnable.into()
    }
}

impl core::fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let (size, unit) = if self.size >= 1 << 20 {
            (self.size >> 20, "MiB")
        } else {
            (self.size >> 10, "KiB")
        };
        write!(f, "{} {} {}", self.name, size, unit)
    }
}
