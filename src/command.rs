use core::ops::Range;

/// Standard SPI flash command opcodes.
///
/// Only single I/O commands used by the supported devices are listed.
/// Erase opcodes and sizes are taken from the device descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(u8)]
pub enum Command {
    // Core instruction set.
    WriteEnable = 0x06,
    WriteDisable = 0x04,
    ReadData = 0x03,
    PageProgram = 0x02,
    ReadStatusRegister = 0x05,
    WriteStatusRegister = 0x01,

    // Standard instruction set.
    ReadJEDECID = 0x9F,
    FastRead = 0x0B,

    // Erase instructions.
    // Typical sizes are 4kB for sector erase, 32kB for block erase 1,
    // and 64kB for block erase 2.
    SectorErase = 0x20,
    BlockErase1 = 0x52,
    BlockErase2 = 0xD8,
    ChipErase = 0xC7,
    ChipEraseAlt = 0x60,

    // SST25 extensions.
    EnableWriteStatusRegister = 0x50,
    AaiWordProgram = 0xAD,
}

/// Number of address bytes sent with addressed commands.
pub const ADDRESS_BYTES: usize = 3;

/// Largest address reachable with a 3-byte address.
pub const MAX_ADDRESS: u32 = 0x00FF_FFFF;

/// A single SPI transaction: bytes to send, then number of bytes to receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub tx: Vec<u8>,
    pub rx_len: usize,
}

impl Frame {
    fn new<C: Into<u8>>(command: C) -> Self {
        Frame { tx: vec![command.into()], rx_len: 0 }
    }

    fn addressed<C: Into<u8>>(command: C, address: u32) -> Self {
        let mut frame = Frame::new(command);
        frame.tx.extend(make_address(address));
        frame
    }

    fn expect(mut self, rx_len: usize) -> Self {
        self.rx_len = rx_len;
        self
    }

    /// Read JEDEC ID: manufacturer and 16-bit device ID.
    ///
    /// `len` is 3 for bank 0 manufacturers, and up to 16 to allow
    /// continuation codes.
    pub fn read_id(len: usize) -> Self {
        Frame::new(Command::ReadJEDECID).expect(len)
    }

    pub fn read_status() -> Self {
        Frame::new(Command::ReadStatusRegister).expect(1)
    }

    /// Set the write-enable latch, or enable a status register write on
    /// devices which use a dedicated opcode for it.
    pub fn write_enable(opcode: u8) -> Self {
        Frame::new(opcode)
    }

    pub fn write_disable() -> Self {
        Frame::new(Command::WriteDisable)
    }

    pub fn write_status(value: u8) -> Self {
        let mut frame = Frame::new(Command::WriteStatusRegister);
        frame.tx.push(value);
        frame
    }

    pub fn erase(opcode: u8, address: u32) -> Self {
        Frame::addressed(opcode, address)
    }

    pub fn chip_erase(opcode: u8) -> Self {
        Frame::new(opcode)
    }

    /// Program `data` at `address`.
    ///
    /// The chip wraps the column address within the current page, so callers
    /// must keep `data` inside one page; see `split_pages()`.
    pub fn page_program(address: u32, data: &[u8]) -> Self {
        let mut frame = Frame::addressed(Command::PageProgram, address);
        frame.tx.extend(data);
        frame
    }

    /// First AAI word program command, which carries the start address.
    pub fn aai_word_first(address: u32, word: [u8; 2]) -> Self {
        let mut frame = Frame::addressed(Command::AaiWordProgram, address);
        frame.tx.extend(word);
        frame
    }

    /// Subsequent AAI word program commands, which continue at the next address.
    pub fn aai_word_next(word: [u8; 2]) -> Self {
        let mut frame = Frame::new(Command::AaiWordProgram);
        frame.tx.extend(word);
        frame
    }

    /// Legacy Read Data, limited to a low clock frequency on most devices.
    pub fn read(address: u32, length: usize) -> Self {
        Frame::addressed(Command::ReadData, address).expect(length)
    }

    /// Fast Read, which takes one dummy byte after the address.
    pub fn fast_read(address: u32, length: usize) -> Self {
        let mut frame = Frame::addressed(Command::FastRead, address);
        frame.tx.push(0);
        frame.expect(length)
    }
}

/// Generate a 3-byte big-endian address.
pub fn make_address(addr: u32) -> [u8; ADDRESS_BYTES] {
    let bytes = addr.to_be_bytes();
    [bytes[1], bytes[2], bytes[3]]
}

/// Decode a 3-byte big-endian address.
pub fn parse_address(bytes: &[u8]) -> Option<u32> {
    match bytes {
        [a, b, c, ..] => Some(u32::from_be_bytes([0, *a, *b, *c])),
        _ => None,
    }
}

/// Split `length` bytes starting at `address` into chunks which never
/// cross a `page_size` boundary.
///
/// Yields `(address, range)` pairs where `range` indexes into the caller's data.
pub fn split_pages(address: u32, length: usize, page_size: usize)
    -> impl Iterator<Item = (u32, Range<usize>)>
{
    let page_size = page_size.max(1);
    let mut pos = 0;
    core::iter::from_fn(move || {
        if pos >= length {
            return None;
        }
        let addr = address as usize + pos;
        let room = page_size - (addr % page_size);
        let end = usize::min(pos + room, length);
        let chunk = (addr as u32, pos..end);
        pos = end;
        Some(chunk)
    })
}
