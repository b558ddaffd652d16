/// Status Register (read with 0x05, written with 0x01).
///
/// Only BUSY and WEL have a fixed meaning across vendors. The block protect
/// bits vary in number and position, so protection queries take the mask
/// from the device's `LockControl`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StatusRegister(pub u8);

impl StatusRegister {
    pub const BUSY: u8 = 0b0000_0001;
    pub const WEL: u8 = 0b0000_0010;

    /// Get BUSY bit.
    pub fn is_busy(&self) -> bool {
        self.0 & Self::BUSY != 0
    }

    /// Get WEL (write enable latch) bit.
    pub fn is_write_enabled(&self) -> bool {
        self.0 & Self::WEL != 0
    }

    /// Get the block protect bits selected by `mask`.
    pub fn block_protect(&self, mask: u8) -> u8 {
        self.0 & mask
    }

    /// True if any block protect bit in `mask` is set.
    pub fn is_protected(&self, mask: u8) -> bool {
        self.block_protect(mask) != 0
    }

    /// Return a copy with every bit in `mask` cleared.
    ///
    /// BUSY and WEL are read-only and always cleared in the result,
    /// since the value is intended to be written back.
    pub fn without(self, mask: u8) -> Self {
        StatusRegister(self.0 & !mask & !(Self::BUSY | Self::WEL))
    }

    /// Return a copy with every bit in `mask` set.
    pub fn with(self, mask: u8) -> Self {
        StatusRegister((self.0 | mask) & !(Self::BUSY | Self::WEL))
    }
}

impl std::fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

#[test]
fn test_status_register_bits() {
    let s = StatusRegister(0b0001_1111);
    assert!(s.is_busy());
    assert!(s.is_write_enabled());
    assert!(s.is_protected(0b0001_1100));
    assert_eq!(s.block_protect(0b0001_1100), 0b0001_1100);
    assert_eq!(s.without(0b0001_1100), StatusRegister(0));
    assert_eq!(StatusRegister(0x80).with(0b0011_1100), StatusRegister(0xBC));
    assert!(!StatusRegister(0x80).is_protected(0b0011_1100));
}
