/// A contiguous range of flash memory.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Region {
    pub address: u32,
    pub length: usize,
}

impl Region {
    pub fn new(address: u32, length: usize) -> Self {
        Region { address, length }
    }

    /// One past the last byte, or `None` if that overflows.
    pub fn end(&self) -> Option<usize> {
        (self.address as usize).checked_add(self.length)
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// True if both ends of the region are multiples of `granule`.
    pub fn is_aligned(&self, granule: usize) -> bool {
        self.address as usize % granule == 0 && self.length % granule == 0
    }

    /// Smallest `granule`-aligned region containing this one.
    ///
    /// An empty region is returned unchanged.
    pub fn align_out(&self, granule: usize) -> Self {
        if self.is_empty() {
            return *self;
        }
        let start = self.address as usize - (self.address as usize % granule);
        let end = self.address as usize + self.length;
        let end = match end % granule {
            0 => end,
            rem => end + granule - rem,
        };
        Region { address: start as u32, length: end - start }
    }
}

impl core::fmt::Display for Region {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "0x{:08X}..0x{:08X}", self.address, self.address as usize + self.length)
    }
}

#[test]
fn test_region_align_out() {
    assert_eq!(Region::new(0x7000, 0x1000).align_out(0x1000), Region::new(0x7000, 0x1000));
    assert_eq!(Region::new(0x7020, 33).align_out(0x1000), Region::new(0x7000, 0x1000));
    assert_eq!(Region::new(0x7FF0, 0x20).align_out(0x1000), Region::new(0x7000, 0x2000));
    assert_eq!(Region::new(0x7000, 0).align_out(0x1000), Region::new(0x7000, 0));
    assert_eq!(Region::new(0x7020, 0).align_out(0x1000), Region::new(0x7020, 0));
    assert!(Region::new(0x7000, 0x2000).is_aligned(0x1000));
    assert!(!Region::new(0x7020, 0x1000).is_aligned(0x1000));
    assert!(!Region::new(0x7000, 0xFFF).is_aligned(0x1000));
}
