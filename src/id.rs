/// JEDEC identification of an SPI flash memory.
///
/// The manufacturer ID and 16-bit device ID are read using the 0x9F command,
/// and the number of 0x7F continuation code bytes present before the manufacturer ID
/// is stored as `manufacturer_bank`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct JedecId {
    pub manufacturer_bank: u8,
    pub manufacturer_id: u8,
    pub device_id: u16,
}

impl JedecId {
    /// JEDEC continuation code, prefixed to manufacturer IDs outside bank 0.
    pub const CONTINUATION: u8 = 0x7F;

    pub const fn new(manufacturer_id: u8, device_id: u16) -> Self {
        JedecId { manufacturer_bank: 0, manufacturer_id, device_id }
    }

    /// Decode the response to a Read JEDEC ID command.
    ///
    /// Returns `None` if more continuation codes are present than the
    /// response holds, or if too few bytes were received.
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        let bank = data.iter().take_while(|&&b| b == Self::CONTINUATION).count();
        match data.get(bank..bank + 3) {
            Some(&[manufacturer_id, hi, lo]) if bank <= 13 => Some(JedecId {
                manufacturer_bank: bank as u8,
                manufacturer_id,
                device_id: u16::from_be_bytes([hi, lo]),
            }),
            _ => None,
        }
    }

    /// True if the ID looks like an idle bus rather than a device.
    ///
    /// With nothing attached, or on a communication error, the response
    /// is usually all-0s or all-1s.
    pub fn is_blank(&self) -> bool {
        matches!(
            (self.manufacturer_id, self.device_id),
            (0x00, 0x0000) | (0xFF, 0xFFFF)
        )
    }

    /// Look up a manufacturer name from the JEDEC ID.
    pub fn manufacturer_name(&self) -> Option<&'static str> {
        let (bank, id) = (self.manufacturer_bank, self.manufacturer_id & 0x7F);
        match jep106::JEP106Code::new(bank, id).get() {
            // Winbond acquired NEXCOM and so the ID 0xEF is commonly used for Winbond memory.
            Some(mfn) if mfn == "NEXCOM" => Some("Winbond/NEXCOM"),
            // GigaDevice flash doesn't use a continuation code, so 0xC8 appears as Apple Computer.
            Some(mfn) if mfn == "Apple Computer" => Some("Apple Computer/GigaDevice Semiconductor"),
            Some(mfn) => Some(mfn),
            None => None,
        }
    }
}

impl std::fmt::Display for JedecId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mfn = match self.manufacturer_name() {
            Some(mfn) => format!(" ({})", mfn),
            None => "".to_string(),
        };
        write!(f, "Manufacturer 0x{:02X}{}, Device 0x{:04X}",
               self.manufacturer_id, mfn, self.device_id)
    }
}

#[test]
fn test_jedec_id_from_bytes() {
    assert_eq!(JedecId::from_bytes(&[0xEF, 0x40, 0x18]), Some(JedecId::new(0xEF, 0x4018)));
    // Trailing bytes are ignored.
    assert_eq!(JedecId::from_bytes(&[0xC2, 0x20, 0x16, 0x00, 0x00]),
               Some(JedecId::new(0xC2, 0x2016)));
    // Continuation codes select the manufacturer bank.
    let id = JedecId::from_bytes(&[0x7F, 0x7F, 0x9D, 0x12, 0x34, 0, 0]).unwrap();
    assert_eq!(id.manufacturer_bank, 2);
    assert_eq!(id.manufacturer_id, 0x9D);
    assert_eq!(id.device_id, 0x1234);
    // Not enough bytes after the continuation codes.
    assert_eq!(JedecId::from_bytes(&[0x7F, 0x7F, 0x7F]), None);
    assert_eq!(JedecId::from_bytes(&[0xEF]), None);
}

#[test]
fn test_jedec_id_blank() {
    assert!(JedecId::new(0xFF, 0xFFFF).is_blank());
    assert!(JedecId::new(0x00, 0x0000).is_blank());
    assert!(!JedecId::new(0xEF, 0x4018).is_blank());
}
