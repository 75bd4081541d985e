//! Decoder address and configuration-variable codecs
//!
//! Pure conversions between DCC addresses and the 8-bit CVs that hold them
//! (CV1, CV17/18, CV19/20), plus the flat key used for banked CVs. Range
//! violations are reported as `None`; none of these functions panic.

use std::fmt;
use std::str::FromStr;

use bitfield::bitfield;

use crate::error::{DccError, Result};
use crate::limits::{ADDRESS_MAX, CV_MAX, CV_MIN, SHORT_ADDRESS_MAX};

/// Number of bank index bytes a [`CvAddress`] can carry
pub const BANK_COUNT: usize = 4;

/// Encode a long address into the combined CV17/CV18 value
///
/// Returns `None` outside `1..=10239`.
pub fn encode_long_address(addr: u16) -> Option<u16> {
    if !(1..=ADDRESS_MAX).contains(&addr) {
        return None;
    }
    Some(0xC000 | (addr & 0x3FFF))
}

/// CV17 (high byte) of an encoded long address
pub fn encode_cv17(addr: u16) -> Option<u8> {
    encode_long_address(addr).map(|v| (v >> 8) as u8)
}

/// CV18 (low byte) of an encoded long address
pub fn encode_cv18(addr: u16) -> Option<u8> {
    encode_long_address(addr).map(|v| (v & 0xFF) as u8)
}

/// Decode a long address from CV17/CV18
///
/// The two top bits of CV17 are ignored, so decoders that leave them clear
/// still decode. Use [`decode_long_address_strict`] to insist on them.
pub fn decode_long_address(cv17: u8, cv18: u8) -> Option<u16> {
    let addr = (u16::from(cv17 & 0x3F) << 8) + u16::from(cv18);
    if addr > ADDRESS_MAX {
        return None;
    }
    Some(addr)
}

/// Decode a long address, requiring the `11` prefix in CV17 bits 7..6
pub fn decode_long_address_strict(cv17: u8, cv18: u8) -> Option<u16> {
    if cv17 & 0xC0 != 0xC0 {
        return None;
    }
    decode_long_address(cv17, cv18)
}

/// Encode a consist address into `(cv20 << 8) | cv19`
///
/// Address 0 means "no consist" and encodes to 0 regardless of direction.
/// Addresses above 127 are split decimally: `cv19 = addr % 100`,
/// `cv20 = addr / 100`. The direction bit (0x80) is carried in CV19.
pub fn encode_consist_address(addr: u16, invert_direction: bool) -> Option<u16> {
    if addr > ADDRESS_MAX {
        return None;
    }
    if addr == 0 {
        return Some(0);
    }

    let (mut cv19, cv20) = if addr > u16::from(SHORT_ADDRESS_MAX) {
        (addr % 100, addr / 100)
    } else {
        (addr, 0)
    };

    if invert_direction {
        cv19 |= 0x80;
    }

    Some((cv20 << 8) | cv19)
}

/// CV19 of an encoded consist address
pub fn encode_cv19(addr: u16, invert_direction: bool) -> Option<u8> {
    encode_consist_address(addr, invert_direction).map(|v| (v & 0xFF) as u8)
}

/// CV20 of an encoded consist address
pub fn encode_cv20(addr: u16) -> Option<u8> {
    encode_consist_address(addr, false).map(|v| (v >> 8) as u8)
}

/// Decode a consist address from CV19/CV20, ignoring the direction bit
///
/// Returns `None` when no consist is configured or the result is out of
/// range.
pub fn decode_consist_address(cv19: u8, cv20: u8) -> Option<u16> {
    let low = u16::from(cv19 & 0x7F);

    if cv20 == 0 {
        return if low == 0 { None } else { Some(low) };
    }

    let addr = low + u16::from(cv20) * 100;
    if addr > ADDRESS_MAX {
        return None;
    }
    Some(addr)
}

/// Direction bit of CV19
pub fn consist_direction_inverted(cv19: u8) -> bool {
    cv19 & 0x80 != 0
}

bitfield! {
    /// Bit view of CV29, the decoder configuration register
    #[derive(Clone, Copy, PartialEq, Eq)]
    pub struct Cv29(u8);
    impl Debug;
    /// Normal direction of travel is reversed
    pub direction_reversed, set_direction_reversed: 0;
    /// 28/128 speed steps instead of 14
    pub speed_steps_28, set_speed_steps_28: 1;
    /// Analog (DC) operation enabled
    pub analog_conversion, set_analog_conversion: 2;
    /// RailCom feedback enabled
    pub railcom, set_railcom: 3;
    /// Use the user speed table (CV67..94)
    pub speed_table, set_speed_table: 4;
    /// Long address in CV17/18 instead of short address in CV1
    pub extended_address, set_extended_address: 5;
    /// Accessory rather than multifunction decoder
    pub accessory_decoder, set_accessory_decoder: 7;
}

impl From<u8> for Cv29 {
    fn from(value: u8) -> Self {
        Cv29(value)
    }
}

impl Cv29 {
    /// Raw register value
    pub fn bits(&self) -> u8 {
        self.0
    }
}

/// Active address of a multifunction decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum DecoderAddress {
    /// 7-bit address from CV1
    Short(u8),
    /// 14-bit address from CV17/18
    Long(u16),
}

impl DecoderAddress {
    /// Create a short address, validating it's within range [1, 127]
    pub fn short(addr: u8) -> Option<Self> {
        if (1..=SHORT_ADDRESS_MAX).contains(&addr) {
            Some(DecoderAddress::Short(addr))
        } else {
            None
        }
    }

    /// Create a long address, validating it's within range [1, 10239]
    pub fn long(addr: u16) -> Option<Self> {
        if (1..=ADDRESS_MAX).contains(&addr) {
            Some(DecoderAddress::Long(addr))
        } else {
            None
        }
    }

    /// Get the numeric address
    pub fn value(&self) -> u16 {
        match self {
            DecoderAddress::Short(a) => u16::from(*a),
            DecoderAddress::Long(a) => *a,
        }
    }

    /// Check if this is a long address
    pub fn is_long(&self) -> bool {
        matches!(self, DecoderAddress::Long(_))
    }

    /// 16-bit wire form: short addresses as-is, long addresses with the
    /// CV17 `11` prefix in the top bits
    pub fn to_wire(&self) -> u16 {
        match self {
            DecoderAddress::Short(a) => u16::from(*a),
            DecoderAddress::Long(a) => 0xC000 | (a & 0x3FFF),
        }
    }

    /// Inverse of [`DecoderAddress::to_wire`]; 0 (programming track) and
    /// out-of-range values give `None`
    pub fn from_wire(value: u16) -> Option<Self> {
        if value & 0xC000 == 0xC000 {
            return Self::long(value & 0x3FFF);
        }
        match u8::try_from(value) {
            Ok(short) if short <= SHORT_ADDRESS_MAX => Self::short(short),
            _ => None,
        }
    }
}

impl fmt::Display for DecoderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecoderAddress::Short(a) => write!(f, "{} (short)", a),
            DecoderAddress::Long(a) => write!(f, "{} (long)", a),
        }
    }
}

/// Logical address of one configuration variable, optionally banked
///
/// Banked CVs are reached by first writing index bytes into bank-select
/// registers. Up to four bank bytes are supported; each occupies its own
/// 8-bit lane of the flat key whether or not the others are present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CvAddress {
    cv: u16,
    banks: [Option<u8>; BANK_COUNT],
}

impl CvAddress {
    /// Create an unbanked CV address, validating it's within range [1, 1024]
    pub fn new(cv: u16) -> Result<Self> {
        if !(CV_MIN..=CV_MAX).contains(&cv) {
            return Err(DccError::invalid_address(format!(
                "CV {} out of range [{}, {}]",
                cv, CV_MIN, CV_MAX
            )));
        }
        Ok(CvAddress {
            cv,
            banks: [None; BANK_COUNT],
        })
    }

    /// Set bank index `index` (0..=3) to `value`
    pub fn with_bank(mut self, index: usize, value: u8) -> Result<Self> {
        let slot = self.banks.get_mut(index).ok_or_else(|| {
            DccError::invalid_address(format!(
                "Bank index {} out of range [0, {}]",
                index,
                BANK_COUNT - 1
            ))
        })?;
        *slot = Some(value);
        Ok(self)
    }

    /// Primary CV number
    pub fn cv(&self) -> u16 {
        self.cv
    }

    /// Bank byte at `index`, if present
    pub fn bank(&self, index: usize) -> Option<u8> {
        self.banks.get(index).copied().flatten()
    }

    /// Whether any bank byte is present
    pub fn is_banked(&self) -> bool {
        self.banks.iter().any(Option::is_some)
    }

    /// Flat 64-bit key: bank3..bank0 big-endian above the 16-bit CV number
    pub fn flat(&self) -> u64 {
        let banks = self
            .banks
            .iter()
            .rev()
            .fold(0u64, |acc, bank| (acc << 8) | u64::from(bank.unwrap_or(0)));
        (banks << 16) | u64::from(self.cv)
    }
}

impl fmt::Display for CvAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CV{}", self.cv)?;
        let mut sep = ':';
        for (i, bank) in self.banks.iter().enumerate() {
            if let Some(v) = bank {
                write!(f, "{}{}={}", sep, i, v)?;
                sep = ',';
            }
        }
        Ok(())
    }
}

impl FromStr for CvAddress {
    type Err = DccError;

    /// Parse `"29"`, `"CV29"` or `"257:0=16,1=2"`
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let s = s
            .strip_prefix("CV")
            .or_else(|| s.strip_prefix("cv"))
            .unwrap_or(s);

        let (cv, banks) = match s.split_once(':') {
            Some((cv, banks)) => (cv, Some(banks)),
            None => (s, None),
        };

        let cv = cv
            .trim()
            .parse::<u16>()
            .map_err(|e| DccError::invalid_address(format!("bad CV number {:?}: {}", cv, e)))?;
        let mut addr = CvAddress::new(cv)?;

        for part in banks.into_iter().flat_map(|b| b.split(',')) {
            let (index, value) = part
                .split_once('=')
                .ok_or_else(|| DccError::invalid_address(format!("bad bank {:?}", part)))?;
            let index = index
                .trim()
                .parse::<usize>()
                .map_err(|e| DccError::invalid_address(format!("bad bank index: {}", e)))?;
            let value = value
                .trim()
                .parse::<u8>()
                .map_err(|e| DccError::invalid_address(format!("bad bank value: {}", e)))?;
            addr = addr.with_bank(index, value)?;
        }

        Ok(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_long_address_encoding() {
        assert_eq!(encode_long_address(1), Some(0xC001));
        assert_eq!(encode_long_address(10239), Some(0xC000 | 10239));
        assert_eq!(encode_long_address(0), None);
        assert_eq!(encode_long_address(10240), None);

        assert_eq!(encode_cv17(1234), Some(0xC4));
        assert_eq!(encode_cv18(1234), Some(0xD2));
    }

    #[test]
    fn test_long_address_roundtrip() {
        for addr in 1..=ADDRESS_MAX {
            let cv17 = encode_cv17(addr).unwrap();
            let cv18 = encode_cv18(addr).unwrap();
            assert_eq!(decode_long_address(cv17, cv18), Some(addr));
            assert_eq!(decode_long_address_strict(cv17, cv18), Some(addr));
        }
    }

    #[test]
    fn test_long_address_decode_limits() {
        // 0x28 << 8 = 10240
        assert_eq!(decode_long_address(0xE8, 0x00), None);
        assert_eq!(decode_long_address(0xE7, 0xFF), Some(10239));
        // prefix bits are not checked by the permissive decoder
        assert_eq!(decode_long_address(0x04, 0xD2), Some(1234));
        assert_eq!(decode_long_address_strict(0x04, 0xD2), None);
    }

    #[test]
    fn test_consist_address_roundtrip() {
        for addr in 1..=ADDRESS_MAX {
            for invert in [false, true] {
                let cv19 = encode_cv19(addr, invert).unwrap();
                let cv20 = encode_cv20(addr).unwrap();
                assert_eq!(decode_consist_address(cv19, cv20), Some(addr));
                assert_eq!(consist_direction_inverted(cv19), invert);
            }
        }
    }

    #[test]
    fn test_consist_address_edges() {
        assert_eq!(encode_consist_address(0, true), Some(0));
        assert_eq!(decode_consist_address(0, 0), None);
        assert_eq!(decode_consist_address(0x80, 0), None);
        assert_eq!(encode_consist_address(10240, false), None);

        // 127 stays in CV19, 128 splits decimally
        assert_eq!(encode_consist_address(127, false), Some(127));
        assert_eq!(encode_consist_address(128, false), Some((1 << 8) | 28));
        assert_eq!(decode_consist_address(99, 102), None);
    }

    #[test]
    fn test_cv29_bits() {
        let cv29 = Cv29::from(0x2A);
        assert!(cv29.extended_address());
        assert!(cv29.railcom());
        assert!(cv29.speed_steps_28());
        assert!(!cv29.direction_reversed());

        let mut cv29 = Cv29(0);
        cv29.set_extended_address(true);
        assert_eq!(cv29.0, 0x20);
    }

    #[test]
    fn test_decoder_address() {
        assert_eq!(DecoderAddress::short(3), Some(DecoderAddress::Short(3)));
        assert_eq!(DecoderAddress::short(0), None);
        assert_eq!(DecoderAddress::short(128), None);
        assert_eq!(DecoderAddress::long(10240), None);
        assert_eq!(DecoderAddress::long(3).map(|a| a.value()), Some(3));
        assert_eq!(DecoderAddress::Long(1234).to_string(), "1234 (long)");
    }

    #[test]
    fn test_decoder_address_wire_form() {
        assert_eq!(DecoderAddress::Short(3).to_wire(), 0x0003);
        assert_eq!(DecoderAddress::Long(3).to_wire(), 0xC003);
        assert_eq!(DecoderAddress::from_wire(0x0003), Some(DecoderAddress::Short(3)));
        assert_eq!(DecoderAddress::from_wire(0xC003), Some(DecoderAddress::Long(3)));
        assert_eq!(DecoderAddress::from_wire(0), None);
        assert_eq!(DecoderAddress::from_wire(0x0080), None);
        assert_eq!(DecoderAddress::from_wire(0xE800), None);
    }

    #[test]
    fn test_cv_address_range() {
        assert!(CvAddress::new(1).is_ok());
        assert!(CvAddress::new(1024).is_ok());
        assert!(CvAddress::new(0).is_err());
        assert!(CvAddress::new(1025).is_err());
        assert!(CvAddress::new(1).unwrap().with_bank(4, 1).is_err());
    }

    #[test]
    fn test_cv_address_flat_key() -> Result<()> {
        let plain = CvAddress::new(29)?;
        assert_eq!(plain.flat(), 29);

        let b0 = CvAddress::new(257)?.with_bank(0, 0x10)?;
        assert_eq!(b0.flat(), 0x0010_0101);

        // bank 2 keeps its lane even when bank 1 is absent
        let b02 = CvAddress::new(257)?.with_bank(0, 0x10)?.with_bank(2, 0xAB)?;
        assert_eq!(b02.flat(), 0x00AB_0010_0101);

        let b3 = CvAddress::new(0x3FF)?.with_bank(3, 0xFF)?;
        assert_eq!(b3.flat(), 0xFF00_0000_03FF);
        Ok(())
    }

    #[test]
    fn test_cv_address_equality() -> Result<()> {
        let a = CvAddress::new(257)?.with_bank(0, 1)?;
        let b = CvAddress::new(257)?.with_bank(0, 1)?;
        let c = CvAddress::new(257)?.with_bank(1, 1)?;
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, CvAddress::new(257)?);
        Ok(())
    }

    #[test]
    fn test_cv_address_parse_display() -> Result<()> {
        let addr: CvAddress = "257:0=16,2=2".parse()?;
        assert_eq!(addr.cv(), 257);
        assert_eq!(addr.bank(0), Some(16));
        assert_eq!(addr.bank(1), None);
        assert_eq!(addr.bank(2), Some(2));
        assert_eq!(addr.to_string(), "CV257:0=16,2=2");
        assert_eq!(addr.to_string().parse::<CvAddress>()?, addr);

        assert_eq!("CV29".parse::<CvAddress>()?, CvAddress::new(29)?);
        assert!("x".parse::<CvAddress>().is_err());
        assert!("29:0".parse::<CvAddress>().is_err());
        assert!("29:0=300".parse::<CvAddress>().is_err());
        Ok(())
    }
}
