//! Hex text helpers for byte buffers
//!
//! Used for diagnostics and to feed captured traffic into tests.

use crate::error::{DccError, Result};

/// Parse hex bytes separated by whitespace, commas or nothing at all
///
/// `"01 0a FF"`, `"010aff"` and `"0x01,0x0a,0xff"` all yield
/// `[0x01, 0x0a, 0xff]`.
pub fn parse(text: &str) -> Result<Vec<u8>> {
    let mut out = Vec::new();

    for token in text.split(|c: char| c.is_whitespace() || c == ',') {
        let token = token
            .strip_prefix("0x")
            .or_else(|| token.strip_prefix("0X"))
            .unwrap_or(token);
        if token.is_empty() {
            continue;
        }
        if !token.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(DccError::invalid_hex(format!("bad digit in {:?}", token)));
        }
        if token.len() % 2 != 0 {
            return Err(DccError::invalid_hex(format!(
                "odd number of digits in {:?}",
                token
            )));
        }

        for i in (0..token.len()).step_by(2) {
            let pair = token
                .get(i..i + 2)
                .ok_or_else(|| DccError::invalid_hex(format!("non-ASCII input {:?}", token)))?;
            let byte = u8::from_str_radix(pair, 16)
                .map_err(|_| DccError::invalid_hex(format!("bad digit pair {:?}", pair)))?;
            out.push(byte);
        }
    }

    Ok(out)
}

/// Format bytes as space separated upper-case hex
pub fn format(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() -> Result<()> {
        assert_eq!(parse("01 0a FF")?, vec![0x01, 0x0a, 0xff]);
        assert_eq!(parse("010aff")?, vec![0x01, 0x0a, 0xff]);
        assert_eq!(parse("0x01,0x0a, 0xff")?, vec![0x01, 0x0a, 0xff]);
        assert_eq!(parse("")?, Vec::<u8>::new());
        Ok(())
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(matches!(parse("0g"), Err(DccError::InvalidHex(_))));
        assert!(matches!(parse("123"), Err(DccError::InvalidHex(_))));
        assert!(matches!(parse("+1"), Err(DccError::InvalidHex(_))));
        assert!(matches!(parse("é1"), Err(DccError::InvalidHex(_))));
    }

    #[test]
    fn test_format() {
        assert_eq!(format(&[0x01, 0xab, 0x10]), "01 AB 10");
        assert_eq!(format(&[]), "");
    }
}
