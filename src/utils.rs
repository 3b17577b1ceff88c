//! Utility functions and helpers
//!
//! Timestamps, hex handling and human-readable formatting shared by the
//! gateway modules.

use crate::{Error, Result};
use std::time::{SystemTime, UNIX_EPOCH};

/// Get current timestamp in milliseconds since Unix epoch
pub fn current_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Format hash rate as a human-readable string
pub fn format_hash_rate(hashes_per_sec: f64) -> String {
    const UNITS: &[&str] = &["H/s", "KH/s", "MH/s", "GH/s", "TH/s", "PH/s"];
    let mut rate = hashes_per_sec;
    let mut unit_index = 0;

    while rate >= 1000.0 && unit_index < UNITS.len() - 1 {
        rate /= 1000.0;
        unit_index += 1;
    }

    format!("{:.2} {}", rate, UNITS[unit_index])
}

/// Decode a `0x`-prefixed hex string of exactly `len` bytes
pub fn decode_hex_fixed(s: &str, len: usize) -> Result<Vec<u8>> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| Error::work("missing 0x prefix"))?;
    if digits.len() != len * 2 {
        return Err(Error::work(format!(
            "expected {} hex digits, got {}",
            len * 2,
            digits.len()
        )));
    }
    hex::decode(digits).map_err(|e| Error::work(e.to_string()))
}

/// Parse a `0x`-prefixed hex quantity (as used for reported hashrates)
pub fn parse_hex_quantity(s: &str) -> Result<u128> {
    let digits = s
        .strip_prefix("0x")
        .ok_or_else(|| Error::work("missing 0x prefix"))?;
    if digits.is_empty() || digits.len() > 32 {
        return Err(Error::work(format!("invalid quantity {:?}", s)));
    }
    u128::from_str_radix(digits, 16).map_err(|e| Error::work(e.to_string()))
}

/// Short form of a header hash for log lines
pub fn short_hash(s: &str) -> &str {
    let end = s.len().min(12);
    s.get(..end).unwrap_or(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_hash_rate() {
        assert_eq!(format_hash_rate(100.0), "100.00 H/s");
        assert_eq!(format_hash_rate(1500.0), "1.50 KH/s");
        assert_eq!(format_hash_rate(1000000.0), "1.00 MH/s");
        assert_eq!(format_hash_rate(1500000000.0), "1.50 GH/s");
    }

    #[test]
    fn test_decode_hex_fixed() {
        assert_eq!(
            decode_hex_fixed("0xdeadbeef", 4).unwrap(),
            vec![0xde, 0xad, 0xbe, 0xef]
        );
        assert!(decode_hex_fixed("0xDEADBEEF", 4).is_ok());
        assert!(decode_hex_fixed("deadbeef", 4).is_err());
        assert!(decode_hex_fixed("0xdeadbeef", 8).is_err());
        assert!(decode_hex_fixed("0xdeadbzzf", 4).is_err());
    }

    #[test]
    fn test_parse_hex_quantity() {
        assert_eq!(parse_hex_quantity("0x500000").unwrap(), 0x500000);
        assert_eq!(parse_hex_quantity("0x0").unwrap(), 0);
        assert!(parse_hex_quantity("0x").is_err());
        assert!(parse_hex_quantity("500000").is_err());
        assert!(parse_hex_quantity("0xzz").is_err());
    }

    #[test]
    fn test_short_hash() {
        assert_eq!(short_hash("0x1234567890abcdef"), "0x1234567890");
        assert_eq!(short_hash("0x12"), "0x12");
    }

    #[test]
    fn test_current_timestamp() {
        let millis = current_timestamp_millis();
        assert!(millis > 1_600_000_000_000);
    }
}
