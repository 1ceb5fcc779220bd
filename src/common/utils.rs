//! Utility functions for kayak

use crate::common::{Error, Result};
use std::time::Duration;

/// Parse a human duration such as "800ms", "5s", "2m" or "1h".
/// A bare number is milliseconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (digits, unit) = s.split_at(split);
    if digits.is_empty() {
        return Err(Error::InvalidConfig(format!("invalid duration: {:?}", s)));
    }

    let value: u64 = digits
        .parse()
        .map_err(|_| Error::InvalidConfig(format!("invalid duration: {:?}", s)))?;

    let millis_per_unit: u64 = match unit.trim() {
        "" | "ms" => 1,
        "s" => 1_000,
        "m" => 60_000,
        "h" => 3_600_000,
        other => {
            return Err(Error::InvalidConfig(format!(
                "unknown duration unit {:?} in {:?}",
                other, s
            )))
        }
    };

    value
        .checked_mul(millis_per_unit)
        .map(Duration::from_millis)
        .ok_or_else(|| Error::InvalidConfig(format!("duration out of range: {:?}", s)))
}

/// CRC32 used for frame checksums
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("800ms").unwrap(), Duration::from_millis(800));
        assert_eq!(parse_duration("250").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 5s ").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_invalid() {
        for bad in ["", "ms", "abc", "10x", "1.5s", "-3s"] {
            assert!(parse_duration(bad).is_err(), "{:?} should fail", bad);
        }
        assert!(parse_duration("18446744073709551615h").is_err());
    }

    #[test]
    fn test_crc32_detects_change() {
        assert_eq!(crc32(b"kayak"), crc32(b"kayak"));
        assert_ne!(crc32(b"kayak"), crc32(b"kayaK"));
    }
}
