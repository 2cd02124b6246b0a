//! File-like attributes carried by entries.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Optional file-like attributes an entry may carry.
///
/// All fields are optional; plugins report only what their provider knows.
/// A non-zero `size` implies the entry supports `read`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
    pub ctime: Option<SystemTime>,
    /// Size in bytes. Authoritative for `read` when present.
    pub size: Option<u64>,
    /// Unix permission bits.
    pub mode: Option<u32>,
    /// How long the kernel may trust these attributes.
    pub valid: Option<Duration>,
}

impl Attributes {
    pub fn is_empty(&self) -> bool {
        *self == Attributes::default()
    }
}

/// Convert plugin-reported Unix seconds into a `SystemTime`.
///
/// Zero is the zero time (the epoch), matching the wire convention that
/// absent timestamps are sent as 0.
pub fn unix_seconds_to_system_time(secs: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs)
}

/// Parse a mode string as a C-style integer literal.
///
/// Accepts the bases strtoul does: `0x`/`0X` hex, leading-zero octal,
/// decimal otherwise. Plugins send mode as a string so they can use
/// whichever form their language prints naturally.
pub fn parse_mode(s: &str) -> Result<u32, ParseModeError> {
    let s = s.trim();
    let parsed = if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u32::from_str_radix(hex, 16)
    } else if s.len() > 1 && s.starts_with('0') {
        u32::from_str_radix(&s[1..], 8)
    } else {
        s.parse::<u32>()
    };
    parsed.map_err(|_| ParseModeError(s.to_string()))
}

/// Error for a mode string that is not a valid C-style integer literal.
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid mode: {0:?} is not a parseable integer")]
pub struct ParseModeError(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_seconds_zero_is_epoch() {
        assert_eq!(unix_seconds_to_system_time(0), UNIX_EPOCH);
    }

    #[test]
    fn test_unix_seconds_round_trip() {
        let now_secs = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let t = unix_seconds_to_system_time(now_secs);
        assert_eq!(t.duration_since(UNIX_EPOCH).unwrap().as_secs(), now_secs);
    }

    #[test]
    fn test_parse_mode_bases() {
        // Same value in hex, decimal, and octal.
        assert_eq!(parse_mode("0xff").unwrap(), 255);
        assert_eq!(parse_mode("255").unwrap(), 255);
        assert_eq!(parse_mode("0377").unwrap(), 255);
    }

    #[test]
    fn test_parse_mode_zero() {
        assert_eq!(parse_mode("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_mode_rejects_garbage() {
        assert!(parse_mode("not a number").is_err());
        assert!(parse_mode("0x").is_err());
        assert!(parse_mode("").is_err());
    }

    #[test]
    fn test_default_attributes_are_empty() {
        assert!(Attributes::default().is_empty());
        let attr = Attributes {
            size: Some(10),
            ..Default::default()
        };
        assert!(!attr.is_empty());
    }
}
