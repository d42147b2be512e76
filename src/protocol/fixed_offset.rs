//! Fixed-offset reply dialect.
//!
//! Each channel occupies a `field_width`-character field starting at a
//! configured one-indexed column. The factory firmware places channel 1..4 at
//! columns 4, 16, 28 and 40 with 8-character fields:
//!
//! ```text
//! A01 +1.2345    -0.5000       12.000    +000.001
//!    ^           ^           ^           ^
//!    4           16          28          40
//! ```
//!
//! A field is trimmed and parsed directly. Firmware that pads fields with unit
//! suffixes or status characters gets a second chance: the first maximal run
//! of `[0-9+\-.]` inside the field is parsed instead.

use super::{parse_number, ChannelValues, CHANNELS_PER_BOX};
use crate::error::DecodeError;
use regex::Regex;
use std::sync::LazyLock;

/// First run of characters that can make up a signed decimal.
static NUMERIC_RUN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[0-9+\-.]+").expect("Invalid numeric run regex"));

pub(crate) fn default_offsets() -> [usize; CHANNELS_PER_BOX] {
    [4, 16, 28, 40]
}

pub(crate) fn default_field_width() -> usize {
    8
}

/// Decode a fixed-offset reply.
///
/// Returns [`DecodeError::TooShort`] when the reply does not reach the last
/// configured offset. A final field cut short by the end of the reply is
/// decoded from whatever characters are present.
pub fn decode(
    reply: &str,
    offsets: &[usize; CHANNELS_PER_BOX],
    field_width: usize,
) -> Result<ChannelValues, DecodeError> {
    let bytes = reply.as_bytes();
    let required = offsets.iter().copied().max().unwrap_or(0);
    if bytes.len() < required {
        return Err(DecodeError::TooShort {
            len: bytes.len(),
            required,
        });
    }

    let mut values = [f64::NAN; CHANNELS_PER_BOX];
    for (slot, &offset) in values.iter_mut().zip(offsets.iter()) {
        let start = offset.saturating_sub(1);
        let end = start.saturating_add(field_width).min(bytes.len());
        if let Some(field) = bytes.get(start..end) {
            let field = String::from_utf8_lossy(field);
            *slot = decode_field(&field).unwrap_or(f64::NAN);
        }
    }

    Ok(ChannelValues::from_array(values))
}

/// Parse one channel field, falling back to its first numeric run.
pub fn decode_field(field: &str) -> Option<f64> {
    let trimmed = field.trim();
    parse_number(trimmed).or_else(|| {
        NUMERIC_RUN
            .find(trimmed)
            .and_then(|run| parse_number(run.as_str()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const FACTORY_REPLY: &str = concat!(
        "A01", " +1.2345", "    ", "-0.5000 ", "    ", "  12.000", "    ", "+000.001"
    );

    fn decode_default(reply: &str) -> Result<ChannelValues, DecodeError> {
        decode(reply, &default_offsets(), default_field_width())
    }

    #[test]
    fn test_decode_factory_layout() {
        let values = decode_default(FACTORY_REPLY).unwrap();
        assert_eq!(values.as_array(), &[1.2345, -0.5, 12.0, 0.001]);
    }

    #[test]
    fn test_field_with_unit_suffix_uses_numeric_run() {
        let reply = concat!(
            "A01", "  +1.5mm", "    ", "OVR-2.25", "    ", "  12.000", "    ", "+000.001"
        );
        let values = decode_default(reply).unwrap();
        assert_eq!(values.get(1), Some(1.5));
        assert_eq!(values.get(2), Some(-2.25));
        assert_eq!(values.get(3), Some(12.0));
    }

    #[test]
    fn test_unparsable_field_is_nan() {
        let reply = concat!(
            "A01", "  ERROR ", "    ", "   --   ", "    ", "  12.000", "    ", "+000.001"
        );
        let values = decode_default(reply).unwrap();
        assert!(values.get(1).unwrap().is_nan());
        assert!(values.get(2).unwrap().is_nan());
        assert_eq!(values.valid_count(), 2);
    }

    #[test]
    fn test_short_reply_is_too_short() {
        let err = decode_default("A01 +1.2345    -0.5000").unwrap_err();
        assert_eq!(
            err,
            DecodeError::TooShort {
                len: 22,
                required: 40
            }
        );
        assert_eq!(decode_default("").unwrap_err(), DecodeError::TooShort {
            len: 0,
            required: 40
        });
    }

    #[test]
    fn test_truncated_last_field_uses_remaining_chars() {
        // Reply ends three characters into the last field.
        let reply = &FACTORY_REPLY[..42];
        let values = decode_default(reply).unwrap();
        assert_eq!(values.get(3), Some(12.0));
        assert_eq!(values.get(4), Some(0.0));
    }

    #[test]
    fn test_length_boundary_at_last_offset() {
        let prefix = &FACTORY_REPLY[..39];
        assert_eq!(
            decode_default(prefix).unwrap_err(),
            DecodeError::TooShort {
                len: 39,
                required: 40
            }
        );

        // Exactly reaching column 40 leaves a one-character last field
        let reply = format!("{}7", prefix);
        assert_eq!(reply.len(), 40);
        let values = decode_default(&reply).unwrap();
        assert_eq!(values.as_array(), &[1.2345, -0.5, 12.0, 7.0]);
    }

    #[test]
    fn test_custom_offsets() {
        let values = decode("+1.00000-2.00000+3.00000+4.00000", &[1, 9, 17, 25], 8).unwrap();
        assert_eq!(values.as_array(), &[1.0, -2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_non_ascii_noise_does_not_panic() {
        let reply = "A01 +1.2345\u{FFFD}\u{FFFD}-0.5000       12.000    +000.001";
        let values = decode_default(reply).unwrap();
        assert_eq!(values.get(1), Some(1.2345));
    }
}
