//! Tagged reply dialect.
//!
//! Values follow the literal `VALL` marker as groups of a two-digit channel
//! tag and a signed decimal:
//!
//! ```text
//! *001VALL C01+012.345C02-001.200C03+000.000C04+099.999#
//! ```
//!
//! Groups are assigned to channels 1..4 in the order they appear. The tag
//! digits are not used for placement; firmware has been seen numbering them
//! from zero.

use super::{parse_number, ChannelValues, CHANNELS_PER_BOX};
use crate::error::DecodeError;
use regex::Regex;
use std::sync::LazyLock;
use tracing::trace;

/// Literal preceding the channel groups.
pub const MARKER: &str = "VALL";

/// Two-digit tag followed by a signed decimal.
static TAGGED_VALUE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\d{2})([+-]?\d+(?:\.\d+)?)").expect("Invalid tagged value regex")
});

/// Decode a tagged reply.
///
/// Returns [`DecodeError::MissingMarker`] when `VALL` is absent. Channels with
/// no matching group are NaN.
pub fn decode(reply: &str) -> Result<ChannelValues, DecodeError> {
    let start = reply.find(MARKER).ok_or(DecodeError::MissingMarker)? + MARKER.len();
    let body = reply[start..].trim_end_matches(['#', '\r', '\n']);

    let mut values = [f64::NAN; CHANNELS_PER_BOX];
    for (slot, caps) in values.iter_mut().zip(TAGGED_VALUE.captures_iter(body)) {
        let tag = &caps[1];
        let number = &caps[2];
        trace!(tag, number, "tagged channel group");
        *slot = parse_number(number).unwrap_or(f64::NAN);
    }

    Ok(ChannelValues::from_array(values))
}
