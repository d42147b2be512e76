//! Probe box wire protocol.
//!
//! Protocol Overview:
//! - Format: ASCII, one poll command reads all four channels of one box
//! - Request: `*` + 3-digit zero-padded box id + `VALL#` + CR (e.g. `*007VALL#\r`)
//! - Reply: ASCII blob terminated by `#`
//!
//! Two firmware variants answer the same command with incompatible reply
//! layouts. The deployment picks one through [`Dialect`]; replies are never
//! sniffed to guess which one is on the wire.
//!
//! - [`Dialect::FixedOffset`]: each channel sits in an 8-character field at a
//!   fixed column (see [`fixed_offset`]).
//! - [`Dialect::Tagged`]: channels follow the `VALL` marker as `NN±ddd.ddd`
//!   groups (see [`tagged`]).
//!
//! Both decoders always return a full [`ChannelValues`]; channels that are
//! missing or unparsable are NaN.

pub mod fixed_offset;
pub mod tagged;

use crate::error::{DecodeError, ProbeError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of analog channels exposed by one box.
pub const CHANNELS_PER_BOX: usize = 4;

/// Byte terminating every box reply.
pub const REPLY_TERMINATOR: u8 = b'#';

// =============================================================================
// Box addressing
// =============================================================================

/// Address of a signal-conditioning box (1..=999).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct BoxId(u16);

impl BoxId {
    /// Lowest addressable box.
    pub const MIN: u16 = 1;
    /// Highest address that fits the 3-digit command field.
    pub const MAX: u16 = 999;

    /// Validate and wrap a box address.
    pub fn new(id: u16) -> Result<Self, ProbeError> {
        if (Self::MIN..=Self::MAX).contains(&id) {
            Ok(Self(id))
        } else {
            Err(ProbeError::Configuration(format!(
                "Box id {} out of range ({}-{})",
                id,
                Self::MIN,
                Self::MAX
            )))
        }
    }

    /// Raw numeric address.
    pub fn get(self) -> u16 {
        self.0
    }
}

impl TryFrom<u16> for BoxId {
    type Error = ProbeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<BoxId> for u16 {
    fn from(value: BoxId) -> Self {
        value.0
    }
}

impl fmt::Display for BoxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:03}", self.0)
    }
}

/// Build the poll command that reads all four channels of `box_id`.
pub fn poll_command(box_id: BoxId) -> String {
    format!("*{}VALL#\r", box_id)
}

// =============================================================================
// Decoded values
// =============================================================================

/// One decoded channel reading.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Channel number (1..=4)
    pub channel: u8,
    /// Decoded value, NaN when the channel was invalid
    pub value: f64,
    /// Tick in which the reply was captured
    pub captured_at_tick: u64,
}

impl Reading {
    /// Whether the channel carried a usable number.
    pub fn is_valid(&self) -> bool {
        self.value.is_finite()
    }
}

/// Fixed-size decode result, 1-indexed by channel; NaN marks an invalid channel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelValues([f64; CHANNELS_PER_BOX]);

impl ChannelValues {
    /// All four channels invalid.
    pub fn invalid() -> Self {
        Self([f64::NAN; CHANNELS_PER_BOX])
    }

    /// Wrap raw values, normalizing non-finite entries to NaN.
    pub fn from_array(values: [f64; CHANNELS_PER_BOX]) -> Self {
        Self(values.map(|v| if v.is_finite() { v } else { f64::NAN }))
    }

    /// Value of a 1-based channel.
    ///
    /// Returns `None` when `channel` is outside 1..=4, and `Some(NaN)` when the
    /// channel exists but was not decodable.
    pub fn get(&self, channel: u8) -> Option<f64> {
        let index = usize::from(channel).checked_sub(1)?;
        self.0.get(index).copied()
    }

    /// Number of channels holding a finite value.
    pub fn valid_count(&self) -> usize {
        self.0.iter().filter(|v| v.is_finite()).count()
    }

    /// Underlying array, index 0 = channel 1.
    pub fn as_array(&self) -> &[f64; CHANNELS_PER_BOX] {
        &self.0
    }

    /// Expand into per-channel readings stamped with `tick`.
    pub fn readings(&self, tick: u64) -> Vec<Reading> {
        self.0
            .iter()
            .zip(1u8..)
            .map(|(&value, channel)| Reading {
                channel,
                value,
                captured_at_tick: tick,
            })
            .collect()
    }
}

impl Default for ChannelValues {
    fn default() -> Self {
        Self::invalid()
    }
}

// =============================================================================
// Dialect selection
// =============================================================================

/// Reply encoding spoken by the deployed box firmware.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Dialect {
    /// Channels in fixed 8-character columns.
    FixedOffset {
        /// One-indexed start column of each channel field
        #[serde(default = "fixed_offset::default_offsets")]
        offsets: [usize; CHANNELS_PER_BOX],
        /// Width of each channel field
        #[serde(default = "fixed_offset::default_field_width")]
        field_width: usize,
    },
    /// Channels as `NN±value` groups after the `VALL` marker.
    Tagged,
}

impl Default for Dialect {
    fn default() -> Self {
        Self::fixed_offset()
    }
}

impl Dialect {
    /// Fixed-offset dialect with the factory column layout (4, 16, 28, 40).
    pub fn fixed_offset() -> Self {
        Self::FixedOffset {
            offsets: fixed_offset::default_offsets(),
            field_width: fixed_offset::default_field_width(),
        }
    }

    /// Decode a reply, reporting why nothing usable came out of it.
    ///
    /// A reply that parses but leaves every channel NaN is reported as
    /// [`DecodeError::NoValidChannels`].
    pub fn decode_checked(&self, reply: &str) -> Result<ChannelValues, DecodeError> {
        let values = match self {
            Dialect::FixedOffset {
                offsets,
                field_width,
            } => fixed_offset::decode(reply, offsets, *field_width)?,
            Dialect::Tagged => tagged::decode(reply)?,
        };

        if values.valid_count() == 0 {
            return Err(DecodeError::NoValidChannels);
        }
        Ok(values)
    }

    /// Decode a reply; failures collapse to all-invalid channels.
    pub fn decode(&self, reply: &str) -> ChannelValues {
        self.decode_checked(reply).unwrap_or_default()
    }

    /// Short name used in logs and CLI output.
    pub fn name(&self) -> &'static str {
        match self {
            Dialect::FixedOffset { .. } => "fixed_offset",
            Dialect::Tagged => "tagged",
        }
    }
}

/// Parse a trimmed numeric token; non-finite results count as invalid.
pub(crate) fn parse_number(token: &str) -> Option<f64> {
    token.parse::<f64>().ok().filter(|v| v.is_finite())
}
