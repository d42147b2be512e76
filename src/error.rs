//! Custom error types for the acquisition engine.
//!
//! `ProbeError` is the crate-wide error returned by session control calls and
//! configuration loading. Transport failures have their own enum,
//! [`TransportError`], because they are also carried inside per-parameter
//! faults without ever reaching the caller of `start`.
//!
//! ## Error Hierarchy
//!
//! - **`Transport`**: open/write/timeout failures (device offline, cable unplugged).
//! - **`Decode`**: a reply that yielded no usable channel for a tick.
//! - **`ChannelConfig`**: a binding references a channel outside 1..=4.
//! - **`Ownership`**: a port is already claimed by another session.
//! - **`AlreadyRunning`**: `start` called while a session is running.
//! - **`Configuration`**: semantic errors found while validating configuration.
//!
//! Per-box and per-channel failures never propagate out of the polling loop;
//! they are surfaced as [`crate::store::Fault`] values on the affected
//! parameters instead.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type AppResult<T> = std::result::Result<T, ProbeError>;

#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Channel {channel} of parameter '{parameter}' is outside 1..=4")]
    ChannelConfig { parameter: String, channel: u8 },

    #[error("Port '{0}' is already owned by another acquisition session")]
    Ownership(String),

    #[error("Acquisition is already running")]
    AlreadyRunning,

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),
}

/// Failures raised by a [`crate::transport::Transport`].
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Serial port '{port}' unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Write timed out after {0:?}")]
    WriteTimeout(std::time::Duration),

    #[error("Transport is already open")]
    AlreadyOpen,

    #[error("Transport is not open")]
    NotOpen,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Injected failure: {0}")]
    Simulated(String),
}

/// Reasons a reply could not be turned into any channel value.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Reply of {len} bytes is shorter than the required {required}")]
    TooShort { len: usize, required: usize },

    #[error("Reply carries no VALL marker")]
    MissingMarker,

    #[error("No channel in the reply could be parsed")]
    NoValidChannels,
}
