//! Acquisition scheduler.
//!
//! One session = one tokio task polling every box referenced by the
//! [`ParameterRegistry`](crate::registry::ParameterRegistry) in ascending
//! order, once per tick:
//!
//! ```text
//! for each tick:
//!     for each box (ascending):
//!         discard_buffers; write "*NNNVALL#\r"
//!         read until '#' or box_timeout
//!         decode with the configured dialect
//!         dispatch values to every parameter bound to the box
//!     bounded mode: stop if every buffer is full
//!     sleep inter_tick_delay (abortable)
//! ```
//!
//! A failure on one box is contained to that box's parameters for that tick.
//! Cancellation is checked before every box command, after every read, and
//! around the inter-tick delay; a pending read or delay is abandoned
//! immediately, a write is never interrupted.
//!
//! # Modes
//!
//! - [`AcquisitionMode::Continuous`]: live cells are overwritten every tick
//!   until the session is stopped.
//! - [`AcquisitionMode::Bounded`]: distinct valid samples are collected until
//!   every parameter holds `target` of them.

mod poll;
mod scheduler;

pub use poll::{poll_once, BoxPoll};
pub use scheduler::{Scheduler, SessionHandle};

use crate::protocol::Dialect;
use std::time::Duration;

/// Default per-box reply timeout.
pub const DEFAULT_BOX_TIMEOUT: Duration = Duration::from_millis(90);

/// Default pause between ticks.
pub const DEFAULT_INTER_TICK_DELAY: Duration = Duration::from_millis(60);

/// Timing and decoding settings shared by every session of a scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerSettings {
    /// Reply dialect spoken by the boxes
    pub dialect: Dialect,
    /// Upper bound on waiting for one box's reply
    pub box_timeout: Duration,
    /// Pause after each full pass over the boxes
    pub inter_tick_delay: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            dialect: Dialect::default(),
            box_timeout: DEFAULT_BOX_TIMEOUT,
            inter_tick_delay: DEFAULT_INTER_TICK_DELAY,
        }
    }
}

impl SchedulerSettings {
    /// Settings for `dialect` with default timing.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            ..Default::default()
        }
    }

    /// Set the per-box reply timeout.
    pub fn with_box_timeout(mut self, timeout: Duration) -> Self {
        self.box_timeout = timeout;
        self
    }

    /// Set the pause between ticks.
    pub fn with_inter_tick_delay(mut self, delay: Duration) -> Self {
        self.inter_tick_delay = delay;
        self
    }
}

/// How a session consumes readings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionMode {
    /// Overwrite live cells every tick until stopped
    Continuous,
    /// Collect `target` distinct samples per parameter, then stop
    Bounded {
        /// Samples required per parameter
        target: usize,
    },
}

/// Lifecycle of a scheduler and its current session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No session has been started
    Idle,
    /// The polling task is active
    Running,
    /// A bounded session filled every buffer
    Completed,
    /// The session was stopped or cancelled
    Stopped,
}

impl SessionState {
    /// Whether the polling task has exited.
    pub fn is_finished(self) -> bool {
        matches!(self, SessionState::Completed | SessionState::Stopped)
    }
}
