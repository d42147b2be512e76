//! Sample store: per-parameter live state and bounded sample buffers.
//!
//! The polling task is the only writer. Consumers read concurrently and only
//! ever see whole entries:
//!
//! - Live cells are published through a `tokio::sync::watch` channel per
//!   parameter. Every update replaces the entire [`LiveCell`], so a reader gets
//!   either the previous cell or the new one.
//! - Sample buffers sit behind a `parking_lot::Mutex` per parameter; the cap
//!   and the dedup rule are checked and applied under the same lock.
//!
//! The key set is fixed at construction from the [`ParameterRegistry`], so the
//! map itself never needs a lock.

use crate::registry::{ParameterBinding, ParameterRegistry};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::watch;

/// Decimal places used in live cell text.
pub const VALUE_PRECISION: usize = 3;

/// Classification of a live value against its limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeStatus {
    /// Below the lower bound
    Under,
    /// Above the upper bound
    Over,
    /// Within limits
    InRange,
    /// No usable value this tick
    Error,
}

impl fmt::Display for ProbeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ProbeStatus::Under => "UNDER",
            ProbeStatus::Over => "OVER",
            ProbeStatus::InRange => "OK",
            ProbeStatus::Error => "ERROR",
        };
        f.write_str(label)
    }
}

/// Why a parameter has no usable value for a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The poll command could not be written to the box
    Transport,
    /// The reply yielded no value for a bound channel
    Decode,
    /// The binding references a channel outside 1..=4
    ChannelConfig {
        /// Offending channel number
        channel: u8,
    },
}

impl fmt::Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::Transport => f.write_str("transport failure"),
            Fault::Decode => f.write_str("undecodable reply"),
            Fault::ChannelConfig { channel } => write!(f, "channel {} outside 1..=4", channel),
        }
    }
}

/// Latest continuous-mode state of one parameter.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveCell {
    /// Primary value (first bound channel), 0.0 before the first reading
    pub value: f64,
    /// Parallel values, one per bound channel
    pub values: Vec<f64>,
    /// Classification
    pub status: ProbeStatus,
    /// Whether every value lies within limits
    pub in_range: bool,
    /// Display text; carries the formatted value when in range
    pub text: String,
    /// Failure cause when `status` is `Error`
    pub fault: Option<Fault>,
    /// Tick that produced this cell, 0 before the first reading
    pub tick: u64,
}

impl LiveCell {
    /// Cell before any reading has arrived.
    pub fn empty() -> Self {
        Self {
            value: 0.0,
            values: Vec::new(),
            status: ProbeStatus::Error,
            in_range: false,
            text: String::new(),
            fault: None,
            tick: 0,
        }
    }

    /// Cell for successfully decoded values, classified against `binding`.
    pub fn measured(binding: &ParameterBinding, values: Vec<f64>, tick: u64) -> Self {
        let status = binding.classify_all(&values);
        if status == ProbeStatus::Error {
            return Self::failed(Fault::Decode, tick);
        }

        let formatted = values
            .iter()
            .map(|v| format!("{:.*}", VALUE_PRECISION, v))
            .collect::<Vec<_>>()
            .join(" / ");
        let text = match status {
            ProbeStatus::InRange => formatted,
            other => format!("{} {}", other, formatted),
        };

        Self {
            value: values.first().copied().unwrap_or(0.0),
            values,
            status,
            in_range: status == ProbeStatus::InRange,
            text,
            fault: None,
            tick,
        }
    }

    /// Cell for a tick in which the parameter could not be read.
    pub fn failed(fault: Fault, tick: u64) -> Self {
        Self {
            value: f64::NAN,
            values: Vec::new(),
            status: ProbeStatus::Error,
            in_range: false,
            text: format!("{}: {}", ProbeStatus::Error, fault),
            fault: Some(fault),
            tick,
        }
    }

    /// Whether a tick has written this cell since the last reset.
    pub fn has_reading(&self) -> bool {
        self.tick > 0
    }
}

impl Default for LiveCell {
    fn default() -> Self {
        Self::empty()
    }
}

/// Accepted bounded-mode samples of one parameter.
#[derive(Debug, Clone, Default)]
struct SampleBuffer {
    rows: Vec<Vec<f64>>,
    target: usize,
}

impl SampleBuffer {
    fn is_full(&self) -> bool {
        self.target > 0 && self.rows.len() >= self.target
    }

    fn try_append(&mut self, sample: &[f64]) -> bool {
        if sample.is_empty() || sample.iter().any(|v| !v.is_finite()) {
            return false;
        }
        if self.rows.len() >= self.target {
            return false;
        }
        if self.rows.last().is_some_and(|last| last.as_slice() == sample) {
            return false;
        }
        self.rows.push(sample.to_vec());
        true
    }
}

struct Entry {
    live: watch::Sender<LiveCell>,
    samples: Mutex<SampleBuffer>,
}

/// Per-parameter accepted-sample counts for a bounded session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundedProgress {
    /// Target count T
    pub target: usize,
    /// (parameter, accepted count) in registry order
    pub counts: Vec<(String, usize)>,
}

impl BoundedProgress {
    /// Whether every parameter reached the target.
    pub fn is_complete(&self) -> bool {
        self.target > 0
            && !self.counts.is_empty()
            && self.counts.iter().all(|(_, n)| *n >= self.target)
    }

    /// Parameters still short of the target.
    pub fn pending(&self) -> impl Iterator<Item = &str> + '_ {
        self.counts
            .iter()
            .filter(|(_, n)| *n < self.target)
            .map(|(name, _)| name.as_str())
    }
}

/// Shared store of live cells and sample buffers.
pub struct SampleStore {
    order: Vec<String>,
    entries: HashMap<String, Entry>,
}

impl SampleStore {
    /// Create one empty entry per parameter in `registry`.
    pub fn new(registry: &ParameterRegistry) -> Self {
        let order: Vec<String> = registry.bindings().iter().map(|b| b.name.clone()).collect();
        let entries = order
            .iter()
            .map(|name| {
                let (live, _rx) = watch::channel(LiveCell::empty());
                (
                    name.clone(),
                    Entry {
                        live,
                        samples: Mutex::new(SampleBuffer::default()),
                    },
                )
            })
            .collect();

        Self { order, entries }
    }

    /// Replace the live cell of `parameter`. Unknown names are ignored.
    pub fn update_live(&self, parameter: &str, cell: LiveCell) {
        if let Some(entry) = self.entries.get(parameter) {
            entry.live.send_replace(cell);
        }
    }

    /// Append a bounded-mode sample if it is valid, the buffer is below its
    /// target, and it differs from the previously accepted sample.
    pub fn try_append(&self, parameter: &str, sample: &[f64]) -> bool {
        self.entries
            .get(parameter)
            .is_some_and(|entry| entry.samples.lock().try_append(sample))
    }

    /// Clear the live cell and sample buffer of `parameter`.
    pub fn reset(&self, parameter: &str) {
        if let Some(entry) = self.entries.get(parameter) {
            entry.live.send_replace(LiveCell::empty());
            entry.samples.lock().rows.clear();
        }
    }

    /// Clear every entry and set the bounded-mode target.
    pub fn reset_all(&self, target: usize) {
        for entry in self.entries.values() {
            entry.live.send_replace(LiveCell::empty());
            let mut buffer = entry.samples.lock();
            buffer.rows.clear();
            buffer.target = target;
        }
    }

    /// Snapshot of the live cell of `parameter`.
    pub fn live_value(&self, parameter: &str) -> Option<LiveCell> {
        self.entries
            .get(parameter)
            .map(|entry| entry.live.borrow().clone())
    }

    /// Watch receiver notified on every live update of `parameter`.
    pub fn subscribe_live(&self, parameter: &str) -> Option<watch::Receiver<LiveCell>> {
        self.entries.get(parameter).map(|entry| entry.live.subscribe())
    }

    /// Snapshot of accepted primary-channel values of `parameter`.
    pub fn samples(&self, parameter: &str) -> Option<Vec<f64>> {
        self.entries.get(parameter).map(|entry| {
            entry
                .samples
                .lock()
                .rows
                .iter()
                .filter_map(|row| row.first().copied())
                .collect()
        })
    }

    /// Snapshot of accepted samples of `parameter`, all bound channels.
    pub fn sample_rows(&self, parameter: &str) -> Option<Vec<Vec<f64>>> {
        self.entries
            .get(parameter)
            .map(|entry| entry.samples.lock().rows.clone())
    }

    /// Accepted counts per parameter.
    pub fn progress(&self) -> BoundedProgress {
        let mut target = 0;
        let counts = self
            .order
            .iter()
            .filter_map(|name| {
                let buffer = self.entries.get(name)?.samples.lock();
                target = buffer.target;
                Some((name.clone(), buffer.rows.len()))
            })
            .collect();
        BoundedProgress { target, counts }
    }

    /// Whether every buffer holds exactly its target count.
    pub fn is_complete(&self) -> bool {
        !self.entries.is_empty() && self.entries.values().all(|e| e.samples.lock().is_full())
    }

    /// Parameter names in registry order.
    pub fn parameters(&self) -> &[String] {
        &self.order
    }
}

impl fmt::Debug for SampleStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleStore")
            .field("parameters", &self.order)
            .finish()
    }
}
