//! Mock probe box bus.
//!
//! Simulates a chain of boxes behind one serial port for testing without
//! physical hardware. Replies are rendered in whichever [`Dialect`] the bus is
//! created with, so the full encode/decode path is exercised.
//!
//! Each simulated box answers from, in order of priority:
//! 1. a queue of scripted replies (one consumed per poll),
//! 2. a steady set of channel values, optionally with random jitter,
//! 3. nothing at all (a silent box; the read times out).
//!
//! Write failures and open failures can be injected per box / per bus. The
//! bus keeps a log of every command written so tests can assert on wire
//! traffic.
//!
//! # Example
//!
//! ```rust,ignore
//! let bus = MockBus::new(Dialect::Tagged);
//! bus.set_values(1, [0.010, -0.020, 0.0, 0.005]);
//! bus.fail_writes(2, true);
//! let transport = bus.transport("mock0");
//! ```

use crate::error::TransportError;
use crate::protocol::{Dialect, CHANNELS_PER_BOX, REPLY_TERMINATOR};
use crate::transport::Transport;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::trace;

#[derive(Debug, Clone)]
enum ScriptedReply {
    Values([f64; CHANNELS_PER_BOX]),
    Raw(String),
}

#[derive(Debug, Default)]
struct MockBox {
    queued: VecDeque<ScriptedReply>,
    steady: Option<[f64; CHANNELS_PER_BOX]>,
    jitter: f64,
    fail_writes: bool,
}

#[derive(Debug)]
struct BusState {
    dialect: Dialect,
    boxes: BTreeMap<u16, MockBox>,
    writes: Vec<String>,
    fail_open: bool,
    opens: usize,
}

/// Shared control handle for a simulated box bus.
///
/// Cloning yields another handle to the same bus; transports created from it
/// see every change made after they were handed to a session.
#[derive(Debug, Clone)]
pub struct MockBus {
    state: Arc<Mutex<BusState>>,
}

impl MockBus {
    /// Empty bus replying in `dialect`.
    pub fn new(dialect: Dialect) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState {
                dialect,
                boxes: BTreeMap::new(),
                writes: Vec::new(),
                fail_open: false,
                opens: 0,
            })),
        }
    }

    /// Answer every poll of `box_id` with `values` once the queue is empty.
    pub fn set_values(&self, box_id: u16, values: [f64; CHANNELS_PER_BOX]) {
        self.state.lock().boxes.entry(box_id).or_default().steady = Some(values);
    }

    /// Add uniform noise of +/- `amplitude` to steady values of `box_id`.
    pub fn set_jitter(&self, box_id: u16, amplitude: f64) {
        self.state.lock().boxes.entry(box_id).or_default().jitter = amplitude.abs();
    }

    /// Queue a one-shot reply carrying `values` (NaN = channel omitted/invalid).
    pub fn push_values(&self, box_id: u16, values: [f64; CHANNELS_PER_BOX]) {
        self.state
            .lock()
            .boxes
            .entry(box_id)
            .or_default()
            .queued
            .push_back(ScriptedReply::Values(values));
    }

    /// Queue a one-shot reply sent verbatim.
    pub fn push_raw(&self, box_id: u16, reply: impl Into<String>) {
        self.state
            .lock()
            .boxes
            .entry(box_id)
            .or_default()
            .queued
            .push_back(ScriptedReply::Raw(reply.into()));
    }

    /// Make writes addressed to `box_id` fail.
    pub fn fail_writes(&self, box_id: u16, fail: bool) {
        self.state.lock().boxes.entry(box_id).or_default().fail_writes = fail;
    }

    /// Make every subsequent `open` fail.
    pub fn fail_open(&self, fail: bool) {
        self.state.lock().fail_open = fail;
    }

    /// Commands written so far, in order.
    pub fn writes(&self) -> Vec<String> {
        self.state.lock().writes.clone()
    }

    /// Number of commands written so far.
    pub fn write_count(&self) -> usize {
        self.state.lock().writes.len()
    }

    /// Scripted replies still queued for `box_id`.
    pub fn queued(&self, box_id: u16) -> usize {
        self.state
            .lock()
            .boxes
            .get(&box_id)
            .map_or(0, |b| b.queued.len())
    }

    /// Number of successful opens.
    pub fn opens(&self) -> usize {
        self.state.lock().opens
    }

    /// New transport attached to this bus.
    pub fn transport(&self, port_name: impl Into<String>) -> MockTransport {
        MockTransport {
            port_name: port_name.into(),
            bus: self.clone(),
            open: false,
            pending: Vec::new(),
        }
    }

    /// Record a command and produce the addressed box's reply, if any.
    fn handle_command(&self, command: &str) -> Result<Option<String>, TransportError> {
        let mut state = self.state.lock();
        state.writes.push(command.to_string());

        let Some(box_id) = parse_box_id(command) else {
            return Ok(None);
        };
        let dialect = state.dialect.clone();
        let Some(mock_box) = state.boxes.get_mut(&box_id) else {
            return Ok(None);
        };
        if mock_box.fail_writes {
            return Err(TransportError::Simulated(format!(
                "write to box {:03} rejected",
                box_id
            )));
        }

        let reply = match mock_box.queued.pop_front() {
            Some(ScriptedReply::Raw(raw)) => Some(raw),
            Some(ScriptedReply::Values(values)) => Some(format_reply(&dialect, box_id, &values)),
            None => mock_box.steady.map(|values| {
                let jitter = mock_box.jitter;
                let values = if jitter > 0.0 {
                    let mut rng = rand::thread_rng();
                    values.map(|v| v + rng.gen_range(-jitter..=jitter))
                } else {
                    values
                };
                format_reply(&dialect, box_id, &values)
            }),
        };
        Ok(reply)
    }
}

/// Extract the box id from a `*NNNVALL#\r` command.
fn parse_box_id(command: &str) -> Option<u16> {
    command.strip_prefix('*')?.get(..3)?.parse().ok()
}

/// Render a reply for `values` the way box firmware speaking `dialect` would.
///
/// Non-finite values are rendered as an `ERR` field (fixed-offset) or left out
/// (tagged).
pub fn format_reply(dialect: &Dialect, box_id: u16, values: &[f64; CHANNELS_PER_BOX]) -> String {
    match dialect {
        Dialect::FixedOffset {
            offsets,
            field_width,
        } => {
            let width = *field_width;
            let len = offsets.iter().copied().max().unwrap_or(1).saturating_sub(1) + width;
            let mut line = vec![b' '; len];

            let prefix = format!("{:03}", box_id);
            let first_field = offsets.iter().copied().min().unwrap_or(1).saturating_sub(1);
            for (dst, src) in line.iter_mut().zip(prefix.bytes()).take(first_field) {
                *dst = src;
            }

            for (&offset, value) in offsets.iter().zip(values) {
                let text = if value.is_finite() {
                    format!("{:+.3}", value)
                } else {
                    "ERR".to_string()
                };
                let field = format!("{:>width$}", text, width = width);
                let start = offset.saturating_sub(1);
                for (dst, src) in line.iter_mut().skip(start).zip(field.bytes().take(width)) {
                    *dst = src;
                }
            }

            let mut reply = String::from_utf8_lossy(&line).into_owned();
            reply.push(char::from(REPLY_TERMINATOR));
            reply
        }
        Dialect::Tagged => {
            let mut reply = format!("*{:03}VALL ", box_id);
            for (channel, value) in (1..).zip(values) {
                if value.is_finite() {
                    reply.push_str(&format!("C{:02}{:+08.3}", channel, value));
                }
            }
            reply.push(char::from(REPLY_TERMINATOR));
            reply
        }
    }
}

/// Transport end of a [`MockBus`].
#[derive(Debug)]
pub struct MockTransport {
    port_name: String,
    bus: MockBus,
    open: bool,
    pending: Vec<u8>,
}

impl MockTransport {
    /// Control handle of the bus behind this transport.
    pub fn bus(&self) -> &MockBus {
        &self.bus
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn port_name(&self) -> &str {
        &self.port_name
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn open(&mut self) -> Result<(), TransportError> {
        if self.open {
            return Err(TransportError::AlreadyOpen);
        }
        let mut state = self.bus.state.lock();
        if state.fail_open {
            return Err(TransportError::PortUnavailable {
                port: self.port_name.clone(),
                reason: "simulated open failure".into(),
            });
        }
        state.opens += 1;
        self.open = true;
        Ok(())
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::NotOpen);
        }
        let command = String::from_utf8_lossy(bytes);
        if let Some(reply) = self.bus.handle_command(&command)? {
            trace!(port = %self.port_name, reply = %reply, "mock reply staged");
            self.pending.extend_from_slice(reply.as_bytes());
        }
        Ok(())
    }

    async fn read_until_or_timeout(&mut self, terminator: u8, timeout: Duration) -> Vec<u8> {
        if let Some(end) = self.pending.iter().position(|&b| b == terminator) {
            let rest = self.pending.split_off(end + 1);
            return std::mem::replace(&mut self.pending, rest);
        }
        // Silent box or partial reply: the terminator never comes.
        sleep(timeout).await;
        std::mem::take(&mut self.pending)
    }

    async fn discard_buffers(&mut self) {
        self.pending.clear();
    }

    async fn close(&mut self) {
        self.open = false;
        self.pending.clear();
    }
}
