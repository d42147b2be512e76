//! Per-box polling and dispatch of decoded values to the sample store.

use super::AcquisitionMode;
use crate::error::{AppResult, DecodeError, ProbeError, TransportError};
use crate::protocol::{poll_command, BoxId, ChannelValues, Dialect, Reading, REPLY_TERMINATOR};
use crate::registry::ParameterBinding;
use crate::store::{Fault, LiveCell, SampleStore};
use crate::transport::Transport;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

/// Outcome of polling one box for one tick.
#[derive(Debug)]
pub enum BoxPoll {
    /// A reply arrived (or the read timed out) and was decoded into one
    /// reading per channel
    Reply(Result<Vec<Reading>, DecodeError>),
    /// The poll command could not be written
    WriteFailed(TransportError),
    /// Cancellation was requested before or during the read
    Cancelled,
}

/// Resolves once cancellation is requested or the controlling handle is gone.
pub(crate) async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    // An Err means the sender was dropped, which also ends the session.
    let _ = cancel.wait_for(|flag| *flag).await;
}

/// Non-blocking check of the cancellation flag.
pub(crate) fn is_cancelled(cancel: &watch::Receiver<bool>) -> bool {
    *cancel.borrow() || cancel.has_changed().is_err()
}

/// Decode raw reply bytes, ignoring line terminators and the trailing `#`.
pub(crate) fn decode_raw(dialect: &Dialect, raw: &[u8]) -> Result<ChannelValues, DecodeError> {
    let reply = String::from_utf8_lossy(raw);
    let reply = reply
        .trim_start_matches(['\r', '\n'])
        .trim_end_matches(['#', '\r', '\n']);
    dialect.decode_checked(reply)
}

/// Send one poll command and collect the decoded reply.
pub(crate) async fn poll_box<T: Transport + ?Sized>(
    transport: &mut T,
    dialect: &Dialect,
    box_id: BoxId,
    tick: u64,
    timeout: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> BoxPoll {
    transport.discard_buffers().await;

    let command = poll_command(box_id);
    if let Err(e) = transport.write(command.as_bytes()).await {
        warn!(box_id = %box_id, error = %e, "poll command failed");
        return BoxPoll::WriteFailed(e);
    }

    let raw = tokio::select! {
        biased;
        _ = cancelled(cancel) => return BoxPoll::Cancelled,
        raw = transport.read_until_or_timeout(REPLY_TERMINATOR, timeout) => raw,
    };
    if is_cancelled(cancel) {
        return BoxPoll::Cancelled;
    }

    trace!(box_id = %box_id, reply = %String::from_utf8_lossy(&raw).escape_default(), "box reply");
    let decoded = decode_raw(dialect, &raw);
    if let Err(e) = &decoded {
        debug!(box_id = %box_id, tick, error = %e, bytes = raw.len(), "reply not decodable");
    }
    BoxPoll::Reply(decoded.map(|values| values.readings(tick)))
}

/// Readings of every channel bound to `binding`, in binding order, or the
/// reason there are none.
///
/// A channel outside 1..=4 is reported before anything about the reply, so a
/// misconfigured binding reads as a configuration fault even while the box is
/// offline.
pub(crate) fn resolve(binding: &ParameterBinding, poll: &BoxPoll) -> Result<Vec<Reading>, Fault> {
    if let Some(channel) = binding.invalid_channels().next() {
        return Err(Fault::ChannelConfig { channel });
    }

    let readings = match poll {
        BoxPoll::Reply(Ok(readings)) => readings,
        BoxPoll::Reply(Err(_)) => return Err(Fault::Decode),
        BoxPoll::WriteFailed(_) => return Err(Fault::Transport),
        BoxPoll::Cancelled => return Err(Fault::Transport),
    };

    let mut resolved = Vec::with_capacity(binding.channels.len());
    for &channel in &binding.channels {
        match readings.iter().find(|r| r.channel == channel) {
            Some(reading) if reading.is_valid() => resolved.push(*reading),
            Some(_) => return Err(Fault::Decode),
            None => return Err(Fault::ChannelConfig { channel }),
        }
    }
    Ok(resolved)
}

/// Hand one box's outcome to every parameter bound to it.
///
/// `tick` stamps faults; measured cells carry the tick their readings were
/// captured in.
pub(crate) fn dispatch(
    store: &SampleStore,
    mode: AcquisitionMode,
    bindings: &[ParameterBinding],
    poll: &BoxPoll,
    tick: u64,
) {
    for binding in bindings {
        let resolved = resolve(binding, poll);
        match mode {
            AcquisitionMode::Continuous => {
                let cell = match resolved {
                    Ok(readings) => {
                        let captured = readings.first().map_or(tick, |r| r.captured_at_tick);
                        LiveCell::measured(binding, values_of(&readings), captured)
                    }
                    Err(fault) => {
                        debug!(parameter = %binding.name, tick, %fault, "parameter unavailable");
                        LiveCell::failed(fault, tick)
                    }
                };
                store.update_live(&binding.name, cell);
            }
            AcquisitionMode::Bounded { .. } => match resolved {
                Ok(readings) => {
                    let values = values_of(&readings);
                    let accepted = store.try_append(&binding.name, &values);
                    trace!(parameter = %binding.name, tick, ?values, accepted, "sample");
                }
                Err(fault) => {
                    debug!(parameter = %binding.name, tick, %fault, "sample skipped");
                }
            },
        }
    }
}

fn values_of(readings: &[Reading]) -> Vec<f64> {
    readings.iter().map(|r| r.value).collect()
}

/// Poll a single box once on an open transport.
///
/// Intended for diagnostics; unlike the polling loop, failures are returned
/// to the caller.
pub async fn poll_once<T: Transport + ?Sized>(
    transport: &mut T,
    dialect: &Dialect,
    box_id: BoxId,
    timeout: Duration,
) -> AppResult<ChannelValues> {
    transport.discard_buffers().await;
    transport.write(poll_command(box_id).as_bytes()).await?;
    let raw = transport
        .read_until_or_timeout(REPLY_TERMINATOR, timeout)
        .await;
    decode_raw(dialect, &raw).map_err(ProbeError::from)
}
