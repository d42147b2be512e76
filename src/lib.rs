//! # Probe DAQ Core Library
//!
//! Acquisition engine for gauging stations built from multi-channel
//! signal-conditioning boxes sharing one serial line. Each box answers a poll
//! command with up to four channel readings; the engine polls every configured
//! box in turn, decodes the replies, and maps channel values onto named
//! measurement parameters.
//!
//! ## Crate Structure
//!
//! - **`transport`**: the [`Transport`](transport::Transport) trait, the
//!   serial implementation, process-wide port claims, and a simulated box bus.
//! - **`protocol`**: poll command formatting and the two reply dialects
//!   (fixed-offset columns and tagged `NN±value` groups).
//! - **`registry`**: parameter bindings from names to (box, channels) with
//!   classification limits.
//! - **`acquisition`**: the polling scheduler, in continuous or bounded mode,
//!   with cooperative cancellation.
//! - **`store`**: live cells and bounded sample buffers shared with readers.
//! - **`config`**: figment-based configuration loading and validation.
//! - **`logging`**: tracing subscriber setup.
//! - **`error`**: the `ProbeError` hierarchy.
//!
//! ## Example
//!
//! ```no_run
//! use probe_daq::acquisition::{Scheduler, SchedulerSettings};
//! use probe_daq::protocol::{BoxId, Dialect};
//! use probe_daq::registry::{ParameterBinding, ParameterRegistry};
//! use probe_daq::transport::SerialTransport;
//!
//! # async fn run() -> probe_daq::error::AppResult<()> {
//! let registry = ParameterRegistry::new(vec![
//!     ParameterBinding::new("bore", BoxId::new(1)?, 1).with_limits(-0.05, 0.05),
//! ])?;
//! let scheduler = Scheduler::new(registry, SchedulerSettings::new(Dialect::fixed_offset()));
//!
//! let mut session = scheduler
//!     .start_continuous(SerialTransport::new("/dev/ttyUSB0", 9600))
//!     .await?;
//! let live = scheduler.store().live_value("bore");
//! session.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod acquisition;
pub mod config;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod registry;
pub mod store;
pub mod transport;

pub use acquisition::{AcquisitionMode, Scheduler, SchedulerSettings, SessionHandle, SessionState};
pub use error::{AppResult, DecodeError, ProbeError, TransportError};
pub use protocol::{BoxId, ChannelValues, Dialect};
pub use registry::{ParameterBinding, ParameterRegistry};
pub use store::{BoundedProgress, Fault, LiveCell, ProbeStatus, SampleStore};
pub use transport::{SerialTransport, Transport};
