use super::poll::{cancelled, dispatch, is_cancelled, poll_box, BoxPoll};
use super::{AcquisitionMode, SchedulerSettings, SessionState};
use crate::error::{AppResult, ProbeError, TransportError};
use crate::protocol::BoxId;
use crate::registry::ParameterRegistry;
use crate::store::{BoundedProgress, SampleStore};
use crate::transport::claims::{self, PortClaim};
use crate::transport::Transport;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Owns the registry and store and starts polling sessions over a transport.
///
/// At most one session runs per scheduler; a port name can only be driven by
/// one session across the process.
pub struct Scheduler {
    registry: Arc<ParameterRegistry>,
    store: Arc<SampleStore>,
    settings: SchedulerSettings,
    state: Arc<watch::Sender<SessionState>>,
}

impl Scheduler {
    /// Create a scheduler with an empty store for every registered parameter.
    pub fn new(registry: ParameterRegistry, settings: SchedulerSettings) -> Self {
        let store = Arc::new(SampleStore::new(&registry));
        let (state, _rx) = watch::channel(SessionState::Idle);
        Self {
            registry: Arc::new(registry),
            store,
            settings,
            state: Arc::new(state),
        }
    }

    /// Shared sample store.
    pub fn store(&self) -> Arc<SampleStore> {
        Arc::clone(&self.store)
    }

    /// Registered parameter bindings.
    pub fn registry(&self) -> &ParameterRegistry {
        &self.registry
    }

    /// Timing and dialect used by new sessions.
    pub fn settings(&self) -> &SchedulerSettings {
        &self.settings
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Start a session that refreshes live cells every tick until stopped.
    pub async fn start_continuous<T>(&self, transport: T) -> AppResult<SessionHandle>
    where
        T: Transport + 'static,
    {
        self.start(transport, AcquisitionMode::Continuous).await
    }

    /// Start a session that collects `target` distinct samples per parameter.
    pub async fn start_bounded<T>(&self, transport: T, target: usize) -> AppResult<SessionHandle>
    where
        T: Transport + 'static,
    {
        self.start(transport, AcquisitionMode::Bounded { target })
            .await
    }

    async fn start<T>(&self, mut transport: T, mode: AcquisitionMode) -> AppResult<SessionHandle>
    where
        T: Transport + 'static,
    {
        if self.registry.is_empty() {
            return Err(ProbeError::Configuration(
                "no parameters registered".to_string(),
            ));
        }
        if mode == (AcquisitionMode::Bounded { target: 0 }) {
            return Err(ProbeError::Configuration(
                "bounded target must be at least 1".to_string(),
            ));
        }

        let mut previous = SessionState::Idle;
        let claimed = self.state.send_if_modified(|state| {
            if *state == SessionState::Running {
                return false;
            }
            previous = *state;
            *state = SessionState::Running;
            true
        });
        if !claimed {
            return Err(ProbeError::AlreadyRunning);
        }

        let claim = match acquire(&mut transport).await {
            Ok(claim) => claim,
            Err(e) => {
                self.state.send_replace(previous);
                return Err(e);
            }
        };

        let target = match mode {
            AcquisitionMode::Bounded { target } => target,
            AcquisitionMode::Continuous => 0,
        };
        self.store.reset_all(target);

        let port = claim.port().to_string();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (outcome, _rx) = watch::channel(SessionState::Running);
        let outcome = Arc::new(outcome);
        let ticks = Arc::new(AtomicU64::new(0));

        let session = Session {
            transport,
            registry: Arc::clone(&self.registry),
            store: Arc::clone(&self.store),
            settings: self.settings.clone(),
            mode,
            state: Arc::clone(&self.state),
            outcome: Arc::clone(&outcome),
            ticks: Arc::clone(&ticks),
            cancel: cancel_rx,
            claim: Some(claim),
        };
        info!(port = %port, ?mode, boxes = self.registry.all_boxes().len(), "starting acquisition");
        let task = tokio::spawn(session.run());

        Ok(SessionHandle {
            mode,
            port,
            cancel: cancel_tx,
            state: outcome,
            scheduler_state: Arc::clone(&self.state),
            ticks,
            task: Some(task),
            store: Arc::clone(&self.store),
        })
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("parameters", &self.registry.len())
            .field("settings", &self.settings)
            .field("state", &self.state())
            .finish()
    }
}

/// Claim the transport's port name and open it.
async fn acquire<T: Transport + ?Sized>(transport: &mut T) -> AppResult<PortClaim> {
    let claim = claims::claim(transport.port_name())?;
    match transport.open().await {
        Ok(()) => Ok(claim),
        Err(TransportError::AlreadyOpen) => {
            Err(ProbeError::Ownership(transport.port_name().to_string()))
        }
        Err(e) => Err(ProbeError::Transport(e)),
    }
}

/// State moved into the polling task.
struct Session<T> {
    transport: T,
    registry: Arc<ParameterRegistry>,
    store: Arc<SampleStore>,
    settings: SchedulerSettings,
    mode: AcquisitionMode,
    state: Arc<watch::Sender<SessionState>>,
    outcome: Arc<watch::Sender<SessionState>>,
    ticks: Arc<AtomicU64>,
    cancel: watch::Receiver<bool>,
    claim: Option<PortClaim>,
}

impl<T: Transport> Session<T> {
    async fn run(mut self) {
        let boxes: Vec<BoxId> = self.registry.all_boxes().into_iter().collect();
        let outcome = self.poll_loop(&boxes).await;

        // The port is free before anyone can observe the session as finished,
        // and the scheduler is idle before the handle sees its own outcome.
        self.transport.close().await;
        drop(self.claim.take());
        self.state.send_replace(outcome);
        self.outcome.send_replace(outcome);
        info!(
            port = %self.transport.port_name(),
            ticks = self.ticks.load(Ordering::SeqCst),
            ?outcome,
            "acquisition finished"
        );
    }

    async fn poll_loop(&mut self, boxes: &[BoxId]) -> SessionState {
        loop {
            if is_cancelled(&self.cancel) {
                return SessionState::Stopped;
            }
            let tick = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;

            for &box_id in boxes {
                if is_cancelled(&self.cancel) {
                    return SessionState::Stopped;
                }
                let poll = poll_box(
                    &mut self.transport,
                    &self.settings.dialect,
                    box_id,
                    tick,
                    self.settings.box_timeout,
                    &mut self.cancel,
                )
                .await;
                if matches!(poll, BoxPoll::Cancelled) {
                    debug!(box_id = %box_id, tick, "poll abandoned");
                    return SessionState::Stopped;
                }
                dispatch(
                    &self.store,
                    self.mode,
                    self.registry.bindings_for_box(box_id),
                    &poll,
                    tick,
                );
            }

            if matches!(self.mode, AcquisitionMode::Bounded { .. }) && self.store.is_complete() {
                debug!(tick, "every buffer reached its target");
                return SessionState::Completed;
            }

            if is_cancelled(&self.cancel) {
                return SessionState::Stopped;
            }
            tokio::select! {
                biased;
                _ = cancelled(&mut self.cancel) => return SessionState::Stopped,
                _ = tokio::time::sleep(self.settings.inter_tick_delay) => {}
            }
        }
    }
}

/// Control handle for a running session.
///
/// Dropping the handle requests cancellation; the task then closes the
/// transport and releases the port on its own. The handle tracks only its own
/// session, so it keeps reporting that session's outcome after the scheduler
/// has moved on to a new one.
pub struct SessionHandle {
    mode: AcquisitionMode,
    port: String,
    cancel: watch::Sender<bool>,
    state: Arc<watch::Sender<SessionState>>,
    scheduler_state: Arc<watch::Sender<SessionState>>,
    ticks: Arc<AtomicU64>,
    task: Option<JoinHandle<()>>,
    store: Arc<SampleStore>,
}

impl SessionHandle {
    /// Request cancellation and wait for the polling task to exit.
    ///
    /// Safe to call more than once, and after the session has completed.
    pub async fn stop(&mut self) -> SessionState {
        self.cancel.send_replace(true);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(port = %self.port, error = %e, "acquisition task ended abnormally");
                self.scheduler_state.send_replace(SessionState::Stopped);
                self.state.send_replace(SessionState::Stopped);
            }
        }
        self.state()
    }

    /// State of this session: `Running` until its task exits, then the outcome.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Receiver notified on every state transition.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Ticks started so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// Mode the session was started in.
    pub fn mode(&self) -> AcquisitionMode {
        self.mode
    }

    /// Port name owned by the session.
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Store the session writes into.
    pub fn store(&self) -> Arc<SampleStore> {
        Arc::clone(&self.store)
    }

    /// Accepted counts per parameter.
    pub fn progress(&self) -> BoundedProgress {
        self.store.progress()
    }

    /// Whether a bounded session has filled every buffer.
    pub fn is_complete(&self) -> bool {
        matches!(self.mode, AcquisitionMode::Bounded { .. }) && self.store.is_complete()
    }

    /// Wait until the polling task has exited.
    pub async fn wait_finished(&self) -> SessionState {
        let mut rx = self.state.subscribe();
        rx.wait_for(|state| state.is_finished())
            .await
            .map(|state| *state)
            .unwrap_or(SessionState::Stopped)
    }

    /// Wait up to `limit` for a bounded session to complete.
    ///
    /// Returns the final progress on completion, or the partial progress if
    /// the session stopped or the limit expired. The session keeps running
    /// after a timeout; call [`stop`](Self::stop) to end it.
    pub async fn wait_complete_timeout(
        &self,
        limit: Duration,
    ) -> Result<BoundedProgress, BoundedProgress> {
        match tokio::time::timeout(limit, self.wait_finished()).await {
            Ok(SessionState::Completed) => Ok(self.progress()),
            Ok(_) => Err(self.progress()),
            Err(_) => {
                let progress = self.progress();
                debug!(
                    port = %self.port,
                    pending = ?progress.pending().collect::<Vec<_>>(),
                    "bounded acquisition still incomplete"
                );
                Err(progress)
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.send_replace(true);
    }
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("mode", &self.mode)
            .field("port", &self.port)
            .field("state", &self.state())
            .field("ticks", &self.ticks())
            .finish()
    }
}
