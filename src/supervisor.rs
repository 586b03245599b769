//! Connection supervision: heartbeat and bounded reconnection
//!
//! The supervisor owns no session resources. It decides *when* to retry and
//! asks the client driver to do it by sending a [`SupervisorCommand`] tagged
//! with the generation that scheduled it. Every explicit `connect` or
//! `disconnect` starts a new generation, so timers scheduled for an older one
//! are ignored when they fire.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control::{ControlChannel, ControlMessage};
use crate::events::{ClientEvent, EventBus};
use crate::peer::ConnectionState;

/// Work the supervisor hands to the client driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorCommand {
    /// Run a fresh session attempt
    Reconnect { generation: u64 },
    /// Reconnection budget is spent; release the failed session
    GiveUp { generation: u64 },
}

/// Linear reconnect backoff counter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectState {
    /// Attempts made since the last successful connection
    pub attempts: u32,
    /// Attempts allowed before giving up
    pub max_attempts: u32,
    /// Delay unit; attempt `n` waits `base_delay * n`
    pub base_delay: Duration,
}

impl ReconnectState {
    /// Create a counter with no attempts made
    #[must_use]
    pub const fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: 0,
            max_attempts,
            base_delay,
        }
    }

    /// Record a failure
    ///
    /// Returns the delay before the next attempt, or `None` once
    /// `max_attempts` retries have been made.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempts >= self.max_attempts {
            return None;
        }
        self.attempts += 1;
        Some(self.base_delay * self.attempts)
    }

    /// Forget previous failures
    pub const fn reset(&mut self) {
        self.attempts = 0;
    }

    /// Whether no attempts remain
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// What [`Supervisor::on_failure`] decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// A retry is scheduled after the given delay
    Retry { attempt: u32, delay: Duration },
    /// Budget exhausted; the terminal event was emitted
    GaveUp,
    /// A retry is already pending, or the client already gave up
    Ignored,
}

struct SupervisorState {
    reconnect: ReconnectState,
    generation: u64,
    token: CancellationToken,
    pending: Option<JoinHandle<()>>,
    gave_up: bool,
    last_pong: Option<Instant>,
}

struct SupervisorInner {
    state: Mutex<SupervisorState>,
    commands: mpsc::UnboundedSender<SupervisorCommand>,
    events: EventBus,
    heartbeat_interval: Duration,
}

/// Reconnect scheduler and heartbeat source (cheap to clone)
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Create a supervisor and the command stream the client driver consumes
    #[must_use]
    pub fn new(
        config: &ClientConfig,
        events: EventBus,
    ) -> (Self, mpsc::UnboundedReceiver<SupervisorCommand>) {
        let (commands, rx) = mpsc::unbounded_channel();
        let state = SupervisorState {
            reconnect: ReconnectState::new(
                config.max_reconnect_attempts,
                config.reconnect_base_delay,
            ),
            generation: 0,
            token: CancellationToken::new(),
            pending: None,
            gave_up: false,
            last_pong: None,
        };

        let supervisor = Self {
            inner: Arc::new(SupervisorInner {
                state: Mutex::new(state),
                commands,
                events,
                heartbeat_interval: config.heartbeat_interval,
            }),
        };
        (supervisor, rx)
    }

    fn lock(&self) -> MutexGuard<'_, SupervisorState> {
        // State stays consistent even if a holder panicked
        self.inner
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Start a new generation for an explicit `connect`
    ///
    /// Cancels pending timers and any in-flight attempt and resets the
    /// attempt counter. Returns the new generation.
    pub fn begin(&self) -> u64 {
        let mut state = self.lock();
        Self::advance(&mut state);
        state.reconnect.reset();
        state.gave_up = false;
        state.last_pong = None;
        tracing::debug!(generation = state.generation, "supervisor generation started");
        state.generation
    }

    /// Start a new generation for an explicit `disconnect`
    ///
    /// Cancels pending timers and any in-flight attempt; nothing is retried
    /// until the next [`Supervisor::begin`].
    pub fn stop(&self) {
        let mut state = self.lock();
        Self::advance(&mut state);
        state.gave_up = true;
        tracing::debug!(generation = state.generation, "supervisor stopped");
    }

    fn advance(state: &mut SupervisorState) {
        state.generation += 1;
        state.token.cancel();
        state.token = CancellationToken::new();
        if let Some(pending) = state.pending.take() {
            pending.abort();
        }
    }

    /// Whether `generation` is still the current one
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.lock().generation == generation
    }

    /// Token cancelled when the current generation ends
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.lock().token.clone()
    }

    /// Attempts made since the last successful connection
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.lock().reconnect.attempts
    }

    /// Record a successful connection
    pub fn on_connected(&self) {
        let mut state = self.lock();
        if state.reconnect.attempts > 0 {
            tracing::info!(
                attempts = state.reconnect.attempts,
                "connection recovered, reconnect counter reset"
            );
        }
        state.reconnect.reset();
        state.gave_up = false;
    }

    /// Record a failure that warrants reconnection
    pub fn on_failure(&self) -> FailureOutcome {
        let mut state = self.lock();

        if state.gave_up || state.pending.is_some() {
            return FailureOutcome::Ignored;
        }

        let generation = state.generation;
        let Some(delay) = state.reconnect.next_delay() else {
            state.gave_up = true;
            let attempts = state.reconnect.attempts;
            drop(state);

            tracing::warn!(attempts, "max reconnect attempts reached, giving up");
            self.inner
                .events
                .emit(ClientEvent::MaxReconnectAttemptsReached { attempts });
            let _ = self
                .inner
                .commands
                .send(SupervisorCommand::GiveUp { generation });
            return FailureOutcome::GaveUp;
        };

        let attempt = state.reconnect.attempts;
        tracing::info!(
            attempt,
            max_attempts = state.reconnect.max_attempts,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "scheduling reconnect"
        );

        let commands = self.inner.commands.clone();
        state.pending = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = commands.send(SupervisorCommand::Reconnect { generation });
        }));

        FailureOutcome::Retry { attempt, delay }
    }

    /// Clear the pending timer once its command has been received
    pub fn clear_pending(&self) {
        self.lock().pending = None;
    }

    /// Record a heartbeat reply
    pub fn record_pong(&self) {
        self.lock().last_pong = Some(Instant::now());
        tracing::trace!("heartbeat acknowledged");
    }

    /// When the last heartbeat reply arrived
    #[must_use]
    pub fn last_pong(&self) -> Option<Instant> {
        self.lock().last_pong
    }

    /// Start sending `ping` on `control` while the connection is up
    ///
    /// The task ends when `cancel` fires, which the session does on teardown.
    pub fn start_heartbeat(
        &self,
        control: ControlChannel,
        state: watch::Receiver<ConnectionState>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = self.inner.heartbeat_interval;
        tokio::spawn(run_heartbeat(interval, state, cancel, move || {
            let control = control.clone();
            async move { control.send(&ControlMessage::Ping).await }
        }))
    }
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("Supervisor")
            .field("generation", &state.generation)
            .field("reconnect", &state.reconnect)
            .field("gave_up", &state.gave_up)
            .finish_non_exhaustive()
    }
}

/// Tick every `interval` and call `ping` whenever the state is connected
pub async fn run_heartbeat<F, Fut>(
    interval: Duration,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
    mut ping: F,
) where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if *state.borrow() != ConnectionState::Connected {
            tracing::trace!("skipping heartbeat while not connected");
            continue;
        }

        if !ping().await {
            tracing::debug!("heartbeat ping not delivered");
        }
    }

    tracing::trace!("heartbeat stopped");
}
