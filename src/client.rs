//! Toy link client facade
//!
//! [`ToyClient`] wires signaling, the session manager, the supervisor and
//! the event bus together. It is cheap to clone; clones share one session.
//!
//! A background driver task consumes [`SupervisorCommand`]s. It only holds a
//! weak reference to the client, so dropping every [`ToyClient`] handle ends
//! it.

use std::sync::{Arc, Weak};

use tokio::sync::{Mutex, broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::config::ClientConfig;
use crate::control::ControlMessage;
use crate::events::{ClientEvent, EventBus};
use crate::peer::{self, ConnectionState, SessionContext, SessionManager};
use crate::signaling::{SessionInfo, SignalingClient};
use crate::supervisor::{Supervisor, SupervisorCommand};
use crate::voice::{CaptureConstraints, CpalDevices, MediaDevices};
use crate::{Error, Result};

struct ClientShared {
    config: ClientConfig,
    signaling: SignalingClient,
    ctx: SessionContext,
    manager: Mutex<SessionManager>,
}

/// Builder for [`ToyClient`]
pub struct ToyClientBuilder {
    config: ClientConfig,
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    http_client: Option<reqwest::Client>,
}

impl ToyClientBuilder {
    /// Use these media devices instead of the host's
    #[must_use]
    pub fn devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = devices;
        self
    }

    /// Capture processing to apply to the microphone
    #[must_use]
    pub const fn constraints(mut self, constraints: CaptureConstraints) -> Self {
        self.constraints = constraints;
        self
    }

    /// HTTP client for signaling requests
    #[must_use]
    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    /// Build the client and start its driver task
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn build(self) -> Result<ToyClient> {
        self.config.validate()?;

        let events = EventBus::new();
        let (supervisor, commands) = Supervisor::new(&self.config, events.clone());
        let ctx = SessionContext::new(events, supervisor);

        let mut signaling = SignalingClient::new(&self.config.gateway_url);
        if let Some(client) = self.http_client {
            signaling = signaling.with_http_client(client);
        }

        let manager = SessionManager::new(
            self.config.clone(),
            self.devices,
            self.constraints,
            ctx.clone(),
        );

        let shared = Arc::new(ClientShared {
            config: self.config,
            signaling,
            ctx,
            manager: Mutex::new(manager),
        });

        tokio::spawn(run_driver(Arc::downgrade(&shared), commands));

        tracing::debug!(
            gateway = %shared.config.gateway_url,
            device_id = %shared.config.device_id,
            toy_id = %shared.config.toy_id,
            "toy client created"
        );

        Ok(ToyClient { shared })
    }
}

/// Device-side voice client for one toy
#[derive(Clone)]
pub struct ToyClient {
    shared: Arc<ClientShared>,
}

impl ToyClient {
    /// Create a client using the host's audio devices
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    /// Start building a client
    #[must_use]
    pub fn builder(config: ClientConfig) -> ToyClientBuilder {
        ToyClientBuilder {
            config,
            devices: Arc::new(CpalDevices),
            constraints: CaptureConstraints::default(),
            http_client: None,
        }
    }

    /// Client configuration
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.shared.config
    }

    /// Establish a session with the gateway
    ///
    /// Replaces any existing session and resets the reconnect counter.
    /// Returns once the answer has been accepted; [`ClientEvent::Connected`]
    /// follows when the transport comes up.
    ///
    /// # Errors
    ///
    /// - `Error::Signaling` if the gateway rejects a request (a reconnect is
    ///   scheduled)
    /// - `Error::MediaAcquisition` if the microphone is unavailable (no
    ///   reconnect)
    /// - `Error::Transport` / `Error::WebRtc` if negotiation fails (a
    ///   reconnect is scheduled)
    /// - `Error::Cancelled` if `disconnect` was called meanwhile
    pub async fn connect(&self) -> Result<SessionInfo> {
        let generation = self.shared.ctx.supervisor.begin();
        self.shared.establish(generation).await
    }

    /// Tear down the session and stop reconnecting
    ///
    /// Safe to call repeatedly; once closed, further calls do nothing.
    pub async fn disconnect(&self) {
        self.shared.ctx.supervisor.stop();

        let mut manager = self.shared.manager.lock().await;
        let had_session = manager.teardown(ConnectionState::Closed).await;
        let changed = self.shared.ctx.force_state(ConnectionState::Closed);
        drop(manager);

        if had_session || changed {
            tracing::info!("disconnected");
            self.shared.ctx.events.emit(ClientEvent::Disconnected);
        }
    }

    /// Mute or unmute the outgoing audio
    ///
    /// Emits [`ClientEvent::MuteStateChanged`] only when the state changes.
    /// Returns the resulting mute state.
    pub fn set_muted(&self, muted: bool) -> bool {
        if self.shared.ctx.mute.set(muted) {
            tracing::info!(muted, "mute state changed");
            self.shared
                .ctx
                .events
                .emit(ClientEvent::MuteStateChanged { muted });
        }
        muted
    }

    /// Flip the mute state and return the new one
    pub fn toggle_mute(&self) -> bool {
        self.set_muted(!self.is_muted())
    }

    /// Whether outgoing audio is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.shared.ctx.mute.is_muted()
    }

    /// Ask the gateway to start recording
    ///
    /// Returns `false` (and emits nothing) if the control channel is not open.
    pub async fn start_recording(&self) -> bool {
        let sent = self
            .send_control_message(&ControlMessage::StartRecording)
            .await;
        if sent {
            self.shared.ctx.events.emit(ClientEvent::RecordingStarted);
        }
        sent
    }

    /// Ask the gateway to stop recording
    ///
    /// Returns `false` (and emits nothing) if the control channel is not open.
    pub async fn stop_recording(&self) -> bool {
        let sent = self
            .send_control_message(&ControlMessage::StopRecording)
            .await;
        if sent {
            self.shared.ctx.events.emit(ClientEvent::RecordingStopped);
        }
        sent
    }

    /// Send a control message if the channel is open
    ///
    /// Nothing is queued: messages sent while the channel is not open are
    /// dropped with a warning.
    pub async fn send_control_message(&self, message: &ControlMessage) -> bool {
        peer::send_on_active(&self.shared.ctx, message).await
    }

    /// Subscribe to client events
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.shared.ctx.events.subscribe()
    }

    /// Current connection state
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.ctx.state.get()
    }

    /// Watch connection state changes
    #[must_use]
    pub fn watch_state(&self) -> tokio::sync::watch::Receiver<ConnectionState> {
        self.shared.ctx.state.subscribe()
    }

    /// Identifiers of the active session
    #[must_use]
    pub fn session_info(&self) -> Option<SessionInfo> {
        self.shared.ctx.active().map(|a| a.info)
    }

    /// Reconnect attempts since the last successful connection
    #[must_use]
    pub fn reconnect_attempts(&self) -> u32 {
        self.shared.ctx.supervisor.attempts()
    }

    /// Whether the control channel can carry messages
    #[must_use]
    pub fn is_data_channel_open(&self) -> bool {
        self.shared
            .ctx
            .active()
            .is_some_and(|a| a.control.is_open())
    }

    /// Local and remote media endpoints still live
    pub async fn live_media(&self) -> usize {
        self.shared.manager.lock().await.live_media()
    }
}

impl std::fmt::Debug for ToyClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToyClient")
            .field("gateway_url", &self.shared.config.gateway_url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ClientShared {
    /// Run one session attempt for `generation`
    async fn establish(&self, generation: u64) -> Result<SessionInfo> {
        let cancel = self.ctx.supervisor.token();
        if !self.ctx.supervisor.is_current(generation) {
            return Err(Error::Cancelled);
        }

        let mut manager = tokio::select! {
            () = cancel.cancelled() => return Err(Error::Cancelled),
            manager = self.manager.lock() => manager,
        };

        let attempt = self.ctx.supervisor.attempts();
        tracing::info!(generation, attempt, "establishing session");

        manager.teardown(ConnectionState::Closed).await;

        let created = match cancellable(
            &cancel,
            self.signaling.create_session(
                &self.config.device_id,
                &self.config.toy_id,
                self.config.user_id.as_deref(),
            ),
        )
        .await
        {
            Ok(created) => created,
            Err(e) => return Err(self.fail(&mut manager, e).await),
        };

        tracing::info!(
            session_id = %created.info.session_id,
            thread_id = %created.info.thread_id,
            "session created"
        );

        let answer = match cancellable(&cancel, manager.attach(&created)).await {
            Ok(answer) => answer,
            Err(e) => return Err(self.fail(&mut manager, e).await),
        };

        if let Err(e) = cancellable(
            &cancel,
            self.signaling
                .submit_answer(&created.info.session_id, &answer),
        )
        .await
        {
            return Err(self.fail(&mut manager, e).await);
        }

        tracing::info!(session_id = %created.info.session_id, "answer submitted");
        Ok(created.info)
    }

    /// Release a failed attempt, report it and schedule a retry if warranted
    async fn fail(&self, manager: &mut SessionManager, error: Error) -> Error {
        if matches!(error, Error::Cancelled) {
            tracing::debug!("connection attempt cancelled");
            manager.teardown(ConnectionState::Closed).await;
            return error;
        }

        tracing::warn!(error = %error, kind = ?error.kind(), "connection attempt failed");
        self.ctx.events.emit_error(&error);

        if error.triggers_reconnect() {
            manager.teardown(ConnectionState::Failed).await;
            self.ctx.force_state(ConnectionState::Failed);
            self.ctx.supervisor.on_failure();
        } else {
            manager.teardown(ConnectionState::Closed).await;
            self.ctx.force_state(ConnectionState::Closed);
        }
        error
    }
}

async fn cancellable<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

async fn run_driver(
    shared: Weak<ClientShared>,
    mut commands: mpsc::UnboundedReceiver<SupervisorCommand>,
) {
    while let Some(command) = commands.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };

        match command {
            SupervisorCommand::Reconnect { generation } => {
                shared.ctx.supervisor.clear_pending();
                if !shared.ctx.supervisor.is_current(generation) {
                    tracing::debug!(generation, "stale reconnect ignored");
                    continue;
                }
                tracing::info!(
                    attempt = shared.ctx.supervisor.attempts(),
                    "reconnecting"
                );
                // Failures are reported and rescheduled inside `establish`
                let _ = shared.establish(generation).await;
            }
            SupervisorCommand::GiveUp { generation } => {
                if !shared.ctx.supervisor.is_current(generation) {
                    continue;
                }
                let mut manager = shared.manager.lock().await;
                manager.teardown(ConnectionState::Failed).await;
                drop(manager);
                shared.ctx.force_state(ConnectionState::Failed);
            }
        }
    }

    tracing::debug!("client driver stopped");
}
