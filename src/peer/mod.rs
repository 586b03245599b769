//! Peer session management
//!
//! A [`SessionManager`] owns at most one peer connection at a time together
//! with everything bound to it: the local microphone track, the remote
//! playback binding, the control channel and the per-session tasks.
//!
//! ```text
//!   mic ──frames──▶ uplink task ──PCMU──▶ local track ──RTP──▶ gateway
//!                                                               │
//!   speaker ◀── downlink reader ◀──PCMU── remote track ◀──RTP───┘
//!
//!   webrtc callbacks ──PeerEvent──▶ session event loop ──ClientEvent──▶ bus
//! ```
//!
//! WebRTC callbacks only forward [`PeerEvent`]s into a channel. The event
//! loop holds clones of the bus, the state cell and the supervisor; it never
//! holds the manager, so session resources are released only by
//! [`SessionManager::teardown`].

mod state;

use std::collections::HashSet;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::api::{API, APIBuilder};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::{
    RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType,
};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_remote::TrackRemote;

pub use state::{ConnectionState, StateCell};

use crate::config::ClientConfig;
use crate::control::{self, CONTROL_CHANNEL_LABEL, ControlChannel, ControlMessage, Inbound};
use crate::events::{ClientEvent, EventBus};
use crate::signaling::{CreatedSession, SessionDescription, SessionInfo};
use crate::supervisor::Supervisor;
use crate::voice::{
    CaptureConstraints, DownlinkProcessor, FarEndLevel, MediaDevices, MediaTrack, MuteGate,
    PCMU_PAYLOAD_TYPE, PlaybackSink, SAMPLE_RATE, UplinkProcessor, WIRE_SAMPLE_RATE,
};
use crate::{Error, Result};

/// Duration of one audio frame on the wire
pub const FRAME_DURATION: Duration = Duration::from_millis(20);

/// Capture frames buffered between the device thread and the uplink task
const FRAME_QUEUE: usize = 16;

/// Codec capability of the outgoing audio track
#[must_use]
pub fn pcmu_capability() -> RTCRtpCodecCapability {
    RTCRtpCodecCapability {
        mime_type: MIME_TYPE_PCMU.to_owned(),
        clock_rate: WIRE_SAMPLE_RATE,
        channels: 1,
        ..Default::default()
    }
}

/// Build a WebRTC API that negotiates PCMU audio only
///
/// # Errors
///
/// Returns error if the codec or interceptors cannot be registered
pub fn build_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine.register_codec(
        RTCRtpCodecParameters {
            capability: pcmu_capability(),
            payload_type: PCMU_PAYLOAD_TYPE,
            ..Default::default()
        },
        RTPCodecType::Audio,
    )?;

    let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Peer connection configuration for the given ICE server URLs
#[must_use]
pub fn rtc_configuration(ice_servers: &[String]) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: ice_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

/// Session published for lock-free queries
#[derive(Debug, Clone)]
pub struct ActiveSession {
    /// Gateway-issued identifiers
    pub info: SessionInfo,
    /// Control channel of this session
    pub control: ControlChannel,
}

/// Shared handles a session reports through
#[derive(Debug, Clone)]
pub struct SessionContext {
    /// Event fan-out
    pub events: EventBus,
    /// Connection state
    pub state: StateCell,
    /// Reconnect and heartbeat scheduling
    pub supervisor: Supervisor,
    /// Outgoing mute gate
    pub mute: MuteGate,
    /// Currently active session, if any
    pub active: Arc<RwLock<Option<ActiveSession>>>,
}

impl SessionContext {
    /// Create a context with no active session
    #[must_use]
    pub fn new(events: EventBus, supervisor: Supervisor) -> Self {
        Self {
            events,
            state: StateCell::new(),
            supervisor,
            mute: MuteGate::default(),
            active: Arc::new(RwLock::new(None)),
        }
    }

    /// Apply a state transition and announce it
    pub fn transition(&self, next: ConnectionState) -> bool {
        let changed = self.state.transition(next);
        if changed {
            self.events
                .emit(ClientEvent::ConnectionStateChange { state: next });
        }
        changed
    }

    /// Set the state at a session boundary and announce it
    pub fn force_state(&self, next: ConnectionState) -> bool {
        let changed = self.state.force(next);
        if changed {
            tracing::debug!(state = %next, "connection state set");
            self.events
                .emit(ClientEvent::ConnectionStateChange { state: next });
        }
        changed
    }

    /// Snapshot of the active session
    #[must_use]
    pub fn active(&self) -> Option<ActiveSession> {
        self.active.read().ok().and_then(|a| a.clone())
    }

    fn publish(&self, session: Option<ActiveSession>) {
        if let Ok(mut active) = self.active.write() {
            *active = session;
        }
    }
}

/// Signals forwarded from WebRTC callbacks to the session event loop
enum PeerEvent {
    StateChanged(RTCPeerConnectionState),
    Track(Arc<TrackRemote>),
    RemoteChannel(Arc<RTCDataChannel>),
    ChannelOpen {
        channel: Weak<RTCDataChannel>,
        label: String,
    },
    ChannelMessage(String),
    ChannelBinary(usize),
    ChannelClosed(String),
}

/// Microphone source and the track it feeds
struct LocalAudioBinding {
    source: Option<Box<dyn MediaTrack>>,
    track: Arc<TrackLocalStaticSample>,
}

/// Playback sink for one remote stream and the readers feeding it
struct RemoteAudioBinding {
    stream_id: String,
    sink: Arc<dyn PlaybackSink>,
    readers: Vec<JoinHandle<()>>,
}

impl RemoteAudioBinding {
    fn stop(self) {
        for reader in self.readers {
            reader.abort();
        }
        self.sink.stop();
    }
}

type RemoteSlot = Arc<Mutex<Option<RemoteAudioBinding>>>;

struct PeerSession {
    epoch: u64,
    info: SessionInfo,
    pc: Arc<RTCPeerConnection>,
    local: LocalAudioBinding,
    remote: RemoteSlot,
    control: ControlChannel,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Owns the peer connection and its media for one session at a time
pub struct SessionManager {
    config: ClientConfig,
    devices: Arc<dyn MediaDevices>,
    constraints: CaptureConstraints,
    ctx: SessionContext,
    session: Option<PeerSession>,
    epoch: u64,
}

impl SessionManager {
    /// Create a manager with no session
    #[must_use]
    pub fn new(
        config: ClientConfig,
        devices: Arc<dyn MediaDevices>,
        constraints: CaptureConstraints,
        ctx: SessionContext,
    ) -> Self {
        Self {
            config,
            devices,
            constraints,
            ctx,
            session: None,
            epoch: 0,
        }
    }

    /// Identifiers of the attached session
    #[must_use]
    pub fn session_info(&self) -> Option<&SessionInfo> {
        self.session.as_ref().map(|s| &s.info)
    }

    /// Number of local and remote media endpoints still live
    #[must_use]
    pub fn live_media(&self) -> usize {
        let Some(session) = &self.session else {
            return 0;
        };
        let local = usize::from(
            session
                .local
                .source
                .as_ref()
                .is_some_and(|source| source.is_live()),
        );
        let remote = session
            .remote
            .lock()
            .ok()
            .and_then(|r| r.as_ref().map(|b| usize::from(b.sink.is_live())))
            .unwrap_or(0);
        local + remote
    }

    /// Bind local media to a new peer connection and answer the gateway offer
    ///
    /// Any existing session is torn down first. On success the returned
    /// answer carries all gathered ICE candidates (or those gathered before
    /// `gather_timeout`). On failure every resource acquired so far is
    /// released before returning.
    ///
    /// # Errors
    ///
    /// - `Error::MediaAcquisition` if the microphone cannot be opened; the
    ///   state does not advance to `connecting`
    /// - `Error::WebRtc` / `Error::Transport` if negotiation fails
    pub async fn attach(&mut self, created: &CreatedSession) -> Result<SessionDescription> {
        self.teardown(ConnectionState::Closed).await;

        self.epoch += 1;
        let epoch = self.epoch;
        self.ctx.force_state(ConnectionState::New);

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE);
        let devices = Arc::clone(&self.devices);
        let source = on_device_thread(move || devices.open_microphone(frame_tx)).await?;
        self.ctx.events.emit(ClientEvent::LocalAudio {
            sample_rate: SAMPLE_RATE,
            channels: 1,
        });

        let span = tracing::info_span!(
            "session",
            session_id = %created.info.session_id,
            epoch
        );
        match self
            .negotiate(epoch, created, source, frame_rx, span.clone())
            .instrument(span)
            .await
        {
            Ok(answer) => Ok(answer),
            Err(e) => {
                self.release().await;
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_lines)]
    async fn negotiate(
        &mut self,
        epoch: u64,
        created: &CreatedSession,
        source: Box<dyn MediaTrack>,
        frames: mpsc::Receiver<Vec<f32>>,
        span: tracing::Span,
    ) -> Result<SessionDescription> {
        let pc = match build_api() {
            Ok(api) => match api
                .new_peer_connection(rtc_configuration(&self.config.ice_servers))
                .await
            {
                Ok(pc) => Arc::new(pc),
                Err(e) => {
                    release_media(Some(source), None).await;
                    return Err(e.into());
                }
            },
            Err(e) => {
                release_media(Some(source), None).await;
                return Err(e);
            }
        };

        let track = Arc::new(TrackLocalStaticSample::new(
            pcmu_capability(),
            format!("mic_{}", uuid::Uuid::new_v4().as_simple()),
            format!("toy-link-{}", created.info.session_id),
        ));

        let cancel = CancellationToken::new();
        let channel = match pc
            .create_data_channel(
                CONTROL_CHANNEL_LABEL,
                Some(RTCDataChannelInit {
                    ordered: Some(true),
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(channel) => channel,
            Err(e) => {
                release_media(Some(source), None).await;
                let _ = pc.close().await;
                return Err(e.into());
            }
        };
        let control = ControlChannel::new(Arc::clone(&channel));

        // From here on the session owns every resource, so errors release
        // them through `release`
        self.session = Some(PeerSession {
            epoch,
            info: created.info.clone(),
            pc: Arc::clone(&pc),
            local: LocalAudioBinding {
                source: Some(source),
                track: Arc::clone(&track),
            },
            remote: Arc::new(Mutex::new(None)),
            control: control.clone(),
            cancel: cancel.clone(),
            tasks: Vec::new(),
        });

        let sender = pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        watch_peer(&pc, &event_tx);
        watch_channel(&channel, &event_tx);

        let offer = RTCSessionDescription::offer(created.offer.sdp.clone())
            .map_err(|e| Error::Transport(format!("invalid offer: {e}")))?;
        pc.set_remote_description(offer).await?;

        self.ctx.transition(ConnectionState::Connecting);

        let answer = pc.create_answer(None).await?;
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(answer).await?;

        if tokio::time::timeout(self.config.gather_timeout, gathered.recv())
            .await
            .is_err()
        {
            tracing::warn!(
                timeout_ms = u64::try_from(self.config.gather_timeout.as_millis())
                    .unwrap_or(u64::MAX),
                "ice gathering timed out, answering with partial candidates"
            );
        }

        let local = pc
            .local_description()
            .await
            .ok_or_else(|| Error::Transport("no local description after answer".to_string()))?;

        let far_end = FarEndLevel::default();
        let uplink = UplinkProcessor::new(
            self.constraints,
            far_end.clone(),
            self.ctx.mute.clone(),
            self.ctx.events.clone(),
        )?;

        let Some(session) = self.session.as_mut() else {
            return Err(Error::Transport("session released during negotiation".to_string()));
        };

        session
            .tasks
            .push(tokio::spawn(drain_rtcp(sender, cancel.child_token())));
        session.tasks.push(tokio::spawn(run_uplink(
            frames,
            uplink,
            track,
            cancel.child_token(),
        )));

        let event_loop = SessionLoop {
            ctx: self.ctx.clone(),
            info: created.info.clone(),
            control: control.clone(),
            remote: Arc::clone(&session.remote),
            devices: Arc::clone(&self.devices),
            far_end,
            event_tx,
            cancel: cancel.clone(),
            streams: HashSet::new(),
            channel_announced: false,
        };
        session
            .tasks
            .push(tokio::spawn(event_loop.run(event_rx).instrument(span)));

        self.ctx.publish(Some(ActiveSession {
            info: created.info.clone(),
            control,
        }));

        tracing::info!("answer ready");
        Ok(SessionDescription::answer(local.sdp))
    }

    /// Release the session after a failed attempt without announcing `closed`
    async fn release(&mut self) {
        if let Some(session) = self.session.take() {
            Self::shutdown(session).await;
        }
        self.ctx.publish(None);
    }

    /// Tear down the current session and move to `final_state`
    ///
    /// Stops local and remote media, closes the control channel, closes the
    /// peer connection and clears the session info, in that order. Returns
    /// `false` if there was no session.
    pub async fn teardown(&mut self, final_state: ConnectionState) -> bool {
        let Some(session) = self.session.take() else {
            return false;
        };

        let session_id = session.info.session_id.clone();
        let epoch = session.epoch;
        Self::shutdown(session).await;
        self.ctx.publish(None);
        self.ctx.force_state(final_state);

        tracing::info!(session_id = %session_id, epoch, state = %final_state, "session torn down");
        true
    }

    async fn shutdown(mut session: PeerSession) {
        session.cancel.cancel();

        let remote = session.remote.lock().ok().and_then(|mut r| r.take());
        release_media(session.local.source.take(), remote).await;
        tracing::debug!(track_id = session.local.track.id(), "local audio released");

        session.control.close().await;

        if let Err(e) = session.pc.close().await {
            tracing::debug!(error = %e, "peer connection close failed");
        }

        for task in std::mem::take(&mut session.tasks) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("epoch", &self.epoch)
            .field("session", &self.session_info())
            .finish_non_exhaustive()
    }
}

fn watch_peer(pc: &RTCPeerConnection, tx: &mpsc::UnboundedSender<PeerEvent>) {
    let state_tx = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |state| {
        let _ = state_tx.send(PeerEvent::StateChanged(state));
        Box::pin(async {})
    }));

    pc.on_ice_connection_state_change(Box::new(move |state| {
        tracing::debug!(ice_state = %state, "ice connection state changed");
        Box::pin(async {})
    }));

    let track_tx = tx.clone();
    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let _ = track_tx.send(PeerEvent::Track(track));
        Box::pin(async {})
    }));

    let channel_tx = tx.clone();
    pc.on_data_channel(Box::new(move |channel| {
        let _ = channel_tx.send(PeerEvent::RemoteChannel(channel));
        Box::pin(async {})
    }));
}

fn watch_channel(channel: &Arc<RTCDataChannel>, tx: &mpsc::UnboundedSender<PeerEvent>) {
    let open_tx = tx.clone();
    let opened = Arc::downgrade(channel);
    let open_label = channel.label().to_string();
    channel.on_open(Box::new(move || {
        let _ = open_tx.send(PeerEvent::ChannelOpen {
            channel: opened.clone(),
            label: open_label.clone(),
        });
        Box::pin(async {})
    }));

    let message_tx = tx.clone();
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        let event = match String::from_utf8(message.data.to_vec()) {
            Ok(text) => PeerEvent::ChannelMessage(text),
            Err(_) => PeerEvent::ChannelBinary(message.data.len()),
        };
        let _ = message_tx.send(event);
        Box::pin(async {})
    }));

    let label = channel.label().to_string();
    let close_tx = tx.clone();
    channel.on_close(Box::new(move || {
        let _ = close_tx.send(PeerEvent::ChannelClosed(label.clone()));
        Box::pin(async {})
    }));
}

/// Run a blocking device call off the async workers
///
/// Opening a cpal stream waits for its device thread to report back.
async fn on_device_thread<T, F>(open: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(open)
        .await
        .map_err(|e| Error::Audio(format!("device task failed: {e}")))?
}

/// Stop capture and playback; stopping joins the device threads
async fn release_media(source: Option<Box<dyn MediaTrack>>, remote: Option<RemoteAudioBinding>) {
    if source.is_none() && remote.is_none() {
        return;
    }
    let released = tokio::task::spawn_blocking(move || {
        if let Some(mut source) = source {
            source.stop();
        }
        if let Some(remote) = remote {
            remote.stop();
        }
    })
    .await;
    if let Err(e) = released {
        tracing::warn!(error = %e, "media release task failed");
    }
}

/// Encode capture frames and write them to the local track
async fn run_uplink(
    mut frames: mpsc::Receiver<Vec<f32>>,
    mut uplink: UplinkProcessor,
    track: Arc<TrackLocalStaticSample>,
    cancel: CancellationToken,
) {
    loop {
        let mut frame = tokio::select! {
            () = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let data = match uplink.process(&mut frame) {
            Ok(payload) => Bytes::copy_from_slice(payload),
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode capture frame");
                continue;
            }
        };

        let sample = Sample {
            data,
            duration: FRAME_DURATION,
            ..Default::default()
        };
        if let Err(e) = track.write_sample(&sample).await {
            tracing::trace!(error = %e, "sample write failed");
        }
    }

    tracing::debug!("uplink stopped");
}

/// Read RTCP so interceptors keep running
async fn drain_rtcp(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    let mut buf = vec![0u8; 1500];
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            result = sender.read(&mut buf) => {
                if result.is_err() {
                    break;
                }
            }
        }
    }
}

/// Decode RTP from a remote track into the downlink pipeline
async fn read_remote_track(
    track: Arc<TrackRemote>,
    mut downlink: DownlinkProcessor,
    cancel: CancellationToken,
) {
    let track_id = track.id();
    loop {
        let packet = tokio::select! {
            () = cancel.cancelled() => break,
            result = track.read_rtp() => match result {
                Ok((packet, _attributes)) => packet,
                Err(e) => {
                    tracing::debug!(track_id = %track_id, error = %e, "remote track ended");
                    break;
                }
            },
        };

        if packet.payload.is_empty() {
            continue;
        }
        if let Err(e) = downlink.process(&packet.payload) {
            tracing::warn!(track_id = %track_id, error = %e, "audio decode error");
        }
    }
}

/// Per-session reactor for WebRTC callbacks
struct SessionLoop {
    ctx: SessionContext,
    info: SessionInfo,
    control: ControlChannel,
    remote: RemoteSlot,
    devices: Arc<dyn MediaDevices>,
    far_end: FarEndLevel,
    event_tx: mpsc::UnboundedSender<PeerEvent>,
    cancel: CancellationToken,
    streams: HashSet<String>,
    channel_announced: bool,
}

impl SessionLoop {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<PeerEvent>) {
        loop {
            let event = tokio::select! {
                () = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                PeerEvent::StateChanged(state) => self.on_state(state),
                PeerEvent::Track(track) => self.on_track(track).await,
                PeerEvent::RemoteChannel(channel) => self.on_remote_channel(&channel),
                PeerEvent::ChannelOpen { channel, label } => {
                    self.on_channel_open(&channel, &label);
                }
                PeerEvent::ChannelMessage(text) => self.on_message(&text).await,
                PeerEvent::ChannelBinary(len) => {
                    tracing::debug!(len, "binary control message dropped");
                }
                PeerEvent::ChannelClosed(label) => {
                    tracing::debug!(label = %label, "data channel closed");
                }
            }
        }
    }

    fn on_state(&self, state: RTCPeerConnectionState) {
        let next = ConnectionState::from(state);
        match next {
            ConnectionState::Connected => {
                if self.ctx.transition(next) {
                    tracing::info!("peer connected");
                    self.ctx.supervisor.on_connected();
                    self.ctx.events.emit(ClientEvent::Connected {
                        session: self.info.clone(),
                    });
                }
            }
            ConnectionState::Failed => {
                if self.ctx.transition(next) {
                    let error = Error::Transport("peer connection failed".to_string());
                    tracing::warn!(error = %error, "peer connection failed");
                    self.ctx.events.emit_error(&error);
                    self.ctx.supervisor.on_failure();
                }
            }
            ConnectionState::Disconnected => {
                if self.ctx.transition(next) {
                    tracing::warn!("peer disconnected, waiting for recovery");
                }
            }
            // `connecting` is entered when the offer is applied; `closed`
            // only through teardown
            ConnectionState::New | ConnectionState::Connecting | ConnectionState::Closed => {
                tracing::trace!(state = %next, "peer state not applied");
            }
        }
    }

    async fn on_track(&mut self, track: Arc<TrackRemote>) {
        if track.kind() != RTPCodecType::Audio {
            tracing::debug!(kind = %track.kind(), "ignoring non-audio track");
            return;
        }

        let codec = track.codec();
        if !codec
            .capability
            .mime_type
            .eq_ignore_ascii_case(MIME_TYPE_PCMU)
        {
            tracing::warn!(
                mime_type = %codec.capability.mime_type,
                "unsupported remote audio codec, track ignored"
            );
            return;
        }

        let stream_id = track.stream_id();
        let track_id = track.id();

        let bound = match self.remote.lock() {
            Ok(remote) => remote.as_ref().map(|binding| binding.stream_id.clone()),
            Err(_) => return,
        };

        if bound.as_deref() != Some(stream_id.as_str()) {
            let devices = Arc::clone(&self.devices);
            let sink = match on_device_thread(move || devices.open_speaker()).await {
                Ok(sink) => sink,
                Err(e) => {
                    tracing::warn!(error = %e, "failed to open playback device");
                    self.ctx.events.emit_error(&e);
                    return;
                }
            };
            let binding = RemoteAudioBinding {
                stream_id: stream_id.clone(),
                sink,
                readers: Vec::new(),
            };

            if self.cancel.is_cancelled() {
                release_media(None, Some(binding)).await;
                return;
            }
            let previous = match self.remote.lock() {
                Ok(mut remote) => remote.replace(binding),
                Err(_) => Some(binding),
            };
            release_media(None, previous).await;
        }

        {
            let Ok(mut remote) = self.remote.lock() else {
                return;
            };
            let Some(binding) = remote.as_mut() else {
                return;
            };
            let downlink =
                match DownlinkProcessor::new(Arc::clone(&binding.sink), self.far_end.clone()) {
                    Ok(downlink) => downlink,
                    Err(e) => {
                        tracing::warn!(error = %e, "failed to create downlink decoder");
                        return;
                    }
                };
            binding.readers.push(tokio::spawn(read_remote_track(
                track,
                downlink,
                self.cancel.child_token(),
            )));
        }

        if self.streams.insert(stream_id.clone()) {
            tracing::info!(stream_id = %stream_id, track_id = %track_id, "remote audio attached");
            self.ctx
                .events
                .emit(ClientEvent::RemoteAudio { stream_id, track_id });
        } else {
            tracing::debug!(stream_id = %stream_id, track_id = %track_id, "remote stream extended");
        }
    }

    fn on_remote_channel(&mut self, channel: &Arc<RTCDataChannel>) {
        tracing::debug!(label = channel.label(), "gateway opened a data channel");
        watch_channel(channel, &self.event_tx);

        if channel.ready_state() == RTCDataChannelState::Open {
            self.on_channel_open(&Arc::downgrade(channel), channel.label());
        }
    }

    /// Announce the control channel once a channel it can use is open
    ///
    /// If another channel opens while the current one is still connecting,
    /// that channel becomes the control channel.
    fn on_channel_open(&mut self, opened: &Weak<RTCDataChannel>, label: &str) {
        if self.channel_announced {
            return;
        }

        if !self.control.is_current(opened) {
            let Some(channel) = opened.upgrade() else {
                return;
            };
            if !self.control.adopt(channel) {
                tracing::trace!(label, "data channel opened, control already open");
                return;
            }
        }
        self.channel_announced = true;

        tracing::info!(label, "control channel open");
        self.ctx.events.emit(ClientEvent::DataChannelOpen);
        self.ctx.supervisor.start_heartbeat(
            self.control.clone(),
            self.ctx.state.subscribe(),
            self.cancel.child_token(),
        );
    }

    async fn on_message(&self, text: &str) {
        match control::decode(text) {
            Ok(Inbound::Message(message)) => {
                tracing::trace!(kind = message.kind(), "control message received");
                let action = control::handle_inbound(message);
                if let Some(event) = action.event {
                    self.ctx.events.emit(event);
                }
                if let Some(reply) = action.reply {
                    self.control.send(&reply).await;
                }
                if action.heartbeat_ack {
                    self.ctx.supervisor.record_pong();
                }
            }
            Ok(Inbound::Unknown(kind)) => {
                tracing::debug!(kind = %kind, "unknown control message type dropped");
            }
            Err(e) => {
                tracing::warn!(error = %e, "malformed control message");
                self.ctx.events.emit_error(&e);
            }
        }
    }
}

/// Send a control message on the active session, if any
pub async fn send_on_active(ctx: &SessionContext, message: &ControlMessage) -> bool {
    match ctx.active() {
        Some(active) => active.control.send(message).await,
        None => {
            tracing::warn!(kind = message.kind(), "no active session, control message dropped");
            false
        }
    }
}
