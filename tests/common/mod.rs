//! Shared test utilities

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast, mpsc};
use toy_link::voice::{MediaDevices, MediaTrack, PlaybackSink};
use toy_link::{ClientConfig, ClientEvent, Error};
use webrtc::api::APIBuilder;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MIME_TYPE_PCMU, MediaEngine};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Media stream id of the gateway's voice tracks
pub const GATEWAY_STREAM: &str = "gateway-voice";

/// Label of the data channel the gateway opens
pub const GATEWAY_CHANNEL: &str = "events";

/// Recorded gateway traffic and failure injection
#[derive(Default)]
pub struct GatewayState {
    pub session_requests: AtomicUsize,
    pub fail_remaining: AtomicUsize,
    pub fail_status: AtomicU16,
    pub hold_answers: AtomicBool,
    pub invalid_offers: AtomicBool,
    pub requests: Mutex<Vec<Value>>,
    pub answers: Mutex<Vec<Value>>,
    peers: Mutex<HashMap<String, Arc<GatewayPeer>>>,
}

/// In-process gateway serving the signaling endpoints
pub struct MockGateway {
    pub url: String,
    pub state: Arc<GatewayState>,
    server: tokio::task::JoinHandle<()>,
}

impl MockGateway {
    /// Start a gateway that accepts every session and applies answers
    pub async fn start() -> Self {
        let state = Arc::new(GatewayState::default());
        let router = Router::new()
            .route("/api/session", post(create_session))
            .route("/api/session/answer", post(submit_answer))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock gateway");
        let addr = listener.local_addr().expect("no local addr");
        let server = tokio::spawn(async move {
            axum::serve(listener, router).await.ok();
        });

        Self {
            url: format!("http://{addr}"),
            state,
            server,
        }
    }

    /// Fail every session request with `status`
    pub async fn failing(status: u16) -> Self {
        let gateway = Self::start().await;
        gateway.fail_next(usize::MAX, status);
        gateway
    }

    /// Fail the next `count` session requests with `status`
    pub fn fail_next(&self, count: usize, status: u16) {
        self.state.fail_status.store(status, Ordering::SeqCst);
        self.state.fail_remaining.store(count, Ordering::SeqCst);
    }

    /// Record answers without applying them, so sessions stay `connecting`
    pub fn hold_answers(&self) {
        self.state.hold_answers.store(true, Ordering::SeqCst);
    }

    /// Answer session requests with an offer that cannot be applied
    pub fn serve_invalid_offers(&self) {
        self.state.invalid_offers.store(true, Ordering::SeqCst);
    }

    /// Number of session creation requests received
    pub fn session_requests(&self) -> usize {
        self.state.session_requests.load(Ordering::SeqCst)
    }

    /// Answers submitted so far
    pub async fn answers(&self) -> Vec<Value> {
        self.state.answers.lock().await.clone()
    }

    /// Session creation bodies received so far
    pub async fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().await.clone()
    }

    /// Gateway side of a created session
    pub async fn peer(&self, session_id: &str) -> Option<Arc<GatewayPeer>> {
        self.state.peers.lock().await.get(session_id).cloned()
    }

    /// Client configuration pointing at this gateway
    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(&self.url, "device-1", "toy-1")
            .with_ice_servers(Vec::new())
            .with_gather_timeout(Duration::from_secs(2))
            .with_reconnect(3, Duration::from_millis(100))
    }
}

impl Drop for MockGateway {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn create_session(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, (StatusCode, String)> {
    let n = state.session_requests.fetch_add(1, Ordering::SeqCst) + 1;
    state.requests.lock().await.push(body);

    let remaining = state.fail_remaining.load(Ordering::SeqCst);
    if remaining > 0 {
        if remaining != usize::MAX {
            state.fail_remaining.store(remaining - 1, Ordering::SeqCst);
        }
        let status = StatusCode::from_u16(state.fail_status.load(Ordering::SeqCst))
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        return Err((status, String::new()));
    }

    let session_id = format!("session-{n}");
    let sdp = if state.invalid_offers.load(Ordering::SeqCst) {
        "not an sdp".to_string()
    } else {
        let (peer, sdp) = GatewayPeer::offer().await;
        state
            .peers
            .lock()
            .await
            .insert(session_id.clone(), Arc::new(peer));
        sdp
    };

    Ok(Json(json!({
        "sessionId": session_id,
        "threadId": "thread-1",
        "offer": { "sdp": sdp, "type": "offer" },
    })))
}

async fn submit_answer(
    State(state): State<Arc<GatewayState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.answers.lock().await.push(body.clone());
    if state.hold_answers.load(Ordering::SeqCst) {
        return StatusCode::NO_CONTENT;
    }

    let session_id = body["sessionId"].as_str().unwrap_or_default();
    let Some(peer) = state.peers.lock().await.get(session_id).cloned() else {
        return StatusCode::NO_CONTENT;
    };

    let sdp = body["answer"]["sdp"].as_str().unwrap_or_default().to_string();
    let Ok(answer) = RTCSessionDescription::answer(sdp) else {
        return StatusCode::BAD_REQUEST;
    };
    match peer.pc.set_remote_description(answer).await {
        Ok(()) => StatusCode::NO_CONTENT,
        Err(_) => StatusCode::BAD_REQUEST,
    }
}

/// Gateway end of one session: two voice tracks in one stream plus the
/// data channels, with every inbound control message recorded
pub struct GatewayPeer {
    pub pc: Arc<RTCPeerConnection>,
    tracks: Vec<Arc<TrackLocalStaticSample>>,
    channels: Arc<StdMutex<Vec<Arc<RTCDataChannel>>>>,
    received: Arc<StdMutex<Vec<String>>>,
}

impl GatewayPeer {
    /// Build a real offer and gather its candidates
    async fn offer() -> (Self, String) {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .expect("failed to register codecs");
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)
            .expect("failed to register interceptors");
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let pc = Arc::new(
            api.new_peer_connection(RTCConfiguration::default())
                .await
                .expect("failed to create gateway peer"),
        );

        let mut tracks = Vec::new();
        for track_id in ["voice-a", "voice-b"] {
            let track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: MIME_TYPE_PCMU.to_owned(),
                    clock_rate: 8000,
                    channels: 1,
                    ..Default::default()
                },
                track_id.to_owned(),
                GATEWAY_STREAM.to_owned(),
            ));
            let sender = pc
                .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .expect("failed to add gateway track");
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while sender.read(&mut buf).await.is_ok() {}
            });
            tracks.push(track);
        }

        let received = Arc::new(StdMutex::new(Vec::new()));
        let channels = Arc::new(StdMutex::new(Vec::new()));

        let events = pc
            .create_data_channel(GATEWAY_CHANNEL, None)
            .await
            .expect("failed to create data channel");
        record_messages(&events, &received);
        channels.lock().unwrap().push(events);

        let inbound_channels = Arc::clone(&channels);
        let inbound_received = Arc::clone(&received);
        pc.on_data_channel(Box::new(move |channel| {
            record_messages(&channel, &inbound_received);
            inbound_channels.lock().unwrap().push(channel);
            Box::pin(async {})
        }));

        let offer = pc.create_offer(None).await.expect("failed to create offer");
        let mut gathered = pc.gathering_complete_promise().await;
        pc.set_local_description(offer)
            .await
            .expect("failed to set local description");
        let _ = tokio::time::timeout(Duration::from_secs(2), gathered.recv()).await;

        let sdp = pc
            .local_description()
            .await
            .expect("no local description")
            .sdp;

        let peer = Self {
            pc,
            tracks,
            channels,
            received,
        };
        (peer, sdp)
    }

    /// Control messages received from the client, as raw text
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    /// `type` of every control message received from the client
    pub fn received_types(&self) -> Vec<String> {
        self.received()
            .iter()
            .filter_map(|text| serde_json::from_str::<Value>(text).ok())
            .filter_map(|v| v["type"].as_str().map(ToString::to_string))
            .collect()
    }

    /// Wait until the channel labelled `label` is open on the gateway side
    pub async fn open_channel(&self, label: &str, timeout: Duration) -> Option<Arc<RTCDataChannel>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let found = self
                .channels
                .lock()
                .unwrap()
                .iter()
                .find(|c| c.label() == label && c.ready_state() == RTCDataChannelState::Open)
                .cloned();
            if found.is_some() || tokio::time::Instant::now() >= deadline {
                return found;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Send `text` to the client on the channel labelled `label`
    pub async fn send(&self, label: &str, text: &str) {
        let channel = self
            .open_channel(label, Duration::from_secs(5))
            .await
            .unwrap_or_else(|| panic!("gateway channel {label} never opened"));
        channel
            .send_text(text.to_string())
            .await
            .expect("gateway send failed");
    }

    /// Stream mu-law silence on both voice tracks until aborted
    pub fn stream_audio(&self) -> tokio::task::JoinHandle<()> {
        let tracks = self.tracks.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(20));
            loop {
                ticker.tick().await;
                for track in &tracks {
                    let sample = Sample {
                        data: Bytes::from_static(&[0xFF; 160]),
                        duration: Duration::from_millis(20),
                        ..Default::default()
                    };
                    let _ = track.write_sample(&sample).await;
                }
            }
        })
    }

    /// Close the gateway's peer connection
    pub async fn close(&self) {
        let _ = self.pc.close().await;
    }
}

fn record_messages(channel: &RTCDataChannel, received: &Arc<StdMutex<Vec<String>>>) {
    let received = Arc::clone(received);
    channel.on_message(Box::new(move |message: DataChannelMessage| {
        received
            .lock()
            .unwrap()
            .push(String::from_utf8_lossy(&message.data).into_owned());
        Box::pin(async {})
    }));
}

/// Media devices that count live endpoints and never touch hardware
#[derive(Default)]
pub struct RecordingDevices {
    pub fail_microphone: AtomicBool,
    pub microphones_opened: AtomicUsize,
    pub live_microphones: Arc<AtomicUsize>,
    pub live_speakers: Arc<AtomicUsize>,
    /// How long opening the microphone blocks its thread
    pub open_delay_ms: AtomicU64,
    /// Bumped by a test task to show the runtime is making progress
    pub runtime_ticks: Arc<AtomicUsize>,
    /// Runtime ticks observed while the microphone was opening
    pub ticks_during_open: AtomicUsize,
}

impl RecordingDevices {
    /// Devices whose microphone is unavailable
    pub fn without_microphone() -> Self {
        let devices = Self::default();
        devices.fail_microphone.store(true, Ordering::SeqCst);
        devices
    }

    /// Devices whose microphone takes `delay` to open
    pub fn slow(delay: Duration) -> Self {
        let devices = Self::default();
        devices.open_delay_ms.store(
            u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
        devices
    }

    pub fn live(&self) -> usize {
        self.live_microphones.load(Ordering::SeqCst) + self.live_speakers.load(Ordering::SeqCst)
    }
}

impl MediaDevices for RecordingDevices {
    fn open_microphone(
        &self,
        _frames: mpsc::Sender<Vec<f32>>,
    ) -> toy_link::Result<Box<dyn MediaTrack>> {
        let delay = self.open_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            let before = self.runtime_ticks.load(Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(delay));
            let after = self.runtime_ticks.load(Ordering::SeqCst);
            self.ticks_during_open.store(after - before, Ordering::SeqCst);
        }

        if self.fail_microphone.load(Ordering::SeqCst) {
            return Err(Error::MediaAcquisition("permission denied".to_string()));
        }
        self.microphones_opened.fetch_add(1, Ordering::SeqCst);
        self.live_microphones.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeMicrophone {
            live: Arc::clone(&self.live_microphones),
            stopped: false,
        }))
    }

    fn open_speaker(&self) -> toy_link::Result<Arc<dyn PlaybackSink>> {
        self.live_speakers.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeSpeaker {
            live: Arc::clone(&self.live_speakers),
            stopped: AtomicBool::new(false),
        }))
    }
}

struct FakeMicrophone {
    live: Arc<AtomicUsize>,
    stopped: bool,
}

impl MediaTrack for FakeMicrophone {
    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        !self.stopped
    }
}

impl Drop for FakeMicrophone {
    fn drop(&mut self) {
        self.stop();
    }
}

struct FakeSpeaker {
    live: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl PlaybackSink for FakeSpeaker {
    fn write(&self, _samples: &[f32]) {}

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            self.live.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_live(&self) -> bool {
        !self.stopped.load(Ordering::SeqCst)
    }
}

impl Drop for FakeSpeaker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Wait for the first event matching `predicate`
pub async fn wait_for<F>(
    rx: &mut broadcast::Receiver<ClientEvent>,
    timeout: Duration,
    mut predicate: F,
) -> Option<ClientEvent>
where
    F: FnMut(&ClientEvent) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Drain already-delivered events
pub fn drain(rx: &mut broadcast::Receiver<ClientEvent>) -> Vec<ClientEvent> {
    let mut events = Vec::new();
    loop {
        match rx.try_recv() {
            Ok(event) => events.push(event),
            Err(broadcast::error::TryRecvError::Lagged(_)) => {}
            Err(_) => return events,
        }
    }
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
