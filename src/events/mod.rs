//! Client events delivered to UI and other consumers
//!
//! Events fan out over a [`tokio::sync::broadcast`] channel. Publishing is
//! best-effort: having no subscriber (or a lagging one) never affects the
//! session. Call [`EventBus::subscribe`] to receive events.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::error::{Error, ErrorKind};
use crate::peer::ConnectionState;
use crate::signaling::SessionInfo;

/// Buffered events per subscriber before it starts lagging
///
/// Level and voice-activity events arrive at frame cadence (50/s), so this
/// covers a few seconds of a stalled consumer.
const EVENT_CAPACITY: usize = 512;

/// An event emitted by the client
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ClientEvent {
    /// Transport established for the current session
    Connected {
        /// Session negotiated with the gateway
        session: SessionInfo,
    },
    /// Peer connection state transition
    ConnectionStateChange {
        /// New state
        state: ConnectionState,
    },
    /// A new inbound audio stream started playing
    RemoteAudio {
        /// Remote media stream identifier
        stream_id: String,
        /// First track seen on the stream
        track_id: String,
    },
    /// Microphone acquired and bound to the outgoing track
    LocalAudio {
        /// Capture rate in Hz
        sample_rate: u32,
        /// Channel count
        channels: u16,
    },
    /// Control channel ready to carry messages
    DataChannelOpen,
    /// Speech-to-text result from the gateway
    Transcription {
        text: String,
    },
    /// Assistant reply text from the gateway
    AiResponse {
        text: String,
    },
    /// Error reported by the gateway over the control channel
    ServerError {
        message: String,
    },
    /// RMS level of the latest capture frame
    AudioLevel {
        level: f32,
    },
    /// Voice-activity classification of the latest capture frame
    VoiceActivity {
        is_speaking: bool,
    },
    RecordingStarted,
    RecordingStopped,
    /// Outgoing track gate changed
    MuteStateChanged {
        muted: bool,
    },
    /// Reconnection abandoned after the configured attempts
    MaxReconnectAttemptsReached {
        attempts: u32,
    },
    /// Session torn down
    Disconnected,
    /// A failure the caller should know about
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl ClientEvent {
    /// Build an error event from a library error
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Event name as seen by UI consumers
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::ConnectionStateChange { .. } => "connectionStateChange",
            Self::RemoteAudio { .. } => "remoteAudio",
            Self::LocalAudio { .. } => "localAudio",
            Self::DataChannelOpen => "dataChannelOpen",
            Self::Transcription { .. } => "transcription",
            Self::AiResponse { .. } => "aiResponse",
            Self::ServerError { .. } => "serverError",
            Self::AudioLevel { .. } => "audioLevel",
            Self::VoiceActivity { .. } => "voiceActivity",
            Self::RecordingStarted => "recordingStarted",
            Self::RecordingStopped => "recordingStopped",
            Self::MuteStateChanged { .. } => "muteStateChanged",
            Self::MaxReconnectAttemptsReached { .. } => "maxReconnectAttemptsReached",
            Self::Disconnected => "disconnected",
            Self::Error { .. } => "error",
        }
    }

    /// Whether this event fires at audio frame cadence
    #[must_use]
    pub const fn is_frame_event(&self) -> bool {
        matches!(self, Self::AudioLevel { .. } | Self::VoiceActivity { .. })
    }
}

/// Fan-out channel for [`ClientEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ClientEvent>,
}

impl EventBus {
    /// Create an event bus with no subscribers
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Subscribe to all events emitted from now on
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.tx.subscribe()
    }

    /// Publish an event (never blocks, dropped if nobody listens)
    pub fn emit(&self, event: ClientEvent) {
        if !event.is_frame_event() {
            tracing::debug!(event = event.name(), "emitting client event");
        }
        let _ = self.tx.send(event);
    }

    /// Publish an error event
    pub fn emit_error(&self, error: &Error) {
        self.emit(ClientEvent::from_error(error));
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_without_subscribers_is_silent() {
        let bus = EventBus::new();
        bus.emit(ClientEvent::DataChannelOpen);
    }

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(ClientEvent::RecordingStarted);
        bus.emit(ClientEvent::AiResponse {
            text: "hello".to_string(),
        });

        assert_eq!(rx.recv().await.unwrap(), ClientEvent::RecordingStarted);
        assert_eq!(
            rx.recv().await.unwrap(),
            ClientEvent::AiResponse {
                text: "hello".to_string()
            }
        );
    }

    #[test]
    fn error_event_carries_kind() {
        let event = ClientEvent::from_error(&Error::signaling(500, "Internal Server Error"));
        match event {
            ClientEvent::Error { kind, message } => {
                assert_eq!(kind, ErrorKind::Signaling);
                assert!(message.contains("500"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn serializes_with_camel_case_names() {
        let json = serde_json::to_value(ClientEvent::MaxReconnectAttemptsReached { attempts: 3 })
            .unwrap();
        assert_eq!(json["event"], "maxReconnectAttemptsReached");
        assert_eq!(json["attempts"], 3);
        assert_eq!(ClientEvent::DataChannelOpen.name(), "dataChannelOpen");
    }
}
