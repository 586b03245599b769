//! Control channel protocol
//!
//! Small JSON messages carried on an ordered, reliable data channel next to
//! the audio track. Every message has a `type` field plus type-specific
//! payload fields:
//!
//! ```text
//! {"type":"ping"}                      heartbeat (either direction)
//! {"type":"pong"}                      heartbeat reply
//! {"type":"start_recording"}           client -> server intent
//! {"type":"stop_recording"}            client -> server intent
//! {"type":"transcription","text":..}   server -> client
//! {"type":"aiResponse","text":..}      server -> client
//! {"type":"error","error":..}          server -> client
//! ```
//!
//! Sending is fire-and-forget: nothing is queued while the channel is not
//! open. Unknown types are dropped so newer gateways can add messages.

use std::sync::{Arc, RwLock, Weak};

use serde::{Deserialize, Serialize};
use webrtc::data_channel::RTCDataChannel;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;

use crate::events::ClientEvent;
use crate::{Error, Result};

/// Label of the data channel the client opens
pub const CONTROL_CHANNEL_LABEL: &str = "control";

/// Message types this client understands
const KNOWN_TYPES: [&str; 8] = [
    "ping",
    "pong",
    "start_recording",
    "stop_recording",
    "transcription",
    "aiResponse",
    "ai_response",
    "error",
];

/// A control channel message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "ping")]
    Ping,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "start_recording")]
    StartRecording,
    #[serde(rename = "stop_recording")]
    StopRecording,
    #[serde(rename = "transcription")]
    Transcription { text: String },
    #[serde(rename = "aiResponse", alias = "ai_response")]
    AiResponse { text: String },
    #[serde(rename = "error")]
    Error {
        #[serde(alias = "message")]
        error: String,
    },
}

impl ControlMessage {
    /// Wire `type` of this message
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::StartRecording => "start_recording",
            Self::StopRecording => "stop_recording",
            Self::Transcription { .. } => "transcription",
            Self::AiResponse { .. } => "aiResponse",
            Self::Error { .. } => "error",
        }
    }

    /// Serialize to the wire format
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Result of decoding an inbound payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A recognized message
    Message(ControlMessage),
    /// A well-formed message of a type this client does not know
    Unknown(String),
}

/// Decode an inbound payload
///
/// `{"type":"command","command":"start_recording"}` is accepted as an
/// envelope for the recording intents.
///
/// # Errors
///
/// Returns `Error::Protocol` if the payload is not a JSON object with a
/// string `type`, or if a known type is missing its payload fields
pub fn decode(text: &str) -> Result<Inbound> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| Error::Protocol(format!("invalid json: {e}")))?;

    let Some(kind) = value.get("type").and_then(serde_json::Value::as_str) else {
        return Err(Error::Protocol("message has no type".to_string()));
    };

    if kind == "command" {
        return Ok(
            match value.get("command").and_then(serde_json::Value::as_str) {
                Some("start_recording") => Inbound::Message(ControlMessage::StartRecording),
                Some("stop_recording") => Inbound::Message(ControlMessage::StopRecording),
                Some(other) => Inbound::Unknown(format!("command:{other}")),
                None => return Err(Error::Protocol("command message has no command".to_string())),
            },
        );
    }

    if !KNOWN_TYPES.contains(&kind) {
        return Ok(Inbound::Unknown(kind.to_string()));
    }

    let kind = kind.to_string();
    serde_json::from_value(value)
        .map(Inbound::Message)
        .map_err(|e| Error::Protocol(format!("malformed {kind} message: {e}")))
}

/// What the session should do in response to an inbound message
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundAction {
    /// Event to publish
    pub event: Option<ClientEvent>,
    /// Message to send back
    pub reply: Option<ControlMessage>,
    /// Whether this acknowledged a heartbeat
    pub heartbeat_ack: bool,
}

/// Map an inbound message to its session action
#[must_use]
pub fn handle_inbound(message: ControlMessage) -> InboundAction {
    let event = match message {
        ControlMessage::Ping => {
            return InboundAction {
                reply: Some(ControlMessage::Pong),
                ..Default::default()
            };
        }
        ControlMessage::Pong => {
            return InboundAction {
                heartbeat_ack: true,
                ..Default::default()
            };
        }
        ControlMessage::StartRecording => ClientEvent::RecordingStarted,
        ControlMessage::StopRecording => ClientEvent::RecordingStopped,
        ControlMessage::Transcription { text } => ClientEvent::Transcription { text },
        ControlMessage::AiResponse { text } => ClientEvent::AiResponse { text },
        ControlMessage::Error { error } => ClientEvent::ServerError { message: error },
    };

    InboundAction {
        event: Some(event),
        ..Default::default()
    }
}

/// Handle to the session's control data channel
///
/// Cloning shares the handle. If another channel (ours or one the gateway
/// opened) becomes usable first, the session swaps it in with
/// [`ControlChannel::adopt`].
#[derive(Clone)]
pub struct ControlChannel {
    inner: Arc<RwLock<Arc<RTCDataChannel>>>,
}

impl ControlChannel {
    /// Wrap a data channel
    #[must_use]
    pub fn new(channel: Arc<RTCDataChannel>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(channel)),
        }
    }

    fn current(&self) -> Option<Arc<RTCDataChannel>> {
        self.inner.read().ok().map(|c| Arc::clone(&*c))
    }

    /// Whether `channel` is the one messages go out on
    #[must_use]
    pub fn is_current(&self, channel: &Weak<RTCDataChannel>) -> bool {
        self.current()
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), channel.as_ptr()))
    }

    /// Replace the underlying channel; returns `false` if the current one is
    /// already open
    pub fn adopt(&self, channel: Arc<RTCDataChannel>) -> bool {
        if self.is_open() {
            return false;
        }
        if let Ok(mut current) = self.inner.write() {
            tracing::debug!(label = channel.label(), "switching control channel");
            *current = channel;
            return true;
        }
        false
    }

    /// Current ready state
    #[must_use]
    pub fn ready_state(&self) -> RTCDataChannelState {
        self.current()
            .map_or(RTCDataChannelState::Closed, |c| c.ready_state())
    }

    /// Whether the channel can carry messages
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.ready_state() == RTCDataChannelState::Open
    }

    /// Send a message if the channel is open
    ///
    /// Never fails: a closed channel or a send error is logged and reported
    /// as `false`. Nothing is queued for later delivery.
    pub async fn send(&self, message: &ControlMessage) -> bool {
        let Some(channel) = self.current() else {
            return false;
        };

        let state = channel.ready_state();
        if state != RTCDataChannelState::Open {
            tracing::warn!(
                kind = message.kind(),
                state = ?state,
                "control channel not open, message dropped"
            );
            return false;
        }

        let text = match message.encode() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "failed to encode control message");
                return false;
            }
        };

        match channel.send_text(text).await {
            Ok(_) => {
                tracing::trace!(kind = message.kind(), "control message sent");
                true
            }
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "control message send failed");
                false
            }
        }
    }

    /// Close the channel (no-op once closed)
    pub async fn close(&self) {
        let Some(channel) = self.current() else {
            return;
        };
        if channel.ready_state() == RTCDataChannelState::Closed {
            return;
        }
        if let Err(e) = channel.close().await {
            tracing::debug!(error = %e, "control channel close failed");
        }
    }
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlChannel")
            .field("state", &self.ready_state())
            .finish()
    }
}
