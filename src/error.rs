//! Error types for the toy link client

use serde::Serialize;
use thiserror::Error;

/// Result type alias for toy link operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the toy link client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Signaling handshake returned a non-success status
    #[error("signaling error: {status} {message}")]
    Signaling {
        /// HTTP status code
        status: u16,
        /// Status text or response body
        message: String,
    },

    /// Microphone could not be acquired
    #[error("media acquisition error: {0}")]
    MediaAcquisition(String),

    /// Peer connection or ICE failure
    #[error("transport error: {0}")]
    Transport(String),

    /// Connection attempt superseded by disconnect or a newer connect
    #[error("connection attempt cancelled")]
    Cancelled,

    /// Malformed control message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Audio processing or device error after acquisition
    #[error("audio error: {0}")]
    Audio(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// WebRTC stack error
    #[error("webrtc error: {0}")]
    WebRtc(#[from] webrtc::Error),
}

/// Coarse classification of an [`Error`], carried on emitted events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// HTTP handshake failure
    Signaling,
    /// Microphone unavailable
    MediaAcquisition,
    /// ICE/connection failure
    Transport,
    /// Malformed control message
    Protocol,
    /// Invalid configuration
    Config,
    /// Audio device or codec failure
    Audio,
}

impl Error {
    /// Build a signaling error from a status code and message
    pub fn signaling(status: u16, message: impl Into<String>) -> Self {
        Self::Signaling {
            status,
            message: message.into(),
        }
    }

    /// Classify this error
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::Config(_) | Self::Toml(_) => ErrorKind::Config,
            Self::Signaling { .. } | Self::Http(_) | Self::Serialization(_) => {
                ErrorKind::Signaling
            }
            Self::MediaAcquisition(_) => ErrorKind::MediaAcquisition,
            Self::Transport(_) | Self::WebRtc(_) | Self::Cancelled => ErrorKind::Transport,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Audio(_) | Self::Io(_) => ErrorKind::Audio,
        }
    }

    /// Whether the supervisor should schedule a reconnect for this error
    #[must_use]
    pub const fn triggers_reconnect(&self) -> bool {
        !matches!(self, Self::Cancelled)
            && matches!(self.kind(), ErrorKind::Signaling | ErrorKind::Transport)
    }
}
