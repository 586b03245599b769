//! Toy Link - Device-side voice client for AI toys
//!
//! This library connects a toy to a cloud voice gateway:
//! - Session signaling over HTTP (offer from the gateway, answer from the toy)
//! - Bidirectional audio over a WebRTC peer connection
//! - A JSON control channel for recording intents, transcripts and replies
//! - Level metering, voice activity and mute on the outgoing audio
//! - Heartbeat and bounded reconnection
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     ToyClient                        │
//! │   connect │ disconnect │ mute │ recording │ events  │
//! └──────┬──────────────┬──────────────────┬────────────┘
//!        │              │                  │
//! ┌──────▼─────┐ ┌──────▼──────────┐ ┌─────▼──────────┐
//! │ Signaling  │ │ Session Manager │ │   Supervisor   │
//! │ HTTP/JSON  │ │ peer │ media    │ │ heartbeat │    │
//! │            │ │ control channel │ │ reconnect      │
//! └────────────┘ └──────┬──────────┘ └────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────┐
//! │                   Voice pipeline                     │
//! │   capture │ processing │ VAD │ PCMU │ playback      │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod control;
pub mod error;
pub mod events;
pub mod peer;
pub mod signaling;
pub mod supervisor;
pub mod voice;

pub use client::{ToyClient, ToyClientBuilder};
pub use config::{ClientConfig, ConfigOverrides};
pub use control::ControlMessage;
pub use error::{Error, ErrorKind, Result};
pub use events::{ClientEvent, EventBus};
pub use peer::ConnectionState;
pub use signaling::{SessionInfo, SignalingClient};
pub use voice::{CaptureConstraints, CpalDevices, MediaDevices, SilentDevices};
