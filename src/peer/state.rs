//! Connection state machine

use serde::Serialize;
use tokio::sync::watch;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

/// Peer connection state as seen by the client
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No negotiation started
    #[default]
    New,
    /// Local media attached and remote offer applied
    Connecting,
    /// Transport path established
    Connected,
    /// Transient loss of connectivity; may recover on its own
    Disconnected,
    /// Non-recoverable without a new session
    Failed,
    /// Deliberately torn down
    Closed,
}

impl From<RTCPeerConnectionState> for ConnectionState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
            _ => Self::New,
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

impl ConnectionState {
    /// Whether moving from `self` to `next` is a legal transition
    #[must_use]
    pub const fn allows(self, next: Self) -> bool {
        use ConnectionState::{Closed, Connected, Connecting, Disconnected, Failed, New};

        match (self, next) {
            (Closed, _) => false,
            (_, Closed) => true,
            (New, Connecting | Failed)
            | (Connecting, Connected | Disconnected | Failed)
            | (Connected, Disconnected | Failed)
            | (Disconnected, Connecting | Connected | Failed) => true,
            _ => false,
        }
    }
}

/// Current connection state with change notification
///
/// Transitions go through [`StateCell::transition`], which rejects moves the
/// state machine does not allow. [`StateCell::force`] is reserved for
/// session boundaries.
#[derive(Debug, Clone)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
}

impl StateCell {
    /// Create a cell in [`ConnectionState::New`]
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ConnectionState::New);
        Self { tx }
    }

    /// Current state
    #[must_use]
    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Watch for changes
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Apply a transition; returns `true` if the state changed
    pub fn transition(&self, next: ConnectionState) -> bool {
        let mut from = ConnectionState::New;
        let changed = self.tx.send_if_modified(|current| {
            from = *current;
            if current.allows(next) {
                *current = next;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!(from = %from, to = %next, "connection state changed");
        } else if from != next {
            tracing::trace!(from = %from, to = %next, "ignored connection state transition");
        }
        changed
    }

    /// Set the state unconditionally; returns `true` if it changed
    pub fn force(&self, next: ConnectionState) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        })
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_from_rtc() {
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::New),
            ConnectionState::New
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Disconnected),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Failed),
            ConnectionState::Failed
        );
        assert_eq!(
            ConnectionState::from(RTCPeerConnectionState::Unspecified),
            ConnectionState::New
        );
    }

    #[test]
    fn happy_path_transitions() {
        let cell = StateCell::new();
        assert!(cell.transition(ConnectionState::Connecting));
        assert!(cell.transition(ConnectionState::Connected));
        assert!(cell.transition(ConnectionState::Disconnected));
        assert!(cell.transition(ConnectionState::Connected));
        assert!(cell.transition(ConnectionState::Failed));
        assert!(cell.transition(ConnectionState::Closed));
        assert_eq!(cell.get(), ConnectionState::Closed);
    }

    #[test]
    fn rejects_illegal_transitions() {
        let cell = StateCell::new();
        assert!(!cell.transition(ConnectionState::Connected));
        assert!(!cell.transition(ConnectionState::New));
        assert_eq!(cell.get(), ConnectionState::New);

        assert!(cell.transition(ConnectionState::Closed));
        assert!(!cell.transition(ConnectionState::Connecting));
        assert!(!cell.transition(ConnectionState::Closed));
    }

    #[test]
    fn force_starts_a_new_session() {
        let cell = StateCell::new();
        cell.transition(ConnectionState::Closed);
        assert!(cell.force(ConnectionState::New));
        assert!(!cell.force(ConnectionState::New));
        assert_eq!(cell.get(), ConnectionState::New);
        assert!(cell.transition(ConnectionState::Connecting));
    }

    #[tokio::test]
    async fn watchers_see_changes() {
        let cell = StateCell::new();
        let mut rx = cell.subscribe();
        cell.transition(ConnectionState::Connecting);
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ConnectionState::Connecting);
    }
}
