//! Session lifecycle states and close reasons.

use serde::Serialize;
use std::fmt;

use agentwire_core::error::{ErrorCode, SessionError};

/// `Connecting → Open → Closing → Closed`. There is no way back to `Open`;
/// a reconnect is a new session re-attached by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Open) | (Connecting, Closing) | (Open, Closing) | (Closing, Closed)
        )
    }

    /// Move to `next`, or fail without changing state.
    pub fn transition(&mut self, next: SessionState) -> Result<(), SessionError> {
        if !self.can_transition_to(next) {
            return Err(SessionError::InvalidTransition {
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        *self = next;
        Ok(())
    }

    pub fn is_open(self) -> bool {
        self == SessionState::Open
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Open => "open",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Why a session closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The peer closed the connection or dropped its side.
    ClientClosed,
    /// The peer stopped answering heartbeat pings.
    HeartbeatTimeout,
    /// The process is shutting down.
    ServerShutdown,
    /// The transport failed underneath the session.
    TransportError,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::ClientClosed => "client_closed",
            CloseReason::HeartbeatTimeout => "heartbeat_timeout",
            CloseReason::ServerShutdown => "server_shutdown",
            CloseReason::TransportError => "transport_error",
        }
    }

    /// Abnormal closes are the ones the client did not ask for.
    pub fn is_abnormal(self) -> bool {
        !matches!(self, CloseReason::ClientClosed)
    }

    pub fn code(self) -> ErrorCode {
        match self {
            CloseReason::ClientClosed | CloseReason::TransportError => ErrorCode::ConnectionClosed,
            CloseReason::HeartbeatTimeout => ErrorCode::HeartbeatTimeout,
            CloseReason::ServerShutdown => ErrorCode::ServerShutdown,
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_only_moves_forward() {
        let mut state = SessionState::Connecting;
        state.transition(SessionState::Open).unwrap();
        assert!(state.is_open());
        state.transition(SessionState::Closing).unwrap();
        assert!(state.transition(SessionState::Open).is_err());
        assert_eq!(state, SessionState::Closing);
        state.transition(SessionState::Closed).unwrap();
        assert!(state.transition(SessionState::Closing).is_err());
    }

    #[test]
    fn connecting_can_abort() {
        assert!(SessionState::Connecting.can_transition_to(SessionState::Closing));
        assert!(!SessionState::Connecting.can_transition_to(SessionState::Closed));
        assert!(!SessionState::Open.can_transition_to(SessionState::Closed));
    }

    #[test]
    fn heartbeat_close_is_abnormal() {
        assert!(CloseReason::HeartbeatTimeout.is_abnormal());
        assert!(!CloseReason::ClientClosed.is_abnormal());
        assert_eq!(CloseReason::HeartbeatTimeout.code().as_u16(), 1002);
        assert_eq!(CloseReason::ServerShutdown.to_string(), "server_shutdown");
    }
}
