//! Errors raised while handling a single inbound operation.
//!
//! None of these are fatal: the connection loop logs them, reports them to
//! the submitting client where appropriate, and keeps reading.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GameError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[from] serde_json::Error),

    #[error("message type {0:?} is not supported")]
    UnsupportedMessageType(String),

    #[error("session {0:?} not found")]
    SessionNotFound(String),

    #[error("player not found")]
    ParticipantNotFound,

    #[error("player is not leader")]
    NotLeader,

    #[error("can't join room, game has already started")]
    SessionAlreadyStarted,

    #[error("game has not started")]
    SessionNotStarted,

    #[error("username too long ({len} characters, at most {max} allowed)")]
    UsernameTooLong { len: usize, max: usize },

    #[error("no round is active")]
    RoundNotActive,

    #[error("a round is already in progress")]
    RoundInProgress,

    #[error("invalid game options: {0}")]
    InvalidOptions(&'static str),

    #[error("connection is not in a session")]
    NotInSession,

    #[error("join token does not match the connection token")]
    TokenMismatch,

    #[error("session {0:?} is closed")]
    SessionClosed(String),
}

impl GameError {
    /// Whether the submitting connection should get an `ERROR` envelope.
    /// Malformed frames are only logged.
    pub fn notify_client(&self) -> bool {
        !matches!(self, GameError::MalformedEnvelope(_))
    }
}

pub type GameResult<T> = Result<T, GameError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_username_too_long_message() {
        let err = GameError::UsernameTooLong { len: 25, max: 20 };
        assert_eq!(
            err.to_string(),
            "username too long (25 characters, at most 20 allowed)"
        );
    }

    #[test]
    fn test_malformed_is_not_reported() {
        let parse_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = GameError::from(parse_err);

        assert!(!err.notify_client());
        assert!(GameError::NotLeader.notify_client());
        assert!(GameError::UnsupportedMessageType("X".into()).notify_client());
        // A join that lost the race with the last leave is told so
        assert!(GameError::SessionClosed("s".into()).notify_client());
    }
}
