//! Errors raised by the lifecycle engine.

use thiserror::Error;

use super::types::SessionId;
use crate::backend::BackendError;

/// Errors that can occur during session operations.
///
/// Every variant names the session it concerns so the transport layer can
/// turn it into a structured error event for the client.
#[derive(Error, Debug)]
pub enum SessionError {
    /// The session was not found.
    #[error("session not found: {0}")]
    NotFound(SessionId),

    /// The session has already been terminated.
    #[error("session already terminated: {0}")]
    AlreadyTerminated(SessionId),

    /// The record exists but its process handle is gone.
    #[error("process unavailable for session {0}")]
    ProcessUnavailable(SessionId),

    /// The durable record could not be written.
    #[error("failed to persist session {id}: {source}")]
    Store {
        id: SessionId,
        #[source]
        source: BackendError,
    },

    /// The process backend refused to start the session.
    #[error("failed to start session {id}: {source}")]
    Spawn {
        id: SessionId,
        #[source]
        source: BackendError,
    },
}

impl SessionError {
    /// Returns the id of the session this error concerns.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionError::NotFound(id)
            | SessionError::AlreadyTerminated(id)
            | SessionError::ProcessUnavailable(id) => id,
            SessionError::Store { id, .. } | SessionError::Spawn { id, .. } => id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_carry_session_id() {
        let err = SessionError::Spawn {
            id: "abc".to_string(),
            source: BackendError::Process("tmux exited".to_string()),
        };
        assert_eq!(err.session_id(), "abc");
        let msg = err.to_string();
        assert!(msg.contains("abc"));
        assert!(msg.contains("tmux exited"));

        assert_eq!(
            SessionError::ProcessUnavailable("xyz".to_string()).to_string(),
            "process unavailable for session xyz"
        );
    }
}
