//! Lifecycle events consumed by the transport layer.

use tokio::sync::broadcast;

use super::types::{ActivityStatus, ClientId, SessionId, SessionRecord};

/// Why a session moved to `Disconnected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The owning client went away.
    ClientLeft,
    /// The process handle exited but the multiplexer session survived.
    ProcessExited,
    /// A write or resize found no live process handle.
    ProcessUnavailable,
}

/// Events emitted by the session manager.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session was created for a client.
    Created {
        session: SessionRecord,
        client_id: ClientId,
    },
    /// A session lost its reader. Never carries an exit code: the logical
    /// session is still alive.
    Disconnected {
        session_id: SessionId,
        reason: DisconnectReason,
    },
    /// A client reattached to a session.
    Reconnected {
        session_id: SessionId,
        client_id: ClientId,
    },
    /// A session ended.
    Terminated {
        session_id: SessionId,
        exit_code: Option<i32>,
    },
    /// The activity detector changed its verdict.
    StatusChange {
        session_id: SessionId,
        activity: ActivityStatus,
    },
    /// Output from a session.
    Output { session_id: SessionId, data: Vec<u8> },
}

impl SessionEvent {
    /// Returns the session this event concerns.
    pub fn session_id(&self) -> &SessionId {
        match self {
            SessionEvent::Created { session, .. } => &session.id,
            SessionEvent::Disconnected { session_id, .. }
            | SessionEvent::Reconnected { session_id, .. }
            | SessionEvent::Terminated { session_id, .. }
            | SessionEvent::StatusChange { session_id, .. }
            | SessionEvent::Output { session_id, .. } => session_id,
        }
    }

    /// Event name as seen by transport consumers.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Created { .. } => "session:created",
            SessionEvent::Disconnected { .. } => "session:disconnected",
            SessionEvent::Reconnected { .. } => "session:reconnected",
            SessionEvent::Terminated { .. } => "session:terminated",
            SessionEvent::StatusChange { .. } => "status:change",
            SessionEvent::Output { .. } => "terminal:output",
        }
    }
}

/// Fan-out of session events to any number of subscribers.
///
/// Each subscriber receives events in emission order, starting from the
/// moment it subscribed.
#[derive(Debug, Clone)]
pub struct SessionEvents {
    tx: broadcast::Sender<SessionEvent>,
}

impl SessionEvents {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Returns a new receiver for session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: SessionEvent) {
        let name = event.name();
        if self.tx.send(event).is_err() {
            tracing::trace!(event = name, "No subscribers for session event");
        }
    }
}
