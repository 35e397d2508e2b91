//! Session lifecycle management.
//!
//! This module owns the session state machine and the protocols around it:
//! creation, startup recovery, client reconnection, exit disambiguation and
//! reaping of idle detached sessions.

pub mod error;
pub mod events;
mod exit;
pub mod manager;
mod recovery;
pub mod registry;
pub mod types;

pub use error::SessionError;
pub use events::{DisconnectReason, SessionEvent, SessionEvents};
pub use exit::ExitOutcome;
pub use manager::{Collaborators, ManagerSettings, SessionManager};
pub use recovery::{BufferReplay, ReconnectOutcome, RecoveryReport, StatusChange};
pub use registry::SessionRegistry;
pub use types::{
    now_millis, ActivityStatus, ClientId, CreateSession, PersistedSession, ProjectId, SessionId,
    SessionKind, SessionRecord, SessionStatus, SpawnConfig, TerminalConfig,
};
