//! Collaborators of the lifecycle engine.
//!
//! The engine only talks to these traits. Concrete implementations live in
//! the submodules: SQLite for durable state, tmux for liveness across
//! restarts, portable-pty for process handles, an in-memory scrollback with
//! disk spill, and a regex-based activity detector.

pub mod activity;
pub mod buffer;
pub mod pty;
pub mod store;
pub mod tmux;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::session::{ActivityStatus, PersistedSession, SessionId, SessionStatus, SpawnConfig};

pub use activity::PatternDetector;
pub use buffer::ScrollbackStore;
pub use pty::PtyBackend;
pub use store::SqliteStore;
pub use tmux::TmuxRegistry;

/// Errors reported by collaborators.
#[derive(Debug, Error)]
pub enum BackendError {
    /// Durable store failure.
    #[error("store error: {0}")]
    Store(String),

    /// SQLite error.
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Configuration blob could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The multiplexer could not be queried.
    #[error("multiplexer error: {0}")]
    Multiplexer(String),

    /// The process backend failed.
    #[error("process error: {0}")]
    Process(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for collaborator calls.
pub type BackendResult<T> = Result<T, BackendError>;

/// A stored session row that exists but could not be decoded.
#[derive(Debug, Error)]
#[error("unreadable session row {id}: {source}")]
pub struct UnreadableRow {
    pub id: SessionId,
    #[source]
    pub source: BackendError,
}

/// One row of a multi-row read. A bad row never hides the others.
pub type StoredRow = Result<PersistedSession, UnreadableRow>;

/// What the multiplexer knows about a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerSession {
    /// Name of the session inside the multiplexer.
    pub external_name: String,
}

/// Events emitted by the multiplexer registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MultiplexerEvent {
    /// A session that outlived the previous daemon was adopted.
    Recovered { session_id: SessionId },
    /// A tracked session disappeared without us killing it.
    Killed { session_id: SessionId },
}

/// Events emitted by the process backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// Output read from a session's PTY.
    Data { session_id: SessionId, data: Vec<u8> },
    /// A session's process handle exited.
    Exit { session_id: SessionId, exit_code: i32 },
}

/// Scrollback snapshot handed to reconnecting clients.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub data: Vec<u8>,
    /// Whether older output was dropped to stay within the buffer cap.
    pub truncated: bool,
}

impl Snapshot {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Source of truth for session metadata across restarts.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn insert(&self, session: &PersistedSession) -> BackendResult<()>;
    async fn update_status(&self, id: &str, status: SessionStatus) -> BackendResult<()>;
    async fn update_last_active(&self, id: &str) -> BackendResult<()>;
    async fn update_external_name(&self, id: &str, name: Option<&str>) -> BackendResult<()>;
    async fn get_by_id(&self, id: &str) -> BackendResult<Option<PersistedSession>>;
    /// All sessions whose status is not terminated, each decoded on its own.
    async fn get_all_active(&self) -> BackendResult<Vec<StoredRow>>;
}

/// Tracks sessions kept alive by the external multiplexer.
#[async_trait]
pub trait MultiplexerRegistry: Send + Sync {
    async fn initialize(&self) -> BackendResult<()>;
    async fn session_exists(&self, id: &str) -> BackendResult<bool>;
    async fn get_session(&self, id: &str) -> BackendResult<Option<MultiplexerSession>>;
    async fn update_last_active(&self, id: &str);
    async fn shutdown(&self);
    fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent>;
}

/// Owns live process handles and their attachment to the multiplexer.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    async fn create(&self, id: &str, config: &SpawnConfig) -> BackendResult<()>;
    /// Reattaches to a surviving multiplexer session. Returns false on failure.
    async fn reconnect(&self, id: &str, config: &SpawnConfig) -> bool;
    /// Returns false when there is no live handle to write to.
    async fn write(&self, id: &str, data: &[u8]) -> bool;
    async fn resize(&self, id: &str, cols: u16, rows: u16) -> bool;
    fn is_running(&self, id: &str) -> bool;
    fn is_multiplexer_backed(&self, id: &str) -> bool;
    async fn terminate(&self, id: &str);
    async fn shutdown(&self);
    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent>;
}

/// Per-session scrollback.
#[async_trait]
pub trait BufferStore: Send + Sync {
    fn create(&self, id: &str);
    fn append(&self, id: &str, data: &[u8]);
    fn mark_disconnect(&self, id: &str);
    fn clear_disconnect(&self, id: &str);
    fn has(&self, id: &str) -> bool;
    /// `full` returns everything retained; otherwise only what arrived since
    /// the disconnect marker.
    fn snapshot(&self, id: &str, full: bool) -> Option<Snapshot>;
    /// Reloads spilled scrollback from disk.
    async fn load(&self, id: &str) -> BackendResult<()>;
    async fn delete(&self, id: &str);
    async fn flush_all(&self) -> BackendResult<()>;
    async fn shutdown(&self);
}

/// Derives a coarse activity status from output.
pub trait ActivityDetector: Send + Sync {
    /// Returns the new status when it changed.
    fn detect(&self, id: &str, data: &[u8]) -> Option<ActivityStatus>;
    fn clear_session(&self, id: &str);
    fn shutdown(&self);
}
