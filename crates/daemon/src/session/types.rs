//! Session records and the lifecycle state machine.
//!
//! A [`SessionRecord`] is the in-memory view of a session owned by the
//! lifecycle engine. [`PersistedSession`] is the durable row it is rebuilt
//! from after a restart or a page reload.

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::backend::BackendError;

/// Unique identifier for a session.
pub type SessionId = String;

/// Identifier of a connected dashboard client.
pub type ClientId = String;

/// Identifier of the project a session belongs to.
pub type ProjectId = String;

/// Returns the current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// A client is attached and the process handle is live.
    Active,
    /// No client is reading, but the backing shell may still be alive.
    Disconnected,
    /// Explicitly paused. Reaped and reconnected like `Disconnected`.
    Paused,
    /// Gone for good. Absorbing.
    Terminated,
}

impl SessionStatus {
    /// Returns the lowercase name used in storage and events.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Paused => "paused",
            SessionStatus::Terminated => "terminated",
        }
    }

    /// Whether the state machine allows moving from `self` to `next`.
    ///
    /// Re-entering the current state is allowed (a reconnect of an active
    /// session refreshes it), except for `Terminated`, which nothing leaves.
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        match (self, next) {
            (SessionStatus::Terminated, _) => false,
            (_, _) => true,
        }
    }

    /// Whether the reaper considers sessions in this state.
    pub fn is_detached(self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Paused)
    }

    /// Whether the session is over.
    pub fn is_terminated(self) -> bool {
        self == SessionStatus::Terminated
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionStatus {
    type Err = BackendError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(SessionStatus::Active),
            "disconnected" => Ok(SessionStatus::Disconnected),
            "paused" => Ok(SessionStatus::Paused),
            "terminated" => Ok(SessionStatus::Terminated),
            other => Err(BackendError::Store(format!("unknown session status: {other}"))),
        }
    }
}

/// Coarse activity derived from a session's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityStatus {
    #[default]
    Idle,
    Busy,
    Waiting,
    Error,
}

impl fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActivityStatus::Idle => "idle",
            ActivityStatus::Busy => "busy",
            ActivityStatus::Waiting => "waiting",
            ActivityStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Configuration of a terminal session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalConfig {
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
}

/// What kind of session this is, with its kind-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SessionKind {
    Terminal(TerminalConfig),
}

impl SessionKind {
    /// Name stored in the durable `kind` column.
    pub fn name(&self) -> &'static str {
        match self {
            SessionKind::Terminal(_) => "terminal",
        }
    }
}

/// Everything the process backend needs to (re)attach a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnConfig {
    pub shell: String,
    pub cwd: String,
    pub cols: u16,
    pub rows: u16,
    pub project_id: ProjectId,
}

/// Request to create a session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateSession {
    /// Caller-chosen id. A uuid is generated when absent.
    pub id: Option<SessionId>,
    pub project_id: ProjectId,
    /// Shell to run. Falls back to the configured default.
    pub shell: Option<String>,
    /// Working directory. Falls back to the configured default.
    pub cwd: Option<String>,
    pub cols: u16,
    pub rows: u16,
    pub title: Option<String>,
}

/// In-memory session record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub kind: SessionKind,
    pub status: SessionStatus,
    pub project_id: ProjectId,
    pub activity: ActivityStatus,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_active_at: i64,
    pub exit_code: Option<i32>,
}

impl SessionRecord {
    /// Builds the backend attach parameters for this session.
    pub fn spawn_config(&self) -> SpawnConfig {
        match &self.kind {
            SessionKind::Terminal(terminal) => SpawnConfig {
                shell: terminal.shell.clone(),
                cwd: terminal.cwd.clone(),
                cols: terminal.cols,
                rows: terminal.rows,
                project_id: self.project_id.clone(),
            },
        }
    }

    /// Records new terminal dimensions.
    pub fn set_size(&mut self, cols: u16, rows: u16) {
        match &mut self.kind {
            SessionKind::Terminal(terminal) => {
                terminal.cols = cols;
                terminal.rows = rows;
            }
        }
    }

    /// Current terminal dimensions.
    pub fn size(&self) -> (u16, u16) {
        match &self.kind {
            SessionKind::Terminal(terminal) => (terminal.cols, terminal.rows),
        }
    }
}

/// Durable row backing a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedSession {
    pub id: SessionId,
    pub kind: String,
    pub project_id: ProjectId,
    pub status: SessionStatus,
    /// JSON-encoded [`SessionKind`].
    pub config: String,
    /// Name of the backing tmux session, once known.
    pub external_name: Option<String>,
    pub title: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_active_at: i64,
}

impl PersistedSession {
    /// Builds the durable row for a freshly created session.
    pub fn from_record(record: &SessionRecord) -> Result<Self, BackendError> {
        Ok(Self {
            id: record.id.clone(),
            kind: record.kind.name().to_string(),
            project_id: record.project_id.clone(),
            status: record.status,
            config: serde_json::to_string(&record.kind)?,
            external_name: None,
            title: record.title.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
            last_active_at: record.last_active_at,
        })
    }

    /// Reconstructs an in-memory record with the given status.
    ///
    /// Fails when the stored configuration blob cannot be decoded.
    pub fn to_record(&self, status: SessionStatus) -> Result<SessionRecord, BackendError> {
        let kind: SessionKind = serde_json::from_str(&self.config)?;
        if kind.name() != self.kind {
            return Err(BackendError::Store(format!(
                "session {} is stored as kind {:?} but its config decodes as {:?}",
                self.id,
                self.kind,
                kind.name()
            )));
        }

        Ok(SessionRecord {
            id: self.id.clone(),
            kind,
            status,
            project_id: self.project_id.clone(),
            activity: ActivityStatus::Idle,
            title: self.title.clone(),
            created_at: self.created_at,
            updated_at: now_millis(),
            last_active_at: self.last_active_at,
            exit_code: None,
        })
    }
}
