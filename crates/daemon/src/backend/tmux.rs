//! tmux-backed multiplexer registry.
//!
//! Every dashboard session runs inside a tmux session named
//! `<prefix><session id>`. tmux keeps the shell alive when our PTY handle
//! goes away, including across daemon restarts; this registry is how the
//! daemon asks whether a given shell is still there.

use std::process::Output;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    BackendError, BackendResult, MultiplexerEvent, MultiplexerRegistry, MultiplexerSession,
};
use crate::session::{now_millis, SessionId};

/// Channel capacity for registry events.
const EVENT_CAPACITY: usize = 64;

/// tmux stderr fragments that mean "there is no server", not "tmux failed".
const NO_SERVER_MARKERS: &[&str] = &["no server running", "error connecting to"];

#[derive(Debug, Clone)]
struct TrackedSession {
    external_name: String,
    last_active: i64,
}

/// [`MultiplexerRegistry`] that shells out to the `tmux` binary.
pub struct TmuxRegistry {
    binary: String,
    prefix: String,
    tracked: DashMap<SessionId, TrackedSession>,
    event_tx: broadcast::Sender<MultiplexerEvent>,
}

impl TmuxRegistry {
    /// Creates a registry using the given tmux binary and session prefix.
    pub fn new(binary: impl Into<String>, prefix: impl Into<String>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            binary: binary.into(),
            prefix: prefix.into(),
            tracked: DashMap::new(),
            event_tx,
        }
    }

    /// Returns the tmux binary this registry runs.
    pub fn binary(&self) -> &str {
        &self.binary
    }

    /// Name of the tmux session backing a dashboard session.
    pub fn external_name(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    /// Target string matching the session name exactly.
    pub fn target(&self, id: &str) -> String {
        format!("={}", self.external_name(id))
    }

    /// Maps a tmux session name back to a dashboard session id.
    pub fn session_id_for(&self, external_name: &str) -> Option<SessionId> {
        external_name
            .strip_prefix(&self.prefix)
            .filter(|id| !id.is_empty())
            .map(str::to_string)
    }

    /// Starts tracking a session created by the process backend.
    pub fn track(&self, id: &str) {
        self.tracked.insert(
            id.to_string(),
            TrackedSession {
                external_name: self.external_name(id),
                last_active: now_millis(),
            },
        );
    }

    /// Whether the session is tracked.
    pub fn is_tracked(&self, id: &str) -> bool {
        self.tracked.contains_key(id)
    }

    /// Last activity recorded for a tracked session, in Unix milliseconds.
    pub fn last_active(&self, id: &str) -> Option<i64> {
        self.tracked.get(id).map(|t| t.last_active)
    }

    /// Kills the tmux session. It is untracked first so no `Killed` event
    /// is raised for a kill we asked for.
    pub async fn kill_session(&self, id: &str) -> BackendResult<()> {
        self.tracked.remove(id);
        let output = self.run(&["kill-session", "-t", &self.target(id)]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(session_id = %id, stderr = %stderr.trim(), "tmux kill-session reported failure");
        }
        Ok(())
    }

    /// Extracts our session ids from `tmux list-sessions` output.
    pub fn parse_session_list(&self, stdout: &str) -> Vec<SessionId> {
        stdout
            .lines()
            .map(str::trim)
            .filter_map(|name| self.session_id_for(name))
            .collect()
    }

    async fn list_sessions(&self) -> BackendResult<Vec<SessionId>> {
        let output = self
            .run(&["list-sessions", "-F", "#{session_name}"])
            .await?;
        if output.status.success() {
            return Ok(self.parse_session_list(&String::from_utf8_lossy(&output.stdout)));
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        if NO_SERVER_MARKERS.iter().any(|m| stderr.contains(m)) {
            return Ok(Vec::new());
        }
        Err(BackendError::Multiplexer(format!(
            "tmux list-sessions failed: {}",
            stderr.trim()
        )))
    }

    async fn run(&self, args: &[&str]) -> BackendResult<Output> {
        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|e| BackendError::Multiplexer(format!("failed to run {}: {e}", self.binary)))
    }
}

#[async_trait]
impl MultiplexerRegistry for TmuxRegistry {
    async fn initialize(&self) -> BackendResult<()> {
        let ids = self.list_sessions().await?;
        for id in &ids {
            self.track(id);
            let _ = self.event_tx.send(MultiplexerEvent::Recovered {
                session_id: id.clone(),
            });
        }
        info!(sessions = ids.len(), "tmux registry initialized");
        Ok(())
    }

    async fn session_exists(&self, id: &str) -> BackendResult<bool> {
        let output = self.run(&["has-session", "-t", &self.target(id)]).await?;
        if output.status.success() {
            return Ok(true);
        }

        if self.tracked.remove(id).is_some() {
            warn!(session_id = %id, "Tracked tmux session has disappeared");
            let _ = self.event_tx.send(MultiplexerEvent::Killed {
                session_id: id.to_string(),
            });
        }
        Ok(false)
    }

    async fn get_session(&self, id: &str) -> BackendResult<Option<MultiplexerSession>> {
        if let Some(tracked) = self.tracked.get(id) {
            return Ok(Some(MultiplexerSession {
                external_name: tracked.external_name.clone(),
            }));
        }

        if self.session_exists(id).await? {
            self.track(id);
            return Ok(Some(MultiplexerSession {
                external_name: self.external_name(id),
            }));
        }
        Ok(None)
    }

    async fn update_last_active(&self, id: &str) {
        if let Some(mut tracked) = self.tracked.get_mut(id) {
            tracked.last_active = now_millis();
        }
    }

    async fn shutdown(&self) {
        // tmux sessions outlive the daemon; only forget about them.
        self.tracked.clear();
        debug!("tmux registry shut down");
    }

    fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.event_tx.subscribe()
    }
}
