//! Session lifecycle engine.
//!
//! [`SessionManager`] owns the session registry and drives every status
//! transition. It talks to the outside world only through the collaborator
//! traits in [`crate::backend`], so each protocol can be exercised against
//! scripted collaborators in tests.
//!
//! The startup recovery and client reconnection protocols live in
//! `recovery.rs`; exit disambiguation and the stale-session reaper live in
//! `exit.rs`.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::error::SessionError;
use super::events::{DisconnectReason, SessionEvent, SessionEvents};
use super::registry::SessionRegistry;
use super::types::{
    now_millis, ActivityStatus, CreateSession, PersistedSession, SessionId, SessionKind,
    SessionRecord, SessionStatus, SpawnConfig, TerminalConfig,
};
use crate::backend::{
    ActivityDetector, BackendResult, BufferStore, DurableStore, MultiplexerRegistry,
    ProcessBackend,
};
use crate::config::SessionConfig;

/// Default reaper interval.
pub const DEFAULT_REAP_INTERVAL: Duration = Duration::from_secs(60);

/// Default idle time after which a detached session is reaped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default capacity of the session event channel.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Tunables of the lifecycle engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerSettings {
    /// Shell used when a create request names none.
    pub default_shell: String,
    /// Working directory used when a create request names none.
    pub default_cwd: String,
    pub reap_interval: Duration,
    pub idle_timeout: Duration,
    pub event_capacity: usize,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            default_shell: std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string()),
            default_cwd: dirs::home_dir()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "/".to_string()),
            reap_interval: DEFAULT_REAP_INTERVAL,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl From<&SessionConfig> for ManagerSettings {
    fn from(config: &SessionConfig) -> Self {
        let defaults = ManagerSettings::default();
        Self {
            default_shell: config.default_shell.clone(),
            default_cwd: config
                .default_cwd
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or(defaults.default_cwd),
            reap_interval: Duration::from_secs(config.reap_interval_secs),
            idle_timeout: Duration::from_secs(config.idle_timeout_secs),
            event_capacity: config.event_capacity,
        }
    }
}

/// The external services the engine depends on.
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn DurableStore>,
    pub multiplexer: Arc<dyn MultiplexerRegistry>,
    pub process: Arc<dyn ProcessBackend>,
    pub buffers: Arc<dyn BufferStore>,
    pub detector: Arc<dyn ActivityDetector>,
}

/// Lifecycle engine for dashboard sessions.
pub struct SessionManager {
    pub(super) settings: ManagerSettings,
    pub(super) store: Arc<dyn DurableStore>,
    pub(super) multiplexer: Arc<dyn MultiplexerRegistry>,
    pub(super) process: Arc<dyn ProcessBackend>,
    pub(super) buffers: Arc<dyn BufferStore>,
    pub(super) detector: Arc<dyn ActivityDetector>,
    pub(super) registry: SessionRegistry,
    /// Per-session ordering locks. Every status transition happens under one.
    locks: DashMap<SessionId, Arc<Mutex<()>>>,
    pub(super) events: SessionEvents,
    pub(super) reaper: std::sync::Mutex<Option<CancellationToken>>,
}

/// Held ordering lock of one session.
///
/// On release the map entry is dropped when no other task holds or waits on
/// it and the registry has no record for the id, so ids that never name a
/// session do not accumulate.
pub(super) struct SessionLock<'a> {
    manager: &'a SessionManager,
    id: SessionId,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for SessionLock<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let registry = &self.manager.registry;
        self.manager.locks.remove_if(&self.id, |id, lock| {
            Arc::strong_count(lock) == 1 && !registry.contains(id)
        });
    }
}

impl SessionManager {
    /// Creates a manager. Call [`SessionManager::initialize`] before use.
    pub fn new(collaborators: Collaborators, settings: ManagerSettings) -> Self {
        let events = SessionEvents::new(settings.event_capacity);
        Self {
            settings,
            store: collaborators.store,
            multiplexer: collaborators.multiplexer,
            process: collaborators.process,
            buffers: collaborators.buffers,
            detector: collaborators.detector,
            registry: SessionRegistry::new(),
            locks: DashMap::new(),
            events,
            reaper: std::sync::Mutex::new(None),
        }
    }

    /// Returns the engine settings.
    pub fn settings(&self) -> &ManagerSettings {
        &self.settings
    }

    /// Returns a receiver for session events.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// Returns the client that currently owns a session.
    pub fn client_of(&self, session_id: &str) -> Option<String> {
        self.registry.client_of(session_id)
    }

    /// Returns the sessions a client currently owns.
    pub fn sessions_of(&self, client_id: &str) -> Vec<SessionId> {
        self.registry.sessions_of(client_id)
    }

    /// Number of ordering locks currently allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Acquires the ordering lock of a session.
    pub(super) async fn lock_session(&self, id: &str) -> SessionLock<'_> {
        let lock = Arc::clone(
            self.locks
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        );
        SessionLock {
            manager: self,
            id: id.to_string(),
            guard: Some(lock.lock_owned().await),
        }
    }

    // =========================================================================
    // Creation
    // =========================================================================

    /// Creates a session for a client.
    ///
    /// The durable record is written before the process backend is asked for
    /// a process, so no live process ever exists without a record pointing
    /// at it. If the process cannot be started the record is marked
    /// terminated rather than deleted.
    pub async fn create(
        &self,
        client_id: &str,
        request: CreateSession,
    ) -> Result<SessionRecord, SessionError> {
        let id = request
            .id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let _guard = self.lock_session(&id).await;

        let now = now_millis();
        let record = SessionRecord {
            id: id.clone(),
            kind: SessionKind::Terminal(TerminalConfig {
                shell: request
                    .shell
                    .unwrap_or_else(|| self.settings.default_shell.clone()),
                cwd: request
                    .cwd
                    .unwrap_or_else(|| self.settings.default_cwd.clone()),
                cols: request.cols,
                rows: request.rows,
            }),
            status: SessionStatus::Active,
            project_id: request.project_id,
            activity: ActivityStatus::Idle,
            title: request.title,
            created_at: now,
            updated_at: now,
            last_active_at: now,
            exit_code: None,
        };

        let persisted = PersistedSession::from_record(&record).map_err(|source| {
            SessionError::Store {
                id: id.clone(),
                source,
            }
        })?;
        self.store
            .insert(&persisted)
            .await
            .map_err(|source| SessionError::Store {
                id: id.clone(),
                source,
            })?;

        if let Err(source) = self.process.create(&id, &record.spawn_config()).await {
            warn!(session_id = %id, error = %source, "Process creation failed, marking record terminated");
            if let Err(e) = self
                .store
                .update_status(&id, SessionStatus::Terminated)
                .await
            {
                warn!(session_id = %id, error = %e, "Failed to mark failed session terminated");
            }
            return Err(SessionError::Spawn { id, source });
        }

        match self.multiplexer.get_session(&id).await {
            Ok(Some(external)) => {
                if let Err(e) = self
                    .store
                    .update_external_name(&id, Some(&external.external_name))
                    .await
                {
                    warn!(session_id = %id, error = %e, "Failed to persist multiplexer session name");
                }
            }
            Ok(None) => debug!(session_id = %id, "Session is not multiplexer-backed"),
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to look up multiplexer session");
            }
        }

        self.buffers.create(&id);
        self.registry.insert(record.clone());
        self.registry.assign_client(client_id, &id);

        let (cols, rows) = record.size();
        info!(
            session_id = %id,
            client_id = %client_id,
            project_id = %record.project_id,
            cols = cols,
            rows = rows,
            "Created new session"
        );

        self.events.emit(SessionEvent::Created {
            session: record.clone(),
            client_id: client_id.to_string(),
        });

        Ok(record)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Gets a session record.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.registry.get(id)
    }

    /// Lists every known session, terminated ones included.
    pub fn get_all(&self) -> Vec<SessionRecord> {
        self.registry.all()
    }

    /// Lists the sessions of a project.
    pub fn get_by_project(&self, project_id: &str) -> Vec<SessionRecord> {
        self.registry.by_project(project_id)
    }

    /// Ids of sessions that currently have a client attached.
    pub fn active_ids(&self) -> Vec<SessionId> {
        self.registry.ids_with_status(SessionStatus::Active)
    }

    // =========================================================================
    // Client I/O
    // =========================================================================

    /// Writes input to a session.
    ///
    /// If the process handle is gone the session drops to `Disconnected`
    /// before the error is returned, so later reads see the real state.
    pub async fn write(&self, id: &str, data: &[u8]) -> Result<(), SessionError> {
        self.ensure_live(id)?;

        if self.process.write(id, data).await {
            self.registry.update(id, |r| r.last_active_at = now_millis());
            self.multiplexer.update_last_active(id).await;
            return Ok(());
        }

        let _guard = self.lock_session(id).await;
        self.ensure_live(id)?;
        warn!(session_id = %id, "Write failed, process handle is gone");
        self.disconnect_locked(id, DisconnectReason::ProcessUnavailable)
            .await;
        Err(SessionError::ProcessUnavailable(id.to_string()))
    }

    /// Resizes a session's terminal.
    ///
    /// On failure the multiplexer decides the outcome: a surviving session
    /// becomes `Disconnected`, a vanished one is terminated.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        self.ensure_live(id)?;

        if self.process.resize(id, cols, rows).await {
            self.registry.update(id, |r| r.set_size(cols, rows));
            debug!(session_id = %id, cols = cols, rows = rows, "Resized session");
            return Ok(());
        }

        let _guard = self.lock_session(id).await;
        self.ensure_live(id)?;
        match self.multiplexer.session_exists(id).await {
            Ok(true) => {
                self.disconnect_locked(id, DisconnectReason::ProcessUnavailable)
                    .await;
                Err(SessionError::ProcessUnavailable(id.to_string()))
            }
            Ok(false) => {
                info!(session_id = %id, "Resize found multiplexer session gone");
                self.terminate_locked(id, None).await;
                Err(SessionError::AlreadyTerminated(id.to_string()))
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Resize failed and multiplexer check failed");
                Err(SessionError::ProcessUnavailable(id.to_string()))
            }
        }
    }

    /// Feeds process output into the session's buffer and the activity
    /// detector, and forwards it to subscribers.
    pub fn handle_output(&self, id: &str, data: &[u8]) {
        match self.registry.status(id) {
            None | Some(SessionStatus::Terminated) => {
                trace!(session_id = %id, bytes = data.len(), "Dropping output for inactive session");
                return;
            }
            Some(_) => {}
        }

        self.buffers.append(id, data);

        if let Some(activity) = self.detector.detect(id, data) {
            self.registry.update(id, |r| r.activity = activity);
            debug!(session_id = %id, activity = %activity, "Activity changed");
            self.events.emit(SessionEvent::StatusChange {
                session_id: id.to_string(),
                activity,
            });
        }

        self.events.emit(SessionEvent::Output {
            session_id: id.to_string(),
            data: data.to_vec(),
        });
    }

    // =========================================================================
    // Disconnect and termination
    // =========================================================================

    /// Handles a client going away. Its sessions keep running, detached.
    ///
    /// Returns the ids that moved to `Disconnected`.
    pub async fn on_client_disconnect(&self, client_id: &str) -> Vec<SessionId> {
        let owned = self.registry.release_client(client_id);
        let mut disconnected = Vec::with_capacity(owned.len());

        for id in owned {
            let _guard = self.lock_session(&id).await;
            // A reconnect may have claimed the session while we waited.
            if self.registry.client_of(&id).is_some() {
                debug!(session_id = %id, "Session was claimed by another client, leaving it attached");
                continue;
            }
            if self
                .disconnect_locked(&id, DisconnectReason::ClientLeft)
                .await
            {
                disconnected.push(id);
            }
        }

        info!(
            client_id = %client_id,
            sessions = disconnected.len(),
            "Client disconnected"
        );
        disconnected
    }

    /// Terminates a session.
    ///
    /// Unknown and already terminated sessions are left alone. Returns
    /// whether this call terminated the session.
    pub async fn terminate(&self, id: &str) -> bool {
        let _guard = self.lock_session(id).await;
        self.terminate_locked(id, None).await
    }

    /// Terminates every live session of a project.
    pub async fn terminate_project(&self, project_id: &str) -> Vec<SessionId> {
        let mut terminated = Vec::new();
        for record in self.registry.by_project(project_id) {
            if record.status.is_terminated() {
                continue;
            }
            if self.terminate(&record.id).await {
                terminated.push(record.id);
            }
        }
        info!(project_id = %project_id, count = terminated.len(), "Terminated project sessions");
        terminated
    }

    /// Moves an `Active` session to `Disconnected`. Caller holds the lock.
    pub(super) async fn disconnect_locked(&self, id: &str, reason: DisconnectReason) -> bool {
        if self.registry.status(id) != Some(SessionStatus::Active) {
            return false;
        }
        if self
            .registry
            .set_status(id, SessionStatus::Disconnected)
            .is_none()
        {
            return false;
        }

        self.buffers.mark_disconnect(id);
        self.persist_status(id, SessionStatus::Disconnected).await;

        info!(session_id = %id, reason = ?reason, "Session disconnected");
        self.events.emit(SessionEvent::Disconnected {
            session_id: id.to_string(),
            reason,
        });
        true
    }

    /// The single termination path: user terminate, reaper, vanished
    /// multiplexer session and confirmed process exit all end here.
    /// Caller holds the lock.
    pub(super) async fn terminate_locked(&self, id: &str, exit_code: Option<i32>) -> bool {
        match self.registry.status(id) {
            None | Some(SessionStatus::Terminated) => return false,
            Some(_) => {}
        }

        self.process.terminate(id).await;

        let Some(previous) = self.registry.set_status(id, SessionStatus::Terminated) else {
            return false;
        };
        self.registry.update(id, |r| r.exit_code = exit_code);
        self.registry.release_session(id);
        self.buffers.delete(id).await;
        self.detector.clear_session(id);
        self.persist_status(id, SessionStatus::Terminated).await;

        info!(
            session_id = %id,
            previous = %previous,
            exit_code = ?exit_code,
            "Session terminated"
        );
        self.events.emit(SessionEvent::Terminated {
            session_id: id.to_string(),
            exit_code,
        });
        true
    }

    /// Best-effort durable status update.
    pub(super) async fn persist_status(&self, id: &str, status: SessionStatus) {
        if let Err(e) = self.store.update_status(id, status).await {
            warn!(session_id = %id, status = %status, error = %e, "Failed to persist session status");
        }
    }

    fn ensure_live(&self, id: &str) -> Result<(), SessionError> {
        match self.registry.status(id) {
            None => Err(SessionError::NotFound(id.to_string())),
            Some(SessionStatus::Terminated) => {
                Err(SessionError::AlreadyTerminated(id.to_string()))
            }
            Some(_) => Ok(()),
        }
    }

    /// Returns the attach parameters of a session, if it is known.
    pub fn spawn_config(&self, id: &str) -> Option<SpawnConfig> {
        self.registry.get(id).map(|r| r.spawn_config())
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Spills every buffer to disk.
    pub async fn flush_all(&self) -> BackendResult<()> {
        self.buffers.flush_all().await
    }

    /// Stops the reaper, spills buffers and releases every collaborator.
    ///
    /// Sessions are not terminated: their multiplexer sessions keep running
    /// and are picked up again by the next startup recovery.
    pub async fn shutdown(&self) {
        self.stop_reaper();

        if let Err(e) = self.flush_all().await {
            warn!(error = %e, "Failed to flush buffers during shutdown");
        }
        self.buffers.shutdown().await;
        self.detector.shutdown();
        self.process.shutdown().await;
        self.multiplexer.shutdown().await;

        let count = self.registry.len();
        self.registry.clear();
        self.locks.clear();
        info!(sessions = count, "Session manager shut down");
    }
}
