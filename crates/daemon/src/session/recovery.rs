//! Startup recovery and client reconnection.
//!
//! Both protocols rebuild in-memory records from durable rows, and both
//! consult the multiplexer before trusting anything the store says: a row
//! only describes a live session if the multiplexer still has it.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::events::SessionEvent;
use super::manager::SessionManager;
use super::types::{
    now_millis, ActivityStatus, PersistedSession, SessionId, SessionRecord, SessionStatus,
};
use crate::backend::BackendResult;

/// What startup recovery did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Sessions whose multiplexer session survived; now `Disconnected`.
    pub recovered: Vec<SessionId>,
    /// Sessions whose multiplexer session is gone; marked terminated.
    pub terminated: Vec<SessionId>,
    /// Rows that could not be processed and were skipped.
    pub failed: Vec<SessionId>,
}

/// Scrollback returned to a reconnecting client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BufferReplay {
    pub session_id: SessionId,
    pub data: Vec<u8>,
    pub truncated: bool,
}

/// Status of a reattached session as reported back to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusChange {
    pub session_id: SessionId,
    pub status: SessionStatus,
    pub activity: ActivityStatus,
}

/// Result of a reconnect request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconnectOutcome {
    pub active: Vec<SessionId>,
    pub terminated: Vec<SessionId>,
    pub buffers: Vec<BufferReplay>,
    pub status_changes: Vec<StatusChange>,
}

enum Reattach {
    Active {
        replay: Option<BufferReplay>,
        change: StatusChange,
    },
    Gone,
}

impl SessionManager {
    /// Initializes the multiplexer, recovers sessions that survived the last
    /// run and starts the reaper.
    pub async fn initialize(self: &Arc<Self>) -> BackendResult<RecoveryReport> {
        self.multiplexer.initialize().await?;
        let report = self.recover().await?;
        self.start_reaper();
        Ok(report)
    }

    /// Rebuilds the registry from durable rows.
    ///
    /// A row that fails (unreadable columns, bad configuration blob,
    /// multiplexer query error) is logged and skipped; it never stops the
    /// rest of the sweep.
    pub async fn recover(&self) -> BackendResult<RecoveryReport> {
        let rows = self.store.get_all_active().await?;
        let mut report = RecoveryReport::default();

        for row in rows {
            let row = match row {
                Ok(row) => row,
                Err(unreadable) => {
                    warn!(
                        session_id = %unreadable.id,
                        error = %unreadable.source,
                        "Skipping stored session that could not be read"
                    );
                    report.failed.push(unreadable.id);
                    continue;
                }
            };
            if row.status.is_terminated() || self.registry.contains(&row.id) {
                continue;
            }
            let id = row.id.clone();
            match self.recover_one(row).await {
                Ok(true) => report.recovered.push(id),
                Ok(false) => report.terminated.push(id),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Skipping session that could not be recovered");
                    report.failed.push(id);
                }
            }
        }

        info!(
            recovered = report.recovered.len(),
            terminated = report.terminated.len(),
            failed = report.failed.len(),
            "Session recovery complete"
        );
        Ok(report)
    }

    /// Returns true when the session was reconstructed, false when its
    /// multiplexer session is gone.
    async fn recover_one(&self, row: PersistedSession) -> BackendResult<bool> {
        let _guard = self.lock_session(&row.id).await;

        if !self.multiplexer.session_exists(&row.id).await? {
            info!(session_id = %row.id, "Multiplexer session gone, marking terminated");
            self.persist_status(&row.id, SessionStatus::Terminated).await;
            return Ok(false);
        }

        let record = row.to_record(SessionStatus::Disconnected)?;
        self.restore_buffer(&row.id).await;
        self.buffers.mark_disconnect(&row.id);
        self.registry.insert(record);
        self.persist_status(&row.id, SessionStatus::Disconnected).await;

        info!(session_id = %row.id, "Recovered session");
        Ok(true)
    }

    /// Allocates a buffer if needed and reloads any spilled scrollback.
    async fn restore_buffer(&self, id: &str) {
        if !self.buffers.has(id) {
            self.buffers.create(id);
        }
        if let Err(e) = self.buffers.load(id).await {
            debug!(session_id = %id, error = %e, "No spilled scrollback reloaded");
        }
    }

    /// Reattaches a client to the given sessions.
    ///
    /// Each id is handled on its own: one id failing never affects another.
    pub async fn reconnect(&self, client_id: &str, ids: &[SessionId]) -> ReconnectOutcome {
        let mut outcome = ReconnectOutcome::default();

        for id in ids {
            match self.reconnect_one(client_id, id).await {
                Reattach::Active { replay, change } => {
                    outcome.active.push(id.clone());
                    if let Some(replay) = replay {
                        outcome.buffers.push(replay);
                    }
                    outcome.status_changes.push(change);
                }
                Reattach::Gone => outcome.terminated.push(id.clone()),
            }
        }

        info!(
            client_id = %client_id,
            active = outcome.active.len(),
            terminated = outcome.terminated.len(),
            "Client reconnected"
        );
        outcome
    }

    /// Alias of [`SessionManager::reconnect`] matching the transport hook.
    pub async fn on_client_reconnect(
        &self,
        client_id: &str,
        ids: &[SessionId],
    ) -> ReconnectOutcome {
        self.reconnect(client_id, ids).await
    }

    async fn reconnect_one(&self, client_id: &str, id: &str) -> Reattach {
        let _guard = self.lock_session(id).await;

        let Some(record) = self.resolve(id).await else {
            debug!(session_id = %id, "Reconnect for unknown session");
            return Reattach::Gone;
        };
        if record.status.is_terminated() {
            return Reattach::Gone;
        }

        match self.multiplexer.session_exists(id).await {
            Ok(true) => {}
            Ok(false) => {
                info!(session_id = %id, "Multiplexer session gone on reconnect");
                self.terminate_locked(id, None).await;
                return Reattach::Gone;
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Multiplexer check failed on reconnect");
                return Reattach::Gone;
            }
        }

        if !self.process.reconnect(id, &record.spawn_config()).await {
            warn!(session_id = %id, "Process backend could not reattach session");
            return Reattach::Gone;
        }

        if self.registry.set_status(id, SessionStatus::Active).is_none() {
            return Reattach::Gone;
        }
        self.registry.update(id, |r| r.last_active_at = now_millis());

        if !self.buffers.has(id) {
            self.restore_buffer(id).await;
        }
        // The client's renderer starts empty after a reload, so it gets the
        // whole scrollback rather than only what it missed.
        let replay = self
            .buffers
            .snapshot(id, true)
            .filter(|snapshot| !snapshot.is_empty())
            .map(|snapshot| BufferReplay {
                session_id: id.to_string(),
                data: snapshot.data,
                truncated: snapshot.truncated,
            });
        self.buffers.clear_disconnect(id);

        if let Some(previous) = self.registry.assign_client(client_id, id) {
            debug!(session_id = %id, previous_client = %previous, "Session ownership transferred");
        }

        self.persist_status(id, SessionStatus::Active).await;
        if let Err(e) = self.store.update_last_active(id).await {
            warn!(session_id = %id, error = %e, "Failed to persist last active time");
        }
        self.multiplexer.update_last_active(id).await;

        let activity = self
            .registry
            .get(id)
            .map(|r| r.activity)
            .unwrap_or_default();

        info!(session_id = %id, client_id = %client_id, "Session reconnected");
        self.events.emit(SessionEvent::Reconnected {
            session_id: id.to_string(),
            client_id: client_id.to_string(),
        });

        Reattach::Active {
            replay,
            change: StatusChange {
                session_id: id.to_string(),
                status: SessionStatus::Active,
                activity,
            },
        }
    }

    /// Finds a session in memory, or rebuilds it from its durable row.
    async fn resolve(&self, id: &str) -> Option<SessionRecord> {
        if let Some(record) = self.registry.get(id) {
            return Some(record);
        }

        match self.store.get_by_id(id).await {
            Ok(Some(row)) if !row.status.is_terminated() => {
                match row.to_record(SessionStatus::Disconnected) {
                    Ok(record) => {
                        self.registry.insert(record.clone());
                        Some(record)
                    }
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Stored session could not be decoded");
                        None
                    }
                }
            }
            Ok(_) => None,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to load stored session");
                None
            }
        }
    }
}
