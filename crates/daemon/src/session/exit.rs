//! Process exit handling and the stale-session reaper.
//!
//! A process handle exiting does not mean the shell is gone: the
//! multiplexer may still be running it. Only the multiplexer can tell the
//! two apart, so every exit is checked against it before any transition.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::events::DisconnectReason;
use super::manager::SessionManager;
use super::types::{now_millis, SessionId, SessionStatus};
use crate::backend::BackendResult;

/// What an exit notification led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Unknown or already terminated session; nothing changed.
    Ignored,
    /// The multiplexer still has the shell; the session is detached.
    Detached,
    /// The shell is gone; the session is terminated with the exit code.
    Terminated,
}

impl SessionManager {
    /// Entry point for process exit notifications.
    ///
    /// Returns immediately; the multiplexer round-trip runs on a detached
    /// task whose failures can only be logged.
    pub fn on_process_exit(self: &Arc<Self>, session_id: SessionId, exit_code: i32) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = manager.handle_process_exit(&session_id, exit_code).await {
                error!(
                    session_id = %session_id,
                    exit_code = exit_code,
                    error = %e,
                    "Could not determine whether exited session survived, leaving status unchanged"
                );
            }
        });
    }

    /// Decides what a process exit means for the session.
    ///
    /// A multiplexer query failure is returned as an error and no transition
    /// is made.
    pub async fn handle_process_exit(
        &self,
        id: &str,
        exit_code: i32,
    ) -> BackendResult<ExitOutcome> {
        let _guard = self.lock_session(id).await;

        let Some(status) = self.registry.status(id) else {
            debug!(session_id = %id, exit_code = exit_code, "Exit for unknown session");
            return Ok(ExitOutcome::Ignored);
        };
        if status.is_terminated() {
            return Ok(ExitOutcome::Ignored);
        }
        self.settle_exit_locked(id, Some(exit_code)).await
    }

    /// Runs exit handling for active sessions whose process handle is gone.
    ///
    /// Used after exit notifications may have been dropped. The exit code of
    /// a missed exit is unknown, so a terminated session records none.
    pub async fn recheck_dead_handles(&self) -> Vec<(SessionId, ExitOutcome)> {
        let mut settled = Vec::new();

        for id in self.active_ids() {
            let _guard = self.lock_session(&id).await;
            if self.registry.status(&id) != Some(SessionStatus::Active)
                || self.process.is_running(&id)
            {
                continue;
            }
            match self.settle_exit_locked(&id, None).await {
                Ok(outcome) => settled.push((id, outcome)),
                Err(e) => {
                    warn!(session_id = %id, error = %e, "Could not recheck session with dead handle");
                }
            }
        }

        if !settled.is_empty() {
            info!(count = settled.len(), "Settled sessions with missed exits");
        }
        settled
    }

    async fn settle_exit_locked(
        &self,
        id: &str,
        exit_code: Option<i32>,
    ) -> BackendResult<ExitOutcome> {
        if self.multiplexer.session_exists(id).await? {
            info!(session_id = %id, "Process handle exited but multiplexer session survives");
            self.disconnect_locked(id, DisconnectReason::ProcessExited)
                .await;
            Ok(ExitOutcome::Detached)
        } else {
            self.terminate_locked(id, exit_code).await;
            Ok(ExitOutcome::Terminated)
        }
    }

    /// Handles a multiplexer session that was killed behind our back.
    pub async fn on_multiplexer_killed(&self, id: &str) -> bool {
        let _guard = self.lock_session(id).await;
        let terminated = self.terminate_locked(id, None).await;
        if terminated {
            warn!(session_id = %id, "Multiplexer session was killed externally");
        }
        terminated
    }

    /// Starts the periodic reaper. Does nothing if it is already running.
    pub fn start_reaper(self: &Arc<Self>) {
        let token = {
            let mut slot = self
                .reaper
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_some() {
                warn!("Session reaper already running");
                return;
            }
            let token = CancellationToken::new();
            *slot = Some(token.clone());
            token
        };

        let manager = Arc::downgrade(self);
        let period = self.settings.reap_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let Some(manager) = manager.upgrade() else { break };
                        let reaped = manager.reap_stale(now_millis()).await;
                        if !reaped.is_empty() {
                            info!(count = reaped.len(), "Reaped stale sessions");
                        }
                    }
                }
            }
            debug!("Session reaper stopped");
        });
        debug!(interval_secs = period.as_secs(), "Started session reaper");
    }

    /// Stops the periodic reaper.
    pub fn stop_reaper(&self) {
        let token = self
            .reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(token) = token {
            token.cancel();
        }
    }

    /// Whether the periodic reaper is running.
    pub fn reaper_running(&self) -> bool {
        self.reaper
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// One reaper pass at time `now` (Unix milliseconds).
    ///
    /// Detached sessions whose last status change is older than the idle
    /// timeout go through the regular termination path.
    pub async fn reap_stale(&self, now: i64) -> Vec<SessionId> {
        let threshold = self.settings.idle_timeout.as_millis() as i64;
        let is_stale = |status: SessionStatus, updated_at: i64| {
            status.is_detached() && now - updated_at > threshold
        };

        let candidates: Vec<SessionId> = self
            .registry
            .all()
            .into_iter()
            .filter(|r| is_stale(r.status, r.updated_at))
            .map(|r| r.id)
            .collect();

        let mut reaped = Vec::new();
        for id in candidates {
            let _guard = self.lock_session(&id).await;
            // Re-check: a reconnect may have revived it in the meantime.
            let still_stale = self
                .registry
                .get(&id)
                .is_some_and(|r| is_stale(r.status, r.updated_at));
            if still_stale && self.terminate_locked(&id, None).await {
                debug!(session_id = %id, "Reaped idle session");
                reaped.push(id);
            }
        }
        reaped
    }
}
