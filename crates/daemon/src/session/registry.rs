//! In-memory session registry.
//!
//! Holds every session record the engine knows about plus the bidirectional
//! client↔session index. Records are never removed one by one: termination
//! is a status change, and only [`SessionRegistry::clear`] empties the map.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use dashmap::DashMap;

use super::types::{now_millis, ClientId, SessionId, SessionRecord, SessionStatus};

/// Both directions of the ownership index, kept under one lock so they can
/// never disagree.
#[derive(Debug, Default)]
struct ClientIndex {
    by_client: HashMap<ClientId, HashSet<SessionId>>,
    by_session: HashMap<SessionId, ClientId>,
}

impl ClientIndex {
    fn unlink_session(&mut self, session_id: &str) -> Option<ClientId> {
        let owner = self.by_session.remove(session_id)?;
        if let Some(set) = self.by_client.get_mut(&owner) {
            set.remove(session_id);
            if set.is_empty() {
                self.by_client.remove(&owner);
            }
        }
        Some(owner)
    }
}

/// Session records and client ownership.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, SessionRecord>,
    index: Mutex<ClientIndex>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn index(&self) -> MutexGuard<'_, ClientIndex> {
        self.index.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Inserts or replaces a record.
    pub fn insert(&self, record: SessionRecord) {
        self.sessions.insert(record.id.clone(), record);
    }

    /// Returns a copy of a record.
    pub fn get(&self, id: &str) -> Option<SessionRecord> {
        self.sessions.get(id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    /// Returns the current status of a session.
    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.sessions.get(id).map(|entry| entry.status)
    }

    /// Returns copies of all records.
    pub fn all(&self) -> Vec<SessionRecord> {
        self.sessions.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Returns copies of all records belonging to a project.
    pub fn by_project(&self, project_id: &str) -> Vec<SessionRecord> {
        self.sessions
            .iter()
            .filter(|entry| entry.project_id == project_id)
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Returns the ids of sessions in the given status.
    pub fn ids_with_status(&self, status: SessionStatus) -> Vec<SessionId> {
        self.sessions
            .iter()
            .filter(|entry| entry.status == status)
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Applies `f` to a record in place.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut SessionRecord) -> R) -> Option<R> {
        self.sessions.get_mut(id).map(|mut entry| f(entry.value_mut()))
    }

    /// Moves a session to `next`, bumping `updated_at`.
    ///
    /// Returns the previous status, or `None` when the session is unknown or
    /// the state machine forbids the move (anything out of `Terminated`).
    pub fn set_status(&self, id: &str, next: SessionStatus) -> Option<SessionStatus> {
        let mut entry = self.sessions.get_mut(id)?;
        let previous = entry.status;
        if !previous.can_transition_to(next) {
            return None;
        }
        entry.status = next;
        entry.updated_at = now_millis();
        Some(previous)
    }

    /// Makes `client_id` the owner of `session_id`, taking it from any
    /// previous owner. Returns the previous owner if it was another client.
    pub fn assign_client(&self, client_id: &str, session_id: &str) -> Option<ClientId> {
        let mut index = self.index();
        let previous = index
            .unlink_session(session_id)
            .filter(|owner| owner != client_id);
        index
            .by_client
            .entry(client_id.to_string())
            .or_default()
            .insert(session_id.to_string());
        index
            .by_session
            .insert(session_id.to_string(), client_id.to_string());
        previous
    }

    /// Drops every session owned by a client and returns their ids.
    pub fn release_client(&self, client_id: &str) -> Vec<SessionId> {
        let mut index = self.index();
        let sessions = index.by_client.remove(client_id).unwrap_or_default();
        for session_id in &sessions {
            index.by_session.remove(session_id);
        }
        sessions.into_iter().collect()
    }

    /// Removes a session from its owner, if any.
    pub fn release_session(&self, session_id: &str) -> Option<ClientId> {
        self.index().unlink_session(session_id)
    }

    /// Returns the current owner of a session.
    pub fn client_of(&self, session_id: &str) -> Option<ClientId> {
        self.index().by_session.get(session_id).cloned()
    }

    /// Returns the sessions a client currently owns.
    pub fn sessions_of(&self, client_id: &str) -> Vec<SessionId> {
        self.index()
            .by_client
            .get(client_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Empties the registry. Only used at component shutdown.
    pub fn clear(&self) {
        self.sessions.clear();
        let mut index = self.index();
        index.by_client.clear();
        index.by_session.clear();
    }

    #[cfg(test)]
    fn index_is_consistent(&self) -> bool {
        let index = self.index();
        let forward = index.by_client.iter().all(|(client, set)| {
            !set.is_empty()
                && set
                    .iter()
                    .all(|session| index.by_session.get(session) == Some(client))
        });
        let backward = index.by_session.iter().all(|(session, client)| {
            index
                .by_client
                .get(client)
                .is_some_and(|set| set.contains(session))
        });
        forward && backward
    }
}
