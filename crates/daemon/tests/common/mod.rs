//! Scripted collaborators shared by the integration tests.
//!
//! Every mock appends `"<component>.<call>:<session id>"` to a shared call
//! log so tests can assert on ordering across collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;
use tokio::sync::broadcast;

use termdash_daemon::backend::{
    BackendError, BackendResult, DurableStore, MultiplexerEvent, MultiplexerRegistry,
    MultiplexerSession, PatternDetector, ProcessBackend, ProcessEvent, ScrollbackStore, StoredRow,
};
use termdash_daemon::session::{
    now_millis, Collaborators, CreateSession, ManagerSettings, PersistedSession, SessionEvent,
    SessionId, SessionManager, SessionStatus, SpawnConfig,
};

pub type CallLog = Arc<Mutex<Vec<String>>>;

fn record(log: &CallLog, entry: String) {
    log.lock().unwrap().push(entry);
}

// ============================================================================
// Durable store
// ============================================================================

pub struct MockStore {
    log: CallLog,
    rows: Mutex<HashMap<SessionId, PersistedSession>>,
    pub fail_insert: AtomicBool,
}

impl MockStore {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            rows: Mutex::new(HashMap::new()),
            fail_insert: AtomicBool::new(false),
        }
    }

    pub fn row(&self, id: &str) -> Option<PersistedSession> {
        self.rows.lock().unwrap().get(id).cloned()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.row(id).map(|r| r.status)
    }

    pub fn put(&self, row: PersistedSession) {
        self.rows.lock().unwrap().insert(row.id.clone(), row);
    }
}

#[async_trait]
impl DurableStore for MockStore {
    async fn insert(&self, session: &PersistedSession) -> BackendResult<()> {
        record(&self.log, format!("store.insert:{}", session.id));
        if self.fail_insert.load(Ordering::SeqCst) {
            return Err(BackendError::Store("insert refused".to_string()));
        }
        let mut rows = self.rows.lock().unwrap();
        if rows.contains_key(&session.id) {
            return Err(BackendError::Store("duplicate id".to_string()));
        }
        rows.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> BackendResult<()> {
        record(&self.log, format!("store.update_status:{id}:{status}"));
        let mut rows = self.rows.lock().unwrap();
        let row = rows
            .get_mut(id)
            .ok_or_else(|| BackendError::Store("no such session".to_string()))?;
        row.status = status;
        row.updated_at = now_millis();
        Ok(())
    }

    async fn update_last_active(&self, id: &str) -> BackendResult<()> {
        record(&self.log, format!("store.update_last_active:{id}"));
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.last_active_at = now_millis();
        }
        Ok(())
    }

    async fn update_external_name(&self, id: &str, name: Option<&str>) -> BackendResult<()> {
        record(&self.log, format!("store.update_external_name:{id}"));
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.external_name = name.map(str::to_string);
        }
        Ok(())
    }

    async fn get_by_id(&self, id: &str) -> BackendResult<Option<PersistedSession>> {
        Ok(self.row(id))
    }

    async fn get_all_active(&self) -> BackendResult<Vec<StoredRow>> {
        let mut rows: Vec<_> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|r| !r.status.is_terminated())
            .cloned()
            .collect();
        rows.sort_by_key(|r| r.created_at);
        Ok(rows.into_iter().map(Ok).collect())
    }
}

// ============================================================================
// Multiplexer
// ============================================================================

pub struct MockMultiplexer {
    log: CallLog,
    alive: Mutex<HashSet<SessionId>>,
    pub failing: AtomicBool,
    tx: broadcast::Sender<MultiplexerEvent>,
}

impl MockMultiplexer {
    pub fn new(log: CallLog) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            log,
            alive: Mutex::new(HashSet::new()),
            failing: AtomicBool::new(false),
            tx,
        }
    }

    pub fn set_alive(&self, id: &str, alive: bool) {
        let mut set = self.alive.lock().unwrap();
        if alive {
            set.insert(id.to_string());
        } else {
            set.remove(id);
        }
    }

    pub fn is_alive(&self, id: &str) -> bool {
        self.alive.lock().unwrap().contains(id)
    }

    /// Simulates the tmux session being killed from outside the daemon.
    pub fn kill_externally(&self, id: &str) {
        self.set_alive(id, false);
        let _ = self.tx.send(MultiplexerEvent::Killed {
            session_id: id.to_string(),
        });
    }
}

#[async_trait]
impl MultiplexerRegistry for MockMultiplexer {
    async fn initialize(&self) -> BackendResult<()> {
        record(&self.log, "mux.initialize".to_string());
        Ok(())
    }

    async fn session_exists(&self, id: &str) -> BackendResult<bool> {
        record(&self.log, format!("mux.exists:{id}"));
        if self.failing.load(Ordering::SeqCst) {
            return Err(BackendError::Multiplexer("tmux unreachable".to_string()));
        }
        Ok(self.is_alive(id))
    }

    async fn get_session(&self, id: &str) -> BackendResult<Option<MultiplexerSession>> {
        Ok(self.is_alive(id).then(|| MultiplexerSession {
            external_name: format!("termdash-{id}"),
        }))
    }

    async fn update_last_active(&self, id: &str) {
        record(&self.log, format!("mux.update_last_active:{id}"));
    }

    async fn shutdown(&self) {
        record(&self.log, "mux.shutdown".to_string());
    }

    fn subscribe(&self) -> broadcast::Receiver<MultiplexerEvent> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Process backend
// ============================================================================

pub struct MockProcess {
    log: CallLog,
    mux: Arc<MockMultiplexer>,
    running: Mutex<HashSet<SessionId>>,
    pub fail_create: AtomicBool,
    pub fail_reconnect: AtomicBool,
    tx: broadcast::Sender<ProcessEvent>,
}

impl MockProcess {
    pub fn new(log: CallLog, mux: Arc<MockMultiplexer>) -> Self {
        let (tx, _) = broadcast::channel(64);
        Self {
            log,
            mux,
            running: Mutex::new(HashSet::new()),
            fail_create: AtomicBool::new(false),
            fail_reconnect: AtomicBool::new(false),
            tx,
        }
    }

    /// Drops the live handle without telling anyone.
    pub fn drop_handle(&self, id: &str) {
        self.running.lock().unwrap().remove(id);
    }

    pub fn emit_data(&self, id: &str, data: &[u8]) {
        let _ = self.tx.send(ProcessEvent::Data {
            session_id: id.to_string(),
            data: data.to_vec(),
        });
    }

    pub fn emit_exit(&self, id: &str, exit_code: i32) {
        self.drop_handle(id);
        let _ = self.tx.send(ProcessEvent::Exit {
            session_id: id.to_string(),
            exit_code,
        });
    }
}

#[async_trait]
impl ProcessBackend for MockProcess {
    async fn create(&self, id: &str, _config: &SpawnConfig) -> BackendResult<()> {
        record(&self.log, format!("process.create:{id}"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(BackendError::Process("spawn refused".to_string()));
        }
        self.running.lock().unwrap().insert(id.to_string());
        self.mux.set_alive(id, true);
        Ok(())
    }

    async fn reconnect(&self, id: &str, _config: &SpawnConfig) -> bool {
        record(&self.log, format!("process.reconnect:{id}"));
        if self.fail_reconnect.load(Ordering::SeqCst) {
            return false;
        }
        self.running.lock().unwrap().insert(id.to_string());
        true
    }

    async fn write(&self, id: &str, _data: &[u8]) -> bool {
        self.is_running(id)
    }

    async fn resize(&self, id: &str, _cols: u16, _rows: u16) -> bool {
        self.is_running(id)
    }

    fn is_running(&self, id: &str) -> bool {
        self.running.lock().unwrap().contains(id)
    }

    fn is_multiplexer_backed(&self, id: &str) -> bool {
        self.mux.is_alive(id)
    }

    async fn terminate(&self, id: &str) {
        record(&self.log, format!("process.terminate:{id}"));
        self.drop_handle(id);
        self.mux.set_alive(id, false);
    }

    async fn shutdown(&self) {
        record(&self.log, "process.shutdown".to_string());
        self.running.lock().unwrap().clear();
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.tx.subscribe()
    }
}

// ============================================================================
// Harness
// ============================================================================

/// A manager wired to scripted collaborators, with a real scrollback store
/// and activity detector.
pub struct Harness {
    pub log: CallLog,
    pub store: Arc<MockStore>,
    pub mux: Arc<MockMultiplexer>,
    pub process: Arc<MockProcess>,
    pub buffers: Arc<ScrollbackStore>,
    pub manager: Arc<SessionManager>,
    settings: ManagerSettings,
    dir: TempDir,
}

pub fn test_settings() -> ManagerSettings {
    ManagerSettings {
        default_shell: "/bin/sh".to_string(),
        default_cwd: "/tmp".to_string(),
        reap_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(60),
        event_capacity: 256,
    }
}

impl Harness {
    pub fn new() -> Self {
        Self::with_settings(test_settings())
    }

    pub fn with_settings(settings: ManagerSettings) -> Self {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MockStore::new(Arc::clone(&log)));
        let mux = Arc::new(MockMultiplexer::new(Arc::clone(&log)));
        let process = Arc::new(MockProcess::new(Arc::clone(&log), Arc::clone(&mux)));
        let buffers = Arc::new(ScrollbackStore::new(dir.path().join("buffers"), 64 * 1024));

        let collaborators = Collaborators {
            store: store.clone(),
            multiplexer: mux.clone(),
            process: process.clone(),
            buffers: buffers.clone(),
            detector: Arc::new(PatternDetector::new().unwrap()),
        };
        let manager = Arc::new(SessionManager::new(collaborators, settings.clone()));

        Self {
            log,
            store,
            mux,
            process,
            buffers,
            manager,
            settings,
            dir,
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            store: self.store.clone(),
            multiplexer: self.mux.clone(),
            process: self.process.clone(),
            buffers: self.buffers.clone(),
            detector: Arc::new(PatternDetector::new().unwrap()),
        }
    }

    fn build_manager(&self) -> Arc<SessionManager> {
        Arc::new(SessionManager::new(self.collaborators(), self.settings.clone()))
    }

    /// Simulates a daemon restart: the store, the multiplexer and the spill
    /// directory survive; process handles and in-memory buffers do not.
    pub fn restart(&mut self) {
        self.process = Arc::new(MockProcess::new(Arc::clone(&self.log), Arc::clone(&self.mux)));
        self.buffers = Arc::new(ScrollbackStore::new(self.dir.path().join("buffers"), 64 * 1024));
        self.manager = self.build_manager();
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn position(&self, call: &str) -> Option<usize> {
        self.calls().iter().position(|c| c == call)
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn status(&self, id: &str) -> Option<SessionStatus> {
        self.manager.get(id).map(|r| r.status)
    }
}

/// Create request for a terminal session with a fixed id.
pub fn terminal(id: &str, project: &str) -> CreateSession {
    CreateSession {
        id: Some(id.to_string()),
        project_id: project.to_string(),
        shell: Some("/bin/bash".to_string()),
        cwd: Some("/home".to_string()),
        cols: 80,
        rows: 24,
        title: None,
    }
}

/// Durable row as a previous daemon run would have left it.
pub fn stored_row(id: &str, status: SessionStatus) -> PersistedSession {
    let now = now_millis();
    PersistedSession {
        id: id.to_string(),
        kind: "terminal".to_string(),
        project_id: "proj".to_string(),
        status,
        config: r#"{"kind":"terminal","shell":"/bin/bash","cwd":"/home","cols":80,"rows":24}"#
            .to_string(),
        external_name: Some(format!("termdash-{id}")),
        title: None,
        created_at: now,
        updated_at: now,
        last_active_at: now,
    }
}

/// Events received so far, without waiting.
pub fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Waits for the first event matching `pred`.
pub async fn wait_for<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) => continue,
                Err(e) => panic!("event channel failed: {e}"),
            }
        }
    })
    .await
    .expect("timed out waiting for session event")
}
