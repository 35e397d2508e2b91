//! Daemon orchestrator for wiring together all components.
//!
//! This module provides the `DaemonOrchestrator` that builds the session
//! collaborators from configuration, runs startup recovery and pumps
//! process and multiplexer events into the session manager.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{
    MultiplexerEvent, MultiplexerRegistry, PatternDetector, ProcessBackend, ProcessEvent,
    PtyBackend, ScrollbackStore, SqliteStore, TmuxRegistry,
};
use crate::config::Config;
use crate::session::{Collaborators, ManagerSettings, RecoveryReport, SessionManager};

/// Daemon orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorState {
    /// Initial state, not started.
    Stopped,
    /// Starting up, recovering sessions.
    Starting,
    /// Running and pumping events.
    Running,
    /// Shutting down gracefully.
    ShuttingDown,
}

/// Events emitted by the orchestrator.
#[derive(Debug, Clone)]
pub enum OrchestratorEvent {
    /// Orchestrator state changed.
    StateChanged(OrchestratorState),
    /// Startup recovery finished.
    Recovered(RecoveryReport),
    /// Error occurred.
    Error { message: String },
}

/// Daemon orchestrator that owns the session manager and its event pumps.
pub struct DaemonOrchestrator {
    /// Configuration.
    config: Config,
    /// Current state.
    state: Arc<RwLock<OrchestratorState>>,
    /// Session lifecycle engine.
    manager: Arc<SessionManager>,
    /// Process backend, whose events feed the manager.
    process: Arc<dyn ProcessBackend>,
    /// Multiplexer registry, whose events feed the manager.
    multiplexer: Arc<dyn MultiplexerRegistry>,
    /// Cancellation token for the event pumps.
    shutdown_token: CancellationToken,
    /// Event sender.
    event_tx: broadcast::Sender<OrchestratorEvent>,
}

impl DaemonOrchestrator {
    /// Creates an orchestrator backed by SQLite, tmux and portable-pty.
    pub fn new(config: Config) -> Result<Self> {
        let data_dir = &config.daemon.data_dir;
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("Failed to create data directory: {}", data_dir.display()))?;

        let db_path = config.daemon.database_path();
        let store = SqliteStore::open(&db_path)
            .with_context(|| format!("Failed to open session database: {}", db_path.display()))?;

        let tmux = Arc::new(TmuxRegistry::new(
            config.tmux.binary.clone(),
            config.tmux.session_prefix.clone(),
        ));
        let process = PtyBackend::new(Arc::clone(&tmux));
        let buffers = ScrollbackStore::new(config.daemon.buffers_dir(), config.buffer.max_bytes);
        let detector = PatternDetector::new().context("Failed to compile activity patterns")?;

        let collaborators = Collaborators {
            store: Arc::new(store),
            multiplexer: tmux,
            process: Arc::new(process),
            buffers: Arc::new(buffers),
            detector: Arc::new(detector),
        };
        Ok(Self::with_collaborators(config, collaborators))
    }

    /// Creates an orchestrator around the given collaborators.
    pub fn with_collaborators(config: Config, collaborators: Collaborators) -> Self {
        let settings = ManagerSettings::from(&config.session);
        let process = Arc::clone(&collaborators.process);
        let multiplexer = Arc::clone(&collaborators.multiplexer);
        let manager = Arc::new(SessionManager::new(collaborators, settings));
        let (event_tx, _) = broadcast::channel(16);

        Self {
            config,
            state: Arc::new(RwLock::new(OrchestratorState::Stopped)),
            manager,
            process,
            multiplexer,
            shutdown_token: CancellationToken::new(),
            event_tx,
        }
    }

    /// Returns the current state.
    pub async fn state(&self) -> OrchestratorState {
        *self.state.read().await
    }

    /// Returns a receiver for orchestrator events.
    pub fn subscribe(&self) -> broadcast::Receiver<OrchestratorEvent> {
        self.event_tx.subscribe()
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the session manager.
    pub fn session_manager(&self) -> &Arc<SessionManager> {
        &self.manager
    }

    /// Starts the event pumps and runs startup recovery.
    pub async fn start(&mut self) -> Result<RecoveryReport> {
        {
            let mut state = self.state.write().await;
            if *state != OrchestratorState::Stopped {
                anyhow::bail!("Orchestrator is already running");
            }
            *state = OrchestratorState::Starting;
        }
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Starting));

        info!("Starting daemon orchestrator...");
        self.shutdown_token = CancellationToken::new();

        // Subscribe before recovery so nothing emitted during it is missed.
        tokio::spawn(Self::pump_process_events(
            Arc::clone(&self.manager),
            self.process.subscribe(),
            self.shutdown_token.clone(),
        ));
        tokio::spawn(Self::pump_multiplexer_events(
            Arc::clone(&self.manager),
            self.multiplexer.subscribe(),
            self.shutdown_token.clone(),
        ));
        debug!("Started event pumps");

        let report = match self.manager.initialize().await {
            Ok(report) => report,
            Err(e) => {
                self.shutdown_token.cancel();
                *self.state.write().await = OrchestratorState::Stopped;
                self.emit_event(OrchestratorEvent::Error {
                    message: e.to_string(),
                });
                self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));
                return Err(e).context("Session recovery failed");
            }
        };
        self.emit_event(OrchestratorEvent::Recovered(report.clone()));

        *self.state.write().await = OrchestratorState::Running;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Running));

        info!("Daemon orchestrator started successfully");
        Ok(report)
    }

    /// Forwards process output and exits to the manager.
    async fn pump_process_events(
        manager: Arc<SessionManager>,
        mut events: broadcast::Receiver<ProcessEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(ProcessEvent::Data { session_id, data }) => {
                        manager.handle_output(&session_id, &data);
                    }
                    Ok(ProcessEvent::Exit { session_id, exit_code }) => {
                        manager.on_process_exit(session_id, exit_code);
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Dropped exits would leave sessions Active with dead handles.
                        warn!(skipped = skipped, "Process event pump lagged, rechecking handles");
                        let manager = Arc::clone(&manager);
                        tokio::spawn(async move {
                            manager.recheck_dead_handles().await;
                        });
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Process event pump stopped");
    }

    /// Forwards multiplexer notifications to the manager.
    async fn pump_multiplexer_events(
        manager: Arc<SessionManager>,
        mut events: broadcast::Receiver<MultiplexerEvent>,
        shutdown_token: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                event = events.recv() => match event {
                    Ok(MultiplexerEvent::Killed { session_id }) => {
                        manager.on_multiplexer_killed(&session_id).await;
                    }
                    Ok(MultiplexerEvent::Recovered { session_id }) => {
                        debug!(session_id = %session_id, "Multiplexer adopted surviving session");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped = skipped, "Multiplexer event pump lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("Multiplexer event pump stopped");
    }

    /// Stops the daemon orchestrator gracefully.
    ///
    /// Sessions are left running in the multiplexer for the next start.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state == OrchestratorState::Stopped {
                return Ok(());
            }
            if *state == OrchestratorState::ShuttingDown {
                anyhow::bail!("Orchestrator is already shutting down");
            }
            *state = OrchestratorState::ShuttingDown;
        }
        self.emit_event(OrchestratorEvent::StateChanged(
            OrchestratorState::ShuttingDown,
        ));

        info!("Stopping daemon orchestrator...");
        self.shutdown_token.cancel();
        self.manager.shutdown().await;

        *self.state.write().await = OrchestratorState::Stopped;
        self.emit_event(OrchestratorEvent::StateChanged(OrchestratorState::Stopped));

        info!("Daemon orchestrator stopped");
        Ok(())
    }

    fn emit_event(&self, event: OrchestratorEvent) {
        let _ = self.event_tx.send(event);
    }

    /// Returns the shutdown token for external tasks to observe shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }
}
