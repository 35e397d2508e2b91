//! # termdash Daemon Library
//!
//! This crate provides the session-orchestration core of the termdash
//! terminal dashboard: durable PTY sessions that survive browser reloads,
//! client disconnects and daemon restarts.
//!
//! ## Overview
//!
//! - **Session lifecycle**: a state machine (`active`, `disconnected`,
//!   `paused`, `terminated`) driven by client, process and timer events
//! - **Durability**: session metadata in SQLite, shells kept alive by tmux
//! - **Recovery**: surviving tmux sessions are re-adopted on startup
//! - **Scrollback**: capped per-session buffers replayed to reconnecting clients
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │                        Daemon Orchestrator                         │
//! ├────────────────────────────────────────────────────────────────────┤
//! │                                                                    │
//! │  ┌──────────────────────────────────────────────────────────────┐  │
//! │  │                       Session Manager                        │  │
//! │  │      registry · recovery · reconnect · exit · reaper         │  │
//! │  └──────────────────────────────────────────────────────────────┘  │
//! │                                                                    │
//! │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐ │
//! │  │  SQLite  │ │   tmux   │ │   PTY    │ │Scrollback│ │ Activity │ │
//! │  │  store   │ │ registry │ │ backend  │ │  store   │ │ detector │ │
//! │  └──────────┘ └──────────┘ └──────────┘ └──────────┘ └──────────┘ │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termdash_daemon::{Config, DaemonOrchestrator};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!
//!     let mut orchestrator = DaemonOrchestrator::new(config)?;
//!     let report = orchestrator.start().await?;
//!     println!("recovered {} sessions", report.recovered.len());
//!
//!     orchestrator.stop().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading and defaults
//! - [`session`]: Session state machine and lifecycle protocols
//! - [`backend`]: Collaborator traits and their SQLite/tmux/PTY implementations
//! - [`orchestrator`]: Main daemon coordinator

pub mod backend;
pub mod config;
pub mod orchestrator;
pub mod session;

// Re-export config types for convenience
pub use config::{Config, ConfigError};

// Re-export session types for convenience
pub use session::{
    ActivityStatus, Collaborators, CreateSession, DisconnectReason, ManagerSettings,
    ReconnectOutcome, RecoveryReport, SessionError, SessionEvent, SessionId, SessionManager,
    SessionRecord, SessionStatus,
};

// Re-export backend types for convenience
pub use backend::{BackendError, BackendResult};

// Re-export orchestrator types for convenience
pub use orchestrator::{DaemonOrchestrator, OrchestratorEvent, OrchestratorState};
