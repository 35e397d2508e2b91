//! Configuration management for the termdash daemon.
//!
//! Settings live in a TOML file, `~/.config/termdash/config.toml` by default.
//! Every section is optional; missing keys take their defaults, and a few
//! `TERMDASH_*` environment variables override the file.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value the daemon cannot run with.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("reap_interval_secs must be between 1 and 86400, got {0}")]
    InvalidReapInterval(u64),

    #[error("idle_timeout_secs must be at least reap_interval_secs ({reap}), got {idle}")]
    InvalidIdleTimeout { idle: u64, reap: u64 },

    #[error("event_capacity must be between 1 and 65536, got {0}")]
    InvalidEventCapacity(usize),

    #[error("buffer max_bytes must be between 1 KiB and 64 MiB, got {0}")]
    InvalidBufferSize(usize),

    #[error("session_prefix must be non-empty and contain no '.' or ':', got {0:?}")]
    InvalidSessionPrefix(String),

    #[error("default_shell path does not exist: {0}")]
    InvalidShellPath(String),

    #[error("tmux binary not found: {0}")]
    InvalidTmuxBinary(String),

    #[error("default_cwd is not a directory: {0}")]
    InvalidDefaultCwd(PathBuf),

    #[error("log_level must be one of: trace, debug, info, warn, error; got {0}")]
    InvalidLogLevel(String),
}

/// Levels accepted by the tracing filter.
const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

const MIN_BUFFER_BYTES: usize = 1024;
const MAX_BUFFER_BYTES: usize = 64 * 1024 * 1024;
const MAX_EVENT_CAPACITY: usize = 65536;
const MAX_REAP_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Main configuration structure for the termdash daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    /// Paths and logging.
    pub daemon: DaemonConfig,

    /// Session lifecycle configuration.
    pub session: SessionConfig,

    /// tmux integration.
    pub tmux: TmuxConfig,

    /// Scrollback buffers.
    pub buffer: BufferConfig,
}

/// Paths and logging.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding the session database and spilled scrollback.
    pub data_dir: PathBuf,

    /// Default tracing level, unless `--verbose` is given.
    pub log_level: String,
}

/// Session lifecycle configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SessionConfig {
    /// Shell for sessions whose create request names none.
    pub default_shell: String,

    /// Working directory for sessions whose create request names none.
    /// Defaults to the home directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_cwd: Option<PathBuf>,

    /// How often the reaper looks for idle detached sessions.
    pub reap_interval_secs: u64,

    /// How long a detached session may stay untouched before it is reaped.
    pub idle_timeout_secs: u64,

    /// Capacity of the session event channel.
    pub event_capacity: usize,
}

/// tmux integration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TmuxConfig {
    /// tmux executable, absolute or looked up in PATH.
    pub binary: String,

    /// Prefix of the tmux session names owned by the daemon.
    pub session_prefix: String,
}

/// Scrollback buffers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BufferConfig {
    /// Per-session cap in bytes (default: 1 MiB).
    pub max_bytes: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: "info".to_string(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            default_shell: default_shell(),
            default_cwd: None,
            reap_interval_secs: 60,
            idle_timeout_secs: 60 * 60,
            event_capacity: 256,
        }
    }
}

impl Default for TmuxConfig {
    fn default() -> Self {
        Self {
            binary: "tmux".to_string(),
            session_prefix: "termdash-".to_string(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

impl DaemonConfig {
    /// Path of the session database.
    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    /// Directory of spilled scrollback files.
    pub fn buffers_dir(&self) -> PathBuf {
        self.data_dir.join("buffers")
    }
}

/// `<config dir>/termdash/config.toml`.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termdash")
        .join("config.toml")
}

/// `<local data dir>/termdash`.
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("termdash")
}

fn default_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

/// Checks that a program exists, either at an absolute path or in PATH.
fn program_exists(program: &str) -> bool {
    let path = Path::new(program);
    if path.is_absolute() {
        path.exists()
    } else {
        which::which(program).is_ok()
    }
}

impl Config {
    /// Applies `TERMDASH_LOG_LEVEL` and `TERMDASH_DATA_DIR`. Empty values
    /// are ignored.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(level) = std::env::var("TERMDASH_LOG_LEVEL") {
            if !level.is_empty() {
                tracing::info!("Overriding log_level from environment: {}", level);
                self.daemon.log_level = level;
            }
        }

        if let Ok(dir) = std::env::var("TERMDASH_DATA_DIR") {
            if !dir.is_empty() {
                tracing::info!("Overriding data_dir from environment: {}", dir);
                self.daemon.data_dir = PathBuf::from(dir);
            }
        }
    }

    /// Checks ranges, the tmux prefix, and that the shell and tmux binaries
    /// can be found. Only `start` needs a valid configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let session = &self.session;
        if session.reap_interval_secs == 0 || session.reap_interval_secs > MAX_REAP_INTERVAL_SECS {
            return Err(ConfigError::InvalidReapInterval(session.reap_interval_secs));
        }

        if session.idle_timeout_secs < session.reap_interval_secs {
            return Err(ConfigError::InvalidIdleTimeout {
                idle: session.idle_timeout_secs,
                reap: session.reap_interval_secs,
            });
        }

        if session.event_capacity == 0 || session.event_capacity > MAX_EVENT_CAPACITY {
            return Err(ConfigError::InvalidEventCapacity(session.event_capacity));
        }

        if !(MIN_BUFFER_BYTES..=MAX_BUFFER_BYTES).contains(&self.buffer.max_bytes) {
            return Err(ConfigError::InvalidBufferSize(self.buffer.max_bytes));
        }

        let prefix = &self.tmux.session_prefix;
        if prefix.is_empty() || prefix.contains(['.', ':']) {
            return Err(ConfigError::InvalidSessionPrefix(prefix.clone()));
        }

        if !program_exists(&session.default_shell) {
            return Err(ConfigError::InvalidShellPath(session.default_shell.clone()));
        }

        if !program_exists(&self.tmux.binary) {
            return Err(ConfigError::InvalidTmuxBinary(self.tmux.binary.clone()));
        }

        if let Some(cwd) = &session.default_cwd {
            if !cwd.is_dir() {
                return Err(ConfigError::InvalidDefaultCwd(cwd.clone()));
            }
        }

        let level = self.daemon.log_level.to_lowercase();
        if !VALID_LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(self.daemon.log_level.clone()));
        }

        Ok(())
    }

    /// Reads the configuration at `path`, or the defaults when there is no
    /// file there.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Reads the configuration at [`default_config_path`].
    pub fn load_default() -> Result<Self> {
        Self::load(default_config_path())
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| anyhow::anyhow!("Invalid TOML configuration: {}", format_toml_error(&e)))
    }

    /// Writes the configuration, creating parent directories.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("Failed to create config directory: {}", parent.display())
            })?;
        }

        let contents = self.to_toml()?;
        fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        tracing::debug!("Configuration saved to {:?}", path);
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration to TOML")
    }
}

fn format_toml_error(error: &toml::de::Error) -> String {
    let mut msg = error.message().to_string();

    if let Some(span) = error.span() {
        msg.push_str(&format!(" (at position {}..{})", span.start, span.end));
    }

    msg
}
