//! PTY process backend.
//!
//! Each live session is a tmux client running in a pseudo-terminal opened
//! with portable-pty. Creating a session runs `tmux new-session -A`, and
//! reattaching runs `tmux attach-session`. Killing the client does not kill
//! the shell: the tmux session outlives the handle, and the daemon too.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use dashmap::DashMap;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};

use super::tmux::TmuxRegistry;
use super::{BackendError, BackendResult, ProcessBackend, ProcessEvent};
use crate::session::{SessionId, SpawnConfig};

/// Buffer size for reading from PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Channel capacity for process events.
const EVENT_CAPACITY: usize = 1024;

/// Exit code reported when the handle's status could not be collected.
const UNKNOWN_EXIT_CODE: i32 = -1;

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A tmux client attached through a PTY.
struct Attachment {
    generation: u64,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,
    /// Cleared when we detach on purpose, so the read loop stays quiet.
    running: Arc<AtomicBool>,
}

impl Attachment {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn write(&self, data: &[u8]) -> std::io::Result<()> {
        let mut writer = lock(&self.writer);
        writer.write_all(data)?;
        writer.flush()
    }

    fn resize(&self, cols: u16, rows: u16) -> BackendResult<()> {
        lock(&self.master)
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Process(e.to_string()))
    }

    /// Kills the tmux client. The tmux session itself is untouched.
    fn detach(&self) {
        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = lock(&self.child).kill() {
            trace!(error = %e, "tmux client already gone");
        }
    }
}

/// [`ProcessBackend`] running tmux clients in portable-pty terminals.
pub struct PtyBackend {
    tmux: Arc<TmuxRegistry>,
    attachments: Arc<DashMap<SessionId, Arc<Attachment>>>,
    next_generation: AtomicU64,
    event_tx: broadcast::Sender<ProcessEvent>,
}

impl PtyBackend {
    pub fn new(tmux: Arc<TmuxRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            tmux,
            attachments: Arc::new(DashMap::new()),
            next_generation: AtomicU64::new(1),
            event_tx,
        }
    }

    /// Number of sessions with an attached handle.
    pub fn attached_count(&self) -> usize {
        self.attachments.len()
    }

    /// tmux arguments that create the session, or attach if it exists.
    pub fn create_args(&self, id: &str, config: &SpawnConfig) -> Vec<String> {
        vec![
            "new-session".to_string(),
            "-A".to_string(),
            "-s".to_string(),
            self.tmux.external_name(id),
            "-x".to_string(),
            config.cols.to_string(),
            "-y".to_string(),
            config.rows.to_string(),
            "-c".to_string(),
            config.cwd.clone(),
            config.shell.clone(),
        ]
    }

    /// tmux arguments that attach to an existing session.
    pub fn attach_args(&self, id: &str) -> Vec<String> {
        vec![
            "attach-session".to_string(),
            "-t".to_string(),
            self.tmux.target(id),
        ]
    }

    fn get(&self, id: &str) -> Option<Arc<Attachment>> {
        self.attachments.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// Spawns a tmux client in a fresh PTY and starts reading from it.
    /// Any previous attachment for the session is detached.
    fn spawn_client(
        &self,
        id: &str,
        args: Vec<String>,
        config: &SpawnConfig,
    ) -> BackendResult<()> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: config.rows,
                cols: config.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| BackendError::Process(e.to_string()))?;

        let mut cmd = CommandBuilder::new(self.tmux.binary());
        cmd.args(&args);
        cmd.cwd(&config.cwd);
        cmd.env("TERM", "xterm-256color");

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| BackendError::Process(e.to_string()))?;
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| BackendError::Process(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| BackendError::Process(e.to_string()))?;

        let attachment = Arc::new(Attachment {
            generation: self.next_generation.fetch_add(1, Ordering::SeqCst),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            child: Arc::new(Mutex::new(child)),
            running: Arc::new(AtomicBool::new(true)),
        });

        if let Some(previous) = self
            .attachments
            .insert(id.to_string(), Arc::clone(&attachment))
        {
            previous.detach();
        }
        self.start_read_loop(id.to_string(), reader, &attachment);
        Ok(())
    }

    /// Reads PTY output until EOF, then reports the exit unless the handle
    /// was detached on purpose.
    fn start_read_loop(
        &self,
        session_id: SessionId,
        reader: Box<dyn Read + Send>,
        attachment: &Arc<Attachment>,
    ) {
        let event_tx = self.event_tx.clone();
        let attachments = Arc::clone(&self.attachments);
        let running = Arc::clone(&attachment.running);
        let child = Arc::clone(&attachment.child);
        let generation = attachment.generation;

        tokio::spawn(async move {
            let reader = Arc::new(Mutex::new(reader));

            loop {
                let reader_clone = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buffer = vec![0u8; READ_BUFFER_SIZE];
                    let n = lock(&reader_clone).read(&mut buffer)?;
                    buffer.truncate(n);
                    Ok::<_, std::io::Error>(buffer)
                })
                .await;

                match result {
                    Ok(Ok(data)) if !data.is_empty() => {
                        let _ = event_tx.send(ProcessEvent::Data {
                            session_id: session_id.clone(),
                            data,
                        });
                    }
                    Ok(Ok(_)) => {
                        debug!(session_id = %session_id, "PTY EOF");
                        break;
                    }
                    Ok(Err(e)) => {
                        // EIO is how Linux reports EOF on a PTY master.
                        trace!(session_id = %session_id, error = %e, "PTY read ended");
                        break;
                    }
                    Err(e) => {
                        error!(session_id = %session_id, error = %e, "Read task panicked");
                        break;
                    }
                }
            }

            attachments.remove_if(&session_id, |_, current| current.generation == generation);

            if !running.swap(false, Ordering::SeqCst) {
                return;
            }

            let status = tokio::task::spawn_blocking(move || lock(&child).wait()).await;
            let exit_code = match status {
                Ok(Ok(status)) => status.exit_code() as i32,
                Ok(Err(e)) => {
                    warn!(session_id = %session_id, error = %e, "Failed to collect exit status");
                    UNKNOWN_EXIT_CODE
                }
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "Wait task panicked");
                    UNKNOWN_EXIT_CODE
                }
            };

            info!(session_id = %session_id, exit_code = exit_code, "Process handle exited");
            let _ = event_tx.send(ProcessEvent::Exit {
                session_id,
                exit_code,
            });
        });
    }
}

#[async_trait]
impl ProcessBackend for PtyBackend {
    async fn create(&self, id: &str, config: &SpawnConfig) -> BackendResult<()> {
        let args = self.create_args(id, config);
        self.spawn_client(id, args, config)?;
        self.tmux.track(id);
        info!(
            session_id = %id,
            shell = %config.shell,
            cwd = %config.cwd,
            "Spawned tmux session"
        );
        Ok(())
    }

    async fn reconnect(&self, id: &str, config: &SpawnConfig) -> bool {
        if let Some(existing) = self.get(id) {
            if existing.is_running() {
                if let Err(e) = existing.resize(config.cols, config.rows) {
                    debug!(session_id = %id, error = %e, "Resize on reattach failed");
                }
                return true;
            }
        }

        let args = self.attach_args(id);
        match self.spawn_client(id, args, config) {
            Ok(()) => {
                self.tmux.track(id);
                info!(session_id = %id, "Reattached to tmux session");
                true
            }
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to reattach to tmux session");
                false
            }
        }
    }

    async fn write(&self, id: &str, data: &[u8]) -> bool {
        let Some(attachment) = self.get(id).filter(|a| a.is_running()) else {
            return false;
        };
        match attachment.write(data) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to write to PTY");
                false
            }
        }
    }

    async fn resize(&self, id: &str, cols: u16, rows: u16) -> bool {
        let Some(attachment) = self.get(id).filter(|a| a.is_running()) else {
            return false;
        };
        match attachment.resize(cols, rows) {
            Ok(()) => true,
            Err(e) => {
                warn!(session_id = %id, error = %e, "Failed to resize PTY");
                false
            }
        }
    }

    fn is_running(&self, id: &str) -> bool {
        self.get(id).is_some_and(|a| a.is_running())
    }

    fn is_multiplexer_backed(&self, id: &str) -> bool {
        self.tmux.is_tracked(id)
    }

    async fn terminate(&self, id: &str) {
        if let Some((_, attachment)) = self.attachments.remove(id) {
            attachment.detach();
        }
        if let Err(e) = self.tmux.kill_session(id).await {
            warn!(session_id = %id, error = %e, "Failed to kill tmux session");
        }
    }

    async fn shutdown(&self) {
        let count = self.attachments.len();
        for entry in self.attachments.iter() {
            entry.value().detach();
        }
        self.attachments.clear();
        debug!(detached = count, "PTY backend shut down");
    }

    fn subscribe(&self) -> broadcast::Receiver<ProcessEvent> {
        self.event_tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> PtyBackend {
        PtyBackend::new(Arc::new(TmuxRegistry::new("tmux", "termdash-")))
    }

    fn config() -> SpawnConfig {
        SpawnConfig {
            shell: "/bin/bash".to_string(),
            cwd: "/tmp".to_string(),
            cols: 120,
            rows: 40,
            project_id: "proj".to_string(),
        }
    }

    #[test]
    fn test_create_args() {
        let args = backend().create_args("abc", &config());
        assert_eq!(
            args,
            vec![
                "new-session", "-A", "-s", "termdash-abc", "-x", "120", "-y", "40", "-c", "/tmp",
                "/bin/bash"
            ]
        );
    }

    #[test]
    fn test_attach_args_use_exact_target() {
        let args = backend().attach_args("abc");
        assert_eq!(args, vec!["attach-session", "-t", "=termdash-abc"]);
    }

    #[tokio::test]
    async fn test_unknown_session_has_no_handle() {
        let backend = backend();
        assert!(!backend.write("ghost", b"ls\n").await);
        assert!(!backend.resize("ghost", 80, 24).await);
        assert!(!backend.is_running("ghost"));
        assert!(!backend.is_multiplexer_backed("ghost"));
        assert_eq!(backend.attached_count(), 0);
    }

    #[tokio::test]
    async fn test_create_fails_without_tmux() {
        let backend = PtyBackend::new(Arc::new(TmuxRegistry::new(
            "/nonexistent/tmux-binary",
            "termdash-",
        )));
        assert!(backend.create("s1", &config()).await.is_err());
        assert!(!backend.is_running("s1"));
    }
}
