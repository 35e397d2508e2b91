//! Scrollback buffers.
//!
//! Each session keeps a capped ring of recent output in memory. When a
//! client drops, the current write offset is remembered so the delta can be
//! served later. On shutdown buffers are spilled to
//! `<data_dir>/buffers/<hex of session id>.log` and reloaded by startup recovery.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, trace, warn};

use super::{BackendResult, BufferStore, Snapshot};
use crate::session::SessionId;

/// Default per-session cap.
pub const DEFAULT_MAX_BYTES: usize = 1024 * 1024;

#[derive(Debug, Default)]
struct Scrollback {
    data: VecDeque<u8>,
    /// Bytes ever appended, including those trimmed off the front.
    written: u64,
    /// Value of `written` when the client dropped.
    disconnect_mark: Option<u64>,
    truncated: bool,
    dirty: bool,
}

impl Scrollback {
    fn push(&mut self, bytes: &[u8], max_bytes: usize) {
        self.data.extend(bytes);
        self.written += bytes.len() as u64;
        if self.data.len() > max_bytes {
            let excess = self.data.len() - max_bytes;
            self.data.drain(..excess);
            self.truncated = true;
        }
        self.dirty = true;
    }

    fn all(&self) -> Snapshot {
        Snapshot {
            data: self.data.iter().copied().collect(),
            truncated: self.truncated,
        }
    }

    fn since(&self, mark: u64) -> Snapshot {
        let missed = self.written.saturating_sub(mark);
        let retained = self.data.len() as u64;
        if missed > retained {
            // Part of what the client missed has been trimmed already.
            return Snapshot {
                data: self.data.iter().copied().collect(),
                truncated: true,
            };
        }
        let start = (retained - missed) as usize;
        Snapshot {
            data: self.data.range(start..).copied().collect(),
            truncated: false,
        }
    }
}

/// In-memory [`BufferStore`] with a disk spill directory.
pub struct ScrollbackStore {
    dir: PathBuf,
    max_bytes: usize,
    buffers: DashMap<SessionId, Scrollback>,
}

impl ScrollbackStore {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: usize) -> Self {
        Self {
            dir: dir.into(),
            max_bytes: max_bytes.max(1),
            buffers: DashMap::new(),
        }
    }

    /// Directory spill files are written to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Spill file of a session. The id is hex-encoded, so it can never
    /// escape the directory and two ids never share a file.
    pub fn spill_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.log", hex::encode(id)))
    }

    /// Bytes currently retained for a session.
    pub fn len(&self, id: &str) -> usize {
        self.buffers.get(id).map(|b| b.data.len()).unwrap_or(0)
    }

    async fn write_spill(&self, id: &str, data: Vec<u8>) -> BackendResult<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        tokio::fs::write(self.spill_path(id), data).await?;
        Ok(())
    }
}

#[async_trait]
impl BufferStore for ScrollbackStore {
    fn create(&self, id: &str) {
        self.buffers.entry(id.to_string()).or_default();
    }

    fn append(&self, id: &str, data: &[u8]) {
        match self.buffers.get_mut(id) {
            Some(mut buffer) => buffer.push(data, self.max_bytes),
            None => trace!(session_id = %id, "No buffer for output"),
        }
    }

    fn mark_disconnect(&self, id: &str) {
        if let Some(mut buffer) = self.buffers.get_mut(id) {
            buffer.disconnect_mark = Some(buffer.written);
        }
    }

    fn clear_disconnect(&self, id: &str) {
        if let Some(mut buffer) = self.buffers.get_mut(id) {
            buffer.disconnect_mark = None;
        }
    }

    fn has(&self, id: &str) -> bool {
        self.buffers.contains_key(id)
    }

    fn snapshot(&self, id: &str, full: bool) -> Option<Snapshot> {
        let buffer = self.buffers.get(id)?;
        match (full, buffer.disconnect_mark) {
            (false, Some(mark)) => Some(buffer.since(mark)),
            _ => Some(buffer.all()),
        }
    }

    async fn load(&self, id: &str) -> BackendResult<()> {
        let path = self.spill_path(id);
        let spilled = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        let mut buffer = self.buffers.entry(id.to_string()).or_default();
        // Spilled output is older than anything appended since startup.
        let newer = std::mem::take(&mut buffer.data);
        let newer_len = newer.len() as u64;
        let mark_offset = buffer.disconnect_mark.map(|m| newer_len.min(buffer.written - m));
        let dirty = buffer.dirty;

        *buffer = Scrollback::default();
        buffer.push(&spilled, self.max_bytes);
        let newer: Vec<u8> = newer.into();
        buffer.push(&newer, self.max_bytes);
        let written = buffer.written;
        buffer.disconnect_mark = mark_offset.map(|behind| written - behind.min(newer_len));
        buffer.dirty = dirty;

        debug!(session_id = %id, bytes = spilled.len(), "Reloaded spilled scrollback");
        Ok(())
    }

    async fn delete(&self, id: &str) {
        self.buffers.remove(id);
        match tokio::fs::remove_file(self.spill_path(id)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(session_id = %id, error = %e, "Failed to remove spill file"),
        }
    }

    async fn flush_all(&self) -> BackendResult<()> {
        let pending: Vec<(SessionId, Vec<u8>)> = self
            .buffers
            .iter_mut()
            .filter(|entry| entry.dirty)
            .map(|mut entry| {
                entry.dirty = false;
                (entry.key().clone(), entry.data.iter().copied().collect())
            })
            .collect();

        for (id, data) in &pending {
            if let Err(e) = self.write_spill(id, data.clone()).await {
                if let Some(mut buffer) = self.buffers.get_mut(id) {
                    buffer.dirty = true;
                }
                return Err(e);
            }
        }

        debug!(buffers = pending.len(), "Flushed scrollback to disk");
        Ok(())
    }

    async fn shutdown(&self) {
        self.buffers.clear();
    }
}
