//! SQLite durable store for session metadata.
//!
//! This module provides:
//! - Schema management and migrations
//! - Session row persistence
//! - Status, last-active and multiplexer-name updates

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{BackendError, BackendResult, DurableStore, StoredRow, UnreadableRow};
use crate::session::{now_millis, PersistedSession, SessionStatus};

/// Current schema version.
const CURRENT_SCHEMA_VERSION: i32 = 1;

const SELECT_COLUMNS: &str = r#"
    SELECT id, kind, project_id, status, config, external_name, title,
           created_at, updated_at, last_active_at
    FROM sessions
"#;

/// SQLite-backed [`DurableStore`].
///
/// Queries are small and local, so they run inline under the connection
/// mutex rather than on a blocking pool.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a database at the given path.
    ///
    /// If the database doesn't exist, it will be created and migrations will be run.
    pub fn open<P: AsRef<Path>>(path: P) -> BackendResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        Self::with_connection(Connection::open(path)?)
    }

    /// Open an in-memory database.
    pub fn open_in_memory() -> BackendResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> BackendResult<Self> {
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> BackendResult<i32> {
        let version = self
            .conn()
            .query_row("PRAGMA user_version", [], |row| row.get(0))?;
        Ok(version)
    }

    /// List every stored session, terminated ones included, newest first.
    pub fn list_all(&self) -> BackendResult<Vec<StoredRow>> {
        self.query_rows(&format!("{SELECT_COLUMNS} ORDER BY created_at DESC"))
    }

    fn query_rows(&self, sql: &str) -> BackendResult<Vec<StoredRow>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map([], read_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn execute_update(&self, sql: &str, params: impl rusqlite::Params) -> BackendResult<()> {
        let affected = self.conn().execute(sql, params)?;
        if affected == 0 {
            return Err(BackendError::Store("no such session".to_string()));
        }
        Ok(())
    }
}

/// Run all pending migrations.
fn run_migrations(conn: &mut Connection) -> BackendResult<()> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

    if current < 1 {
        let tx = conn.transaction()?;
        tx.execute(
            r#"
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                project_id TEXT NOT NULL,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                external_name TEXT,
                title TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                last_active_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
            [],
        )?;
        tx.execute(
            "CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id)",
            [],
        )?;
        tx.execute(&format!("PRAGMA user_version = {CURRENT_SCHEMA_VERSION}"), [])?;
        tx.commit()?;
    }

    Ok(())
}

/// Maps a row to a session. Only the id has to be readable; anything else
/// wrong with the row is reported against that id.
fn read_row(row: &Row<'_>) -> rusqlite::Result<StoredRow> {
    let id: String = row.get(0)?;
    Ok(decode_row(row, &id).map_err(|source| UnreadableRow { id, source }))
}

fn decode_row(row: &Row<'_>, id: &str) -> BackendResult<PersistedSession> {
    let status: String = row.get(3)?;
    Ok(PersistedSession {
        id: id.to_string(),
        kind: row.get(1)?,
        project_id: row.get(2)?,
        status: status.parse::<SessionStatus>()?,
        config: row.get(4)?,
        external_name: row.get(5)?,
        title: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        last_active_at: row.get(9)?,
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn insert(&self, session: &PersistedSession) -> BackendResult<()> {
        self.conn().execute(
            r#"
            INSERT INTO sessions (id, kind, project_id, status, config, external_name,
                                  title, created_at, updated_at, last_active_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                session.id,
                session.kind,
                session.project_id,
                session.status.as_str(),
                session.config,
                session.external_name,
                session.title,
                session.created_at,
                session.updated_at,
                session.last_active_at
            ],
        )?;
        Ok(())
    }

    async fn update_status(&self, id: &str, status: SessionStatus) -> BackendResult<()> {
        self.execute_update(
            "UPDATE sessions SET status = ?1, updated_at = ?2 WHERE id = ?3",
            params![status.as_str(), now_millis(), id],
        )
    }

    async fn update_last_active(&self, id: &str) -> BackendResult<()> {
        self.execute_update(
            "UPDATE sessions SET last_active_at = ?1 WHERE id = ?2",
            params![now_millis(), id],
        )
    }

    async fn update_external_name(&self, id: &str, name: Option<&str>) -> BackendResult<()> {
        self.execute_update(
            "UPDATE sessions SET external_name = ?1 WHERE id = ?2",
            params![name, id],
        )
    }

    async fn get_by_id(&self, id: &str) -> BackendResult<Option<PersistedSession>> {
        let row = self
            .conn()
            .query_row(&format!("{SELECT_COLUMNS} WHERE id = ?1"), params![id], read_row)
            .optional()?;
        row.transpose().map_err(|unreadable| unreadable.source)
    }

    async fn get_all_active(&self) -> BackendResult<Vec<StoredRow>> {
        self.query_rows(&format!(
            "{SELECT_COLUMNS} WHERE status != 'terminated' ORDER BY created_at ASC"
        ))
    }
}
