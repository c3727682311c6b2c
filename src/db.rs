//! SQLite persistence for sessions, AI usage, access logs and history.

use anyhow::{anyhow, Result};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Shared handle to the single database file.
///
/// Cloning is cheap; every clone talks to the same connection. Each call
/// holds the lock only for the duration of its statements, so SQLite's own
/// transaction semantics decide how conflicting writes are ordered.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.migrate()?;
        Ok(db)
    }

    /// Run `f` with exclusive access to the connection.
    ///
    /// This blocks the calling thread on the mutex and on SQLite's busy
    /// timeout. Async code calls it through [`crate::handlers::blocking`].
    pub fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> rusqlite::Result<T>) -> Result<T> {
        let conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))?;
        Ok(f(&conn)?)
    }

    fn migrate(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS migrations (
                    id INTEGER PRIMARY KEY,
                    name TEXT NOT NULL UNIQUE,
                    applied_at DATETIME DEFAULT CURRENT_TIMESTAMP
                )",
                [],
            )?;
            Ok(())
        })?;

        self.run_migration("001_initial_schema", MIGRATION_001)?;
        Ok(())
    }

    fn run_migration(&self, name: &str, sql: &str) -> Result<()> {
        let applied = self.with_conn(|conn| {
            conn.query_row("SELECT 1 FROM migrations WHERE name = ?1", [name], |_| Ok(()))
                .optional()
        })?;
        if applied.is_some() {
            return Ok(());
        }

        self.with_conn(|conn| {
            conn.execute_batch(sql)?;
            conn.execute("INSERT INTO migrations (name) VALUES (?1)", [name])?;
            Ok(())
        })?;

        tracing::info!("applied migration {}", name);
        Ok(())
    }
}

const MIGRATION_001: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    expires_at INTEGER NOT NULL,
    created_at INTEGER NOT NULL,
    last_accessed INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_expires ON sessions(expires_at);

CREATE TABLE IF NOT EXISTS ai_usage (
    date TEXT PRIMARY KEY,
    request_count INTEGER NOT NULL DEFAULT 0,
    token_count INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS ai_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    role TEXT NOT NULL,
    content TEXT NOT NULL,
    file_context TEXT,
    tokens INTEGER NOT NULL DEFAULT 0,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS command_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    command TEXT NOT NULL,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE IF NOT EXISTS ip_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    ip_address TEXT NOT NULL,
    endpoint TEXT,
    method TEXT,
    user_agent TEXT,
    created_at DATETIME DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_ip_logs_ip ON ip_logs(ip_address);
CREATE INDEX IF NOT EXISTS idx_ip_logs_created ON ip_logs(created_at);
"#;
