//! Session store backing password authentication.
//!
//! Sessions are opaque 256-bit tokens with an absolute expiry. A token is
//! valid while `now < expires_at`; the first validation at or after expiry
//! deletes the row. A background sweeper deletes expired rows nobody asks
//! about again.

use anyhow::{anyhow, Result};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, OptionalExtension};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::db::Database;

/// How often expired sessions are reclaimed
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

const TOKEN_BYTES: usize = 32;

/// A stored session record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

#[derive(Clone)]
pub struct SessionStore {
    db: Database,
}

impl SessionStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Create a session that expires `ttl` from now and return its token.
    ///
    /// Fails without storing anything if the OS random source is unavailable.
    pub fn create(&self, ttl: Duration) -> Result<String> {
        self.create_at(ttl, Utc::now())
    }

    pub(crate) fn create_at(&self, ttl: Duration, now: DateTime<Utc>) -> Result<String> {
        let token = generate_token()?;
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| now.checked_add_signed(ttl))
            .ok_or_else(|| anyhow!("session lifetime of {}s is too large", ttl.as_secs()))?;
        let now_ms = now.timestamp_millis();

        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, expires_at, created_at, last_accessed) VALUES (?1, ?2, ?3, ?3)",
                params![token, expires_at.timestamp_millis(), now_ms],
            )
        })?;

        Ok(token)
    }

    /// Check a token. Any storage error counts as invalid.
    pub fn validate(&self, token: &str) -> bool {
        self.validate_at(token, Utc::now())
    }

    pub(crate) fn validate_at(&self, token: &str, now: DateTime<Utc>) -> bool {
        match self.try_validate_at(token, now) {
            Ok(valid) => valid,
            Err(err) => {
                tracing::warn!("session validation failed: {:#}", err);
                false
            }
        }
    }

    fn try_validate_at(&self, token: &str, now: DateTime<Utc>) -> Result<bool> {
        let now_ms = now.timestamp_millis();
        self.db.with_conn(|conn| {
            let expires_at: Option<i64> = conn
                .query_row(
                    "SELECT expires_at FROM sessions WHERE id = ?1",
                    [token],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(expires_at) = expires_at else {
                return Ok(false);
            };

            if now_ms >= expires_at {
                conn.execute("DELETE FROM sessions WHERE id = ?1", [token])?;
                return Ok(false);
            }

            conn.execute(
                "UPDATE sessions SET last_accessed = ?1 WHERE id = ?2",
                params![now_ms, token],
            )?;
            Ok(true)
        })
    }

    /// Remove a session. Deleting an unknown token is not an error.
    pub fn delete(&self, token: &str) -> Result<()> {
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM sessions WHERE id = ?1", [token]))?;
        Ok(())
    }

    /// Delete every session whose expiry is strictly in the past.
    /// Returns the number of rows removed.
    pub fn sweep(&self) -> Result<usize> {
        self.sweep_at(Utc::now())
    }

    pub(crate) fn sweep_at(&self, now: DateTime<Utc>) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM sessions WHERE expires_at < ?1",
                [now.timestamp_millis()],
            )
        })
    }

    /// Look up a session record without touching it
    pub fn get(&self, token: &str) -> Result<Option<Session>> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, created_at, expires_at, last_accessed FROM sessions WHERE id = ?1",
                [token],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()
        })?;

        row.map(|(token, created, expires, accessed)| {
            Ok(Session {
                token,
                created_at: from_millis(created)?,
                expires_at: from_millis(expires)?,
                last_accessed: from_millis(accessed)?,
            })
        })
        .transpose()
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| anyhow!("invalid timestamp {} in sessions table", ms))
}

/// 256 bits from the OS CSPRNG, hex-encoded (64 characters)
fn generate_token() -> Result<String> {
    let mut bytes = [0u8; TOKEN_BYTES];
    getrandom::getrandom(&mut bytes)
        .map_err(|err| anyhow!("secure random source unavailable: {}", err))?;
    Ok(hex::encode(bytes))
}

/// Spawn the background task that sweeps expired sessions every `every`.
/// Failures are logged and the task keeps running.
pub fn spawn_sweeper(store: SessionStore, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let store = store.clone();
            match tokio::task::spawn_blocking(move || store.sweep()).await {
                Ok(Ok(removed)) => tracing::debug!("session sweep removed {} expired", removed),
                Ok(Err(err)) => tracing::warn!("session sweep failed: {:#}", err),
                Err(err) => tracing::warn!("session sweep task failed: {}", err),
            }
        }
    })
}
