//! Daily AI usage ledger for the free tier.
//!
//! One row per local calendar date holding the request and token totals.
//! The quota check reads the row; the increment is a single upsert issued
//! only after a provider call has succeeded.

use anyhow::Result;
use chrono::{Local, NaiveDate};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;

use crate::db::Database;

/// Counters for one day
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DailyUsage {
    pub request_count: u64,
    pub token_count: u64,
}

/// Result of a quota check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Quota {
    pub used: u64,
    pub limit: u64,
}

impl Quota {
    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }

    pub fn remaining(&self) -> u64 {
        self.limit.saturating_sub(self.used)
    }
}

/// The process's local date, which keys the ledger
pub fn today() -> NaiveDate {
    Local::now().date_naive()
}

fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Clone)]
pub struct UsageLedger {
    db: Database,
}

impl UsageLedger {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Counters for `date`; zero if nothing was recorded that day
    pub fn usage(&self, date: NaiveDate) -> Result<DailyUsage> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT request_count, token_count FROM ai_usage WHERE date = ?1",
                [date_key(date)],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()
        })?;

        Ok(row
            .map(|(requests, tokens)| DailyUsage {
                request_count: requests.max(0) as u64,
                token_count: tokens.max(0) as u64,
            })
            .unwrap_or_default())
    }

    /// Read-only quota check; never mutates the ledger
    pub fn check(&self, date: NaiveDate, limit: u64) -> Result<Quota> {
        let used = self.usage(date)?.request_count;
        Ok(Quota { used, limit })
    }

    /// Count one successful call consuming `tokens`.
    pub fn record(&self, date: NaiveDate, tokens: u64) -> Result<()> {
        let tokens = i64::try_from(tokens).unwrap_or(i64::MAX);
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ai_usage (date, request_count, token_count) VALUES (?1, 1, ?2)
                 ON CONFLICT(date) DO UPDATE SET
                    request_count = request_count + 1,
                    token_count = token_count + excluded.token_count",
                params![date_key(date), tokens],
            )
        })?;
        Ok(())
    }
}

/// Format token count for display
pub fn format_tokens(tokens: u64) -> String {
    if tokens >= 1_000_000 {
        format!("{:.1}M", tokens as f64 / 1_000_000.0)
    } else if tokens >= 1_000 {
        format!("{:.1}k", tokens as f64 / 1_000.0)
    } else {
        tokens.to_string()
    }
}
