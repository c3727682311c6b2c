//! Per-request access log and client IP allowlist.
//!
//! Client IPs are taken from `X-Forwarded-For` (first entry), then
//! `X-Real-IP`, then the socket peer address. Proxy headers are trusted
//! unconditionally, so a client talking to the server directly can claim
//! any address. Deployments exposed without a reverse proxy should not rely
//! on the logged IPs or on `security.allowed_ips`.

use anyhow::Result;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rusqlite::params;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};

use crate::db::Database;
use crate::error::ApiError;
use crate::handlers::blocking;
use crate::server::AppState;

/// One logged request
#[derive(Debug, Clone, Serialize)]
pub struct AccessLogEntry {
    pub id: i64,
    pub ip_address: String,
    pub endpoint: String,
    pub method: String,
    pub user_agent: String,
    pub created_at: String,
}

/// Per-IP summary
#[derive(Debug, Clone, Serialize)]
pub struct UniqueIp {
    pub ip_address: String,
    pub request_count: i64,
    pub last_seen: String,
}

/// Best-effort client address for a request
pub fn client_ip(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(forwarded) = header_str(headers, "x-forwarded-for") {
        let first = forwarded.split(',').next().unwrap_or_default().trim();
        if !first.is_empty() {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header_str(headers, "x-real-ip") {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    remote
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

#[derive(Clone)]
pub struct AccessLog {
    db: Database,
    enabled: bool,
}

impl AccessLog {
    pub fn new(db: Database, enabled: bool) -> Self {
        Self { db, enabled }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Append an entry. Never fails the caller: storage errors are logged
    /// and dropped.
    pub fn record(&self, ip: &str, endpoint: &str, method: &str, user_agent: &str) {
        if !self.enabled {
            return;
        }
        let result = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO ip_logs (ip_address, endpoint, method, user_agent) VALUES (?1, ?2, ?3, ?4)",
                params![ip, endpoint, method, user_agent],
            )
        });
        if let Err(err) = result {
            tracing::warn!("failed to record access from {}: {:#}", ip, err);
        }
    }

    /// Most recent entries first
    pub fn recent(&self, limit: usize) -> Result<Vec<AccessLogEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, ip_address, COALESCE(endpoint, ''), COALESCE(method, ''),
                        COALESCE(user_agent, ''), COALESCE(created_at, '')
                 FROM ip_logs ORDER BY id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([sql_limit(limit)], |row| {
                Ok(AccessLogEntry {
                    id: row.get(0)?,
                    ip_address: row.get(1)?,
                    endpoint: row.get(2)?,
                    method: row.get(3)?,
                    user_agent: row.get(4)?,
                    created_at: row.get(5)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }

    /// Distinct client IPs with request counts, most recently seen first
    pub fn unique_ips(&self, limit: usize) -> Result<Vec<UniqueIp>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT ip_address, COUNT(*), COALESCE(MAX(created_at), ''), MAX(id) AS last_id
                 FROM ip_logs GROUP BY ip_address ORDER BY last_id DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map([sql_limit(limit)], |row| {
                Ok(UniqueIp {
                    ip_address: row.get(0)?,
                    request_count: row.get(1)?,
                    last_seen: row.get(2)?,
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
    }
}

/// `LIMIT` operand for `limit`. A plain cast would wrap large values to
/// negative, which SQLite reads as no limit at all.
fn sql_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Whether `ip` passes `security.allowed_ips`. An empty list admits everyone.
pub fn ip_allowed(allowed: &[String], ip: &str) -> bool {
    if allowed.is_empty() {
        return true;
    }
    let Ok(ip) = ip.parse::<IpAddr>() else {
        return false;
    };
    allowed
        .iter()
        .filter_map(|entry| entry.trim().parse::<IpAddr>().ok())
        .any(|entry| entry == ip)
}

/// Outermost middleware: log every request, then apply the IP allowlist.
/// Rejected requests are logged too.
pub async fn log_requests(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(request.headers(), remote);

    if state.access_log.is_enabled() {
        let log = state.access_log.clone();
        let client = ip.clone();
        let endpoint = request.uri().path().to_string();
        let method = request.method().as_str().to_string();
        let user_agent = header_str(request.headers(), header::USER_AGENT.as_str())
            .unwrap_or("")
            .to_string();
        let recorded =
            blocking(move || log.record(&client, &endpoint, &method, &user_agent)).await;
        if let Err(err) = recorded {
            tracing::warn!("failed to record access from {}: {}", ip, err);
        }
    }

    if !ip_allowed(&state.config.security.allowed_ips, &ip) {
        tracing::info!("rejected request from {} (not in allowed_ips)", ip);
        return ApiError::Forbidden.into_response();
    }

    next.run(request).await
}
