//! AI chat with the free-tier quota.
//!
//! When the configuration is metered ([`crate::config::AiConfig::is_metered`])
//! a request is refused with 429 once today's ledger count reaches the limit.
//! The ledger is incremented only after the provider returns successfully.

use axum::extract::State;
use axum::Json;
use chrono::NaiveDate;
use rusqlite::params;
use serde::Deserialize;
use serde_json::{json, Value};

use super::blocking;
use crate::db::Database;
use crate::error::ApiError;
use crate::llm::ChatMessage;
use crate::server::AppState;
use crate::usage::{format_tokens, today, DailyUsage, Quota};

/// Messages of prior conversation sent with each request
pub const HISTORY_WINDOW: usize = 10;

const SYSTEM_PROMPT: &str = "You are an expert programming assistant integrated into c00d IDE.
Help users with coding tasks: explain code, fix bugs, write tests, suggest improvements.
Be concise and provide code examples when helpful.";

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub context_code: String,
    #[serde(default)]
    pub context_file: String,
}

pub fn system_prompt(context_code: &str, context_file: &str) -> String {
    let mut prompt = SYSTEM_PROMPT.to_string();
    if !context_code.is_empty() {
        prompt.push_str("\n\nUser is currently viewing this code");
        if !context_file.is_empty() {
            prompt.push_str(" from file: ");
            prompt.push_str(context_file);
        }
        prompt.push_str(":\n```\n");
        prompt.push_str(context_code);
        prompt.push_str("\n```");
    }
    prompt
}

pub fn append_history(
    db: &Database,
    role: &str,
    content: &str,
    file_context: &str,
    tokens: u64,
) -> anyhow::Result<()> {
    let tokens = i64::try_from(tokens).unwrap_or(i64::MAX);
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO ai_history (role, content, file_context, tokens) VALUES (?1, ?2, ?3, ?4)",
            params![role, content, file_context, tokens],
        )
    })?;
    Ok(())
}

/// The last `limit` history messages, oldest first
pub fn recent_history(db: &Database, limit: usize) -> anyhow::Result<Vec<ChatMessage>> {
    let mut messages = db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT role, content FROM ai_history ORDER BY id DESC LIMIT ?1")?;
        let rows = stmt.query_map([i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
            Ok(ChatMessage {
                role: row.get(0)?,
                content: row.get(1)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
    })?;
    messages.reverse();
    Ok(messages)
}

fn usage_json(state: &AppState, date: NaiveDate, usage: DailyUsage) -> Value {
    let ai = &state.config.ai;
    let mut value = json!({
        "date": date.format("%Y-%m-%d").to_string(),
        "request_count": usage.request_count,
        "token_count": usage.token_count,
        "metered": ai.is_metered(),
    });
    if ai.is_metered() {
        let quota = Quota {
            used: usage.request_count,
            limit: ai.free_daily_limit,
        };
        value["limit"] = json!(quota.limit);
        value["remaining"] = json!(quota.remaining());
    } else {
        value["limit"] = json!("unlimited");
    }
    value
}

/// `POST /api/ai`
pub async fn chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("message is required".to_string()));
    }

    let ai = &state.config.ai;
    let date = today();
    let metered = ai.is_metered();
    let limit = ai.free_daily_limit;

    let (db, usage) = (state.db.clone(), state.usage.clone());
    let (message, file) = (req.message.clone(), req.context_file.clone());
    let messages = blocking(move || -> Result<Vec<ChatMessage>, ApiError> {
        if metered {
            let quota = usage.check(date, limit)?;
            if quota.is_exhausted() {
                tracing::info!("free tier limit reached ({} requests)", quota.used);
                return Err(ApiError::QuotaExceeded { limit: quota.limit });
            }
        }
        append_history(&db, "user", &message, &file, 0)?;
        Ok(recent_history(&db, HISTORY_WINDOW)?)
    })
    .await??;

    let system = system_prompt(&req.context_code, &req.context_file);
    let client = state.llm.clone();
    let result = blocking(move || client.chat(&system, &messages)).await?;

    let completion = match result {
        Ok(completion) => completion,
        Err(err) => {
            tracing::warn!("{} request failed: {:#}", ai.provider.as_str(), err);
            return Ok(Json(json!({ "success": false, "error": err.to_string() })));
        }
    };

    let (db, usage) = (state.db.clone(), state.usage.clone());
    let (reply, file, tokens) = (completion.content.clone(), req.context_file, completion.tokens);
    let today_usage = blocking(move || -> anyhow::Result<DailyUsage> {
        append_history(&db, "assistant", &reply, &file, tokens)?;
        usage.record(date, tokens)?;
        usage.usage(date)
    })
    .await??;
    tracing::debug!(
        "{} replied using {} tokens",
        ai.provider.as_str(),
        format_tokens(completion.tokens)
    );

    Ok(Json(json!({
        "success": true,
        "content": completion.content,
        "tokens": completion.tokens,
        "usage": usage_json(&state, date, today_usage),
    })))
}

/// `GET /api/ai/usage`
pub async fn usage(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let date = today();
    let ledger = state.usage.clone();
    let usage = blocking(move || ledger.usage(date)).await??;
    Ok(Json(usage_json(&state, date, usage)))
}
