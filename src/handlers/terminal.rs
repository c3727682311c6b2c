use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

use super::blocking;
use crate::db::Database;
use crate::error::ApiError;
use crate::server::AppState;

/// Exit code reported when the command was killed for running too long
pub const TIMEOUT_EXIT_CODE: i32 = -1;

#[derive(Debug, Deserialize)]
pub struct TerminalRequest {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    pub output: String,
    pub exit_code: i32,
}

/// Run `command` through `sh -c` in `cwd`. Output is stdout followed by
/// stderr, capped at `max_output` bytes. The child is killed if it outlives
/// `timeout`.
pub async fn run_command(
    command: &str,
    cwd: &Path,
    timeout: Duration,
    max_output: usize,
) -> anyhow::Result<CommandOutput> {
    let mut child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()?;

    // One byte past the cap is enough to know truncation is needed
    let cap = (max_output as u64).saturating_add(1);
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let collect = async {
        let (stdout, stderr, status) = tokio::join!(
            read_capped(stdout, cap),
            read_capped(stderr, cap),
            child.wait()
        );
        Ok::<_, std::io::Error>((stdout?, stderr?, status?))
    };

    let (stdout, stderr, status) = match tokio::time::timeout(timeout, collect).await {
        Ok(result) => result?,
        Err(_) => {
            return Ok(CommandOutput {
                output: format!("Command timed out after {}s", timeout.as_secs_f64()),
                exit_code: TIMEOUT_EXIT_CODE,
            });
        }
    };

    let mut text = String::from_utf8_lossy(&stdout).to_string();
    if !stderr.is_empty() {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&String::from_utf8_lossy(&stderr));
    }

    Ok(CommandOutput {
        output: truncate_output(text, max_output),
        exit_code: status.code().unwrap_or(-1),
    })
}

/// Keep the first `cap` bytes of a pipe and discard the rest, so the child
/// never blocks on a full pipe and memory stays bounded
async fn read_capped<R>(pipe: Option<R>, cap: u64) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut pipe) = pipe else {
        return Ok(Vec::new());
    };
    let mut kept = Vec::new();
    (&mut pipe).take(cap).read_to_end(&mut kept).await?;
    tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok(kept)
}

fn truncate_output(mut text: String, max: usize) -> String {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
    text.push_str("\n... [output truncated]");
    text
}

fn record_command(db: &Database, command: &str) {
    let result = db.with_conn(|conn| {
        conn.execute("INSERT INTO command_history (command) VALUES (?1)", [command])
    });
    if let Err(err) = result {
        tracing::warn!("failed to record command history: {:#}", err);
    }
}

/// `POST /api/terminal`
pub async fn run(
    State(state): State<AppState>,
    Json(req): Json<TerminalRequest>,
) -> Result<Json<CommandOutput>, ApiError> {
    if req.command.trim().is_empty() {
        return Err(ApiError::BadRequest("no command".to_string()));
    }

    let cwd = state.workspace.resolve(&req.cwd)?;
    if !cwd.is_dir() {
        return Err(ApiError::BadRequest(format!(
            "working directory {} does not exist",
            req.cwd
        )));
    }

    let db = state.db.clone();
    let command = req.command.clone();
    blocking(move || record_command(&db, &command)).await?;
    tracing::info!("terminal: {}", req.command);

    let terminal = &state.config.terminal;
    let output = run_command(
        &req.command,
        &cwd,
        Duration::from_millis(terminal.timeout_ms),
        terminal.max_output_bytes,
    )
    .await?;

    Ok(Json(output))
}
