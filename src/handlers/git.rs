use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;

use crate::error::ApiError;
use crate::server::AppState;
use crate::workspace::Workspace;

/// Git operations the IDE may request. Anything else is rejected before a
/// process is spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GitAction {
    Status,
    Stage,
    Unstage,
    StageAll,
    UnstageAll,
    Commit,
    Push,
    Pull,
    Diff,
    Discard,
}

impl GitAction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "status" => Some(Self::Status),
            "stage" => Some(Self::Stage),
            "unstage" => Some(Self::Unstage),
            "stage_all" => Some(Self::StageAll),
            "unstage_all" => Some(Self::UnstageAll),
            "commit" => Some(Self::Commit),
            "push" => Some(Self::Push),
            "pull" => Some(Self::Pull),
            "diff" => Some(Self::Diff),
            "discard" => Some(Self::Discard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Stage => "stage",
            Self::Unstage => "unstage",
            Self::StageAll => "stage_all",
            Self::UnstageAll => "unstage_all",
            Self::Commit => "commit",
            Self::Push => "push",
            Self::Pull => "pull",
            Self::Diff => "diff",
            Self::Discard => "discard",
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GitRequest {
    #[serde(default)]
    pub action: String,
    #[serde(default)]
    pub file: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub staged: bool,
}

/// One line of `git diff --name-status`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStatus {
    pub status: String,
    pub file: String,
}

/// Parse `--name-status` output. Renames and copies report the new name.
pub fn parse_status(output: &str) -> Vec<FileStatus> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('\t');
            let status = fields.next()?.trim();
            let file = fields.last()?;
            if status.is_empty() || file.is_empty() {
                return None;
            }
            Some(FileStatus {
                status: status.to_string(),
                file: file.to_string(),
            })
        })
        .collect()
}

struct GitOutput {
    stdout: String,
    stderr: String,
    exit_code: i32,
}

impl GitOutput {
    fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn combined(&self) -> String {
        let mut text = self.stdout.clone();
        text.push_str(&self.stderr);
        text
    }
}

async fn git(root: &Path, args: &[OsString]) -> Result<GitOutput, ApiError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| ApiError::Internal(anyhow::anyhow!("failed to run git: {}", e)))?;

    Ok(GitOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

fn args(list: &[&str]) -> Vec<OsString> {
    list.iter().map(|s| OsString::from(*s)).collect()
}

/// Resolve a required file argument
fn file_arg(ws: &Workspace, file: &str) -> Result<OsString, ApiError> {
    if file.is_empty() {
        return Err(ApiError::BadRequest("file is required".to_string()));
    }
    Ok(ws.resolve(file)?.into_os_string())
}

async fn status(root: &Path) -> Result<Value, ApiError> {
    let branch = git(root, &args(&["rev-parse", "--abbrev-ref", "HEAD"])).await?;
    let mut result = json!({ "branch": branch.stdout.trim() });

    let counts = git(
        root,
        &args(&["rev-list", "--left-right", "--count", "HEAD...@{upstream}"]),
    )
    .await?;
    if counts.success() {
        let parts: Vec<u64> = counts
            .stdout
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect();
        if let [ahead, behind] = parts[..] {
            result["ahead"] = json!(ahead);
            result["behind"] = json!(behind);
        }
    }

    let staged = git(root, &args(&["diff", "--cached", "--name-status"])).await?;
    let unstaged = git(root, &args(&["diff", "--name-status"])).await?;
    let untracked = git(root, &args(&["ls-files", "--others", "--exclude-standard"])).await?;

    result["staged"] = json!(parse_status(&staged.stdout));
    result["unstaged"] = json!(parse_status(&unstaged.stdout));
    result["untracked"] = json!(untracked
        .stdout
        .lines()
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>());
    Ok(result)
}

/// Execute `req` against the repository at the workspace root
pub async fn execute(ws: &Workspace, req: &GitRequest) -> Result<Value, ApiError> {
    let action = GitAction::parse(&req.action)
        .ok_or_else(|| ApiError::BadRequest("invalid action".to_string()))?;
    let root = ws.root();

    let argv = match action {
        GitAction::Status => return status(root).await,
        GitAction::Stage => {
            let mut a = args(&["add", "--"]);
            a.push(file_arg(ws, &req.file)?);
            a
        }
        GitAction::Unstage => {
            let mut a = args(&["restore", "--staged", "--"]);
            a.push(file_arg(ws, &req.file)?);
            a
        }
        GitAction::StageAll => args(&["add", "-A"]),
        GitAction::UnstageAll => args(&["restore", "--staged", "."]),
        GitAction::Commit => {
            if req.message.is_empty() {
                return Err(ApiError::BadRequest("message is required".to_string()));
            }
            let mut a = args(&["commit", "-m"]);
            a.push(OsString::from(&req.message));
            a
        }
        GitAction::Push => args(&["push"]),
        GitAction::Pull => args(&["pull"]),
        GitAction::Diff => {
            let mut a = args(&["diff"]);
            if req.staged {
                a.push("--staged".into());
            }
            if !req.file.is_empty() {
                a.push("--".into());
                a.push(ws.resolve(&req.file)?.into_os_string());
            }
            a
        }
        GitAction::Discard => {
            let mut a = args(&["checkout", "--"]);
            a.push(file_arg(ws, &req.file)?);
            a
        }
    };

    tracing::info!("git {}", action.as_str());
    let out = git(root, &argv).await?;
    Ok(json!({
        "success": out.success(),
        "output": out.combined(),
        "exit_code": out.exit_code,
    }))
}

/// `POST /api/git`
pub async fn handle(
    State(state): State<AppState>,
    Json(req): Json<GitRequest>,
) -> Result<Json<Value>, ApiError> {
    Ok(Json(execute(&state.workspace, &req).await?))
}
