use axum::extract::{Query, State};
use axum::Json;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::Path;

use crate::error::ApiError;
use crate::server::AppState;
use crate::workspace::Workspace;

/// Directories left out of listings even though they are not hidden
const SKIPPED_DIRS: &[&str] = &["node_modules", "vendor"];

#[derive(Debug, Deserialize)]
pub struct PathQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct WriteRequest {
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    #[serde(default)]
    pub new_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub mod_time: String,
}

fn display_path(ws: &Workspace, path: &Path) -> String {
    ws.relative(path)
        .map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn not_found(err: std::io::Error, path: &str) -> ApiError {
    if err.kind() == std::io::ErrorKind::NotFound {
        ApiError::NotFound(format!("{} not found", path))
    } else {
        ApiError::Io(err)
    }
}

/// List one directory: hidden entries and dependency directories are
/// skipped, directories sort before files, then by name.
pub async fn list_dir(ws: &Workspace, relative: &str) -> Result<Vec<FileEntry>, ApiError> {
    let dir = ws.resolve(relative)?;
    let mut reader = tokio::fs::read_dir(&dir).await?;
    let mut entries = Vec::new();

    while let Some(entry) = reader.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        let Ok(metadata) = entry.metadata().await else {
            continue;
        };
        if metadata.is_dir() && SKIPPED_DIRS.contains(&name.as_str()) {
            continue;
        }

        let mod_time = metadata
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339_opts(SecondsFormat::Secs, true))
            .unwrap_or_default();

        entries.push(FileEntry {
            path: display_path(ws, &entry.path()),
            name,
            is_dir: metadata.is_dir(),
            size: metadata.len(),
            mod_time,
        });
    }

    entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.name.cmp(&b.name)));
    Ok(entries)
}

/// `GET /api/files?path=`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let files = list_dir(&state.workspace, &query.path).await?;
    Ok(Json(json!({ "path": query.path, "files": files })))
}

/// `GET /api/file?path=`
pub async fn read(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = state.workspace.resolve(&query.path)?;
    let bytes = tokio::fs::read(&path)
        .await
        .map_err(|err| not_found(err, &query.path))?;
    Ok(Json(json!({
        "path": query.path,
        "content": String::from_utf8_lossy(&bytes),
    })))
}

/// `POST|PUT /api/file?path=` with `{content}`. Missing parents are created.
pub async fn write(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    Json(req): Json<WriteRequest>,
) -> Result<Json<Value>, ApiError> {
    let path = state.workspace.resolve(&query.path)?;
    if state.workspace.is_root(&path) {
        return Err(ApiError::BadRequest("path is required".to_string()));
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, req.content.as_bytes()).await?;
    tracing::debug!("wrote {} ({} bytes)", path.display(), req.content.len());
    Ok(Json(json!({ "success": true })))
}

/// `DELETE /api/file?path=`. Directories are removed recursively.
pub async fn delete(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
) -> Result<Json<Value>, ApiError> {
    let path = state.workspace.resolve(&query.path)?;
    if state.workspace.is_root(&path) {
        return Err(ApiError::BadRequest(
            "cannot delete the workspace root".to_string(),
        ));
    }

    let metadata = tokio::fs::symlink_metadata(&path)
        .await
        .map_err(|err| not_found(err, &query.path))?;
    if metadata.is_dir() {
        tokio::fs::remove_dir_all(&path).await?;
    } else {
        tokio::fs::remove_file(&path).await?;
    }
    tracing::info!("deleted {}", path.display());
    Ok(Json(json!({ "success": true })))
}

/// `PATCH /api/file?path=` with `{new_path}`
pub async fn rename(
    State(state): State<AppState>,
    Query(query): Query<PathQuery>,
    Json(req): Json<RenameRequest>,
) -> Result<Json<Value>, ApiError> {
    if req.new_path.is_empty() {
        return Err(ApiError::BadRequest("new_path is required".to_string()));
    }

    let from = state.workspace.resolve(&query.path)?;
    let to = state.workspace.resolve(&req.new_path)?;
    if state.workspace.is_root(&from) || state.workspace.is_root(&to) {
        return Err(ApiError::BadRequest(
            "cannot rename the workspace root".to_string(),
        ));
    }

    if let Some(parent) = to.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::rename(&from, &to).await?;
    tracing::info!("renamed {} -> {}", from.display(), to.display());
    Ok(Json(json!({ "success": true, "new_path": req.new_path })))
}
