//! HTTP handlers for the IDE capabilities. Each one turns client paths into
//! filesystem paths only through [`crate::workspace::Workspace::resolve`].

pub mod ai;
pub mod files;
pub mod git;
pub mod iplogs;
pub mod search;
pub mod settings;
pub mod terminal;

use anyhow::anyhow;

use crate::error::ApiError;

/// Run blocking work (filesystem walks, SQLite, provider HTTP) off the
/// async executor
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| ApiError::Internal(anyhow!("blocking task failed: {}", err)))
}
