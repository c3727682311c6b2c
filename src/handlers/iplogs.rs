use axum::extract::{Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

use super::blocking;
use crate::error::ApiError;
use crate::server::AppState;

const DEFAULT_LIMIT: usize = 100;

#[derive(Debug, Default, Deserialize)]
pub struct IpLogsQuery {
    #[serde(default)]
    pub limit: Option<String>,
    #[serde(default)]
    pub view: Option<String>,
}

impl IpLogsQuery {
    /// Unparsable or non-positive limits fall back to the default
    fn limit(&self) -> usize {
        self.limit
            .as_deref()
            .and_then(|l| l.parse::<usize>().ok())
            .filter(|l| *l > 0)
            .unwrap_or(DEFAULT_LIMIT)
    }
}

/// `GET /api/iplogs?limit=&view=unique|detailed`
pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<IpLogsQuery>,
) -> Result<Json<Value>, ApiError> {
    if !state.access_log.is_enabled() {
        return Ok(Json(json!({
            "enabled": false,
            "message": "IP logging is disabled in config",
        })));
    }

    let limit = query.limit();
    let log = state.access_log.clone();
    if query.view.as_deref() == Some("unique") {
        let ips = blocking(move || log.unique_ips(limit)).await??;
        return Ok(Json(json!({ "enabled": true, "view": "unique", "ips": ips })));
    }

    let logs = blocking(move || log.recent(limit)).await??;
    Ok(Json(json!({
        "enabled": true,
        "view": "detailed",
        "count": logs.len(),
        "logs": logs,
    })))
}
