use axum::extract::State;
use axum::Json;
use serde_json::{json, Value};

use crate::server::AppState;

/// `GET /api/config`: what the frontend needs to set up the editor. Keys
/// themselves are never returned.
pub async fn config(State(state): State<AppState>) -> Json<Value> {
    let config = &state.config;
    Json(json!({
        "editor": {
            "theme": config.editor.theme,
            "font_size": config.editor.font_size,
            "tab_size": config.editor.tab_size,
        },
        "ai": {
            "provider": config.ai.provider.as_str(),
            "has_key": config.ai.has_key(),
        },
    }))
}
