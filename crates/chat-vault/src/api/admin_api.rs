//! Liveness and totals

use axum::{extract::State, Json};
use serde::Serialize;

use super::{track, with_db, ApiResult};
use crate::chat_db::ChatStats;
use crate::metrics;
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub server: &'static str,
    pub version: &'static str,
}

/// GET /api/health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        server: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /api/stats
pub async fn stats(State(state): State<AppState>) -> ApiResult<Json<ChatStats>> {
    let result = with_db(&state, |db| db.conversations.stats()).await;
    if let Ok(stats) = &result {
        metrics::set_conversations(stats.total_chats);
    }
    track("stats", result.map(Json))
}
