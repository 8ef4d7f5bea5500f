use axum::{extract::State, response::IntoResponse, Json};
use serde::Serialize;

use crate::engine::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    timestamp: chrono::DateTime<chrono::Utc>,
    last_committed_tick: u64,
    degraded: bool,
}

/// GET /health - liveness plus the engine's last committed tick.
pub async fn health_check(State(st): State<AppState>) -> impl IntoResponse {
    let snapshot = st.engine.latest_snapshot();
    Json(HealthResponse {
        status: if snapshot.degraded { "degraded" } else { "ok" },
        timestamp: chrono::Utc::now(),
        last_committed_tick: snapshot.tick,
        degraded: snapshot.degraded,
    })
}
