//! Grid state queries and control command endpoints.

use axum::extract::{Path, Query, State};
use axum::{http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::engine::AppState;
use crate::topology::NodeId;

#[derive(Debug, Deserialize)]
pub struct SnapshotQuery {
    pub tick: Option<u64>,
}

/// GET /api/v1/snapshot - latest committed snapshot, or a retained
/// historical one when `tick` is given.
pub async fn get_snapshot(
    State(st): State<AppState>,
    Query(q): Query<SnapshotQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = match q.tick {
        Some(tick) => st
            .engine
            .snapshot_at(tick)
            .ok_or_else(|| ApiError::NotFound(format!("no snapshot retained for tick {tick}")))?,
        None => st.engine.latest_snapshot(),
    };
    Ok(Json(snapshot.as_ref().clone()))
}

#[derive(Debug, Deserialize)]
pub struct MetricsQuery {
    pub since_tick: Option<u64>,
}

/// GET /api/v1/metrics - bounded pull of metric samples in tick order.
/// Evicted history is a gap, not an error.
pub async fn get_metrics(
    State(st): State<AppState>,
    Query(q): Query<MetricsQuery>,
) -> impl IntoResponse {
    Json(st.engine.metrics_since(q.since_tick.unwrap_or(0)))
}

#[derive(Debug, Deserialize)]
pub struct TripsQuery {
    pub since_seq: Option<u64>,
}

/// GET /api/v1/trips - append-only trip event feed, consumable from any
/// sequence number with no gaps.
pub async fn get_trips(
    State(st): State<AppState>,
    Query(q): Query<TripsQuery>,
) -> impl IntoResponse {
    Json(st.engine.trips_since(q.since_seq.unwrap_or(0)))
}

#[derive(Debug, Deserialize)]
pub struct SetpointRequest {
    pub value_kw: f64,
}

#[derive(Debug, Serialize)]
pub struct Ack {
    pub status: &'static str,
    /// Commands take effect at the start of the next tick.
    pub applies_from_tick: u64,
}

impl Ack {
    fn next_tick(st: &AppState) -> Self {
        Self {
            status: "accepted",
            applies_from_tick: st.engine.latest_snapshot().tick + 1,
        }
    }
}

/// POST /api/v1/generators/:id/setpoint
pub async fn set_setpoint(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SetpointRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine
        .set_generator_setpoint(NodeId::new(id), req.value_kw)?;
    Ok((StatusCode::ACCEPTED, Json(Ack::next_tick(&st))))
}

#[derive(Debug, Deserialize)]
pub struct DemandRequest {
    pub value_kw: f64,
}

/// POST /api/v1/loads/:id/demand - external demand input.
pub async fn set_demand(
    State(st): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<DemandRequest>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine.set_load_demand(NodeId::new(id), req.value_kw)?;
    Ok((StatusCode::ACCEPTED, Json(Ack::next_tick(&st))))
}

/// POST /api/v1/breakers/:id/trip - manual trip, highest precedence.
pub async fn trip_breaker(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine.trip_breaker(NodeId::new(id))?;
    Ok((StatusCode::ACCEPTED, Json(Ack::next_tick(&st))))
}

/// POST /api/v1/breakers/:id/reclose
pub async fn reclose_breaker(
    State(st): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    st.engine.reclose_breaker(NodeId::new(id))?;
    Ok((StatusCode::ACCEPTED, Json(Ack::next_tick(&st))))
}
