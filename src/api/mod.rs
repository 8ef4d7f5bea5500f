pub mod error;
pub mod grid;
pub mod health;

use axum::routing::{get, post};
use axum::Router;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::engine::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/snapshot", get(grid::get_snapshot))
        .route("/api/v1/metrics", get(grid::get_metrics))
        .route("/api/v1/trips", get(grid::get_trips))
        .route("/api/v1/generators/:id/setpoint", post(grid::set_setpoint))
        .route("/api/v1/loads/:id/demand", post(grid::set_demand))
        .route("/api/v1/breakers/:id/trip", post(grid::trip_breaker))
        .route("/api/v1/breakers/:id/reclose", post(grid::reclose_breaker))
        .layer(
            ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(64 * 1024))
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
