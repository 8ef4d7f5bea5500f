use anyhow::Result;
use axum::Router;
use gridmesh::config::Config;
use gridmesh::telemetry::{self, init_tracing};
use gridmesh::{api, engine};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cfg = Config::load()?;

    let app_state = engine::AppState::new(cfg.clone()).await?;

    #[cfg(feature = "sim")]
    gridmesh::sim::spawn_demand_driver(app_state.engine.clone(), cfg.sim.clone());

    let app: Router = api::router(app_state);

    let addr = cfg.server.socket_addr()?;

    if cfg.server.host == "0.0.0.0" {
        warn!(
            "Server binding to 0.0.0.0 - service will be accessible from network! \
            For production, bind to 127.0.0.1 unless behind a firewall/reverse proxy."
        );
    }

    info!(%addr, "starting Grid Mesh");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(telemetry::shutdown_signal())
        .await?;

    warn!("shutdown complete");
    Ok(())
}
