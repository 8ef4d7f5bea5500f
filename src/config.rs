use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
    pub topology: TopologyConfig,
    pub sim: SimConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig { pub host: String, pub port: u16 }
impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        Ok(format!("{}:{}", self.host, self.port).parse()?)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Wall-clock period of one simulation tick.
    pub tick_ms: u64,
    /// Maximum cascade re-computation rounds within one tick; exceeding it
    /// aborts the tick with CascadeDivergence.
    pub cascade_cap: u32,
    /// How long a node actor waits for its neighbors' peer updates.
    pub peer_window_ms: u64,
    /// Hard timeout on the coordinator's collection barrier.
    pub barrier_timeout_ms: u64,
    /// Linear factor from bus net flow (kW) to voltage deviation.
    pub voltage_sensitivity: f64,
    /// Committed snapshots retained for queries.
    pub snapshot_history: usize,
    /// Metric samples retained for bounded pulls.
    pub metrics_history: usize,
}

impl EngineConfig {
    pub fn peer_window(&self) -> Duration {
        Duration::from_millis(self.peer_window_ms.max(1))
    }

    pub fn barrier_timeout(&self) -> Duration {
        Duration::from_millis(self.barrier_timeout_ms.max(1))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_ms: 1000,
            cascade_cap: 8,
            peer_window_ms: 200,
            barrier_timeout_ms: 1000,
            voltage_sensitivity: 0.01,
            snapshot_history: 128,
            metrics_history: 512,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    /// TOML file describing nodes and edges.
    pub path: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SimConfig {
    pub enabled: bool,
    /// Relative jitter applied to each load's base demand per step.
    pub demand_jitter: f64,
    pub step_ms: u64,
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("GRIDMESH__").split("__"));
        Ok(figment.extract()?)
    }
}
