//! Demand driver for the `sim` feature: random-walks each load's demand
//! through the same external-input path the API uses, so a fresh checkout
//! produces live grid activity without real telemetry.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::SimConfig;
use crate::engine::EngineHandle;
use crate::topology::{NodeId, NodeKind};

pub struct DemandDriver {
    handle: EngineHandle,
    cfg: SimConfig,
    rng: StdRng,
    /// (load id, configured base demand)
    loads: Vec<(NodeId, f64)>,
}

impl DemandDriver {
    pub fn new(handle: EngineHandle, cfg: SimConfig) -> Self {
        let loads = handle
            .topology()
            .nodes_of_kind(NodeKind::Load)
            .map(|spec| (spec.id.clone(), spec.demand_kw))
            .collect();
        Self {
            handle,
            cfg,
            rng: StdRng::from_entropy(),
            loads,
        }
    }

    pub async fn run(mut self) {
        if self.loads.is_empty() {
            debug!("no loads in topology, demand driver idle");
            return;
        }
        let mut interval =
            tokio::time::interval(Duration::from_millis(self.cfg.step_ms.max(1)));
        loop {
            interval.tick().await;
            for (id, base_kw) in &self.loads {
                let jitter = self.rng.gen_range(-self.cfg.demand_jitter..=self.cfg.demand_jitter);
                let demand_kw = (base_kw * (1.0 + jitter)).max(0.0);
                if let Err(e) = self.handle.set_load_demand(id.clone(), demand_kw) {
                    warn!(load = %id, error = %e, "demand update rejected");
                }
            }
        }
    }
}

pub fn spawn_demand_driver(handle: EngineHandle, cfg: SimConfig) {
    if !cfg.enabled {
        return;
    }
    tokio::spawn(DemandDriver::new(handle, cfg).run());
}
