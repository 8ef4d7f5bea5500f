//! Aggregation pipeline: an order-preserving transform from committed tick
//! snapshots to grid-wide metric samples, with a bounded pull history and a
//! broadcast feed for push subscribers.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::engine::snapshot::{NodeState, TickSnapshot};
use crate::topology::NodeId;

/// Derived grid-wide aggregates for one committed tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub total_generation_kw: f64,
    pub total_load_kw: f64,
    pub open_breakers: usize,
    /// Proxy for grid frequency deviation: bus voltage deviations averaged
    /// with each bus weighted by its edge throughput.
    pub frequency_deviation: f64,
}

/// Pure transform from one snapshot to its metric sample.
pub fn sample_from(snapshot: &TickSnapshot) -> MetricSample {
    let mut weighted = 0.0;
    let mut weight_sum = 0.0;
    let mut plain = 0.0;
    let mut buses = 0usize;

    for (id, record) in &snapshot.nodes {
        if let NodeState::Bus {
            voltage_deviation, ..
        } = record.state
        {
            let throughput = bus_throughput_kw(snapshot, id);
            weighted += voltage_deviation * throughput;
            weight_sum += throughput;
            plain += voltage_deviation;
            buses += 1;
        }
    }

    let frequency_deviation = if weight_sum > f64::EPSILON {
        weighted / weight_sum
    } else if buses > 0 {
        // A dead grid carries no flow; fall back to the plain mean.
        plain / buses as f64
    } else {
        0.0
    };

    MetricSample {
        tick: snapshot.tick,
        timestamp: snapshot.timestamp,
        total_generation_kw: snapshot.total_generation_kw(),
        total_load_kw: snapshot.total_load_kw(),
        open_breakers: snapshot.open_breakers(),
        frequency_deviation,
    }
}

fn bus_throughput_kw(snapshot: &TickSnapshot, bus: &NodeId) -> f64 {
    snapshot
        .flows
        .iter()
        .filter(|f| &f.a == bus || &f.b == bus)
        .map(|f| f.flow_kw.abs())
        .sum()
}

/// Bounded metric history plus the live broadcast feed. Single writer (the
/// aggregation pipeline); subscribers that lag or join late see a gap,
/// never a replay.
#[derive(Debug)]
pub struct MetricsStore {
    samples: RwLock<VecDeque<MetricSample>>,
    capacity: usize,
    feed: broadcast::Sender<MetricSample>,
}

impl MetricsStore {
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(16));
        Self {
            samples: RwLock::new(VecDeque::with_capacity(capacity.max(1))),
            capacity: capacity.max(1),
            feed,
        }
    }

    pub fn push(&self, sample: MetricSample) {
        {
            let mut samples = self.samples.write();
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample.clone());
        }
        // No subscribers is fine.
        let _ = self.feed.send(sample);
    }

    pub fn latest(&self) -> Option<MetricSample> {
        self.samples.read().back().cloned()
    }

    /// Samples with tick >= `since_tick`, oldest evicted first. A caller
    /// asking for evicted history gets what is retained, i.e. a gap.
    pub fn since(&self, since_tick: u64) -> Vec<MetricSample> {
        self.samples
            .read()
            .iter()
            .filter(|s| s.tick >= since_tick)
            .cloned()
            .collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricSample> {
        self.feed.subscribe()
    }
}

/// Consumes the committed snapshot sequence and republishes metric samples
/// in strictly increasing tick order.
pub struct AggregationPipeline {
    snapshots: mpsc::Receiver<Arc<TickSnapshot>>,
    store: Arc<MetricsStore>,
    last_tick: Option<u64>,
}

impl AggregationPipeline {
    pub fn new(snapshots: mpsc::Receiver<Arc<TickSnapshot>>, store: Arc<MetricsStore>) -> Self {
        Self {
            snapshots,
            store,
            last_tick: None,
        }
    }

    pub async fn run(mut self) {
        while let Some(snapshot) = self.snapshots.recv().await {
            if let Some(last) = self.last_tick {
                if snapshot.tick <= last {
                    // The coordinator never re-commits a tick; treat this
                    // as a protocol violation and keep ordering intact.
                    warn!(tick = snapshot.tick, last, "out-of-order snapshot dropped");
                    continue;
                }
            }
            self.last_tick = Some(snapshot.tick);
            let sample = sample_from(&snapshot);
            debug!(
                tick = sample.tick,
                total_generation_kw = sample.total_generation_kw,
                total_load_kw = sample.total_load_kw,
                open_breakers = sample.open_breakers,
                "metric sample"
            );
            self.store.push(sample);
        }
        info!("aggregation pipeline stopped");
    }
}
