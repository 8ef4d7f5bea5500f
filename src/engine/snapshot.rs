use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

use crate::topology::{NodeId, NodeKind, NodeSpec, Topology};

/// Kind-specific state of one grid element at the end of a tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeState {
    Generator {
        output_kw: f64,
        setpoint_kw: f64,
        max_capacity_kw: f64,
    },
    Load {
        demand_kw: f64,
        /// Power actually arriving over adjacent edges. Zero when the load
        /// sits behind an open breaker.
        served_kw: f64,
    },
    Bus {
        net_flow_kw: f64,
        voltage_deviation: f64,
    },
    Transformer {
        input_kw: f64,
        output_kw: f64,
        overloaded: bool,
    },
    Breaker {
        open: bool,
    },
}

impl NodeState {
    pub fn kind(&self) -> NodeKind {
        match self {
            NodeState::Generator { .. } => NodeKind::Generator,
            NodeState::Load { .. } => NodeKind::Load,
            NodeState::Bus { .. } => NodeKind::Bus,
            NodeState::Transformer { .. } => NodeKind::Transformer,
            NodeState::Breaker { .. } => NodeKind::Breaker,
        }
    }

    /// Pre-first-tick state derived from the static spec.
    pub fn initial(spec: &NodeSpec) -> Self {
        match spec.kind {
            NodeKind::Generator => NodeState::Generator {
                output_kw: spec.setpoint_kw.clamp(0.0, spec.max_capacity_kw),
                setpoint_kw: spec.setpoint_kw,
                max_capacity_kw: spec.max_capacity_kw,
            },
            NodeKind::Load => NodeState::Load {
                demand_kw: spec.demand_kw,
                served_kw: 0.0,
            },
            NodeKind::Bus => NodeState::Bus {
                net_flow_kw: 0.0,
                voltage_deviation: 0.0,
            },
            NodeKind::Transformer => NodeState::Transformer {
                input_kw: 0.0,
                output_kw: 0.0,
                overloaded: false,
            },
            NodeKind::Breaker => NodeState::Breaker {
                open: !spec.normally_closed,
            },
        }
    }
}

/// Per-node entry in a snapshot: the state plus the degraded flag set when
/// the node computed without hearing from every peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub state: NodeState,
    pub stale: bool,
}

impl NodeRecord {
    pub fn new(state: NodeState) -> Self {
        Self {
            state,
            stale: false,
        }
    }
}

/// Signed flow on one edge; positive means power flows a -> b.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeFlow {
    pub a: NodeId,
    pub b: NodeId,
    pub flow_kw: f64,
}

/// Immutable record of every node's state and every edge's flow at the end
/// of one committed tick. Superseded, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickSnapshot {
    pub tick: u64,
    pub timestamp: DateTime<Utc>,
    pub nodes: BTreeMap<NodeId, NodeRecord>,
    pub flows: Vec<EdgeFlow>,
    /// True when any node reported a stale peer this tick.
    pub degraded: bool,
}

impl TickSnapshot {
    /// Tick-zero baseline published before the first computed tick, so
    /// queries never observe an empty store.
    pub fn initial(topology: &Topology) -> Self {
        let nodes = topology
            .nodes()
            .map(|spec| (spec.id.clone(), NodeRecord::new(NodeState::initial(spec))))
            .collect();
        let flows = topology
            .edges()
            .iter()
            .map(|e| EdgeFlow {
                a: e.a.clone(),
                b: e.b.clone(),
                flow_kw: 0.0,
            })
            .collect();
        Self {
            tick: 0,
            timestamp: Utc::now(),
            nodes,
            flows,
            degraded: false,
        }
    }

    pub fn total_generation_kw(&self) -> f64 {
        self.nodes
            .values()
            .map(|r| match r.state {
                NodeState::Generator { output_kw, .. } => output_kw,
                _ => 0.0,
            })
            .sum()
    }

    pub fn total_load_kw(&self) -> f64 {
        self.nodes
            .values()
            .map(|r| match r.state {
                NodeState::Load { demand_kw, .. } => demand_kw,
                _ => 0.0,
            })
            .sum()
    }

    pub fn open_breakers(&self) -> usize {
        self.nodes
            .values()
            .filter(|r| matches!(r.state, NodeState::Breaker { open: true }))
            .count()
    }

    pub fn breaker_open(&self, id: &NodeId) -> Option<bool> {
        match self.nodes.get(id)?.state {
            NodeState::Breaker { open } => Some(open),
            _ => None,
        }
    }

    /// Signed flow between two adjacent nodes, positive from `a` to `b`.
    pub fn flow_between(&self, a: &NodeId, b: &NodeId) -> Option<f64> {
        self.flows.iter().find_map(|f| {
            if &f.a == a && &f.b == b {
                Some(f.flow_kw)
            } else if &f.a == b && &f.b == a {
                Some(-f.flow_kw)
            } else {
                None
            }
        })
    }
}

/// Bounded history of committed snapshots, oldest evicted. Single writer
/// (the tick coordinator); readers get cheap `Arc` clones.
#[derive(Debug)]
pub struct SnapshotStore {
    inner: RwLock<VecDeque<Arc<TickSnapshot>>>,
    capacity: usize,
}

impl SnapshotStore {
    /// Seeds the store with the tick-zero baseline.
    pub fn new(topology: &Topology, capacity: usize) -> Self {
        let mut history = VecDeque::with_capacity(capacity.max(1));
        history.push_back(Arc::new(TickSnapshot::initial(topology)));
        Self {
            inner: RwLock::new(history),
            capacity: capacity.max(1),
        }
    }

    pub fn commit(&self, snapshot: TickSnapshot) -> Arc<TickSnapshot> {
        let snapshot = Arc::new(snapshot);
        let mut history = self.inner.write();
        if history.len() == self.capacity {
            history.pop_front();
        }
        history.push_back(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Arc<TickSnapshot> {
        self.inner
            .read()
            .back()
            .expect("store is seeded at construction")
            .clone()
    }

    pub fn at_tick(&self, tick: u64) -> Option<Arc<TickSnapshot>> {
        self.inner
            .read()
            .iter()
            .find(|s| s.tick == tick)
            .cloned()
    }

    pub fn latest_tick(&self) -> u64 {
        self.latest().tick
    }
}
