use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::broadcast;

use super::snapshot::{SnapshotStore, TickSnapshot};
use crate::metrics::{MetricSample, MetricsStore};
use crate::protection::{TripEvent, TripLog};
use crate::topology::{NodeId, NodeKind, Topology};

/// External control command, validated synchronously and applied at the
/// start of the next tick.
#[derive(Debug, Clone)]
pub enum GridCommand {
    SetGeneratorSetpoint { node: NodeId, value_kw: f64 },
    SetLoadDemand { node: NodeId, value_kw: f64 },
    TripBreaker { node: NodeId },
    RecloseBreaker { node: NodeId },
}

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("no such node (or wrong kind): {0}")]
    InvalidNode(NodeId),

    #[error("value {value_kw} kW outside [0, {max_kw}] kW")]
    OutOfRange { value_kw: f64, max_kw: f64 },

    #[error("breaker {0} is already in the requested state")]
    AlreadyInState(NodeId),
}

/// Commands accepted since the last tick started. Drained by the
/// coordinator in round 0; re-queued wholesale when a tick aborts so an
/// operator command is never lost to a rollback.
#[derive(Debug, Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<GridCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, command: GridCommand) {
        self.inner.lock().push_back(command);
    }

    pub fn drain(&self) -> Vec<GridCommand> {
        self.inner.lock().drain(..).collect()
    }

    pub fn requeue(&self, commands: Vec<GridCommand>) {
        let mut inner = self.inner.lock();
        for command in commands.into_iter().rev() {
            inner.push_front(command);
        }
    }
}

/// Shared handle into the running engine: read access to committed state
/// and the validated command path. Cheap to clone; this is what the API
/// layer holds.
#[derive(Clone)]
pub struct EngineHandle {
    topology: Arc<Topology>,
    snapshots: Arc<SnapshotStore>,
    trips: Arc<TripLog>,
    metrics: Arc<MetricsStore>,
    queue: Arc<CommandQueue>,
}

impl EngineHandle {
    pub fn new(
        topology: Arc<Topology>,
        snapshots: Arc<SnapshotStore>,
        trips: Arc<TripLog>,
        metrics: Arc<MetricsStore>,
        queue: Arc<CommandQueue>,
    ) -> Self {
        Self {
            topology,
            snapshots,
            trips,
            metrics,
            queue,
        }
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn latest_snapshot(&self) -> Arc<TickSnapshot> {
        self.snapshots.latest()
    }

    pub fn snapshot_at(&self, tick: u64) -> Option<Arc<TickSnapshot>> {
        self.snapshots.at_tick(tick)
    }

    pub fn trips_since(&self, seq: u64) -> Vec<TripEvent> {
        self.trips.since(seq)
    }

    pub fn metrics_since(&self, tick: u64) -> Vec<MetricSample> {
        self.metrics.since(tick)
    }

    pub fn latest_metric(&self) -> Option<MetricSample> {
        self.metrics.latest()
    }

    pub fn subscribe_metrics(&self) -> broadcast::Receiver<MetricSample> {
        self.metrics.subscribe()
    }

    /// Queue a generator setpoint change for the next tick.
    pub fn set_generator_setpoint(&self, node: NodeId, value_kw: f64) -> Result<(), CommandError> {
        let spec = self
            .topology
            .node(&node)
            .filter(|n| n.kind == NodeKind::Generator)
            .ok_or_else(|| CommandError::InvalidNode(node.clone()))?;
        if !(0.0..=spec.max_capacity_kw).contains(&value_kw) {
            return Err(CommandError::OutOfRange {
                value_kw,
                max_kw: spec.max_capacity_kw,
            });
        }
        self.queue
            .push(GridCommand::SetGeneratorSetpoint { node, value_kw });
        Ok(())
    }

    /// Queue a load demand change for the next tick. Demand is an external
    /// input; only non-negativity is enforced.
    pub fn set_load_demand(&self, node: NodeId, value_kw: f64) -> Result<(), CommandError> {
        self.topology
            .node(&node)
            .filter(|n| n.kind == NodeKind::Load)
            .ok_or_else(|| CommandError::InvalidNode(node.clone()))?;
        if value_kw < 0.0 {
            return Err(CommandError::OutOfRange {
                value_kw,
                max_kw: f64::INFINITY,
            });
        }
        self.queue.push(GridCommand::SetLoadDemand { node, value_kw });
        Ok(())
    }

    pub fn trip_breaker(&self, node: NodeId) -> Result<(), CommandError> {
        self.validate_breaker(&node, true)?;
        self.queue.push(GridCommand::TripBreaker { node });
        Ok(())
    }

    pub fn reclose_breaker(&self, node: NodeId) -> Result<(), CommandError> {
        self.validate_breaker(&node, false)?;
        self.queue.push(GridCommand::RecloseBreaker { node });
        Ok(())
    }

    fn validate_breaker(&self, node: &NodeId, want_open: bool) -> Result<(), CommandError> {
        self.topology
            .node(node)
            .filter(|n| n.kind == NodeKind::Breaker)
            .ok_or_else(|| CommandError::InvalidNode(node.clone()))?;
        let open = self
            .latest_snapshot()
            .breaker_open(node)
            .ok_or_else(|| CommandError::InvalidNode(node.clone()))?;
        if open == want_open {
            return Err(CommandError::AlreadyInState(node.clone()));
        }
        Ok(())
    }
}
