//! Tick coordination: the two-phase broadcast/collect protocol, bounded
//! cascade sub-rounds, commit/rollback, and engine assembly.

pub mod flow;
pub mod handle;
pub mod snapshot;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, trace, warn};

use crate::config::{Config, EngineConfig};
use crate::mesh::{
    self, ActorMsg, AddressedCommand, Contribution, MeshConfig, MeshEvent, NodeCommand,
};
use crate::metrics::{AggregationPipeline, MetricsStore};
use crate::protection::{ProtectionEngine, TripLog};
use crate::topology::{NodeId, Topology};

pub use handle::{CommandError, CommandQueue, EngineHandle, GridCommand};
pub use snapshot::{EdgeFlow, NodeRecord, NodeState, SnapshotStore, TickSnapshot};

#[derive(Debug, Error)]
pub enum EngineError {
    /// Trips kept cascading past the configured round cap. The tick was
    /// aborted and state rolled back to the last committed snapshot.
    #[error("cascade divergence at tick {tick}: exceeded {cap} cascade rounds")]
    CascadeDivergence { tick: u64, cap: u32 },

    /// Not every node reported within the collection window. Indicates a
    /// scheduling fault, not transient loss; the tick is aborted.
    #[error("barrier timeout at tick {tick} round {round}: missing {missing:?}")]
    BarrierTimeout {
        tick: u64,
        round: u32,
        missing: Vec<NodeId>,
    },

    #[error("mesh channel closed")]
    MeshClosed,
}

/// Coordinator phase, advanced once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorPhase {
    Idle,
    Broadcasting,
    Collecting,
    Stabilizing,
    Committed,
}

/// Drives discrete simulation steps: every node actor processes exactly
/// one round of inbound messages before any node starts the next round.
pub struct TickCoordinator {
    topology: Arc<Topology>,
    cascade_cap: u32,
    barrier_timeout: Duration,
    mailboxes: HashMap<NodeId, mpsc::Sender<ActorMsg>>,
    events: mpsc::Receiver<MeshEvent>,
    protection: ProtectionEngine,
    snapshots: Arc<SnapshotStore>,
    queue: Arc<CommandQueue>,
    publish: mpsc::Sender<Arc<TickSnapshot>>,
    tick: u64,
    phase: CoordinatorPhase,
    last_committed: Arc<TickSnapshot>,
}

impl TickCoordinator {
    #[allow(clippy::too_many_arguments)]
    fn new(
        topology: Arc<Topology>,
        cfg: &EngineConfig,
        mailboxes: HashMap<NodeId, mpsc::Sender<ActorMsg>>,
        events: mpsc::Receiver<MeshEvent>,
        protection: ProtectionEngine,
        snapshots: Arc<SnapshotStore>,
        queue: Arc<CommandQueue>,
        publish: mpsc::Sender<Arc<TickSnapshot>>,
    ) -> Self {
        let last_committed = snapshots.latest();
        Self {
            topology,
            cascade_cap: cfg.cascade_cap,
            barrier_timeout: cfg.barrier_timeout(),
            mailboxes,
            events,
            protection,
            snapshots,
            queue,
            publish,
            tick: 0,
            phase: CoordinatorPhase::Idle,
            last_committed,
        }
    }

    pub fn current_tick(&self) -> u64 {
        self.tick
    }

    /// Tick loop. Recoverable tick failures (divergence, barrier timeout)
    /// are logged and the next tick proceeds from the prior snapshot.
    pub async fn run(mut self, period: Duration) -> Result<()> {
        let mut interval = tokio::time::interval(period.max(Duration::from_millis(1)));
        loop {
            interval.tick().await;
            match self.run_tick().await {
                Ok(snapshot) => {
                    trace!(tick = snapshot.tick, "tick loop advanced");
                }
                Err(EngineError::MeshClosed) => {
                    warn!("mesh closed, coordinator stopping");
                    return Ok(());
                }
                Err(e) => warn!(error = %e, "tick aborted"),
            }
        }
    }

    /// Execute exactly one tick. Public so tests (and the sim harness) can
    /// step the engine deterministically.
    pub async fn run_tick(&mut self) -> Result<Arc<TickSnapshot>, EngineError> {
        let tick = self.tick + 1;
        self.protection.begin_tick();

        // External commands are applied in round 0 with highest precedence.
        let external = self.queue.drain();
        let mut commands: HashMap<NodeId, Vec<NodeCommand>> = HashMap::new();
        // Each breaker switches at most once per tick, however many times
        // the command was queued.
        let mut switched: HashSet<NodeId> = HashSet::new();
        for command in &external {
            match command {
                GridCommand::SetGeneratorSetpoint { node, value_kw } => {
                    commands
                        .entry(node.clone())
                        .or_default()
                        .push(NodeCommand::SetGeneratorSetpoint {
                            value_kw: *value_kw,
                        });
                }
                GridCommand::SetLoadDemand { node, value_kw } => {
                    commands
                        .entry(node.clone())
                        .or_default()
                        .push(NodeCommand::SetLoadDemand {
                            value_kw: *value_kw,
                        });
                }
                GridCommand::TripBreaker { node } => {
                    // Double-tripping an open breaker is a no-op, not an
                    // error, and produces no event.
                    if self.last_committed.breaker_open(node) == Some(false)
                        && switched.insert(node.clone())
                    {
                        self.protection.record_manual(node, true);
                        commands
                            .entry(node.clone())
                            .or_default()
                            .push(NodeCommand::OpenBreaker);
                    }
                }
                GridCommand::RecloseBreaker { node } => {
                    if self.last_committed.breaker_open(node) == Some(true)
                        && switched.insert(node.clone())
                    {
                        self.protection.record_manual(node, false);
                        commands
                            .entry(node.clone())
                            .or_default()
                            .push(NodeCommand::CloseBreaker);
                    }
                }
            }
        }

        let mut round: u32 = 0;
        let (reports, resolved) = loop {
            self.set_phase(CoordinatorPhase::Broadcasting);
            for id in self.topology.node_ids() {
                let node_commands = commands.remove(id).unwrap_or_default();
                self.send_to(
                    id,
                    ActorMsg::Compute {
                        tick,
                        round,
                        commands: node_commands,
                    },
                )
                .await?;
            }

            self.set_phase(CoordinatorPhase::Collecting);
            let contributions = match self.collect_contributions(tick, round).await {
                Ok(c) => c,
                Err(e) => {
                    self.abort_tick(tick, external).await?;
                    return Err(e);
                }
            };

            let resolved = flow::resolve(&self.topology, &contributions);
            for id in self.topology.node_ids() {
                self.send_to(
                    id,
                    ActorMsg::Resolve {
                        tick,
                        round,
                        inflows: resolved.inflows(&self.topology, id),
                        overloaded: resolved.is_overloaded(id),
                    },
                )
                .await?;
            }

            let reports = match self.collect_reports(tick, round).await {
                Ok(r) => r,
                Err(e) => {
                    self.abort_tick(tick, external).await?;
                    return Err(e);
                }
            };

            self.set_phase(CoordinatorPhase::Stabilizing);
            let trips = self.protection.evaluate_round(tick, round, &reports, &resolved);
            if trips.is_empty() {
                break (reports, resolved);
            }

            round += 1;
            if round > self.cascade_cap {
                self.abort_tick(tick, external).await?;
                return Err(EngineError::CascadeDivergence {
                    tick,
                    cap: self.cascade_cap,
                });
            }
            debug!(tick, round, trips = trips.len(), "cascade round");
            commands = group_commands(trips);
        };

        let degraded = reports.values().any(|r| r.stale);
        let flows = self
            .topology
            .edges()
            .iter()
            .zip(resolved.edge_flows())
            .map(|(edge, flow_kw)| EdgeFlow {
                a: edge.a.clone(),
                b: edge.b.clone(),
                flow_kw: *flow_kw,
            })
            .collect();
        let committed = self.snapshots.commit(TickSnapshot {
            tick,
            timestamp: Utc::now(),
            nodes: reports,
            flows,
            degraded,
        });
        let trip_events = self.protection.commit(tick);

        self.tick = tick;
        self.last_committed = committed.clone();
        self.set_phase(CoordinatorPhase::Committed);
        info!(
            tick,
            rounds = round + 1,
            trips = trip_events.len(),
            degraded,
            "tick committed"
        );

        if self.publish.send(committed.clone()).await.is_err() {
            warn!("aggregation pipeline gone, snapshot not republished");
        }
        self.set_phase(CoordinatorPhase::Idle);
        Ok(committed)
    }

    /// Abort the in-flight tick: discard tentative trips, restore every
    /// actor from the last committed snapshot, and re-queue the external
    /// commands so the next tick picks them up.
    async fn abort_tick(&mut self, tick: u64, external: Vec<GridCommand>) -> Result<(), EngineError> {
        warn!(tick, "rolling back to tick {}", self.last_committed.tick);
        self.protection.rollback(tick);
        self.queue.requeue(external);
        let records: Vec<(NodeId, NodeRecord)> = self
            .last_committed
            .nodes
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        for (id, record) in records {
            self.send_to(&id, ActorMsg::Restore { record }).await?;
        }
        self.set_phase(CoordinatorPhase::Idle);
        Ok(())
    }

    async fn send_to(&self, id: &NodeId, msg: ActorMsg) -> Result<(), EngineError> {
        self.mailboxes
            .get(id)
            .ok_or(EngineError::MeshClosed)?
            .send(msg)
            .await
            .map_err(|_| EngineError::MeshClosed)
    }

    /// Collection barrier for the peer-exchange half of a round.
    async fn collect_contributions(
        &mut self,
        tick: u64,
        round: u32,
    ) -> Result<BTreeMap<NodeId, Contribution>, EngineError> {
        let deadline = Instant::now() + self.barrier_timeout;
        let mut out = BTreeMap::new();
        while out.len() < self.topology.node_count() {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(MeshEvent::Contribution {
                    node,
                    tick: t,
                    round: r,
                    contribution,
                    stale,
                })) if t == tick && r == round => {
                    if stale {
                        debug!(node = %node, tick, round, "stale contribution");
                    }
                    out.insert(node, contribution);
                }
                // Stragglers from an aborted round.
                Ok(Some(_)) => {}
                Ok(None) => return Err(EngineError::MeshClosed),
                Err(_elapsed) => {
                    return Err(self.barrier_timeout_error(tick, round, &out));
                }
            }
        }
        Ok(out)
    }

    /// Collection barrier for the final reports of a round.
    async fn collect_reports(
        &mut self,
        tick: u64,
        round: u32,
    ) -> Result<BTreeMap<NodeId, NodeRecord>, EngineError> {
        let deadline = Instant::now() + self.barrier_timeout;
        let mut out = BTreeMap::new();
        while out.len() < self.topology.node_count() {
            match timeout_at(deadline, self.events.recv()).await {
                Ok(Some(MeshEvent::Computed {
                    node,
                    tick: t,
                    round: r,
                    record,
                })) if t == tick && r == round => {
                    out.insert(node, record);
                }
                Ok(Some(_)) => {}
                Ok(None) => return Err(EngineError::MeshClosed),
                Err(_elapsed) => {
                    return Err(self.barrier_timeout_error(tick, round, &out));
                }
            }
        }
        Ok(out)
    }

    fn barrier_timeout_error<T>(
        &self,
        tick: u64,
        round: u32,
        received: &BTreeMap<NodeId, T>,
    ) -> EngineError {
        let missing = self
            .topology
            .node_ids()
            .filter(|id| !received.contains_key(*id))
            .cloned()
            .collect();
        EngineError::BarrierTimeout {
            tick,
            round,
            missing,
        }
    }

    fn set_phase(&mut self, phase: CoordinatorPhase) {
        trace!(from = ?self.phase, to = ?phase, "coordinator phase");
        self.phase = phase;
    }
}

fn group_commands(commands: Vec<AddressedCommand>) -> HashMap<NodeId, Vec<NodeCommand>> {
    let mut grouped: HashMap<NodeId, Vec<NodeCommand>> = HashMap::new();
    for c in commands {
        grouped.entry(c.node).or_default().push(c.command);
    }
    grouped
}

/// A fully wired engine, not yet running. Tests drive the coordinator tick
/// by tick; production spawns it via [`spawn_engine_tasks`].
pub struct GridEngine {
    pub coordinator: TickCoordinator,
    pub pipeline: AggregationPipeline,
    pub handle: EngineHandle,
    pub mesh_tasks: Vec<JoinHandle<()>>,
}

/// Spawn the mesh and wire up coordinator, protection, stores, and the
/// aggregation pipeline.
pub fn assemble(topology: Arc<Topology>, cfg: &EngineConfig) -> GridEngine {
    let mesh = mesh::spawn_mesh(
        topology.clone(),
        &MeshConfig {
            peer_window: cfg.peer_window(),
            voltage_sensitivity: cfg.voltage_sensitivity,
        },
    );
    let snapshots = Arc::new(SnapshotStore::new(&topology, cfg.snapshot_history));
    let trips = Arc::new(TripLog::new());
    let metrics = Arc::new(MetricsStore::new(cfg.metrics_history));
    let queue = Arc::new(CommandQueue::new());
    let (snapshot_tx, snapshot_rx) = mpsc::channel(64);

    let protection = ProtectionEngine::new(topology.clone(), trips.clone());
    let coordinator = TickCoordinator::new(
        topology.clone(),
        cfg,
        mesh.mailboxes,
        mesh.events,
        protection,
        snapshots.clone(),
        queue.clone(),
        snapshot_tx,
    );
    let pipeline = AggregationPipeline::new(snapshot_rx, metrics.clone());
    let handle = EngineHandle::new(topology, snapshots, trips, metrics, queue);

    GridEngine {
        coordinator,
        pipeline,
        handle,
        mesh_tasks: mesh.tasks,
    }
}

/// Shared application state handed to the API layer.
#[derive(Clone)]
pub struct AppState {
    pub cfg: Config,
    pub engine: EngineHandle,
}

impl AppState {
    pub async fn new(cfg: Config) -> Result<Self> {
        let topology = Arc::new(Topology::load(&cfg.topology.path)?);
        info!(
            nodes = topology.node_count(),
            edges = topology.edge_count(),
            islands = topology.islands().len(),
            "topology loaded from {}",
            cfg.topology.path
        );
        let engine = assemble(topology, &cfg.engine);
        let handle = engine.handle.clone();
        spawn_engine_tasks(engine, &cfg);
        Ok(Self {
            cfg,
            engine: handle,
        })
    }
}

pub fn spawn_engine_tasks(engine: GridEngine, cfg: &Config) {
    let GridEngine {
        coordinator,
        pipeline,
        ..
    } = engine;
    let period = Duration::from_millis(cfg.engine.tick_ms.max(1));
    tokio::spawn(async move {
        if let Err(e) = coordinator.run(period).await {
            warn!(error = %e, "tick coordinator stopped");
        }
    });
    tokio::spawn(pipeline.run());
}
