use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace, warn};

use super::message::{
    ActorMsg, Contribution, MeshEvent, NodeCommand, PeerPayload, PeerUpdate,
};
use crate::engine::snapshot::{NodeRecord, NodeState};
use crate::topology::{NodeId, NodeSpec, Topology};

/// Per-tick phase of a node actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    AwaitingPeers,
    Computed,
}

/// One concurrent unit per grid element. Exclusively owns that element's
/// mutable state; all state change flows through the mailbox.
pub struct NodeActor {
    id: NodeId,
    spec: NodeSpec,
    topology: Arc<Topology>,
    inbox: mpsc::Receiver<ActorMsg>,
    peers: HashMap<NodeId, mpsc::Sender<ActorMsg>>,
    events: mpsc::Sender<MeshEvent>,
    peer_window: Duration,
    voltage_sensitivity: f64,
    state: NodeState,
    phase: Phase,
    /// Peer updates that arrived before this node entered the round they
    /// belong to. The coordinator signals nodes one by one, so a fast
    /// neighbor's update can land ahead of our own round signal.
    pending: Vec<PeerUpdate>,
}

impl NodeActor {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new(
        spec: NodeSpec,
        topology: Arc<Topology>,
        inbox: mpsc::Receiver<ActorMsg>,
        peers: HashMap<NodeId, mpsc::Sender<ActorMsg>>,
        events: mpsc::Sender<MeshEvent>,
        peer_window: Duration,
        voltage_sensitivity: f64,
    ) -> Self {
        let state = NodeState::initial(&spec);
        Self {
            id: spec.id.clone(),
            spec,
            topology,
            inbox,
            peers,
            events,
            peer_window,
            voltage_sensitivity,
            state,
            phase: Phase::Idle,
            pending: Vec::new(),
        }
    }

    pub async fn run(mut self) {
        debug!(node = %self.id, kind = %self.spec.kind, "node actor started");
        let mut next = None;
        loop {
            let msg = match next.take() {
                Some(msg) => msg,
                None => match self.inbox.recv().await {
                    Some(msg) => msg,
                    None => break,
                },
            };
            match msg {
                ActorMsg::Compute {
                    tick,
                    round,
                    commands,
                } => match self.run_round(tick, round, commands).await {
                    Ok(carryover) => next = carryover,
                    Err(e) => {
                        warn!(node = %self.id, error = %e, "node actor stopping");
                        break;
                    }
                },
                ActorMsg::Restore { record } => {
                    trace!(node = %self.id, "state restored from committed snapshot");
                    self.state = record.state;
                    // Anything stashed belongs to the aborted attempt.
                    self.pending.clear();
                    self.set_phase(Phase::Idle);
                }
                // A neighbor already running a round this node has not been
                // signaled for yet; held for that round's collection.
                ActorMsg::Peer(update) => self.stash_peer(update),
                // Resolution for an abandoned round.
                ActorMsg::Resolve { .. } => {}
            }
        }
        debug!(node = %self.id, "node actor stopped");
    }

    /// One computation round: apply commands, exchange exactly one message
    /// with every neighbor, report the contribution, wait for resolved
    /// flows, compute the new state, report it.
    ///
    /// Returns a carryover message when the coordinator moved on (abort)
    /// before this round finished.
    async fn run_round(
        &mut self,
        tick: u64,
        round: u32,
        commands: Vec<NodeCommand>,
    ) -> Result<Option<ActorMsg>> {
        for command in commands {
            self.apply_command(command);
        }

        let payload = self.peer_payload();
        for (neighbor, _) in self.topology.neighbors(&self.id) {
            let sender = self
                .peers
                .get(neighbor)
                .ok_or_else(|| anyhow!("no mailbox for neighbor {neighbor}"))?;
            sender
                .send(ActorMsg::Peer(PeerUpdate {
                    from: self.id.clone(),
                    tick,
                    round,
                    payload: payload.clone(),
                }))
                .await
                .map_err(|_| anyhow!("neighbor {neighbor} mailbox closed"))?;
        }

        self.set_phase(Phase::AwaitingPeers);
        let (received, stale, interrupted) = self.collect_peers(tick, round).await?;
        if let Some(msg) = interrupted {
            self.set_phase(Phase::Idle);
            return Ok(Some(msg));
        }
        if stale {
            warn!(node = %self.id, tick, round, "stale peer: missing neighbor updates");
        }

        self.events
            .send(MeshEvent::Contribution {
                node: self.id.clone(),
                tick,
                round,
                contribution: self.contribution(),
                stale,
            })
            .await
            .map_err(|_| anyhow!("coordinator gone"))?;

        // Wait for the coordinator's flow resolution for this round.
        loop {
            match self.inbox.recv().await {
                Some(ActorMsg::Resolve {
                    tick: t,
                    round: r,
                    inflows,
                    overloaded,
                }) if t == tick && r == round => {
                    self.state = self.next_state(&received, &inflows, overloaded);
                    self.set_phase(Phase::Computed);
                    self.events
                        .send(MeshEvent::Computed {
                            node: self.id.clone(),
                            tick,
                            round,
                            record: NodeRecord {
                                state: self.state.clone(),
                                stale,
                            },
                        })
                        .await
                        .map_err(|_| anyhow!("coordinator gone"))?;
                    return Ok(None);
                }
                // Peer traffic racing ahead into a later round.
                Some(ActorMsg::Peer(update)) => self.stash_peer(update),
                // Resolution for an abandoned round.
                Some(ActorMsg::Resolve { .. }) => {}
                // Coordinator aborted this tick and moved on.
                Some(msg @ ActorMsg::Compute { .. }) | Some(msg @ ActorMsg::Restore { .. }) => {
                    self.set_phase(Phase::Idle);
                    return Ok(Some(msg));
                }
                None => return Err(anyhow!("mailbox closed")),
            }
        }
    }

    /// Collect one peer update per neighbor within the delivery window.
    /// A missing peer marks this node stale; it is surfaced, not retried.
    async fn collect_peers(
        &mut self,
        tick: u64,
        round: u32,
    ) -> Result<(HashMap<NodeId, PeerPayload>, bool, Option<ActorMsg>)> {
        let expected = self.topology.degree(&self.id);
        let deadline = Instant::now() + self.peer_window;
        let mut received: HashMap<NodeId, PeerPayload> = HashMap::with_capacity(expected);

        // Drain updates that raced ahead of our own round signal; anything
        // from an abandoned round is dropped here.
        for update in std::mem::take(&mut self.pending) {
            if update.tick == tick && update.round == round {
                received.insert(update.from, update.payload);
            } else if (update.tick, update.round) > (tick, round) {
                self.pending.push(update);
            }
        }

        while received.len() < expected {
            match timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(ActorMsg::Peer(update))) => {
                    if update.tick == tick && update.round == round {
                        received.insert(update.from, update.payload);
                    } else if (update.tick, update.round) > (tick, round) {
                        self.stash_peer(update);
                    }
                    // Updates from abandoned rounds are dropped.
                }
                Ok(Some(msg @ ActorMsg::Compute { .. }))
                | Ok(Some(msg @ ActorMsg::Restore { .. })) => {
                    return Ok((received, false, Some(msg)));
                }
                Ok(Some(ActorMsg::Resolve { .. })) => {}
                Ok(None) => return Err(anyhow!("mailbox closed")),
                Err(_elapsed) => return Ok((received, true, None)),
            }
        }
        Ok((received, false, None))
    }

    fn apply_command(&mut self, command: NodeCommand) {
        match (&mut self.state, command) {
            (
                NodeState::Generator { setpoint_kw, .. },
                NodeCommand::SetGeneratorSetpoint { value_kw },
            ) => {
                debug!(node = %self.id, value_kw, "setpoint applied");
                *setpoint_kw = value_kw;
            }
            (NodeState::Load { demand_kw, .. }, NodeCommand::SetLoadDemand { value_kw }) => {
                *demand_kw = value_kw;
            }
            (NodeState::Breaker { open }, NodeCommand::OpenBreaker) => {
                debug!(node = %self.id, "breaker opening");
                *open = true;
            }
            (NodeState::Breaker { open }, NodeCommand::CloseBreaker) => {
                debug!(node = %self.id, "breaker reclosing");
                *open = false;
            }
            (_, command) => {
                warn!(node = %self.id, ?command, "command does not match node kind, ignored");
            }
        }
    }

    fn peer_payload(&self) -> PeerPayload {
        match &self.state {
            NodeState::Generator {
                setpoint_kw,
                max_capacity_kw,
                ..
            } => PeerPayload::Inject {
                power_kw: setpoint_kw.clamp(0.0, *max_capacity_kw),
            },
            NodeState::Load { demand_kw, .. } => PeerPayload::Withdraw {
                power_kw: *demand_kw,
            },
            NodeState::Breaker { open } => PeerPayload::Gate { open: *open },
            NodeState::Transformer { .. } => PeerPayload::Transfer,
            NodeState::Bus { .. } => PeerPayload::Junction,
        }
    }

    fn contribution(&self) -> Contribution {
        match &self.state {
            NodeState::Generator {
                setpoint_kw,
                max_capacity_kw,
                ..
            } => Contribution::Source {
                injection_kw: setpoint_kw.clamp(0.0, *max_capacity_kw),
            },
            NodeState::Load { demand_kw, .. } => Contribution::Sink {
                demand_kw: *demand_kw,
            },
            NodeState::Bus { .. } => Contribution::Junction,
            NodeState::Transformer { .. } => Contribution::Coupler,
            NodeState::Breaker { open } => Contribution::Gate { open: *open },
        }
    }

    /// Kind-specific update rule, deterministic in the resolved inflows.
    fn next_state(
        &self,
        received: &HashMap<NodeId, PeerPayload>,
        inflows: &[(NodeId, f64)],
        overloaded: bool,
    ) -> NodeState {
        match &self.state {
            NodeState::Generator {
                setpoint_kw,
                max_capacity_kw,
                ..
            } => NodeState::Generator {
                output_kw: setpoint_kw.clamp(0.0, *max_capacity_kw),
                setpoint_kw: *setpoint_kw,
                max_capacity_kw: *max_capacity_kw,
            },
            NodeState::Load { demand_kw, .. } => {
                let served_kw: f64 = inflows.iter().map(|(_, f)| f.max(0.0)).sum();
                NodeState::Load {
                    demand_kw: *demand_kw,
                    served_kw,
                }
            }
            NodeState::Bus { .. } => {
                // Edges gated off by an open breaker carry no flow; the
                // resolver already zeroes them, the Gate message is the
                // neighbor-level view of the same fact.
                let net_flow_kw: f64 = inflows
                    .iter()
                    .filter(|(neighbor, _)| {
                        !matches!(received.get(neighbor), Some(PeerPayload::Gate { open: true }))
                    })
                    .map(|(_, f)| f)
                    .sum();
                NodeState::Bus {
                    net_flow_kw,
                    voltage_deviation: net_flow_kw * self.voltage_sensitivity,
                }
            }
            NodeState::Transformer { .. } => {
                let input_kw: f64 = inflows.iter().map(|(_, f)| f.max(0.0)).sum();
                let output_kw: f64 = inflows.iter().map(|(_, f)| (-f).max(0.0)).sum();
                NodeState::Transformer {
                    input_kw,
                    output_kw,
                    overloaded,
                }
            }
            NodeState::Breaker { open } => NodeState::Breaker { open: *open },
        }
    }

    /// One slot per (neighbor, tick, round); a re-sent update supersedes
    /// the held one.
    fn stash_peer(&mut self, update: PeerUpdate) {
        self.pending.retain(|p| {
            !(p.from == update.from && p.tick == update.tick && p.round == update.round)
        });
        self.pending.push(update);
    }

    fn set_phase(&mut self, phase: Phase) {
        trace!(node = %self.id, from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }
}
