//! Protection policy: overcurrent and overload evaluation after every
//! round, trip cascades across rounds, and the append-only trip event log.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::engine::flow::ResolvedFlows;
use crate::engine::snapshot::{NodeRecord, NodeState};
use crate::mesh::{AddressedCommand, NodeCommand};
use crate::topology::{NodeId, NodeKind, Topology};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum TripCause {
    Overcurrent,
    Manual,
    /// Secondary trip triggered by rerouted flow after `from` opened
    /// earlier in the same tick.
    Cascade { from: NodeId },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum TripAction {
    Open { #[serde(flatten)] cause: TripCause },
    Reclose,
}

/// One applied breaker transition. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    /// Position in the log; strictly increasing, no gaps.
    pub seq: u64,
    pub breaker: NodeId,
    pub tick: u64,
    #[serde(flatten)]
    pub action: TripAction,
    pub at: DateTime<Utc>,
}

/// Append-only log of committed trip/reclose transitions. Single writer
/// (the protection engine at commit time), any number of readers.
#[derive(Debug, Default)]
pub struct TripLog {
    events: RwLock<Vec<TripEvent>>,
}

impl TripLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Events from sequence number `seq` onward. `since(0)` is the whole
    /// log; the feed has no gaps.
    pub fn since(&self, seq: u64) -> Vec<TripEvent> {
        let events = self.events.read();
        let start = (seq as usize).min(events.len());
        events[start..].to_vec()
    }

    fn append(&self, breaker: NodeId, tick: u64, action: TripAction) -> TripEvent {
        let mut events = self.events.write();
        let event = TripEvent {
            seq: events.len() as u64,
            breaker,
            tick,
            action,
            at: Utc::now(),
        };
        events.push(event.clone());
        event
    }
}

/// A transition applied during the in-flight tick, not yet committed.
#[derive(Debug, Clone)]
struct PendingTransition {
    breaker: NodeId,
    action: TripAction,
}

/// Evaluates trip conditions per breaker/transformer each round and buffers
/// the resulting transitions until the tick commits. A rolled-back tick
/// discards its tentative transitions together with its tentative snapshot.
pub struct ProtectionEngine {
    topology: Arc<Topology>,
    log: Arc<TripLog>,
    tentative: Vec<PendingTransition>,
    /// Breakers opened by the previous round's evaluation; used to
    /// attribute cascade causes.
    last_round_trips: Vec<NodeId>,
}

impl ProtectionEngine {
    pub fn new(topology: Arc<Topology>, log: Arc<TripLog>) -> Self {
        Self {
            topology,
            log,
            tentative: Vec::new(),
            last_round_trips: Vec::new(),
        }
    }

    pub fn begin_tick(&mut self) {
        self.tentative.clear();
        self.last_round_trips.clear();
    }

    /// Record a manual transition the coordinator is about to apply in
    /// round 0. Manual commands have highest precedence and are already
    /// validated against the last committed state.
    pub fn record_manual(&mut self, breaker: &NodeId, open: bool) {
        let action = if open {
            self.last_round_trips.push(breaker.clone());
            TripAction::Open {
                cause: TripCause::Manual,
            }
        } else {
            TripAction::Reclose
        };
        self.tentative.push(PendingTransition {
            breaker: breaker.clone(),
            action,
        });
    }

    /// Evaluate one round's node states and resolved flows. Returns the
    /// trip commands for the next cascade round; an empty result means the
    /// tick has stabilized.
    pub fn evaluate_round(
        &mut self,
        tick: u64,
        round: u32,
        reports: &BTreeMap<NodeId, NodeRecord>,
        resolved: &ResolvedFlows,
    ) -> Vec<AddressedCommand> {
        let cause = |origin: &[NodeId]| -> TripCause {
            if round == 0 {
                TripCause::Overcurrent
            } else {
                // Attribute secondary trips to the first breaker opened in
                // the previous round.
                match origin.first() {
                    Some(from) => TripCause::Cascade { from: from.clone() },
                    None => TripCause::Overcurrent,
                }
            }
        };

        let mut tripping: HashSet<NodeId> = HashSet::new();
        let mut commands = Vec::new();

        // Overcurrent: any adjacent edge above the breaker's threshold.
        for spec in self.topology.nodes_of_kind(NodeKind::Breaker) {
            if self.is_open(reports, &spec.id) || tripping.contains(&spec.id) {
                continue;
            }
            let Some(threshold) = self.topology.breaker_threshold_kw(&spec.id) else {
                continue; // unprotected breaker, manual control only
            };
            let flow = resolved.max_adjacent_flow(&self.topology, &spec.id);
            if flow > threshold {
                let cause = cause(&self.last_round_trips);
                warn!(
                    breaker = %spec.id, tick, round, flow_kw = flow,
                    threshold_kw = threshold, ?cause, "overcurrent trip"
                );
                self.tentative.push(PendingTransition {
                    breaker: spec.id.clone(),
                    action: TripAction::Open { cause },
                });
                tripping.insert(spec.id.clone());
                commands.push(AddressedCommand {
                    node: spec.id.clone(),
                    command: NodeCommand::OpenBreaker,
                });
            }
        }

        // Overloaded transformers trip their configured protecting breaker.
        for transformer in resolved.overloaded() {
            let Some(breaker) = self
                .topology
                .node(transformer)
                .and_then(|spec| spec.protected_by.clone())
            else {
                continue;
            };
            if self.is_open(reports, &breaker) || tripping.contains(&breaker) {
                continue; // already open: tripping again is a no-op
            }
            let cause = cause(&self.last_round_trips);
            warn!(
                transformer = %transformer, breaker = %breaker, tick, round,
                ?cause, "transformer overload trip"
            );
            self.tentative.push(PendingTransition {
                breaker: breaker.clone(),
                action: TripAction::Open { cause },
            });
            tripping.insert(breaker.clone());
            commands.push(AddressedCommand {
                node: breaker,
                command: NodeCommand::OpenBreaker,
            });
        }

        self.last_round_trips = tripping.into_iter().collect();
        self.last_round_trips.sort();
        commands
    }

    /// Append this tick's tentative transitions to the log.
    pub fn commit(&mut self, tick: u64) -> Vec<TripEvent> {
        let mut events = Vec::with_capacity(self.tentative.len());
        for pending in self.tentative.drain(..) {
            let event = self.log.append(pending.breaker, tick, pending.action);
            info!(
                seq = event.seq, breaker = %event.breaker, tick,
                action = ?event.action, "trip event committed"
            );
            events.push(event);
        }
        self.last_round_trips.clear();
        events
    }

    /// Discard this tick's tentative transitions. Keeps the trip log and
    /// the snapshot history mutually consistent when a tick rolls back.
    pub fn rollback(&mut self, tick: u64) {
        if !self.tentative.is_empty() {
            warn!(
                tick,
                discarded = self.tentative.len(),
                "tick aborted; tentative trip events discarded"
            );
        }
        self.tentative.clear();
        self.last_round_trips.clear();
    }

    fn is_open(&self, reports: &BTreeMap<NodeId, NodeRecord>, breaker: &NodeId) -> bool {
        matches!(
            reports.get(breaker).map(|r| &r.state),
            Some(NodeState::Breaker { open: true })
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::flow;
    use crate::mesh::Contribution;
    use crate::topology::{EdgeSpec, NodeSpec};

    fn protected_chain() -> Arc<Topology> {
        Arc::new(
            Topology::build(
                vec![
                    NodeSpec::generator("gen-1", 100.0, 120.0),
                    NodeSpec::bus("bus-1"),
                    NodeSpec::breaker("brk-1", 50.0),
                    NodeSpec::load("load-1", 80.0),
                ],
                vec![
                    EdgeSpec::new("gen-1", "bus-1", 150.0),
                    EdgeSpec::new("bus-1", "brk-1", 150.0),
                    EdgeSpec::new("brk-1", "load-1", 150.0),
                ],
            )
            .unwrap(),
        )
    }

    fn reports(topo: &Topology) -> BTreeMap<NodeId, NodeRecord> {
        topo.nodes()
            .map(|spec| {
                (
                    spec.id.clone(),
                    NodeRecord::new(crate::engine::snapshot::NodeState::initial(spec)),
                )
            })
            .collect()
    }

    fn contributions(topo: &Topology) -> BTreeMap<NodeId, Contribution> {
        topo.nodes()
            .map(|spec| {
                let c = match spec.kind {
                    NodeKind::Generator => Contribution::Source {
                        injection_kw: spec.setpoint_kw,
                    },
                    NodeKind::Load => Contribution::Sink {
                        demand_kw: spec.demand_kw,
                    },
                    NodeKind::Bus => Contribution::Junction,
                    NodeKind::Transformer => Contribution::Coupler,
                    NodeKind::Breaker => Contribution::Gate {
                        open: !spec.normally_closed,
                    },
                };
                (spec.id.clone(), c)
            })
            .collect()
    }

    #[test]
    fn test_overcurrent_trips_breaker() {
        let topo = protected_chain();
        let log = Arc::new(TripLog::new());
        let mut engine = ProtectionEngine::new(topo.clone(), log.clone());
        let resolved = flow::resolve(&topo, &contributions(&topo));

        engine.begin_tick();
        let commands = engine.evaluate_round(1, 0, &reports(&topo), &resolved);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].node, "brk-1".into());

        let events = engine.commit(1);
        assert_eq!(events.len(), 1);
        assert_eq!(
            events[0].action,
            TripAction::Open {
                cause: TripCause::Overcurrent
            }
        );
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn test_open_breaker_not_retripped() {
        let topo = protected_chain();
        let mut engine = ProtectionEngine::new(topo.clone(), Arc::new(TripLog::new()));
        let resolved = flow::resolve(&topo, &contributions(&topo));

        let mut reports = reports(&topo);
        reports.insert(
            "brk-1".into(),
            NodeRecord::new(NodeState::Breaker { open: true }),
        );

        engine.begin_tick();
        let commands = engine.evaluate_round(1, 0, &reports, &resolved);
        assert!(commands.is_empty());
        assert!(engine.commit(1).is_empty());
    }

    #[test]
    fn test_rollback_discards_tentative_events() {
        let topo = protected_chain();
        let log = Arc::new(TripLog::new());
        let mut engine = ProtectionEngine::new(topo.clone(), log.clone());
        let resolved = flow::resolve(&topo, &contributions(&topo));

        engine.begin_tick();
        let commands = engine.evaluate_round(1, 0, &reports(&topo), &resolved);
        assert!(!commands.is_empty());
        engine.rollback(1);
        assert!(log.is_empty());

        // The next tick starts clean.
        engine.begin_tick();
        assert!(engine.commit(2).is_empty());
    }

    #[test]
    fn test_cascade_cause_names_origin() {
        // A manual trip of brk-0 in round 0 reroutes flow; the overcurrent
        // on brk-1 detected in round 1 must be attributed to brk-0.
        let topo = Arc::new(
            Topology::build(
                vec![
                    NodeSpec::generator("gen-1", 100.0, 120.0),
                    NodeSpec::bus("bus-1"),
                    NodeSpec::breaker("brk-0", 500.0),
                    NodeSpec::breaker("brk-1", 50.0),
                    NodeSpec::load("load-1", 80.0),
                ],
                vec![
                    EdgeSpec::new("gen-1", "brk-0", 150.0),
                    EdgeSpec::new("brk-0", "bus-1", 150.0),
                    EdgeSpec::new("bus-1", "brk-1", 150.0),
                    EdgeSpec::new("brk-1", "load-1", 150.0),
                ],
            )
            .unwrap(),
        );
        let mut engine = ProtectionEngine::new(topo.clone(), Arc::new(TripLog::new()));
        engine.begin_tick();
        engine.record_manual(&"brk-0".into(), true);

        let resolved = flow::resolve(&topo, &contributions(&topo));
        let commands = engine.evaluate_round(1, 1, &reports(&topo), &resolved);
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].node, "brk-1".into());

        let events = engine.commit(1);
        assert_eq!(events.len(), 2, "manual open plus cascade trip");
        assert_eq!(
            events[1].action,
            TripAction::Open {
                cause: TripCause::Cascade {
                    from: "brk-0".into()
                }
            }
        );
    }

    #[test]
    fn test_trip_event_wire_format_flattens_cause() {
        let log = TripLog::new();
        let event = log.append(
            "brk-1".into(),
            7,
            TripAction::Open {
                cause: TripCause::Cascade {
                    from: "brk-0".into(),
                },
            },
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["seq"], 0);
        assert_eq!(json["breaker"], "brk-1");
        assert_eq!(json["action"], "open");
        assert_eq!(json["cause"], "cascade");
        assert_eq!(json["from"], "brk-0");
    }

    #[test]
    fn test_log_since_has_no_gaps() {
        let log = TripLog::new();
        for tick in 1..=5 {
            log.append("brk-1".into(), tick, TripAction::Reclose);
        }
        let tail = log.since(3);
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].seq, 3);
        assert_eq!(tail[1].seq, 4);
    }
}
