//! Deterministic per-round edge flow assignment.
//!
//! Not a load-flow solve: flows are derived in a single pass from node
//! contributions over the live (breaker-gated) graph. Each island gets a
//! BFS spanning tree rooted at its smallest-id bus; every tree edge carries
//! the aggregate surplus of the subtree hanging below it, cycle-closing
//! edges carry zero. One pass, always terminates, identical output for
//! identical input.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use crate::mesh::Contribution;
use crate::topology::{NodeId, NodeKind, Topology};

/// Signed edge flows (positive from `edge.a` to `edge.b`, indexed by edge)
/// plus the transformers whose throughput was capped above rating.
#[derive(Debug, Clone)]
pub struct ResolvedFlows {
    flows: Vec<f64>,
    overloaded: HashSet<NodeId>,
}

impl ResolvedFlows {
    pub fn edge_flows(&self) -> &[f64] {
        &self.flows
    }

    pub fn is_overloaded(&self, id: &NodeId) -> bool {
        self.overloaded.contains(id)
    }

    pub fn overloaded(&self) -> impl Iterator<Item = &NodeId> {
        self.overloaded.iter()
    }

    /// Signed flow into `id` for each adjacent neighbor.
    pub fn inflows(&self, topology: &Topology, id: &NodeId) -> Vec<(NodeId, f64)> {
        topology
            .neighbors(id)
            .iter()
            .map(|(neighbor, idx)| {
                let edge = topology.edge_at(*idx);
                let into = if &edge.a == id {
                    -self.flows[*idx]
                } else {
                    self.flows[*idx]
                };
                (neighbor.clone(), into)
            })
            .collect()
    }

    /// Largest flow magnitude on any edge adjacent to `id`.
    pub fn max_adjacent_flow(&self, topology: &Topology, id: &NodeId) -> f64 {
        topology
            .neighbors(id)
            .iter()
            .map(|(_, idx)| self.flows[*idx].abs())
            .fold(0.0, f64::max)
    }
}

fn surplus_kw(contribution: &Contribution) -> f64 {
    match contribution {
        Contribution::Source { injection_kw } => *injection_kw,
        Contribution::Sink { demand_kw } => -demand_kw,
        _ => 0.0,
    }
}

/// Resolve all edge flows for one round.
pub fn resolve(
    topology: &Topology,
    contributions: &BTreeMap<NodeId, Contribution>,
) -> ResolvedFlows {
    let mut flows = vec![0.0; topology.edge_count()];
    let mut overloaded = HashSet::new();

    // An open breaker disconnects both of its edges for this round; the
    // breaker node itself belongs to no island.
    let mut visited: HashSet<NodeId> = contributions
        .iter()
        .filter(|(_, c)| matches!(c, Contribution::Gate { open: true }))
        .map(|(id, _)| id.clone())
        .collect();

    for start in topology.node_ids() {
        if visited.contains(start) {
            continue;
        }
        let island = collect_island(topology, start, &visited);
        for id in &island {
            visited.insert(id.clone());
        }
        resolve_island(
            topology,
            contributions,
            &island,
            &mut flows,
            &mut overloaded,
        );
    }

    ResolvedFlows { flows, overloaded }
}

/// Members of the island containing `start`, sorted by id.
fn collect_island(topology: &Topology, start: &NodeId, excluded: &HashSet<NodeId>) -> Vec<NodeId> {
    let mut members = vec![start.clone()];
    let mut seen: HashSet<NodeId> = HashSet::from([start.clone()]);
    let mut queue = VecDeque::from([start.clone()]);
    while let Some(id) = queue.pop_front() {
        for (neighbor, _) in topology.neighbors(&id) {
            if excluded.contains(neighbor) || !seen.insert(neighbor.clone()) {
                continue;
            }
            members.push(neighbor.clone());
            queue.push_back(neighbor.clone());
        }
    }
    members.sort();
    members
}

fn resolve_island(
    topology: &Topology,
    contributions: &BTreeMap<NodeId, Contribution>,
    island: &[NodeId],
    flows: &mut [f64],
    overloaded: &mut HashSet<NodeId>,
) {
    // Root at the smallest-id bus so an island's generation/load imbalance
    // surfaces as that bus's net flow (and hence voltage deviation). An
    // island with no bus roots at its smallest member.
    let in_island: HashSet<&NodeId> = island.iter().collect();
    let root = island
        .iter()
        .find(|id| {
            topology
                .node(id)
                .map(|n| n.kind == NodeKind::Bus)
                .unwrap_or(false)
        })
        .unwrap_or(&island[0]);

    // BFS spanning tree with id-sorted neighbor order.
    let mut parent: HashMap<NodeId, (NodeId, usize)> = HashMap::new();
    let mut order = vec![root.clone()];
    let mut seen: HashSet<NodeId> = HashSet::from([root.clone()]);
    let mut queue = VecDeque::from([root.clone()]);
    while let Some(id) = queue.pop_front() {
        for (neighbor, idx) in topology.neighbors(&id) {
            if !in_island.contains(neighbor) || !seen.insert(neighbor.clone()) {
                continue;
            }
            parent.insert(neighbor.clone(), (id.clone(), *idx));
            order.push(neighbor.clone());
            queue.push_back(neighbor.clone());
        }
    }

    // Post-order surplus accumulation: children settle before parents.
    let mut surplus: HashMap<&NodeId, f64> = order
        .iter()
        .map(|id| {
            let s = contributions.get(id).map(surplus_kw).unwrap_or(0.0);
            (id, s)
        })
        .collect();

    for child in order.iter().rev() {
        let Some((up, edge_idx)) = parent.get(child) else {
            continue; // the root exports nowhere
        };
        let raw = surplus[child];
        let carried = carried_flow(topology, child, raw, overloaded);
        let edge = topology.edge_at(*edge_idx);
        // Positive flow is a -> b; `carried` > 0 means power moves child -> parent.
        flows[*edge_idx] = if &edge.a == child { carried } else { -carried };
        *surplus.get_mut(up).expect("parent is in the island") += carried;
    }
}

/// Flow leaving a subtree through `node` toward its parent. Transformers
/// scale by their ratio and cap at their rating; crossing the cap marks
/// the transformer overloaded.
fn carried_flow(
    topology: &Topology,
    node: &NodeId,
    raw: f64,
    overloaded: &mut HashSet<NodeId>,
) -> f64 {
    let Some(spec) = topology.node(node) else {
        return raw;
    };
    if spec.kind != NodeKind::Transformer {
        return raw;
    }
    let scaled = raw * spec.ratio;
    if spec.rating_kw > 0.0 && scaled.abs() > spec.rating_kw {
        overloaded.insert(node.clone());
        scaled.signum() * spec.rating_kw
    } else {
        scaled
    }
}
