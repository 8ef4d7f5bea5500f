use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::Path;
use strum::{Display, EnumString};
use thiserror::Error;

/// Identifier of a grid element. Unique across the whole topology.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum NodeKind {
    Generator,
    Load,
    Bus,
    Transformer,
    Breaker,
}

/// Static description of one grid element. Kind-irrelevant fields are left
/// at their defaults and ignored by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: NodeId,
    pub kind: NodeKind,

    /// Generator: commanded output, clamped to [0, max_capacity_kw].
    #[serde(default)]
    pub setpoint_kw: f64,
    /// Generator: physical output ceiling.
    #[serde(default)]
    pub max_capacity_kw: f64,
    /// Load: initial demand. Updated externally at runtime.
    #[serde(default)]
    pub demand_kw: f64,
    /// Transformer: output flow = input flow * ratio, capped at rating_kw.
    #[serde(default = "default_ratio")]
    pub ratio: f64,
    /// Transformer: thermal rating. Breaker: overcurrent trip threshold
    /// (0 means "use the smallest adjacent edge capacity").
    #[serde(default)]
    pub rating_kw: f64,
    /// Breaker: position at startup.
    #[serde(default = "default_true")]
    pub normally_closed: bool,
    /// Transformer: breaker tripped when this transformer overloads.
    #[serde(default)]
    pub protected_by: Option<NodeId>,
}

fn default_ratio() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

impl NodeSpec {
    fn bare(id: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            id: NodeId::new(id),
            kind,
            setpoint_kw: 0.0,
            max_capacity_kw: 0.0,
            demand_kw: 0.0,
            ratio: 1.0,
            rating_kw: 0.0,
            normally_closed: true,
            protected_by: None,
        }
    }

    pub fn generator(id: impl Into<String>, setpoint_kw: f64, max_capacity_kw: f64) -> Self {
        Self {
            setpoint_kw,
            max_capacity_kw,
            ..Self::bare(id, NodeKind::Generator)
        }
    }

    pub fn load(id: impl Into<String>, demand_kw: f64) -> Self {
        Self {
            demand_kw,
            ..Self::bare(id, NodeKind::Load)
        }
    }

    pub fn bus(id: impl Into<String>) -> Self {
        Self::bare(id, NodeKind::Bus)
    }

    pub fn transformer(id: impl Into<String>, ratio: f64, rating_kw: f64) -> Self {
        Self {
            ratio,
            rating_kw,
            ..Self::bare(id, NodeKind::Transformer)
        }
    }

    pub fn breaker(id: impl Into<String>, rating_kw: f64) -> Self {
        Self {
            rating_kw,
            ..Self::bare(id, NodeKind::Breaker)
        }
    }

    pub fn protected_by(mut self, breaker: impl Into<String>) -> Self {
        self.protected_by = Some(NodeId::new(breaker));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub a: NodeId,
    pub b: NodeId,
    /// Physical line rating. Informational unless an adjacent breaker has
    /// no rating of its own, in which case it becomes the trip threshold.
    #[serde(default)]
    pub capacity_kw: f64,
}

impl EdgeSpec {
    pub fn new(a: impl Into<String>, b: impl Into<String>, capacity_kw: f64) -> Self {
        Self {
            a: NodeId::new(a),
            b: NodeId::new(b),
            capacity_kw,
        }
    }
}

/// A line/coupling between two elements. Immutable after build; flow values
/// live in per-tick snapshots, never on the edge itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub index: usize,
    pub a: NodeId,
    pub b: NodeId,
    pub capacity_kw: f64,
}

impl Edge {
    /// The endpoint opposite to `id`.
    pub fn other(&self, id: &NodeId) -> &NodeId {
        if &self.a == id {
            &self.b
        } else {
            &self.a
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
    #[error("duplicate node id: {0}")]
    DuplicateNode(NodeId),

    #[error("duplicate edge between {0} and {1}")]
    DuplicateEdge(NodeId, NodeId),

    #[error("edge {a}-{b} references unknown node {missing}")]
    DanglingEdgeReference { a: NodeId, b: NodeId, missing: NodeId },

    #[error("self-loop edge on node {0}")]
    SelfLoop(NodeId),

    #[error("transformer {transformer} protected by {breaker}, which is not a breaker in the topology")]
    InvalidProtection { transformer: NodeId, breaker: NodeId },
}

/// On-disk shape of a topology definition file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyFile {
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
}

/// Immutable-after-build grid graph. Shared read-only (via `Arc`) by every
/// node actor and by the coordinator; a topology change means building a
/// new instance and restarting the mesh, never patching this one.
#[derive(Debug)]
pub struct Topology {
    nodes: BTreeMap<NodeId, NodeSpec>,
    edges: Vec<Edge>,
    adjacency: HashMap<NodeId, Vec<(NodeId, usize)>>,
    edge_lookup: HashMap<(NodeId, NodeId), usize>,
}

impl Topology {
    pub fn build(
        node_specs: Vec<NodeSpec>,
        edge_specs: Vec<EdgeSpec>,
    ) -> Result<Self, TopologyError> {
        let mut nodes = BTreeMap::new();
        for spec in node_specs {
            if nodes.contains_key(&spec.id) {
                return Err(TopologyError::DuplicateNode(spec.id));
            }
            nodes.insert(spec.id.clone(), spec);
        }

        let mut edges = Vec::with_capacity(edge_specs.len());
        let mut adjacency: HashMap<NodeId, Vec<(NodeId, usize)>> = nodes
            .keys()
            .map(|id| (id.clone(), Vec::new()))
            .collect();
        let mut edge_lookup = HashMap::new();

        for spec in edge_specs {
            if spec.a == spec.b {
                return Err(TopologyError::SelfLoop(spec.a));
            }
            for endpoint in [&spec.a, &spec.b] {
                if !nodes.contains_key(endpoint) {
                    return Err(TopologyError::DanglingEdgeReference {
                        a: spec.a.clone(),
                        b: spec.b.clone(),
                        missing: endpoint.clone(),
                    });
                }
            }
            let key = Self::edge_key(&spec.a, &spec.b);
            if edge_lookup.contains_key(&key) {
                return Err(TopologyError::DuplicateEdge(spec.a, spec.b));
            }

            let index = edges.len();
            edge_lookup.insert(key, index);
            adjacency
                .get_mut(&spec.a)
                .expect("endpoint checked above")
                .push((spec.b.clone(), index));
            adjacency
                .get_mut(&spec.b)
                .expect("endpoint checked above")
                .push((spec.a.clone(), index));
            edges.push(Edge {
                index,
                a: spec.a,
                b: spec.b,
                capacity_kw: spec.capacity_kw,
            });
        }

        // Deterministic neighbor order; the flow resolver and the tests
        // both rely on it.
        for neighbors in adjacency.values_mut() {
            neighbors.sort_by(|(a, _), (b, _)| a.cmp(b));
        }

        for spec in nodes.values() {
            if let Some(breaker) = &spec.protected_by {
                let ok = nodes
                    .get(breaker)
                    .map(|n| n.kind == NodeKind::Breaker)
                    .unwrap_or(false);
                if !ok {
                    return Err(TopologyError::InvalidProtection {
                        transformer: spec.id.clone(),
                        breaker: breaker.clone(),
                    });
                }
            }
        }

        Ok(Self {
            nodes,
            edges,
            adjacency,
            edge_lookup,
        })
    }

    pub fn from_toml_str(raw: &str) -> anyhow::Result<Self> {
        let file: TopologyFile = toml::from_str(raw)?;
        Ok(Self::build(file.nodes, file.edges)?)
    }

    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    fn edge_key(a: &NodeId, b: &NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        }
    }

    pub fn node(&self, id: &NodeId) -> Option<&NodeSpec> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Node ids in sorted order.
    pub fn node_ids(&self) -> impl Iterator<Item = &NodeId> {
        self.nodes.keys()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values()
    }

    pub fn nodes_of_kind(&self, kind: NodeKind) -> impl Iterator<Item = &NodeSpec> {
        self.nodes.values().filter(move |n| n.kind == kind)
    }

    /// Neighbors of `id` with the connecting edge index, sorted by id.
    pub fn neighbors(&self, id: &NodeId) -> &[(NodeId, usize)] {
        self.adjacency
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn degree(&self, id: &NodeId) -> usize {
        self.neighbors(id).len()
    }

    pub fn max_degree(&self) -> usize {
        self.adjacency.values().map(|v| v.len()).max().unwrap_or(0)
    }

    pub fn edge(&self, a: &NodeId, b: &NodeId) -> Option<&Edge> {
        self.edge_lookup
            .get(&Self::edge_key(a, b))
            .map(|&i| &self.edges[i])
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edge_at(&self, index: usize) -> &Edge {
        &self.edges[index]
    }

    /// Connected components of the full graph (breaker positions ignored),
    /// each sorted by id, components ordered by their smallest member.
    pub fn islands(&self) -> Vec<Vec<NodeId>> {
        let mut seen: HashSet<&NodeId> = HashSet::new();
        let mut islands = Vec::new();
        for start in self.nodes.keys() {
            if seen.contains(start) {
                continue;
            }
            let mut island = Vec::new();
            let mut queue = VecDeque::from([start]);
            seen.insert(start);
            while let Some(id) = queue.pop_front() {
                island.push(id.clone());
                for (neighbor, _) in self.neighbors(id) {
                    if seen.insert(neighbor) {
                        queue.push_back(neighbor);
                    }
                }
            }
            island.sort();
            islands.push(island);
        }
        islands
    }

    /// Effective overcurrent threshold for a breaker: its own rating, or
    /// the smallest adjacent edge capacity when no rating is configured.
    pub fn breaker_threshold_kw(&self, id: &NodeId) -> Option<f64> {
        let spec = self.nodes.get(id)?;
        if spec.kind != NodeKind::Breaker {
            return None;
        }
        if spec.rating_kw > 0.0 {
            return Some(spec.rating_kw);
        }
        self.neighbors(id)
            .iter()
            .map(|(_, idx)| self.edges[*idx].capacity_kw)
            .filter(|c| *c > 0.0)
            .min_by(|a, b| a.partial_cmp(b).expect("capacities are finite"))
    }
}
