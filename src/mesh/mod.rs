//! The actor mesh: one tokio task per grid element, mailbox-serialized
//! state ownership, peer message exchange along topology edges.

pub mod actor;
pub mod message;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::topology::{NodeId, Topology};
pub use actor::{NodeActor, Phase};
pub use message::{ActorMsg, AddressedCommand, Contribution, MeshEvent, NodeCommand};

#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// How long a node waits for its neighbors' updates before reporting
    /// itself stale.
    pub peer_window: Duration,
    /// Linear factor relating bus net flow to voltage deviation.
    pub voltage_sensitivity: f64,
}

/// Coordinator-side handle to a spawned mesh: one sender per node mailbox
/// and the single event stream every actor reports into.
pub struct MeshHandle {
    pub mailboxes: HashMap<NodeId, mpsc::Sender<ActorMsg>>,
    pub events: mpsc::Receiver<MeshEvent>,
    pub tasks: Vec<JoinHandle<()>>,
}

/// Spawn one actor per topology node. Mailbox capacity covers a full round
/// of peer traffic plus coordinator messages, so a round never deadlocks on
/// a full channel.
pub fn spawn_mesh(topology: Arc<Topology>, cfg: &MeshConfig) -> MeshHandle {
    let capacity = topology.max_degree() + 8;
    let (event_tx, event_rx) = mpsc::channel(topology.node_count().max(1) * 2);

    let mut mailboxes = HashMap::with_capacity(topology.node_count());
    let mut inboxes = HashMap::with_capacity(topology.node_count());
    for id in topology.node_ids() {
        let (tx, rx) = mpsc::channel(capacity);
        mailboxes.insert(id.clone(), tx);
        inboxes.insert(id.clone(), rx);
    }

    let mut tasks = Vec::with_capacity(topology.node_count());
    for spec in topology.nodes() {
        let inbox = inboxes.remove(&spec.id).expect("one inbox per node");
        let peers = topology
            .neighbors(&spec.id)
            .iter()
            .map(|(neighbor, _)| (neighbor.clone(), mailboxes[neighbor].clone()))
            .collect();
        let actor = NodeActor::new(
            spec.clone(),
            topology.clone(),
            inbox,
            peers,
            event_tx.clone(),
            cfg.peer_window,
            cfg.voltage_sensitivity,
        );
        tasks.push(tokio::spawn(actor.run()));
    }

    info!(nodes = topology.node_count(), edges = topology.edge_count(), "mesh spawned");
    MeshHandle {
        mailboxes,
        events: event_rx,
        tasks,
    }
}
