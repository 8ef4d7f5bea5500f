use crate::engine::snapshot::NodeRecord;
use crate::topology::NodeId;

/// One state-update message exchanged between topology neighbors during a
/// round. Exactly one per neighbor per round.
#[derive(Debug, Clone)]
pub struct PeerUpdate {
    pub from: NodeId,
    pub tick: u64,
    pub round: u32,
    pub payload: PeerPayload,
}

#[derive(Debug, Clone)]
pub enum PeerPayload {
    /// Generator: power injected this round.
    Inject { power_kw: f64 },
    /// Load: power withdrawn this round.
    Withdraw { power_kw: f64 },
    /// Breaker: position this round. Open means the edge is dead.
    Gate { open: bool },
    /// Transformer presence announcement.
    Transfer,
    /// Bus presence announcement.
    Junction,
}

/// Command applied by a node actor at the start of a round, before it
/// exchanges peer messages. Manual commands arrive in round 0 only;
/// protection trips arrive in cascade rounds.
#[derive(Debug, Clone)]
pub enum NodeCommand {
    SetGeneratorSetpoint { value_kw: f64 },
    SetLoadDemand { value_kw: f64 },
    OpenBreaker,
    CloseBreaker,
}

#[derive(Debug, Clone)]
pub struct AddressedCommand {
    pub node: NodeId,
    pub command: NodeCommand,
}

/// What a node tells the coordinator after its peer exchange; input to the
/// flow resolver. Static parameters (ratings, ratios) stay in the topology.
#[derive(Debug, Clone, PartialEq)]
pub enum Contribution {
    Source { injection_kw: f64 },
    Sink { demand_kw: f64 },
    Junction,
    Coupler,
    Gate { open: bool },
}

/// Messages delivered to a node actor's mailbox.
#[derive(Debug)]
pub enum ActorMsg {
    /// Coordinator: begin one computation round.
    Compute {
        tick: u64,
        round: u32,
        commands: Vec<NodeCommand>,
    },
    /// Neighbor state update.
    Peer(PeerUpdate),
    /// Coordinator: resolved signed flows into this node, one entry per
    /// adjacent neighbor. `overloaded` is meaningful for transformers only.
    Resolve {
        tick: u64,
        round: u32,
        inflows: Vec<(NodeId, f64)>,
        overloaded: bool,
    },
    /// Coordinator: the tick was aborted; re-seed state from the last
    /// committed snapshot.
    Restore { record: NodeRecord },
}

/// Events a node actor reports back to the coordinator.
#[derive(Debug)]
pub enum MeshEvent {
    /// Peer exchange finished; ready for flow resolution.
    Contribution {
        node: NodeId,
        tick: u64,
        round: u32,
        contribution: Contribution,
        stale: bool,
    },
    /// Final state for this round.
    Computed {
        node: NodeId,
        tick: u64,
        round: u32,
        record: NodeRecord,
    },
}
