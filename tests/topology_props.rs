//! Property tests over randomly generated radial topologies.

use std::collections::BTreeMap;

use proptest::prelude::*;

use gridmesh::engine::flow;
use gridmesh::mesh::Contribution;
use gridmesh::topology::{EdgeSpec, NodeId, NodeKind, NodeSpec, Topology};

fn node(i: usize, kind: u8) -> NodeSpec {
    let id = format!("n{i:02}");
    match kind % 5 {
        0 => NodeSpec::generator(id, 50.0, 100.0),
        1 => NodeSpec::load(id, 40.0),
        2 => NodeSpec::bus(id),
        3 => NodeSpec::transformer(id, 1.0, 500.0),
        _ => NodeSpec::breaker(id, 200.0),
    }
}

/// A connected radial grid: node 0 is always a bus, every later node hangs
/// off a uniformly chosen earlier one.
fn random_tree(kinds: &[u8], parents: &[prop::sample::Index]) -> Topology {
    let mut nodes = vec![NodeSpec::bus("n00")];
    let mut edges = Vec::new();
    for (i, kind) in kinds.iter().enumerate() {
        let child = i + 1;
        nodes.push(node(child, *kind));
        let parent = parents[i].index(child);
        edges.push(EdgeSpec::new(
            format!("n{parent:02}"),
            format!("n{child:02}"),
            1000.0,
        ));
    }
    Topology::build(nodes, edges).expect("tree topologies always build")
}

fn contributions_for(topology: &Topology) -> BTreeMap<NodeId, Contribution> {
    topology
        .nodes()
        .map(|spec| {
            let c = match spec.kind {
                NodeKind::Generator => Contribution::Source {
                    injection_kw: spec.setpoint_kw.clamp(0.0, spec.max_capacity_kw),
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

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_random_tree_is_one_island(
        kinds in prop::collection::vec(0u8..5, 1..24),
        parents in prop::collection::vec(any::<prop::sample::Index>(), 23),
    ) {
        let topo = random_tree(&kinds, &parents);
        let n = kinds.len() + 1;

        prop_assert_eq!(topo.node_count(), n);
        prop_assert_eq!(topo.edge_count(), n - 1);

        let islands = topo.islands();
        prop_assert_eq!(islands.len(), 1);
        prop_assert_eq!(islands[0].len(), n);

        let degree_sum: usize = topo.node_ids().map(|id| topo.degree(id)).sum();
        prop_assert_eq!(degree_sum, 2 * (n - 1));
    }

    #[test]
    fn prop_leaf_edges_carry_exactly_the_leaf_contribution(
        kinds in prop::collection::vec(0u8..5, 1..24),
        parents in prop::collection::vec(any::<prop::sample::Index>(), 23),
    ) {
        let topo = random_tree(&kinds, &parents);
        let resolved = flow::resolve(&topo, &contributions_for(&topo));

        for spec in topo.nodes() {
            // The root bus may also be a leaf; its edge is settled by the
            // node on the other end.
            if spec.id == "n00".into() || topo.degree(&spec.id) != 1 {
                continue;
            }
            let (_, edge_idx) = &topo.neighbors(&spec.id)[0];
            let expected = match spec.kind {
                NodeKind::Generator => 50.0,
                NodeKind::Load => 40.0,
                _ => 0.0,
            };
            prop_assert!(
                (resolved.edge_flows()[*edge_idx].abs() - expected).abs() < 1e-9,
                "leaf {} ({}) carries {}, expected {}",
                spec.id,
                spec.kind,
                resolved.edge_flows()[*edge_idx],
                expected,
            );
        }
    }

    #[test]
    fn prop_flow_resolution_is_deterministic(
        kinds in prop::collection::vec(0u8..5, 1..24),
        parents in prop::collection::vec(any::<prop::sample::Index>(), 23),
    ) {
        let topo = random_tree(&kinds, &parents);
        let contributions = contributions_for(&topo);
        let a = flow::resolve(&topo, &contributions);
        let b = flow::resolve(&topo, &contributions);
        prop_assert_eq!(a.edge_flows(), b.edge_flows());
    }

    #[test]
    fn prop_quiet_grid_carries_no_flow(
        parents in prop::collection::vec(any::<prop::sample::Index>(), 1..23),
    ) {
        // Buses and breakers only: nothing injects or withdraws.
        let kinds: Vec<u8> = parents.iter().enumerate().map(|(i, _)| if i % 2 == 0 { 2 } else { 4 }).collect();
        let topo = random_tree(&kinds, &parents);
        let resolved = flow::resolve(&topo, &contributions_for(&topo));
        prop_assert!(resolved.edge_flows().iter().all(|f| f.abs() < 1e-9));
    }
}
