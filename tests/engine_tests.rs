//! End-to-end tick tests: a real mesh, a real coordinator, stepped one
//! tick at a time.

use std::sync::Arc;
use std::time::Duration;

use gridmesh::config::EngineConfig;
use gridmesh::engine::{assemble, CommandError, EngineError, GridEngine, NodeState};
use gridmesh::protection::{TripAction, TripCause};
use gridmesh::topology::{EdgeSpec, NodeSpec, Topology};

fn test_config(cascade_cap: u32) -> EngineConfig {
    EngineConfig {
        tick_ms: 10,
        cascade_cap,
        peer_window_ms: 500,
        barrier_timeout_ms: 2000,
        voltage_sensitivity: 0.01,
        snapshot_history: 16,
        metrics_history: 32,
    }
}

/// gen-1 (100 kW) -- bus-1 -- brk-1 -- load-1 (80 kW)
fn radial_grid(breaker_rating_kw: f64) -> Arc<Topology> {
    Arc::new(
        Topology::build(
            vec![
                NodeSpec::generator("gen-1", 100.0, 120.0),
                NodeSpec::bus("bus-1"),
                NodeSpec::breaker("brk-1", breaker_rating_kw),
                NodeSpec::load("load-1", 80.0),
            ],
            vec![
                EdgeSpec::new("gen-1", "bus-1", 150.0),
                EdgeSpec::new("bus-1", "brk-1", 100.0),
                EdgeSpec::new("brk-1", "load-1", 100.0),
            ],
        )
        .unwrap(),
    )
}

fn engine(topology: Arc<Topology>, cascade_cap: u32) -> GridEngine {
    assemble(topology, &test_config(cascade_cap))
}

#[tokio::test]
async fn test_steady_state_tick_commits_balanced_flows() {
    let topology = radial_grid(200.0);
    let mut engine = engine(topology, 8);

    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.tick, 1);
    assert!(!snapshot.degraded);
    assert_eq!(snapshot.breaker_open(&"brk-1".into()), Some(false));
    assert_eq!(
        snapshot.nodes[&"load-1".into()].state,
        NodeState::Load {
            demand_kw: 80.0,
            served_kw: 80.0,
        }
    );
    assert_eq!(
        snapshot.nodes[&"gen-1".into()].state,
        NodeState::Generator {
            output_kw: 100.0,
            setpoint_kw: 100.0,
            max_capacity_kw: 120.0,
        }
    );
    // The bus absorbs the 20 kW surplus.
    assert_eq!(
        snapshot.nodes[&"bus-1".into()].state,
        NodeState::Bus {
            net_flow_kw: 20.0,
            voltage_deviation: 0.2,
        }
    );
    assert_eq!(
        snapshot.flow_between(&"bus-1".into(), &"brk-1".into()),
        Some(80.0)
    );
    assert_eq!(
        snapshot.flow_between(&"gen-1".into(), &"bus-1".into()),
        Some(100.0)
    );
    assert!(engine.handle.trips_since(0).is_empty());
}

#[tokio::test]
async fn test_overcurrent_trips_within_the_same_tick() {
    // 80 kW through a 50 kW breaker trips it; the committed snapshot
    // already reflects the post-trip island split.
    let topology = radial_grid(50.0);
    let mut engine = engine(topology, 8);

    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.tick, 1);
    assert_eq!(snapshot.breaker_open(&"brk-1".into()), Some(true));
    assert_eq!(
        snapshot.nodes[&"load-1".into()].state,
        NodeState::Load {
            demand_kw: 80.0,
            served_kw: 0.0,
        }
    );

    let trips = engine.handle.trips_since(0);
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].breaker, "brk-1".into());
    assert_eq!(trips[0].tick, 1);
    assert_eq!(
        trips[0].action,
        TripAction::Open {
            cause: TripCause::Overcurrent
        }
    );
}

#[tokio::test]
async fn test_manual_trip_is_deduplicated_and_reclose_restores_service() {
    let topology = radial_grid(200.0);
    let mut engine = engine(topology, 8);
    let handle = engine.handle.clone();

    // Both trips validate against the committed (closed) state; only one
    // transition and one event come out of the tick.
    handle.trip_breaker("brk-1".into()).unwrap();
    handle.trip_breaker("brk-1".into()).unwrap();
    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.breaker_open(&"brk-1".into()), Some(true));
    assert_eq!(
        snapshot.nodes[&"load-1".into()].state,
        NodeState::Load {
            demand_kw: 80.0,
            served_kw: 0.0,
        }
    );
    let trips = handle.trips_since(0);
    assert_eq!(trips.len(), 1);
    assert_eq!(
        trips[0].action,
        TripAction::Open {
            cause: TripCause::Manual
        }
    );

    // Now that the open state is committed, tripping again is rejected
    // up front.
    assert_eq!(
        handle.trip_breaker("brk-1".into()),
        Err(CommandError::AlreadyInState("brk-1".into()))
    );

    handle.reclose_breaker("brk-1".into()).unwrap();
    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.tick, 2);
    assert_eq!(snapshot.breaker_open(&"brk-1".into()), Some(false));
    assert_eq!(
        snapshot.nodes[&"load-1".into()].state,
        NodeState::Load {
            demand_kw: 80.0,
            served_kw: 80.0,
        }
    );
    let trips = handle.trips_since(0);
    assert_eq!(trips.len(), 2);
    assert_eq!(trips[1].action, TripAction::Reclose);
    assert_eq!(trips[1].tick, 2);
}

#[tokio::test]
async fn test_setpoint_change_applies_from_the_next_tick() {
    let topology = radial_grid(200.0);
    let mut engine = engine(topology, 8);
    let handle = engine.handle.clone();

    let first = engine.coordinator.run_tick().await.unwrap();
    assert_eq!(
        first.nodes[&"gen-1".into()].state,
        NodeState::Generator {
            output_kw: 100.0,
            setpoint_kw: 100.0,
            max_capacity_kw: 120.0,
        }
    );

    handle.set_generator_setpoint("gen-1".into(), 90.0).unwrap();
    // The already-committed snapshot is untouched.
    assert_eq!(handle.latest_snapshot().tick, 1);
    assert_eq!(
        handle.latest_snapshot().nodes[&"gen-1".into()].state,
        first.nodes[&"gen-1".into()].state
    );

    let second = engine.coordinator.run_tick().await.unwrap();
    assert_eq!(
        second.nodes[&"gen-1".into()].state,
        NodeState::Generator {
            output_kw: 90.0,
            setpoint_kw: 90.0,
            max_capacity_kw: 120.0,
        }
    );
    assert_eq!(
        second.nodes[&"bus-1".into()].state,
        NodeState::Bus {
            net_flow_kw: 10.0,
            voltage_deviation: 0.1,
        }
    );
}

#[tokio::test]
async fn test_snapshot_covers_every_node_and_edge() {
    let topology = radial_grid(200.0);
    let mut engine = engine(topology.clone(), 8);

    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.nodes.len(), topology.node_count());
    for id in topology.node_ids() {
        assert!(snapshot.nodes.contains_key(id), "missing node {id}");
    }
    assert_eq!(snapshot.flows.len(), topology.edge_count());
}

#[tokio::test]
async fn test_cascade_divergence_rolls_back_to_last_committed() {
    // cascade cap of zero turns any protective trip into a divergence.
    let topology = radial_grid(50.0);
    let mut engine = engine(topology, 0);
    let handle = engine.handle.clone();

    let err = engine.coordinator.run_tick().await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::CascadeDivergence { tick: 1, cap: 0 }
    ));

    // Nothing from the aborted tick leaked out.
    let latest = handle.latest_snapshot();
    assert_eq!(latest.tick, 0);
    assert_eq!(latest.breaker_open(&"brk-1".into()), Some(false));
    assert!(handle.trips_since(0).is_empty());
    assert!(handle.snapshot_at(1).is_none());
}

#[tokio::test]
async fn test_historic_snapshots_stay_queryable() {
    let topology = radial_grid(200.0);
    let mut engine = engine(topology, 8);
    let handle = engine.handle.clone();

    for _ in 0..3 {
        engine.coordinator.run_tick().await.unwrap();
    }

    assert_eq!(handle.latest_snapshot().tick, 3);
    assert_eq!(handle.snapshot_at(1).unwrap().tick, 1);
    assert_eq!(handle.snapshot_at(2).unwrap().tick, 2);
    assert!(handle.snapshot_at(7).is_none());
}

#[tokio::test]
async fn test_aggregation_pipeline_emits_ordered_samples() {
    let topology = radial_grid(200.0);
    let GridEngine {
        mut coordinator,
        pipeline,
        handle,
        ..
    } = engine(topology, 8);

    let mut feed = handle.subscribe_metrics();
    tokio::spawn(pipeline.run());

    coordinator.run_tick().await.unwrap();
    coordinator.run_tick().await.unwrap();

    let first = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("sample within deadline")
        .unwrap();
    let second = tokio::time::timeout(Duration::from_secs(2), feed.recv())
        .await
        .expect("sample within deadline")
        .unwrap();

    assert_eq!(first.tick, 1);
    assert_eq!(second.tick, 2);
    assert_eq!(first.total_generation_kw, 100.0);
    assert_eq!(first.total_load_kw, 80.0);
    assert_eq!(first.open_breakers, 0);

    let pulled = handle.metrics_since(0);
    assert_eq!(pulled.len(), 2);
    assert!(pulled.windows(2).all(|w| w[0].tick < w[1].tick));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_wide_star_commits_clean_snapshots_under_parallelism() {
    // The coordinator signals nodes one at a time, so on a parallel
    // runtime a leaf's update regularly reaches the hub before the hub's
    // own round signal. No update may be lost and no healthy node may be
    // reported stale.
    let mut nodes = vec![NodeSpec::bus("bus-00")];
    let mut edges = Vec::new();
    for i in 1..=24 {
        let id = format!("n{i:02}");
        nodes.push(if i % 2 == 0 {
            NodeSpec::generator(id.clone(), 10.0, 20.0)
        } else {
            NodeSpec::load(id.clone(), 8.0)
        });
        edges.push(EdgeSpec::new("bus-00", id, 1000.0));
    }
    let topology = Arc::new(Topology::build(nodes, edges).unwrap());
    let mut engine = engine(topology, 8);

    for _ in 0..20 {
        let snapshot = engine.coordinator.run_tick().await.unwrap();
        let stale: Vec<_> = snapshot
            .nodes
            .iter()
            .filter(|(_, r)| r.stale)
            .map(|(id, _)| id.clone())
            .collect();
        assert!(
            stale.is_empty(),
            "tick {} has stale nodes: {stale:?}",
            snapshot.tick
        );
        assert!(!snapshot.degraded, "tick {} committed degraded", snapshot.tick);
    }
}

#[tokio::test]
async fn test_transformer_overload_trips_its_protecting_breaker() {
    // gen-1 -- bus-1 -- brk-1 -- xfmr-1 -- load-1, with the transformer
    // rated below the load it carries and protected by brk-1.
    let topology = Arc::new(
        Topology::build(
            vec![
                NodeSpec::generator("gen-1", 100.0, 120.0),
                NodeSpec::bus("bus-1"),
                NodeSpec::breaker("brk-1", 500.0),
                NodeSpec::transformer("xfmr-1", 1.0, 60.0).protected_by("brk-1"),
                NodeSpec::load("load-1", 80.0),
            ],
            vec![
                EdgeSpec::new("gen-1", "bus-1", 150.0),
                EdgeSpec::new("bus-1", "brk-1", 150.0),
                EdgeSpec::new("brk-1", "xfmr-1", 150.0),
                EdgeSpec::new("xfmr-1", "load-1", 150.0),
            ],
        )
        .unwrap(),
    );
    let mut engine = engine(topology, 8);

    let snapshot = engine.coordinator.run_tick().await.unwrap();

    assert_eq!(snapshot.breaker_open(&"brk-1".into()), Some(true));
    assert_eq!(
        snapshot.nodes[&"load-1".into()].state,
        NodeState::Load {
            demand_kw: 80.0,
            served_kw: 0.0,
        }
    );
    let trips = engine.handle.trips_since(0);
    assert_eq!(trips.len(), 1);
    assert_eq!(trips[0].breaker, "brk-1".into());
}
