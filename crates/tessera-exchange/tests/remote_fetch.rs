//! Cross-rank reads through the exchange worker.

use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tessera_core::{
    CommError, Extents, Grid, MaterialIndex, PatchId, Rank, ReductionOp, RemoteFailure,
    VarKind, VarLabel, VariableCatalog,
};
use tessera_exchange::{ExchangeConfig, LocalCluster, MpiExchangeHandler};
use tessera_warehouse::{
    DataWarehouse, GridVariable, ReductionVariable, WarehouseConfig, WarehouseError, Which,
};

const M: MaterialIndex = MaterialIndex(0);

struct Node {
    dw: Arc<DataWarehouse>,
    handler: MpiExchangeHandler,
}

fn fast_config() -> ExchangeConfig {
    ExchangeConfig {
        request_timeout_ms: 20,
        max_backoff_ms: 200,
        ..ExchangeConfig::default()
    }
}

fn catalog() -> VariableCatalog {
    let mut c = VariableCatalog::new();
    c.register("u", VarKind::Grid(tessera_core::Centering::Cell))
        .unwrap();
    c.register("total", VarKind::Reduction(ReductionOp::Sum))
        .unwrap();
    c
}

/// One patch per rank along x, each 4x4x4 cells; patch `i` owned by rank `i`.
fn cluster(
    world: u32,
    config: ExchangeConfig,
    catalog: VariableCatalog) -> (LocalCluster,
    Vec<Node>,
) {
    let grid = Arc::new(
        Grid::uniform(
            Extents::new([0, 0, 0], [4 * world as i32, 4, 4]),
            [world, 1, 1],
        )
        .unwrap(),
    );
    let catalog = Arc::new(catalog);
    let mut cluster = LocalCluster::new(world as usize, config.inbox_capacity);
    let mut nodes = Vec::new();
    for r in 0..world {
        let dw = Arc::new(
            DataWarehouse::new(Rank(r), Arc::clone(&grid), WarehouseConfig::default()).unwrap(),
        );
        for label in catalog.iter().filter(|l| !l.is_reduction()) {
            for p in 0..world {
                dw.register_ownership(label, PatchId(p), Rank(p)).unwrap();
            }
        }
        let endpoint = cluster.take_endpoint(Rank(r)).unwrap();
        let handler = MpiExchangeHandler::spawn(
            endpoint,
            Arc::clone(&dw),
            Arc::clone(&catalog),
            config.clone(),
        )
        .unwrap();
        nodes.push(Node { dw, handler });
    }
    (cluster, nodes)
}

fn put_signature(node: &Node, label: &VarLabel, patch: PatchId) {
    let extents = node.dw.grid().patch(patch).unwrap().extents;
    let var = GridVariable::from_fn(extents, tessera_core::Centering::Cell, |c| {
        patch.0 as f64 * 1000.0 + (c[0] * 100 + c[1] * 10 + c[2]) as f64
    });
    node.dw.put(var, label, patch, M, false).unwrap();
}

// ── Grid reads ──────────────────────────────────────────────────

#[test]
fn remote_read_matches_owner_bit_for_bit() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");
    put_signature(&nodes[1], &u, PatchId(1));

    let remote = nodes[0].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap();
    let local = nodes[1].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap();
    assert!(remote.bits_eq(&local));
    assert_eq!(nodes[1].handler.metrics().requests_served, 1);
    assert_eq!(nodes[0].handler.metrics().replies_received, 1);
}

#[test]
fn halo_is_filled_from_the_other_rank() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");
    put_signature(&nodes[0], &u, PatchId(0));
    put_signature(&nodes[1], &u, PatchId(1));

    let halo = nodes[0].dw.get(Which::New, &u, PatchId(0), M, 1).unwrap();
    // Clamped at the domain boundary, one layer into patch 1 along +x.
    assert_eq!(halo.extents(), Extents::new([0, 0, 0], [5, 4, 4]));
    assert_eq!(halo.get([4, 2, 3]), Some(1000.0 + 423.0));
    assert_eq!(halo.get([3, 2, 3]), Some(323.0));
}

#[test]
fn request_is_parked_until_the_owner_puts() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");

    let reader = {
        let dw = Arc::clone(&nodes[0].dw);
        let u = u.clone();
        thread::spawn(move || dw.get(Which::New, &u, PatchId(1), M, 0))
    };
    thread::sleep(Duration::from_millis(50));
    put_signature(&nodes[1], &u, PatchId(1));

    let got = reader.join().unwrap().unwrap();
    assert_eq!(got.get([4, 0, 0]), Some(1400.0));
    assert!(nodes[1].handler.metrics().requests_parked >= 1);
}

#[test]
fn prefetch_then_settle_avoids_blocking_get() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");
    put_signature(&nodes[1], &u, PatchId(1));

    let fetches = nodes[0].dw.prefetch(Which::New, &u, PatchId(1), M, 0).unwrap();
    assert_eq!(fetches.len(), 1);
    for f in fetches {
        nodes[0].dw.settle(f).unwrap();
    }
    let sent = nodes[0].handler.metrics().requests_sent;
    nodes[0].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap();
    assert_eq!(nodes[0].handler.metrics().requests_sent, sent);
}

// ── Failures ────────────────────────────────────────────────────

#[test]
fn isolated_owner_times_out_after_retries() {
    let config = ExchangeConfig {
        request_timeout_ms: 5,
        max_retries: 2,
        max_backoff_ms: 20,
        ..ExchangeConfig::default()
    };
    let (cluster, nodes) = cluster(2, config, catalog());
    let u = VarLabel::cell("u");
    put_signature(&nodes[1], &u, PatchId(1));
    cluster.isolate(Rank(1));

    let err = nodes[0].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap_err();
    match err {
        WarehouseError::Communication(CommError::Timeout {
            label,
            patch,
            owner,
            attempts,
        }) => {
            assert_eq!(label, "u");
            assert_eq!(patch, PatchId(1));
            assert_eq!(owner, Rank(1));
            assert_eq!(attempts, 3);
        }
        other => panic!("expected timeout, got {other:?}"),
    }
    let m = nodes[0].handler.metrics();
    assert_eq!(m.retries, 2);
    assert_eq!(m.timeouts, 1);
}

#[test]
fn lossy_links_are_recovered_by_retries() {
    let config = ExchangeConfig {
        request_timeout_ms: 5,
        max_retries: 12,
        backoff_factor: 1.5,
        max_backoff_ms: 40,
        ..ExchangeConfig::default()
    };
    let catalog = Arc::new(catalog());
    let grid = Arc::new(Grid::uniform(Extents::new([0, 0, 0], [8, 4, 4]), [2, 1, 1]).unwrap());
    let mut cluster = LocalCluster::with_drop_probability(2, config.inbox_capacity, 0.2, 7);
    let u = VarLabel::cell("u");
    let mut nodes = Vec::new();
    for r in 0..2 {
        let dw = Arc::new(
            DataWarehouse::new(Rank(r), Arc::clone(&grid), WarehouseConfig::default()).unwrap(),
        );
        dw.register_ownership(&u, PatchId(0), Rank(0)).unwrap();
        dw.register_ownership(&u, PatchId(1), Rank(1)).unwrap();
        let endpoint = cluster.take_endpoint(Rank(r)).unwrap();
        let handler = MpiExchangeHandler::spawn(
            endpoint,
            Arc::clone(&dw),
            Arc::clone(&catalog),
            config.clone(),
        )
        .unwrap();
        nodes.push(Node { dw, handler });
    }
    put_signature(&nodes[1], &u, PatchId(1));

    let expected = nodes[1].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap();
    for z in 0..4 {
        // Distinct windows force a fresh request each time.
        let window = Extents::new([4, 0, z], [8, 4, z + 1]);
        let pending = {
            use tessera_warehouse::{FetchRequest, FetchTarget, RemoteFetch};
            nodes[0].handler.client().request(FetchRequest {
                owner: Rank(1),
                label: u.clone(),
                patch: PatchId(1),
                material: M,
                generation: nodes[0].dw.generation_id(Which::New),
                target: FetchTarget::Grid { window: Some(window) },
            })
        };
        let bytes = pending.wait().unwrap();
        let part = tessera_warehouse::codec::decode_grid(&bytes).unwrap();
        assert!(part.bits_eq(&expected.crop(&window).unwrap()));
    }
}

#[test]
fn unknown_label_is_rejected_by_owner() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    // Only the requester knows "v"; rank 1's catalog has never seen it.
    let v = VarLabel::cell("v");
    nodes[0].dw.register_ownership(&v, PatchId(1), Rank(1)).unwrap();

    let err = nodes[0].dw.get(Which::New, &v, PatchId(1), M, 0).unwrap_err();
    assert!(matches!(
        err,
        WarehouseError::Communication(CommError::Remote {
            owner: Rank(1),
            failure: RemoteFailure::Rejected { .. },
        })
    ));
}

#[test]
fn retired_generation_is_reported_stale() {
    let (_cluster, nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");
    for _ in 0..4 {
        nodes[1].dw.advance();
    }
    // Rank 0 is still on generation 1; rank 1 keeps 5 (new), 4 (old), 3 and 2.
    let err = nodes[0].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap_err();
    assert!(matches!(err, WarehouseError::StaleGeneration { .. }), "{err:?}");
}

#[test]
fn shutdown_drains_and_disconnects_clients() {
    let (_cluster, mut nodes) = cluster(2, fast_config(), catalog());
    let u = VarLabel::cell("u");
    let report = nodes[0].handler.shutdown();
    assert!(report.joined);
    assert_eq!(report.drained, 0);

    let err = nodes[0].dw.get(Which::New, &u, PatchId(1), M, 0).unwrap_err();
    assert_eq!(err, WarehouseError::Communication(CommError::Disconnected));

    // A second shutdown is a no-op.
    assert!(nodes[0].handler.shutdown().joined);
}

// ── Reductions ──────────────────────────────────────────────────

#[test]
fn all_reduce_agrees_on_every_rank() {
    let (_cluster, nodes) = cluster(3, fast_config(), catalog());
    let total = VarLabel::reduction("total", ReductionOp::Sum);

    let handles: Vec<_> = nodes
        .iter()
        .enumerate()
        .map(|(r, node)| {
            let dw = Arc::clone(&node.dw);
            let client = node.handler.client();
            let total = total.clone();
            thread::spawn(move || {
                let generation = dw.generation_id(Which::New);
                dw.put(
                    ReductionVariable::new(ReductionOp::Sum, 0.1 * (r + 1) as f64),
                    &total,
                    PatchId(r as u32),
                    M,
                    false,
                )
                .unwrap();
                let local = dw.seal_reduction(&total, M).unwrap();
                let global = client.all_reduce(&total, M, generation, local).unwrap();
                dw.set_global_reduction(&total, M, global).unwrap();
                global
            })
        })
        .collect();

    let results: Vec<f64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    let expected = ReductionOp::Sum.fold([0.1, 0.2, 0.30000000000000004]);
    for r in &results {
        assert_eq!(r.to_bits(), expected.to_bits());
    }
    for node in &nodes {
        assert_eq!(
            node.dw.get_reduction(Which::New, &total, M).unwrap().to_bits(),
            expected.to_bits()
        );
    }
}

#[test]
fn all_reduce_rejects_grid_labels() {
    let (_cluster, nodes) = cluster(1, fast_config(), catalog());
    let err = nodes[0]
        .handler
        .client()
        .all_reduce(&VarLabel::cell("u"), M, nodes[0].dw.generation_id(Which::New), 1.0)
        .unwrap_err();
    assert!(matches!(err, tessera_exchange::ExchangeError::NotAReduction { .. }));
}
