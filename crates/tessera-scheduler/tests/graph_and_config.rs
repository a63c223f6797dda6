//! Graph compilation errors and configuration loading, end to end.

use std::sync::Arc;
use tessera_core::{MaterialIndex, PatchId, Rank, ReductionOp, TimestepId, VarLabel};
use tessera_exchange::LocalCluster;
use tessera_scheduler::{
    ConfigError, GraphError, RoundRobin, Scheduler, SchedulerConfig, SchedulerError,
    SchedulerFactory, SchedulerKind, SingleRank, Task, TaskError,
};
use tessera_test_utils::fixtures::{constant_fill, copy, signature_fill, stencil};
use tessera_test_utils::{catalog_with, line_grid};
use tessera_warehouse::{GhostBoundary, WarehouseError, Which};

fn single(labels: &[&VarLabel], config: SchedulerConfig) -> Scheduler {
    SchedulerFactory::create(
        config,
        Rank(0),
        line_grid(3, 2),
        catalog_with(labels),
        Arc::new(SingleRank),
        None,
    )
    .unwrap()
}

// ── Graph errors ─────────────────────────────────────────────────

#[test]
fn cycle_is_rejected_before_anything_runs() {
    let a = VarLabel::cell("A");
    let b = VarLabel::cell("B");
    let mut s = single(&[&a, &b], SchedulerConfig::default());
    s.add_task(
        Task::with_body("left", copy(&b, Which::New, &a))
            .requires(&b, Which::New, 0)
            .computes(&a),
    );
    s.add_task(
        Task::with_body("right", copy(&a, Which::New, &b))
            .requires(&a, Which::New, 0)
            .computes(&b),
    );

    let err = s.execute().unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Graph(GraphError::Cycle {
            tasks: vec!["left".into(), "right".into()],
            labels: vec!["A".into(), "B".into()],
        })
    );
    // Declaration errors do not halt; fixing the graph is enough.
    assert!(!s.is_halted());
    assert_eq!(s.timestep(), TimestepId(0));

    s.clear_tasks();
    s.add_task(Task::with_body("left", constant_fill(&a, 1.0)).computes(&a));
    s.add_task(
        Task::with_body("right", copy(&a, Which::New, &b))
            .requires(&a, Which::New, 0)
            .computes(&b),
    );
    s.execute().unwrap();
}

fn compile_error(task: Task, catalog: &[&VarLabel]) -> GraphError {
    let mut s = single(catalog, SchedulerConfig::default());
    s.add_task(task);
    match s.compile() {
        Err(SchedulerError::Graph(e)) => e,
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("graph compiled"),
    }
}

#[test]
fn declaration_mistakes_are_reported_by_compile() {
    let x = VarLabel::cell("X");
    let total = VarLabel::reduction("total", ReductionOp::Sum);
    let unknown = VarLabel::cell("nowhere");
    let labels = [&x, &total];

    let err = compile_error(
        Task::with_body("t", signature_fill(&unknown)).computes(&unknown),
        &labels,
    );
    assert!(matches!(err, GraphError::UnknownLabel { .. }), "{err}");

    let err = compile_error(
        Task::with_body("t", signature_fill(&x))
            .requires(&x, Which::New, 3)
            .computes(&x),
        &labels,
    );
    assert!(matches!(err, GraphError::InvalidGhost { ghost: 3, .. }), "{err}");

    let err = compile_error(
        Task::with_body("t", signature_fill(&x))
            .requires(&total, Which::Old, 1)
            .computes(&x),
        &labels,
    );
    assert!(matches!(err, GraphError::InvalidGhost { .. }), "{err}");

    let err = compile_error(Task::with_body("t", signature_fill(&x)).modifies(&x), &labels);
    assert!(matches!(err, GraphError::MissingProducer { patch: PatchId(0), .. }), "{err}");

    let err = compile_error(
        Task::with_body("t", signature_fill(&x))
            .on_patches([PatchId(9)])
            .computes(&x),
        &labels,
    );
    assert!(matches!(err, GraphError::UnknownPatch { patch: PatchId(9), .. }), "{err}");
}

#[test]
fn missing_producer_names_the_gap() {
    let x = VarLabel::cell("X");
    let y = VarLabel::cell("Y");
    let mut s = single(&[&x, &y], SchedulerConfig::default());
    s.add_task(
        Task::with_body("fill", signature_fill(&x))
            .on_patches([PatchId(0), PatchId(1)])
            .computes(&x),
    );
    s.add_task(
        Task::with_body("smooth", stencil(&x, Which::New, &y))
            .on_patches([PatchId(1)])
            .requires(&x, Which::New, 1)
            .computes(&y),
    );
    let err = s.compile().unwrap_err();
    assert_eq!(
        err,
        SchedulerError::Graph(GraphError::MissingProducer {
            task: "smooth".into(),
            label: "X".into(),
            patch: PatchId(2),
            material: MaterialIndex(0),
        })
    );
}

// ── Ghost boundary policy ────────────────────────────────────────

fn edge_stencil() -> (VarLabel, VarLabel, Vec<Task>) {
    let x = VarLabel::cell("X");
    let y = VarLabel::cell("Y");
    let tasks = vec![
        Task::with_body("fill", signature_fill(&x)).computes(&x),
        Task::with_body("smooth", stencil(&x, Which::New, &y))
            .on_patches([PatchId(0)])
            .requires(&x, Which::New, 1)
            .computes(&y),
    ];
    (x, y, tasks)
}

#[test]
fn halo_is_clamped_at_the_domain_edge_by_default() {
    let (x, y, tasks) = edge_stencil();
    let mut s = single(&[&x, &y], SchedulerConfig::default());
    for t in tasks {
        s.add_task(t);
    }
    s.execute().unwrap();
}

#[test]
fn fatal_boundary_aborts_the_timestep() {
    let (x, y, tasks) = edge_stencil();
    let mut config = SchedulerConfig::default();
    config.warehouse.ghost_boundary = GhostBoundary::Fatal;
    let mut s = single(&[&x, &y], config);
    for t in tasks {
        s.add_task(t);
    }
    match s.execute().unwrap_err() {
        SchedulerError::TaskFailed {
            task,
            source: TaskError::Warehouse(WarehouseError::GhostCellUnavailable { requested, .. }),
            ..
        } => {
            assert_eq!(task, "smooth");
            assert_eq!(requested, 1);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(s.is_halted());
}

// ── Configuration ────────────────────────────────────────────────

#[test]
fn distributed_config_loads_from_json() {
    let json = r#"{
        "kind": {"type": "distributed", "world_size": 2},
        "max_ghost_cells": 1,
        "warehouse": {"ghost_boundary": "fatal"},
        "exchange": {"request_timeout_ms": 50, "max_retries": 3}
    }"#;
    let config: SchedulerConfig = serde_json::from_str(json).unwrap();
    assert_eq!(config.kind, SchedulerKind::Distributed { world_size: 2 });
    assert_eq!(config.forecast_window, SchedulerConfig::default().forecast_window);
    config.validate().unwrap();

    let mut cluster = LocalCluster::new(2, config.exchange.inbox_capacity);
    let s = SchedulerFactory::create(
        config.clone(),
        Rank(1),
        line_grid(2, 2),
        catalog_with(&[]),
        Arc::new(RoundRobin::new(2).unwrap()),
        cluster.take_endpoint(Rank(1)),
    )
    .unwrap();
    assert_eq!(s.rank(), Rank(1));
    assert!(s.exchange_client().is_some());
    assert_eq!(s.config(), &config);

    let json = serde_json::to_string(&config).unwrap();
    let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
    assert_eq!(back, config);
}

#[test]
fn factory_rejects_mismatched_balancer() {
    let err = SchedulerFactory::create(
        SchedulerConfig::default(),
        Rank(0),
        line_grid(2, 2),
        catalog_with(&[]),
        Arc::new(RoundRobin::new(2).unwrap()),
        None,
    )
    .unwrap_err();
    assert_eq!(
        err,
        ConfigError::BalancerMismatch {
            balancer: 2,
            configured: 1
        }
    );
}
