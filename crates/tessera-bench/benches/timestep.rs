//! Criterion benchmarks for whole timesteps on one and two ranks.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use std::sync::Arc;
use tessera_bench::{declare, DiffusionProfile};
use tessera_core::Rank;
use tessera_scheduler::{RoundRobin, SchedulerConfig};
use tessera_test_utils::ClusterHarness;

/// Benchmark: one diffusion step of the reference profile on one rank.
fn bench_single_rank_step(c: &mut Criterion) {
    let profile = DiffusionProfile::reference(42).unwrap();
    let mut s = profile.single_rank().unwrap();
    declare(&mut s, profile.init_tasks());
    s.execute().unwrap();
    declare(&mut s, profile.step_tasks());
    c.bench_function("timestep_reference_1_rank", |b| {
        b.iter(|| black_box(s.execute().unwrap()));
    });
}

/// Benchmark: the same step split across two in-process ranks.
fn bench_two_rank_step(c: &mut Criterion) {
    let profile = DiffusionProfile::reference(42).unwrap();
    let mut cluster = ClusterHarness::new(
        2,
        Arc::clone(&profile.grid),
        Arc::clone(&profile.catalog),
        Arc::new(RoundRobin::new(2).unwrap()),
        SchedulerConfig::default(),
    )
    .unwrap();
    for t in profile.init_tasks() {
        cluster.add_task(t);
    }
    cluster.execute_ok();
    for r in 0..2 {
        declare(cluster.rank_mut(Rank(r)), profile.step_tasks());
    }
    c.bench_function("timestep_reference_2_ranks", |b| {
        b.iter(|| black_box(cluster.execute_ok()));
    });
    cluster.shutdown();
}

criterion_group!(benches, bench_single_rank_step, bench_two_rank_step);
criterion_main!(benches);
