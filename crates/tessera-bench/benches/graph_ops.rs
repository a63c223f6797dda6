//! Criterion micro-benchmarks for task-graph compilation.

use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tessera_bench::DiffusionProfile;
use tessera_scheduler::graph::compile;
use tessera_scheduler::{RoundRobin, SingleRank, Task};
use tessera_warehouse::Which;

/// Diffusion step plus a read-modify chain, so every edge kind appears.
fn pipeline(profile: &DiffusionProfile) -> Vec<Task> {
    let mut tasks = profile.step_tasks();
    let noop = tasks[0].body().clone();
    tasks.push(
        Task::with_body("inspect", noop)
            .requires(&profile.heat, Which::New, 2)
            .requires(&profile.energy, Which::New, 0),
    );
    tasks
}

/// Benchmark: compile the reference profile (16 patches) on one rank.
fn bench_compile_reference(c: &mut Criterion) {
    let profile = DiffusionProfile::reference(42).unwrap();
    let tasks = pipeline(&profile);
    c.bench_function("compile_reference_single", |b| {
        b.iter(|| {
            black_box(
                compile(&tasks, &profile.grid, &profile.catalog, &SingleRank, &[], 2).unwrap(),
            )
        });
    });
}

/// Benchmark: compile the stress profile (128 patches) across 8 ranks.
fn bench_compile_stress(c: &mut Criterion) {
    let profile = DiffusionProfile::stress(42).unwrap();
    let tasks = pipeline(&profile);
    let balancer = RoundRobin::new(8).unwrap();
    c.bench_function("compile_stress_8_ranks", |b| {
        b.iter(|| {
            black_box(compile(&tasks, &profile.grid, &profile.catalog, &balancer, &[], 2).unwrap())
        });
    });
}

criterion_group!(benches, bench_compile_reference, bench_compile_stress);
criterion_main!(benches);
