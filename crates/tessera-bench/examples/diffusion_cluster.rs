//! Heat diffusion on two in-process ranks.
//!
//! Demonstrates: build a profile → one scheduler per rank over a
//! `LocalCluster` → seed the field → step → read the global energy and
//! per-rank metrics.

use std::sync::Arc;
use tessera_bench::{declare, DiffusionProfile};
use tessera_core::{MaterialIndex, Rank};
use tessera_scheduler::{RoundRobin, SchedulerConfig};
use tessera_test_utils::ClusterHarness;
use tessera_warehouse::Which;

fn main() {
    println!("=== Tessera Diffusion Example ===\n");

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

    println!("{} patches over 2 ranks, 50 steps", profile.grid.len());
    for step in 0..50 {
        let metrics = cluster.execute_ok();
        if step % 10 == 0 || step == 49 {
            let energy = cluster
                .rank(Rank(0))
                .warehouse()
                .get_reduction(Which::Old, &profile.energy, MaterialIndex(0))
                .unwrap();
            println!(
                "  step {:>3}: energy={:>12.6}, rank0={:>6}μs ({} fetches), rank1={:>6}μs ({} fetches)",
                step + 1,
                energy,
                metrics[0].total_us,
                metrics[0].remote_fetches,
                metrics[1].total_us,
                metrics[1].remote_fetches,
            );
        }
    }

    for (r, report) in (0..2).map(|r| (r, cluster.rank_mut(Rank(r)).shutdown())) {
        if let Some(report) = report {
            println!("rank {r}: {report:?}");
        }
    }
}
