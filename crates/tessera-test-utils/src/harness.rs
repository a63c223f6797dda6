//! Multi-rank test harness.
//!
//! [`ClusterHarness`] builds one distributed scheduler per rank over a
//! shared [`LocalCluster`] and runs every rank's timestep concurrently,
//! one scoped thread per rank.

use std::sync::Arc;
use std::thread;
use tessera_core::{Grid, Rank, VarLabel, VariableCatalog};
use tessera_exchange::{FaultHandle, LocalCluster};
use tessera_scheduler::{
    ConfigError, LoadBalancer, Scheduler, SchedulerConfig, SchedulerError, SchedulerFactory,
    SchedulerKind, Task, TimestepMetrics,
};

/// One scheduler per rank of an in-process cluster.
///
/// Declarations go to every rank alike; [`execute`](Self::execute) runs
/// the ranks' timesteps side by side, as a real distributed run would.
pub struct ClusterHarness {
    schedulers: Vec<Scheduler>,
    faults: FaultHandle,
}

impl ClusterHarness {
    /// `world_size` ranks with reliable links.
    pub fn new(
        world_size: usize,
        grid: Arc<Grid>,
        catalog: Arc<VariableCatalog>,
        balancer: Arc<dyn LoadBalancer>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        let cluster = LocalCluster::new(world_size, config.exchange.inbox_capacity);
        Self::with_cluster(cluster, grid, catalog, balancer, config)
    }

    /// Build over an existing cluster, e.g. one with lossy links.
    pub fn with_cluster(
        mut cluster: LocalCluster,
        grid: Arc<Grid>,
        catalog: Arc<VariableCatalog>,
        balancer: Arc<dyn LoadBalancer>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        let world_size = cluster.world_size();
        let config = SchedulerConfig {
            kind: SchedulerKind::Distributed { world_size },
            ..config
        };
        let faults = cluster.fault_handle();
        let mut schedulers = Vec::with_capacity(world_size);
        for r in 0..world_size as u32 {
            let rank = Rank(r);
            schedulers.push(SchedulerFactory::create(
                config.clone(),
                rank,
                Arc::clone(&grid),
                Arc::clone(&catalog),
                Arc::clone(&balancer),
                cluster.take_endpoint(rank),
            )?);
        }
        Ok(Self { schedulers, faults })
    }

    /// Number of ranks.
    pub fn world_size(&self) -> usize {
        self.schedulers.len()
    }

    /// Isolate or heal ranks of the underlying cluster.
    pub fn faults(&self) -> &FaultHandle {
        &self.faults
    }

    /// Scheduler of `rank`. Panics if `rank` is outside the cluster.
    pub fn rank(&self, rank: Rank) -> &Scheduler {
        &self.schedulers[rank.index()]
    }

    /// Mutable scheduler of `rank`, for per-rank declarations.
    pub fn rank_mut(&mut self, rank: Rank) -> &mut Scheduler {
        &mut self.schedulers[rank.index()]
    }

    /// Every scheduler, indexed by rank.
    pub fn schedulers(&self) -> &[Scheduler] {
        &self.schedulers
    }

    /// Declare `task` on every rank.
    pub fn add_task(&mut self, task: Task) {
        for s in &mut self.schedulers {
            s.add_task(task.clone());
        }
    }

    /// Drop every task and carry-forward declaration on every rank.
    pub fn clear_tasks(&mut self) {
        for s in &mut self.schedulers {
            s.clear_tasks();
        }
    }

    /// Carry `label` forward on every rank.
    pub fn carry_forward(&mut self, label: &VarLabel) {
        for s in &mut self.schedulers {
            s.carry_forward(label);
        }
    }

    /// Install `balancer` on every rank.
    pub fn set_load_balancer(
        &mut self,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Result<(), ConfigError> {
        for s in &mut self.schedulers {
            s.set_load_balancer(Arc::clone(&balancer))?;
        }
        Ok(())
    }

    /// Leave the halted state on every rank.
    pub fn reset_after_failure(&mut self) {
        for s in &mut self.schedulers {
            s.reset_after_failure();
        }
    }

    /// Run one timestep on every rank concurrently. Results are indexed
    /// by rank.
    pub fn execute(&mut self) -> Vec<Result<TimestepMetrics, SchedulerError>> {
        thread::scope(|scope| {
            let handles: Vec<_> = self
                .schedulers
                .iter_mut()
                .map(|s| scope.spawn(move || s.execute()))
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }

    /// Like [`execute`](Self::execute), panicking if any rank fails.
    pub fn execute_ok(&mut self) -> Vec<TimestepMetrics> {
        self.execute()
            .into_iter()
            .enumerate()
            .map(|(rank, result)| match result {
                Ok(metrics) => metrics,
                Err(e) => panic!("rank {rank} failed: {e}"),
            })
            .collect()
    }

    /// Stop every exchange worker.
    pub fn shutdown(&mut self) {
        for s in &mut self.schedulers {
            s.shutdown();
        }
    }
}
