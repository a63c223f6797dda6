//! Per-rank timestep driver.
//!
//! A [`Scheduler`] owns one rank's [`DataWarehouse`], its task
//! declarations and (in distributed runs) its exchange worker. Each call
//! to [`execute()`](Scheduler::execute) runs one timestep:
//!
//! ```text
//! hold back modified keys → carry forward → register ownership
//!     → move modified carried keys to their assigned rank
//!     → for each node of the global order:
//!     task on this rank:  prefetch inputs → settle → run body → check outputs
//!     reduce:             seal partial → all-reduce → store global
//! → advance generations → fold cost measurements
//! ```
//!
//! # Abort semantics
//!
//! Any failure discards the new generation, drops the timestep's cost
//! measurements and halts the scheduler. Further `execute()` calls
//! return [`SchedulerError::Halted`] until
//! [`reset_after_failure()`](Scheduler::reset_after_failure) is called.
//! No partially computed timestep is ever committed.

use crate::balance::LoadBalancer;
use crate::config::{ConfigError, SchedulerConfig};
use crate::context::TaskContext;
use crate::error::{SchedulerError, TaskError};
use crate::forecast::CostForecaster;
use crate::graph::{self, CompiledGraph, ReduceStep, ScheduledNode, TaskInstance};
use crate::metrics::TimestepMetrics;
use crate::task::Task;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tessera_core::{Rank, TimestepId, VarLabel, VariableCatalog};
use tessera_exchange::{ExchangeClient, MpiExchangeHandler, ShutdownReport};
use tessera_warehouse::{DataWarehouse, InFlightFetch, WarehouseError, Which};
use tracing::{debug, error, info};

// Compile-time assertion: a Scheduler can be moved onto a rank thread.
const _: () = {
    #[allow(dead_code)]
    fn assert_send<T: Send>() {}
    #[allow(dead_code)]
    fn check() {
        assert_send::<Scheduler>();
    }
};

// ── TaskState ────────────────────────────────────────────────────

/// Lifecycle of one task instance within a timestep.
///
/// ```text
/// Unscheduled → Ready → Executing → Done
///      │          │          │
///      └──────────┴──────────┴────→ Failed
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for predecessors or inputs.
    Unscheduled,
    /// Every declared input is obtainable locally.
    Ready,
    /// The body is running.
    Executing,
    /// Completed with all outputs stored.
    Done,
    /// Failed; the timestep was aborted.
    Failed,
}

impl TaskState {
    /// Whether `self → next` is a legal transition.
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Unscheduled, Ready)
                | (Ready, Executing)
                | (Executing, Done)
                | (Unscheduled | Ready | Executing, Failed)
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Failed { timestep: TimestepId },
}

// ── Scheduler ────────────────────────────────────────────────────

/// Drives timesteps for one rank.
///
/// Build with [`new()`](Scheduler::new) for a single-rank run, or with
/// [`SchedulerFactory::create`](crate::SchedulerFactory::create) which
/// also wires the exchange worker for distributed runs.
pub struct Scheduler {
    warehouse: Arc<DataWarehouse>,
    catalog: Arc<VariableCatalog>,
    balancer: Arc<dyn LoadBalancer>,
    config: SchedulerConfig,
    exchange: Option<MpiExchangeHandler>,
    client: Option<ExchangeClient>,
    tasks: Vec<Task>,
    carried: Vec<VarLabel>,
    compiled: Option<Arc<CompiledGraph>>,
    forecaster: CostForecaster,
    timestep: TimestepId,
    state: RunState,
    instance_states: Vec<(TaskInstance, TaskState)>,
    last_metrics: TimestepMetrics,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("rank", &self.warehouse.rank())
            .field("tasks", &self.tasks.len())
            .field("carried", &self.carried)
            .field("timestep", &self.timestep)
            .field("state", &self.state)
            .field("distributed", &self.client.is_some())
            .finish()
    }
}

impl Scheduler {
    /// A scheduler over an existing warehouse.
    ///
    /// Validates `config` and checks that `balancer` spans the configured
    /// number of ranks and that the warehouse's rank is one of them.
    pub fn new(
        warehouse: Arc<DataWarehouse>,
        catalog: Arc<VariableCatalog>,
        balancer: Arc<dyn LoadBalancer>,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let world_size = config.kind.world_size();
        check_balancer(balancer.as_ref(), world_size)?;
        let rank = warehouse.rank();
        if rank.index() >= world_size {
            return Err(ConfigError::RankOutOfRange { rank, world_size });
        }
        let forecaster = CostForecaster::new(config.forecast_window)?;
        Ok(Self {
            warehouse,
            catalog,
            balancer,
            config,
            exchange: None,
            client: None,
            tasks: Vec::new(),
            carried: Vec::new(),
            compiled: None,
            forecaster,
            timestep: TimestepId(0),
            state: RunState::Idle,
            instance_states: Vec::new(),
            last_metrics: TimestepMetrics::default(),
        })
    }

    /// Route remote reads and reductions through `handler`.
    ///
    /// The handler must serve this scheduler's warehouse.
    pub(crate) fn attach_exchange(&mut self, handler: MpiExchangeHandler) {
        self.client = Some(handler.client());
        self.exchange = Some(handler);
    }

    // ── Declarations ─────────────────────────────────────────────

    /// Declare a task. Invalidates the compiled graph.
    pub fn add_task(&mut self, task: Task) {
        self.tasks.push(task);
        self.compiled = None;
    }

    /// Copy `label` unchanged from the old generation at the start of
    /// every timestep. Invalidates the compiled graph.
    pub fn carry_forward(&mut self, label: &VarLabel) {
        if !self.carried.contains(label) {
            self.carried.push(label.clone());
            self.compiled = None;
        }
    }

    /// Remove every task and carry-forward declaration.
    pub fn clear_tasks(&mut self) {
        self.tasks.clear();
        self.carried.clear();
        self.compiled = None;
    }

    /// Declared tasks, in declaration order.
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Compile the declared tasks, reusing the previous result if no
    /// declaration or assignment changed since.
    pub fn compile(&mut self) -> Result<Arc<CompiledGraph>, SchedulerError> {
        if let Some(compiled) = &self.compiled {
            return Ok(Arc::clone(compiled));
        }
        let compiled = Arc::new(graph::compile(
            &self.tasks,
            self.warehouse.grid(),
            &self.catalog,
            self.balancer.as_ref(),
            &self.carried,
            self.config.max_ghost_cells,
        )?);
        info!(
            rank = %self.rank(),
            tasks = self.tasks.len(),
            nodes = compiled.len(),
            edges = compiled.edge_count(),
            local = compiled.instances_on(self.rank()).count(),
            "task graph compiled"
        );
        self.compiled = Some(Arc::clone(&compiled));
        Ok(compiled)
    }

    // ── Accessors ────────────────────────────────────────────────

    /// This rank's warehouse.
    pub fn warehouse(&self) -> &Arc<DataWarehouse> {
        &self.warehouse
    }

    /// Rank this scheduler drives.
    pub fn rank(&self) -> Rank {
        self.warehouse.rank()
    }

    /// Last completed timestep (`0` before the first).
    pub fn timestep(&self) -> TimestepId {
        self.timestep
    }

    /// Configuration in use.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Current load balancer.
    pub fn load_balancer(&self) -> &Arc<dyn LoadBalancer> {
        &self.balancer
    }

    /// Per-patch cost history.
    pub fn forecaster(&self) -> &CostForecaster {
        &self.forecaster
    }

    /// Metrics of the last successful timestep.
    pub fn last_metrics(&self) -> &TimestepMetrics {
        &self.last_metrics
    }

    /// State of every local task instance in the last attempted timestep.
    pub fn instance_states(&self) -> &[(TaskInstance, TaskState)] {
        &self.instance_states
    }

    /// Whether a timestep aborted and the scheduler awaits a reset.
    pub fn is_halted(&self) -> bool {
        matches!(self.state, RunState::Failed { .. })
    }

    /// Exchange client, present in distributed runs.
    pub fn exchange_client(&self) -> Option<&ExchangeClient> {
        self.client.as_ref()
    }

    // ── Control ──────────────────────────────────────────────────

    /// Replace the patch assignment. Takes effect at the next timestep.
    ///
    /// Every rank must switch to an identical balancer between the same
    /// two timesteps.
    pub fn set_load_balancer(
        &mut self,
        balancer: Arc<dyn LoadBalancer>,
    ) -> Result<(), ConfigError> {
        check_balancer(balancer.as_ref(), self.config.kind.world_size())?;
        info!(rank = %self.rank(), balancer = ?balancer, "load balancer replaced");
        self.balancer = balancer;
        self.compiled = None;
        Ok(())
    }

    /// Leave the halted state after an aborted timestep.
    ///
    /// The aborted timestep's new generation was already discarded, so
    /// the next `execute()` reruns it from the same old generation.
    pub fn reset_after_failure(&mut self) {
        if let RunState::Failed { timestep } = self.state {
            info!(rank = %self.rank(), timestep = %timestep, "scheduler reset after failure");
        }
        self.state = RunState::Idle;
    }

    /// Stop the exchange worker, if any. Idempotent.
    pub fn shutdown(&mut self) -> Option<ShutdownReport> {
        self.client = None;
        self.exchange.as_mut().map(MpiExchangeHandler::shutdown)
    }

    // ── Execution ────────────────────────────────────────────────

    /// Run one timestep.
    ///
    /// Blocks while waiting for data owned by other ranks, so in a
    /// distributed run every rank's scheduler must be executing the same
    /// timestep concurrently.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Graph`] if the declarations do not compile
    /// (nothing runs and the scheduler is not halted). Any other error
    /// aborts the timestep and halts the scheduler.
    pub fn execute(&mut self) -> Result<TimestepMetrics, SchedulerError> {
        let start = Instant::now();

        // 0. Refuse to run after an abort.
        if let RunState::Failed { timestep } = self.state {
            return Err(SchedulerError::Halted { timestep });
        }
        let compiled = self.compile()?;
        let timestep = self.timestep.next();
        let rank = self.rank();
        info!(
            rank = %rank,
            timestep = %timestep,
            generation = %self.warehouse.generation_id(Which::New),
            "timestep begin"
        );

        let mut metrics = TimestepMetrics {
            timestep,
            ..TimestepMetrics::default()
        };
        self.instance_states = compiled
            .instances_on(rank)
            .map(|i| (*i, TaskState::Unscheduled))
            .collect();

        match self.run_timestep(&compiled, timestep, &mut metrics) {
            Ok(()) => {
                // 6. Commit.
                let generation = self.warehouse.advance();
                let updated = self.forecaster.finalize_contributions();
                self.timestep = timestep;
                metrics.total_us = start.elapsed().as_micros() as u64;
                info!(
                    rank = %rank,
                    timestep = %timestep,
                    generation = %generation,
                    tasks = metrics.tasks_run(),
                    remote_fetches = metrics.remote_fetches,
                    forecast_updates = updated,
                    total_us = metrics.total_us,
                    "timestep end"
                );
                self.last_metrics = metrics.clone();
                Ok(metrics)
            }
            Err(err) => {
                error!(rank = %rank, timestep = %timestep, error = %err, "timestep aborted");
                self.warehouse.discard_new();
                self.forecaster.discard_contributions();
                self.state = RunState::Failed { timestep };
                Err(err)
            }
        }
    }

    fn run_timestep(
        &mut self,
        compiled: &CompiledGraph,
        timestep: TimestepId,
        metrics: &mut TimestepMetrics,
    ) -> Result<(), SchedulerError> {
        let storage = |e: WarehouseError| SchedulerError::storage(timestep, e);

        // 1. Hold back values that local tasks will still modify, before
        //    any of them can be served.
        let rank = self.rank();
        for m in compiled.modifications().iter().filter(|m| m.rank == rank) {
            self.warehouse
                .expect_modifications(&m.label, m.patch, m.material, m.count)
                .map_err(storage)?;
        }

        // 2. Carry forward.
        metrics.carried_forward = self
            .warehouse
            .carry_forward(&self.carried)
            .map_err(storage)? as u64;

        // 3. Publish ownership of everything produced this timestep.
        for owner in compiled.ownership() {
            self.warehouse
                .register_ownership(&owner.label, owner.patch, owner.rank)
                .map_err(storage)?;
            self.warehouse
                .register_materials(&owner.label, owner.patch, &owner.materials);
        }

        // 4. A carried value is modified where its patch runs now.
        for owner in compiled.carried_ownership() {
            let moved = self
                .warehouse
                .migrate_ownership(&owner.label, owner.patch, owner.rank, &owner.materials)
                .map_err(storage)?;
            if let Some(from) = moved {
                metrics.migrated += 1;
                debug!(
                    rank = %rank,
                    label = %owner.label,
                    patch = %owner.patch,
                    from = %from,
                    to = %owner.rank,
                    "carried value moved"
                );
            }
        }

        // 5. Walk the global order.
        let mut local = 0;
        for node in compiled.order() {
            match node {
                ScheduledNode::Task(instance) if instance.rank == rank => {
                    let slot = local;
                    local += 1;
                    self.run_instance(compiled, instance, slot, timestep, metrics)?;
                }
                ScheduledNode::Task(_) => {}
                ScheduledNode::Reduce(step) => {
                    self.reduce(step, timestep)?;
                    metrics.reductions += 1;
                }
            }
        }
        Ok(())
    }

    fn run_instance(
        &mut self,
        compiled: &CompiledGraph,
        instance: &TaskInstance,
        slot: usize,
        timestep: TimestepId,
        metrics: &mut TimestepMetrics,
    ) -> Result<(), SchedulerError> {
        let task = &compiled.tasks()[instance.task];
        let fail = |source: TaskError| match source {
            TaskError::Warehouse(WarehouseError::Communication(source)) => {
                SchedulerError::Communication { timestep, source }
            }
            source => SchedulerError::TaskFailed {
                task: task.name().to_string(),
                patch: instance.patch,
                timestep,
                source,
            },
        };

        // 5a. Make every input obtainable before dispatch.
        let wait_start = Instant::now();
        let fetched = match self.gather_inputs(task, instance) {
            Ok(n) => n,
            Err(e) => {
                self.set_state(slot, TaskState::Failed);
                return Err(fail(TaskError::Warehouse(e)));
            }
        };
        if fetched > 0 {
            metrics.remote_fetches += fetched;
            metrics.fetch_wait_us += wait_start.elapsed().as_micros() as u64;
        }
        self.set_state(slot, TaskState::Ready);

        // 5b. Run the body.
        let Some(patch) = self.warehouse.grid().patch(instance.patch).copied() else {
            self.set_state(slot, TaskState::Failed);
            return Err(fail(TaskError::Warehouse(WarehouseError::UnknownPatch {
                patch: instance.patch,
            })));
        };
        self.set_state(slot, TaskState::Executing);
        debug!(
            rank = %instance.rank,
            task = task.name(),
            patch = %instance.patch,
            "task dispatched"
        );
        let body_start = Instant::now();
        let result = {
            let mut ctx = TaskContext::new(&self.warehouse, task, patch, timestep);
            (task.body())(&mut ctx).and_then(|()| ctx.check_outputs())
        };
        let elapsed = body_start.elapsed();
        if let Err(e) = result {
            self.set_state(slot, TaskState::Failed);
            error!(
                rank = %instance.rank,
                task = task.name(),
                patch = %instance.patch,
                error = %e,
                "task failed"
            );
            return Err(fail(e));
        }
        self.set_state(slot, TaskState::Done);

        let us = elapsed.as_micros() as u64;
        debug!(rank = %instance.rank, task = task.name(), patch = %instance.patch, us, "task done");
        self.forecaster
            .add_contribution(instance.patch, elapsed.as_secs_f64());
        metrics
            .task_us
            .push((task.name().to_string(), instance.patch, us));
        Ok(())
    }

    /// Issue every remote fetch the instance's grid inputs need, then
    /// wait for all of them. Returns the number of fetches.
    fn gather_inputs(&self, task: &Task, instance: &TaskInstance) -> Result<u64, WarehouseError> {
        let mut inflight: Vec<InFlightFetch> = Vec::new();
        for dep in task.requires_list() {
            if dep.label.is_reduction() {
                continue;
            }
            for &material in dep.materials_for(task.task_materials()) {
                inflight.extend(self.warehouse.prefetch(
                    dep.which,
                    &dep.label,
                    instance.patch,
                    material,
                    dep.ghost,
                )?);
            }
        }
        for dep in task.modifies_list() {
            for &material in dep.materials_for(task.task_materials()) {
                inflight.extend(self.warehouse.prefetch(
                    Which::New,
                    &dep.label,
                    instance.patch,
                    material,
                    0,
                )?);
            }
        }
        let count = inflight.len() as u64;
        for fetch in inflight {
            self.warehouse.settle(fetch)?;
        }
        Ok(count)
    }

    fn reduce(&self, step: &ReduceStep, timestep: TimestepId) -> Result<(), SchedulerError> {
        let generation = self.warehouse.generation_id(Which::New);
        for &material in &step.materials {
            let partial = self
                .warehouse
                .seal_reduction(&step.label, material)
                .map_err(|e| SchedulerError::storage(timestep, e))?;
            let global = match &self.client {
                Some(client) => client
                    .all_reduce(&step.label, material, generation, partial)
                    .map_err(|source| SchedulerError::Reduction {
                        label: step.label.name().to_string(),
                        timestep,
                        source,
                    })?,
                None => partial,
            };
            self.warehouse
                .set_global_reduction(&step.label, material, global)
                .map_err(|e| SchedulerError::storage(timestep, e))?;
            debug!(
                rank = %self.rank(),
                label = %step.label,
                material = %material,
                partial,
                global,
                "reduction stored"
            );
        }
        Ok(())
    }

    fn set_state(&mut self, slot: usize, next: TaskState) {
        if let Some((_, state)) = self.instance_states.get_mut(slot) {
            debug_assert!(state.can_transition_to(next), "{state:?} -> {next:?}");
            *state = next;
        }
    }
}

fn check_balancer(balancer: &dyn LoadBalancer, world_size: usize) -> Result<(), ConfigError> {
    if balancer.world_size() != world_size {
        return Err(ConfigError::BalancerMismatch {
            balancer: balancer.world_size(),
            configured: world_size,
        });
    }
    Ok(())
}
