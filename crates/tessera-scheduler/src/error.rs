//! Scheduler error types.
//!
//! [`TaskError`] is what task bodies return. [`GraphError`] covers
//! declaration mistakes found while compiling the task graph, and
//! [`SchedulerError`] is what [`execute`](crate::Scheduler::execute)
//! reports when a timestep aborts.

use crate::config::ConfigError;
use tessera_core::{CommError, MaterialIndex, PatchId, Rank, TimestepId};
use tessera_exchange::ExchangeError;
use tessera_warehouse::{WarehouseError, Which};

// ── TaskError ────────────────────────────────────────────────────

/// Failure reported by, or on behalf of, a task body.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The body itself reported a fatal error.
    #[error("{reason}")]
    Failed {
        /// Description from the body.
        reason: String,
    },
    /// A warehouse operation failed.
    #[error(transparent)]
    Warehouse(#[from] WarehouseError),
    /// The body read a variable it did not declare.
    #[error("task '{task}' read undeclared input '{label}' ({which}, material {material})")]
    UndeclaredInput {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// Generation read.
        which: Which,
        /// Material read.
        material: MaterialIndex,
    },
    /// The body wrote a variable it did not declare.
    #[error("task '{task}' wrote undeclared output '{label}' (material {material})")]
    UndeclaredOutput {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// Material written.
        material: MaterialIndex,
    },
    /// The body returned without putting a declared output.
    #[error("task '{task}' did not write '{label}' on patch {patch}, material {material}")]
    MissingOutput {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// Patch the task ran on.
        patch: PatchId,
        /// Material left unwritten.
        material: MaterialIndex,
    },
}

impl TaskError {
    /// A body failure with the given description.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }
}

// ── GraphError ───────────────────────────────────────────────────

/// A configuration error in the declared task graph.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    /// Two tasks share a name.
    #[error("duplicate task name '{name}'")]
    DuplicateTaskName {
        /// The repeated name.
        name: String,
    },
    /// A task selects no patches.
    #[error("task '{task}' runs on no patches")]
    NoPatches {
        /// Task name.
        task: String,
    },
    /// A task names a patch the grid does not have.
    #[error("task '{task}' names unknown patch {patch}")]
    UnknownPatch {
        /// Task name.
        task: String,
        /// The patch.
        patch: PatchId,
    },
    /// A dependency uses a label missing from the catalog, or registered
    /// there with a different kind.
    #[error("task '{task}' uses unregistered label '{label}'")]
    UnknownLabel {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
    },
    /// A dependency is malformed.
    #[error("task '{task}' has an invalid dependency on '{label}': {reason}")]
    InvalidDependency {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// What is wrong.
        reason: String,
    },
    /// A task modifies a variable of the old generation.
    #[error("task '{task}' modifies '{label}' in the old generation")]
    ModifiesOldGeneration {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
    },
    /// A ghost width is not allowed for this dependency.
    #[error("task '{task}' requests {ghost} ghost cells of '{label}': {reason}")]
    InvalidGhost {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// Requested width.
        ghost: u32,
        /// Why it is rejected.
        reason: String,
    },
    /// Two task instances compute the same variable.
    #[error("'{label}' on patch {patch}, material {material} is computed by both '{first}' and '{second}'")]
    DuplicateProducer {
        /// Label name.
        label: String,
        /// Patch.
        patch: PatchId,
        /// Material.
        material: MaterialIndex,
        /// First producing task.
        first: String,
        /// Second producing task.
        second: String,
    },
    /// A carried-forward label is also computed.
    #[error("task '{task}' computes '{label}', which is carried forward")]
    ComputesCarriedLabel {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
    },
    /// A new-generation input has no producer.
    #[error("task '{task}' requires '{label}' on patch {patch}, material {material}, but nothing computes it")]
    MissingProducer {
        /// Task name.
        task: String,
        /// Label name.
        label: String,
        /// Patch with no producer.
        patch: PatchId,
        /// Material with no producer.
        material: MaterialIndex,
    },
    /// The load balancer assigned a patch to a rank outside the run.
    #[error("patch {patch} assigned to rank {rank}, but the run has {world_size} ranks")]
    UnknownRank {
        /// The patch.
        patch: PatchId,
        /// The assigned rank.
        rank: Rank,
        /// Number of ranks.
        world_size: usize,
    },
    /// The new-generation dependencies form a cycle.
    #[error("dependency cycle among tasks [{}] through labels [{}]", tasks.join(", "), labels.join(", "))]
    Cycle {
        /// Tasks on the cycle, sorted.
        tasks: Vec<String>,
        /// Labels carried by the cycle's edges, sorted.
        labels: Vec<String>,
    },
}

// ── SchedulerError ───────────────────────────────────────────────

/// Why a call into the [`Scheduler`](crate::Scheduler) failed.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    /// Invalid configuration.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// The task graph could not be compiled.
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// A task failed; the timestep was aborted.
    #[error("task '{task}' failed on patch {patch} in timestep {timestep}: {source}")]
    TaskFailed {
        /// Task name.
        task: String,
        /// Patch the instance ran on.
        patch: PatchId,
        /// Aborted timestep.
        timestep: TimestepId,
        /// The task's error.
        source: TaskError,
    },
    /// Remote data could not be obtained; the timestep was aborted.
    #[error("communication failure in timestep {timestep}: {source}")]
    Communication {
        /// Aborted timestep.
        timestep: TimestepId,
        /// The exhausted request.
        source: CommError,
    },
    /// A warehouse operation made by the scheduler itself failed.
    #[error("storage failure in timestep {timestep}: {source}")]
    Storage {
        /// Aborted timestep.
        timestep: TimestepId,
        /// The warehouse error.
        source: WarehouseError,
    },
    /// A cross-rank reduction failed.
    #[error("reduction of '{label}' failed in timestep {timestep}: {source}")]
    Reduction {
        /// Label name.
        label: String,
        /// Aborted timestep.
        timestep: TimestepId,
        /// The exchange error.
        source: ExchangeError,
    },
    /// An earlier timestep aborted and the scheduler was not reset.
    #[error("scheduler halted after timestep {timestep} aborted; call reset_after_failure")]
    Halted {
        /// The timestep that aborted.
        timestep: TimestepId,
    },
}

impl SchedulerError {
    /// `true` if the abort was caused by exhausted communication retries.
    pub fn is_communication(&self) -> bool {
        match self {
            Self::Communication { .. } => true,
            Self::TaskFailed {
                source: TaskError::Warehouse(WarehouseError::Communication(_)),
                ..
            } => true,
            Self::Reduction {
                source: ExchangeError::Comm(_),
                ..
            } => true,
            _ => false,
        }
    }

    /// Classify a warehouse error raised outside a task body.
    pub(crate) fn storage(timestep: TimestepId, err: WarehouseError) -> Self {
        match err {
            WarehouseError::Communication(source) => Self::Communication { timestep, source },
            source => Self::Storage { timestep, source },
        }
    }
}
