//! Dependency-driven task scheduling for Tessera.
//!
//! Tasks declare what they `computes`, `requires` and `modifies`. The
//! scheduler compiles those declarations into a task graph, orders it
//! deterministically, and runs one timestep per
//! [`execute()`](Scheduler::execute) call against this rank's
//! [`DataWarehouse`](tessera_warehouse::DataWarehouse):
//!
//! ```text
//!  Task declarations ──▶ graph::compile ──▶ CompiledGraph (global order)
//!         │                    ▲                      │
//!         │              LoadBalancer                 ▼
//!         │           (patch → rank)          Scheduler::execute
//!         │                    ▲               │            │
//!         │            CostForecaster ◀─ task timings       │
//!         ▼                                                 ▼
//!   TaskContext ◀────────── DataWarehouse ◀──── MpiExchangeHandler
//! ```
//!
//! [`SchedulerFactory`] builds a single-rank or distributed scheduler from
//! a [`SchedulerConfig`].

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod balance;
pub mod config;
pub mod context;
pub mod error;
pub mod factory;
pub mod forecast;
pub mod graph;
pub mod metrics;
pub mod scheduler;
pub mod task;

pub use balance::{ForecastBalancer, LoadBalancer, RoundRobin, SingleRank, StaticAssignment};
pub use config::{ConfigError, SchedulerConfig, SchedulerKind, MAX_GHOST_LIMIT};
pub use context::TaskContext;
pub use error::{GraphError, SchedulerError, TaskError};
pub use factory::SchedulerFactory;
pub use forecast::{CostForecaster, CostModel};
pub use graph::{CompiledGraph, Modification, Ownership, ReduceStep, ScheduledNode, TaskInstance};
pub use metrics::TimestepMetrics;
pub use scheduler::{Scheduler, TaskState};
pub use task::{Dependency, PatchSelection, Role, Task, TaskBody};
