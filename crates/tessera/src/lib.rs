//! Tessera: an on-demand distributed data warehouse and task scheduler
//! for patch-based simulations.
//!
//! Drivers depend on this crate alone: it re-exports the warehouse, the
//! exchange and the scheduler, and gathers the everyday types in
//! [`prelude`].
//!
//! # Quick start
//!
//! ```rust
//! use std::sync::Arc;
//! use tessera::prelude::*;
//!
//! // Two patches of 4×4×4 cells side by side along x.
//! let domain = Extents::new([0, 0, 0], [8, 4, 4]);
//! let grid = Arc::new(Grid::uniform(domain, [2, 1, 1]).unwrap());
//!
//! let heat = VarLabel::cell("heat");
//! let mut catalog = VariableCatalog::new();
//! catalog.insert(&heat).unwrap();
//!
//! let mut scheduler = SchedulerFactory::create(
//!     SchedulerConfig::default(),
//!     Rank(0),
//!     grid,
//!     Arc::new(catalog),
//!     Arc::new(SingleRank),
//!     None,
//! )
//! .unwrap();
//!
//! let fill = heat.clone();
//! scheduler.add_task(
//!     Task::with_body(
//!         "init",
//!         Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
//!             for m in ctx.materials().to_vec() {
//!                 let mut var = ctx.allocate(&fill, m)?;
//!                 var.fill(1.0);
//!                 ctx.put(var, &fill, m)?;
//!             }
//!             Ok(())
//!         }),
//!     )
//!     .computes(&heat),
//! );
//!
//! let metrics = scheduler.execute().unwrap();
//! assert_eq!(metrics.timestep, TimestepId(1));
//! assert_eq!(metrics.tasks_run(), 2);
//! ```
//!
//! # Modules
//!
//! One module per sub-crate, for types the prelude leaves out:
//!
//! | Module | Sub-crate | Contents |
//! |--------|-----------|----------|
//! | [`types`] | `tessera-core` | IDs, grid geometry, variable labels, catalog |
//! | [`warehouse`] | `tessera-warehouse` | Generations, variables, ghost composition, serving |
//! | [`exchange`] | `tessera-exchange` | Transport, wire frames, the exchange worker |
//! | [`scheduler`] | `tessera-scheduler` | Tasks, graph compilation, balancing, execution |

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

/// Core types and IDs (`tessera-core`).
///
/// Contains [`types::Grid`], [`types::Extents`], [`types::VarLabel`] and
/// the [`types::VariableCatalog`].
pub use tessera_core as types;

/// Per-rank variable storage (`tessera-warehouse`).
///
/// The [`warehouse::DataWarehouse`] holds the old and new generations of
/// every variable this rank owns, plus copies fetched from other ranks.
pub use tessera_warehouse as warehouse;

/// Cross-rank messaging (`tessera-exchange`).
///
/// [`exchange::LocalCluster`] wires in-process ranks together;
/// [`exchange::MpiExchangeHandler`] serves and fetches on a worker thread.
pub use tessera_exchange as exchange;

/// Task declarations and timestep execution (`tessera-scheduler`).
pub use tessera_scheduler as scheduler;

/// Common imports for typical Tessera usage.
///
/// ```rust
/// use tessera::prelude::*;
/// ```
pub mod prelude {
    // Core types
    pub use tessera_core::{
        Centering, Extents, Grid, MaterialIndex, PatchId, Rank, ReductionOp, TimestepId, VarKind,
        VarLabel, VariableCatalog,
    };

    // Warehouse
    pub use tessera_warehouse::{
        DataWarehouse, GhostBoundary, GridVariable, WarehouseConfig, WarehouseError, Which,
    };

    // Exchange
    pub use tessera_exchange::{ExchangeConfig, LocalCluster};

    // Scheduler
    pub use tessera_scheduler::{
        ForecastBalancer, LoadBalancer, RoundRobin, Scheduler, SchedulerConfig, SchedulerError,
        SchedulerFactory, SchedulerKind, SingleRank, StaticAssignment, Task, TaskContext, TaskError,
        TimestepMetrics,
    };
}
