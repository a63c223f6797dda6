//! On-demand generational data warehouse for Tessera.
//!
//! Stores the variables tasks read and write, one [`DataWarehouse`] per
//! rank. Each warehouse holds two live generations (old and new) plus a
//! short ring of retired ones:
//!
//! ```text
//! DataWarehouse
//! ├── Generation (new)   ← tasks put here
//! │   ├── PatchDatabase (local)    per-key slots, one lock each
//! │   ├── PatchDatabase (foreign)  copies fetched from other ranks
//! │   ├── ReductionTable           (label, material) → partial/global
//! │   └── DataLocationRecord       (label, patch) → owning rank
//! ├── Generation (old)   ← previous timestep, read-only
//! └── retired ring       ← kept for slower ranks, then dropped
//! ```
//!
//! Data owned by another rank is requested through a [`RemoteFetch`]
//! implementation, which returns a [`PendingFetch`] future. The exchange
//! crate provides the implementation used in distributed runs.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod codec;
pub mod config;
pub mod database;
pub mod error;
pub mod fetch;
pub mod generation;
pub mod location;
pub mod reduction;
pub mod variable;
pub mod warehouse;

pub use config::{GhostBoundary, WarehouseConfig};
pub use database::{PatchDatabase, VarKey};
pub use error::{CodecError, WarehouseError};
pub use fetch::{
    pending_fetch, FetchCompleter, FetchRequest, FetchResult, FetchTarget, PendingFetch,
    RemoteFetch,
};
pub use generation::Generation;
pub use location::{DataLocationRecord, Owner};
pub use reduction::{ReductionState, ReductionTable};
pub use variable::{storage_window, GridVariable, ReductionVariable, VariableInstance};
pub use warehouse::{DataWarehouse, InFlightFetch, ServeOutcome, ServeRequest, Which};
