//! Core types for the Tessera patch scheduler.
//!
//! This is the leaf crate with zero internal dependencies. It defines
//! the vocabulary shared by every other crate in the workspace:
//! strongly-typed ids, patch geometry, the [`Grid`] description,
//! variable labels and the [`VariableCatalog`], and the error types
//! that cross subsystem boundaries.

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![forbid(unsafe_code)]

pub mod catalog;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod id;
pub mod label;

pub use catalog::VariableCatalog;
pub use error::{CatalogError, CommError, GridError, RemoteFailure};
pub use geometry::{Cell, CellIter, Extents};
pub use grid::{Grid, Patch};
pub use id::{GenerationId, MaterialIndex, PatchId, Rank, Tag, TimestepId};
pub use label::{Centering, ReductionOp, VarKind, VarLabel};
