//! Test utilities for Tessera development.
//!
//! Provides grid and catalog builders, reusable task bodies
//! ([`fixtures`]) and a [`ClusterHarness`] that runs one scheduler per
//! simulated rank on its own thread.

#![forbid(unsafe_code)]
#![allow(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub mod fixtures;
pub mod harness;

pub use harness::ClusterHarness;

use std::sync::Arc;
use tessera_core::{Cell, Extents, Grid, PatchId, VarLabel, VariableCatalog};

/// `patches` cubes of `cells`³ cells laid out along x; patch `i` spans
/// `x ∈ [i·cells, (i+1)·cells)`.
pub fn line_grid(patches: u32, cells: i32) -> Arc<Grid> {
    let domain = Extents::new([0, 0, 0], [cells * patches as i32, cells, cells]);
    match Grid::uniform(domain, [patches, 1, 1]) {
        Ok(grid) => Arc::new(grid),
        Err(e) => panic!("line_grid({patches}, {cells}): {e}"),
    }
}

/// A catalog with every label in `labels` registered.
pub fn catalog_with(labels: &[&VarLabel]) -> Arc<VariableCatalog> {
    let mut catalog = VariableCatalog::new();
    for label in labels {
        if let Err(e) = catalog.insert(label) {
            panic!("catalog_with: {e}");
        }
    }
    Arc::new(catalog)
}

/// Distinct, exactly representable value for `cell` written by `patch`.
pub fn signature(patch: PatchId, cell: Cell) -> f64 {
    patch.0 as f64 * 1000.0 + (cell[0] * 100 + cell[1] * 10 + cell[2]) as f64
}
