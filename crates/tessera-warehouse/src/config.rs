//! Warehouse configuration.

use crate::error::WarehouseError;
use serde::{Deserialize, Serialize};

/// What `get` does when a ghost halo extends past the physical domain.
///
/// Missing data *inside* the domain is always an error; this only
/// governs cells that no patch could ever own.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GhostBoundary {
    /// Trim the halo to the domain bounding box.
    #[default]
    ClampToDomain,
    /// Reject the request with `GhostCellUnavailable`.
    Fatal,
}

/// Configuration for a [`DataWarehouse`](crate::DataWarehouse).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarehouseConfig {
    /// Halo policy at the domain boundary.
    pub ghost_boundary: GhostBoundary,
    /// Number of retired generations kept (beyond old and new) so that
    /// slower ranks can still fetch from them.
    pub retained_generations: usize,
}

impl WarehouseConfig {
    /// Default number of retired generations kept.
    pub const DEFAULT_RETAINED_GENERATIONS: usize = 2;

    /// Upper bound on retained generations.
    pub const MAX_RETAINED_GENERATIONS: usize = 64;

    /// Check the configuration for consistency.
    pub fn validate(&self) -> Result<(), WarehouseError> {
        if self.retained_generations > Self::MAX_RETAINED_GENERATIONS {
            return Err(WarehouseError::InvalidConfig {
                reason: format!(
                    "retained_generations must be at most {}, got {}",
                    Self::MAX_RETAINED_GENERATIONS,
                    self.retained_generations
                ),
            });
        }
        Ok(())
    }
}

impl Default for WarehouseConfig {
    fn default() -> Self {
        Self {
            ghost_boundary: GhostBoundary::default(),
            retained_generations: Self::DEFAULT_RETAINED_GENERATIONS,
        }
    }
}
