//! Per-patch cost forecasting.
//!
//! [`CostForecaster`] keeps an exponential moving average of the measured
//! cost of each patch. Measurements for a timestep are accumulated with
//! [`add_contribution`](CostForecaster::add_contribution) and folded into
//! the averages by [`finalize_contributions`](CostForecaster::finalize_contributions).
//! Patches never measured are estimated from a linear [`CostModel`].

use crate::config::ConfigError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tessera_core::{Grid, PatchId};

/// Fallback cost estimate: `patch_cost + cell_cost * cells`, in seconds.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct CostModel {
    /// Fixed overhead per patch.
    pub patch_cost: f64,
    /// Cost per cell.
    pub cell_cost: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            patch_cost: 1e-4,
            cell_cost: 1e-7,
        }
    }
}

impl CostModel {
    /// Modelled cost of a patch with `cells` cells.
    pub fn estimate(&self, cells: usize) -> f64 {
        self.patch_cost + self.cell_cost * cells as f64
    }
}

/// Exponential moving average of per-patch task costs.
#[derive(Clone, Debug)]
pub struct CostForecaster {
    window: usize,
    alpha: f64,
    model: CostModel,
    estimates: IndexMap<PatchId, f64>,
    pending: IndexMap<PatchId, f64>,
}

impl CostForecaster {
    /// A forecaster averaging over roughly `window` timesteps.
    pub fn new(window: usize) -> Result<Self, ConfigError> {
        Self::with_model(window, CostModel::default())
    }

    /// A forecaster with a custom fallback model.
    pub fn with_model(window: usize, model: CostModel) -> Result<Self, ConfigError> {
        if window == 0 {
            return Err(ConfigError::InvalidForecastWindow { window });
        }
        Ok(Self {
            window,
            alpha: 2.0 / (window as f64 + 1.0),
            model,
            estimates: IndexMap::new(),
            pending: IndexMap::new(),
        })
    }

    /// Smoothing window in timesteps.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Weight of the newest measurement.
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Record `seconds` of work on `patch` in the current timestep.
    /// Several contributions to one patch are summed.
    pub fn add_contribution(&mut self, patch: PatchId, seconds: f64) {
        if !seconds.is_finite() || seconds < 0.0 {
            return;
        }
        *self.pending.entry(patch).or_insert(0.0) += seconds;
    }

    /// Fold the current timestep's measurements into the averages.
    /// Returns the number of patches updated.
    pub fn finalize_contributions(&mut self) -> usize {
        let updated = self.pending.len();
        let alpha = self.alpha;
        for (patch, observed) in self.pending.drain(..) {
            self.estimates
                .entry(patch)
                .and_modify(|e| *e = alpha * observed + (1.0 - alpha) * *e)
                .or_insert(observed);
        }
        updated
    }

    /// Drop measurements not yet finalized.
    pub fn discard_contributions(&mut self) {
        self.pending.clear();
    }

    /// Averaged cost of `patch`, if it was ever measured.
    pub fn estimate(&self, patch: PatchId) -> Option<f64> {
        self.estimates.get(&patch).copied()
    }

    /// Forecast cost of every patch of `grid`, in patch id order.
    pub fn weights(&self, grid: &Grid) -> IndexMap<PatchId, f64> {
        grid.patches()
            .map(|p| {
                let w = self
                    .estimate(p.id)
                    .unwrap_or_else(|| self.model.estimate(p.extents.cell_count()));
                (p.id, w)
            })
            .collect()
    }
}
