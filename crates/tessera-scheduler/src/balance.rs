//! Patch-to-rank assignment.
//!
//! The scheduler asks a [`LoadBalancer`] which rank runs the task
//! instances of each patch. Every rank of a run must use a balancer that
//! gives identical answers.

use crate::config::ConfigError;
use crate::forecast::CostForecaster;
use indexmap::IndexMap;
use std::fmt;
use tessera_core::{Grid, PatchId, Rank};

/// Assigns patches to ranks.
pub trait LoadBalancer: fmt::Debug + Send + Sync {
    /// Rank that owns `patch`.
    fn processor_assignment(&self, patch: PatchId) -> Rank;

    /// Number of ranks assigned to.
    fn world_size(&self) -> usize;

    /// Patches `rank` owns or needs halo data from when reading with
    /// `ghost` layers. Sorted ascending.
    fn neighborhood(&self, rank: Rank, grid: &Grid, ghost: u32) -> Vec<PatchId> {
        let mut out: Vec<PatchId> = Vec::new();
        for id in grid.patch_ids() {
            if self.processor_assignment(id) != rank {
                continue;
            }
            out.push(id);
            out.extend(grid.patches_within(id, ghost));
        }
        out.sort_unstable();
        out.dedup();
        out
    }
}

// ── SingleRank ───────────────────────────────────────────────────

/// Everything on rank 0.
#[derive(Clone, Copy, Debug, Default)]
pub struct SingleRank;

impl LoadBalancer for SingleRank {
    fn processor_assignment(&self, _patch: PatchId) -> Rank {
        Rank(0)
    }

    fn world_size(&self) -> usize {
        1
    }
}

// ── RoundRobin ───────────────────────────────────────────────────

/// Patch `p` on rank `p mod world_size`.
#[derive(Clone, Copy, Debug)]
pub struct RoundRobin {
    world_size: usize,
}

impl RoundRobin {
    /// Round-robin over `world_size` ranks.
    pub fn new(world_size: usize) -> Result<Self, ConfigError> {
        if world_size == 0 {
            return Err(ConfigError::InvalidWorldSize { world_size });
        }
        Ok(Self { world_size })
    }
}

impl LoadBalancer for RoundRobin {
    fn processor_assignment(&self, patch: PatchId) -> Rank {
        Rank(patch.0 % self.world_size as u32)
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

// ── StaticAssignment ─────────────────────────────────────────────

/// An explicit patch-to-rank table. Unlisted patches go to rank 0.
#[derive(Clone, Debug)]
pub struct StaticAssignment {
    world_size: usize,
    table: IndexMap<PatchId, Rank>,
}

impl StaticAssignment {
    /// Build from `(patch, rank)` pairs; every rank must be below
    /// `world_size`.
    pub fn new(
        world_size: usize,
        assignments: impl IntoIterator<Item = (PatchId, Rank)>,
    ) -> Result<Self, ConfigError> {
        if world_size == 0 {
            return Err(ConfigError::InvalidWorldSize { world_size });
        }
        let mut table = IndexMap::new();
        for (patch, rank) in assignments {
            if rank.index() >= world_size {
                return Err(ConfigError::RankOutOfRange { rank, world_size });
            }
            table.insert(patch, rank);
        }
        table.sort_keys();
        Ok(Self { world_size, table })
    }
}

impl LoadBalancer for StaticAssignment {
    fn processor_assignment(&self, patch: PatchId) -> Rank {
        self.table.get(&patch).copied().unwrap_or(Rank(0))
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

// ── ForecastBalancer ─────────────────────────────────────────────

/// Greedy assignment from forecast patch costs.
///
/// Patches are taken heaviest first (ties by ascending patch id) and each
/// goes to the currently least-loaded rank (ties by ascending rank).
#[derive(Clone, Debug)]
pub struct ForecastBalancer {
    world_size: usize,
    table: IndexMap<PatchId, Rank>,
    loads: Vec<f64>,
}

impl ForecastBalancer {
    /// Assign every patch of `grid` using `forecaster`'s weights.
    pub fn from_forecast(
        world_size: usize,
        grid: &Grid,
        forecaster: &CostForecaster,
    ) -> Result<Self, ConfigError> {
        if world_size == 0 {
            return Err(ConfigError::InvalidWorldSize { world_size });
        }
        let mut weights: Vec<(PatchId, f64)> = forecaster.weights(grid).into_iter().collect();
        weights.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));

        let mut loads = vec![0.0_f64; world_size];
        let mut table = IndexMap::with_capacity(weights.len());
        for (patch, weight) in weights {
            let mut best = 0;
            for r in 1..world_size {
                if loads[r] < loads[best] {
                    best = r;
                }
            }
            loads[best] += weight;
            table.insert(patch, Rank(best as u32));
        }
        table.sort_keys();
        Ok(Self {
            world_size,
            table,
            loads,
        })
    }

    /// Forecast total cost per rank.
    pub fn loads(&self) -> &[f64] {
        &self.loads
    }
}

impl LoadBalancer for ForecastBalancer {
    fn processor_assignment(&self, patch: PatchId) -> Rank {
        self.table.get(&patch).copied().unwrap_or(Rank(0))
    }

    fn world_size(&self) -> usize {
        self.world_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::Extents;

    fn line(n: u32) -> Grid {
        Grid::uniform(Extents::new([0, 0, 0], [2 * n as i32, 2, 2]), [n, 1, 1]).unwrap()
    }

    #[test]
    fn round_robin_cycles() {
        let b = RoundRobin::new(3).unwrap();
        let ranks: Vec<u32> = (0..6).map(|p| b.processor_assignment(PatchId(p)).0).collect();
        assert_eq!(ranks, vec![0, 1, 2, 0, 1, 2]);
        assert!(RoundRobin::new(0).is_err());
    }

    #[test]
    fn static_assignment_validates_ranks() {
        let err = StaticAssignment::new(2, [(PatchId(0), Rank(2))]).unwrap_err();
        assert_eq!(
            err,
            ConfigError::RankOutOfRange {
                rank: Rank(2),
                world_size: 2
            }
        );
        let b = StaticAssignment::new(2, [(PatchId(1), Rank(1))]).unwrap();
        assert_eq!(b.processor_assignment(PatchId(1)), Rank(1));
        assert_eq!(b.processor_assignment(PatchId(7)), Rank(0));
    }

    #[test]
    fn neighborhood_includes_halo_patches() {
        let grid = line(4);
        let b = RoundRobin::new(2).unwrap();
        // Rank 0 owns patches 0 and 2; with one ghost layer it also needs 1 and 3.
        assert_eq!(
            b.neighborhood(Rank(0), &grid, 1),
            vec![PatchId(0), PatchId(1), PatchId(2), PatchId(3)]
        );
        assert_eq!(b.neighborhood(Rank(0), &grid, 0), vec![PatchId(0), PatchId(2)]);
    }

    #[test]
    fn forecast_balancer_is_greedy_and_deterministic() {
        let grid = line(4);
        let mut f = CostForecaster::new(1).unwrap();
        for (p, c) in [(0, 4.0), (1, 3.0), (2, 2.0), (3, 1.0)] {
            f.add_contribution(PatchId(p), c);
        }
        f.finalize_contributions();
        let b = ForecastBalancer::from_forecast(2, &grid, &f).unwrap();
        // 4 → r0, 3 → r1, 2 → r1 (3 < 4), 1 → r0 (4 < 5).
        let ranks: Vec<u32> = (0..4).map(|p| b.processor_assignment(PatchId(p)).0).collect();
        assert_eq!(ranks, vec![0, 1, 1, 0]);
        assert_eq!(b.loads(), &[5.0, 5.0]);
    }

    #[test]
    fn forecast_ties_break_by_patch_then_rank() {
        let grid = line(3);
        let f = CostForecaster::with_model(
            2,
            crate::forecast::CostModel {
                patch_cost: 1.0,
                cell_cost: 0.0,
            },
        )
        .unwrap();
        let b = ForecastBalancer::from_forecast(2, &grid, &f).unwrap();
        let ranks: Vec<u32> = (0..3).map(|p| b.processor_assignment(PatchId(p)).0).collect();
        assert_eq!(ranks, vec![0, 1, 0]);
    }
}
