//! Benchmark profiles for the Tessera scheduler.
//!
//! Provides a heat-diffusion workload used by the benchmarks and the
//! `diffusion_cluster` example:
//!
//! - [`DiffusionProfile::reference`]: 4×4×1 patches of 16³ cells
//! - [`DiffusionProfile::stress`]: 8×8×2 patches of 16³ cells
//! - [`init_heat`]: deterministic initial values from a seed

#![forbid(unsafe_code)]
#![deny(rustdoc::broken_intra_doc_links)]

use std::sync::Arc;
use tessera_core::{Cell, Extents, Grid, GridError, ReductionOp, VarLabel, VariableCatalog};
use tessera_scheduler::{
    ConfigError, Scheduler, SchedulerConfig, SchedulerFactory, SingleRank, Task, TaskContext,
    TaskError,
};
use tessera_warehouse::Which;

const NEIGHBOURS: [[i32; 3]; 6] = [
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

/// Grid, catalog and labels of the diffusion workload.
#[derive(Clone, Debug)]
pub struct DiffusionProfile {
    /// Patch layout.
    pub grid: Arc<Grid>,
    /// `heat` and `energy` registered.
    pub catalog: Arc<VariableCatalog>,
    /// Cell-centred temperature.
    pub heat: VarLabel,
    /// Sum of `heat` over the domain.
    pub energy: VarLabel,
    /// Diffusion coefficient × dt / dx². Stable below 1/6.
    pub coefficient: f64,
    /// Seed for [`init_heat`].
    pub seed: u64,
}

impl DiffusionProfile {
    /// `divisions` patches of `cells`³ cells each.
    pub fn new(divisions: [u32; 3], cells: i32, seed: u64) -> Result<Self, GridError> {
        let hi = [
            cells * divisions[0] as i32,
            cells * divisions[1] as i32,
            cells * divisions[2] as i32,
        ];
        let grid = Grid::uniform(Extents::new([0, 0, 0], hi), divisions)?;
        let heat = VarLabel::cell("heat");
        let energy = VarLabel::reduction("energy", ReductionOp::Sum);
        let mut catalog = VariableCatalog::new();
        for label in [&heat, &energy] {
            // Fresh catalog; the two names differ.
            let _ = catalog.insert(label);
        }
        Ok(Self {
            grid: Arc::new(grid),
            catalog: Arc::new(catalog),
            heat,
            energy,
            coefficient: 0.1,
            seed,
        })
    }

    /// 16 patches, 65 536 cells.
    pub fn reference(seed: u64) -> Result<Self, GridError> {
        Self::new([4, 4, 1], 16, seed)
    }

    /// 128 patches, ~500K cells.
    pub fn stress(seed: u64) -> Result<Self, GridError> {
        Self::new([8, 8, 2], 16, seed)
    }

    /// Tasks of the first timestep: seed `heat`.
    pub fn init_tasks(&self) -> Vec<Task> {
        let heat = self.heat.clone();
        let seed = self.seed;
        let body = Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
            for m in ctx.materials().to_vec() {
                let mut var = ctx.allocate(&heat, m)?;
                for cell in ctx.extents().iter() {
                    var[cell] = init_heat(seed, cell);
                }
                ctx.put(var, &heat, m)?;
            }
            Ok(())
        });
        vec![Task::with_body("init_heat", body).computes(&self.heat)]
    }

    /// Tasks of every later timestep: one explicit diffusion step reading
    /// the old generation with a one-cell halo, then the energy sum.
    pub fn step_tasks(&self) -> Vec<Task> {
        let (heat, energy) = (self.heat.clone(), self.energy.clone());
        let k = self.coefficient;
        let diffuse = Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
            for m in ctx.materials().to_vec() {
                let old = ctx.get(Which::Old, &heat, m)?;
                let mut new = ctx.allocate(&heat, m)?;
                let mut total = 0.0;
                for cell in ctx.extents().iter() {
                    let centre = old[cell];
                    // Missing neighbours at the domain edge act as zero flux.
                    let flux: f64 = NEIGHBOURS
                        .iter()
                        .map(|o| {
                            let n = [cell[0] + o[0], cell[1] + o[1], cell[2] + o[2]];
                            old.get(n).unwrap_or(centre) - centre
                        })
                        .sum();
                    let v = centre + k * flux;
                    new[cell] = v;
                    total += v;
                }
                ctx.put(new, &heat, m)?;
                ctx.put_reduction(&energy, m, total)?;
            }
            Ok(())
        });
        vec![Task::with_body("diffuse", diffuse)
            .requires(&self.heat, Which::Old, 1)
            .computes(&self.heat)
            .computes(&self.energy)]
    }

    /// A single-rank scheduler over this profile with no tasks declared.
    pub fn single_rank(&self) -> Result<Scheduler, ConfigError> {
        SchedulerFactory::create(
            SchedulerConfig::default(),
            tessera_core::Rank(0),
            Arc::clone(&self.grid),
            Arc::clone(&self.catalog),
            Arc::new(SingleRank),
            None,
        )
    }
}

/// Replace the declared tasks of `scheduler` with `tasks`.
pub fn declare(scheduler: &mut Scheduler, tasks: Vec<Task>) {
    scheduler.clear_tasks();
    for t in tasks {
        scheduler.add_task(t);
    }
}

/// Deterministic initial temperature in `[0, 1)` for `cell`.
pub fn init_heat(seed: u64, cell: Cell) -> f64 {
    let mut h = seed.wrapping_mul(6364136223846793005);
    for c in cell {
        h = (h ^ c as u32 as u64).wrapping_mul(1442695040888963407);
    }
    (h >> 11) as f64 / (1u64 << 53) as f64
}
