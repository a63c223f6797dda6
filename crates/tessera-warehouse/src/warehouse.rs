//! The on-demand data warehouse.
//!
//! A [`DataWarehouse`] holds an old and a new [`Generation`] for one
//! rank. Tasks write into the new generation and read from either.
//! Reads are resolved on demand: local data is returned directly, ghost
//! halos are composed from neighbouring patches, and data owned by other
//! ranks is pulled through the attached [`RemoteFetch`] transport.
//!
//! Locking is layered: the generation pair sits behind a `RwLock` held
//! only long enough to clone an `Arc<Generation>`; after that every
//! operation works on per-key slots inside the generation.

use crate::codec;
use crate::config::{GhostBoundary, WarehouseConfig};
use crate::database::VarKey;
use crate::error::WarehouseError;
use crate::fetch::{FetchRequest, FetchTarget, PendingFetch, RemoteFetch};
use crate::generation::Generation;
use crate::variable::{storage_window, GridVariable, ReductionVariable, VariableInstance};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tessera_core::{
    Centering, CommError, Extents, GenerationId, Grid, MaterialIndex, PatchId, Rank,
    ReductionOp, RemoteFailure, VarLabel,
};
use tracing::{debug, info, trace};

/// Which generation an operation reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Which {
    /// The previous timestep's completed data.
    Old,
    /// The timestep being computed.
    New,
}

impl fmt::Display for Which {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Old => f.write_str("old"),
            Self::New => f.write_str("new"),
        }
    }
}

/// A remote request as seen by the serving rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServeRequest {
    /// Variable.
    pub label: VarLabel,
    /// Patch (ignored for reductions).
    pub patch: PatchId,
    /// Material.
    pub material: MaterialIndex,
    /// Generation asked for.
    pub generation: GenerationId,
    /// Grid window or reduction.
    pub target: FetchTarget,
}

/// What the serving rank can do with a request right now.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Encoded payload.
    Ready(Vec<u8>),
    /// The data may still be produced; ask again later.
    NotYet,
    /// The request can never be satisfied.
    Failed(RemoteFailure),
}

/// A remote transfer started by [`DataWarehouse::prefetch`].
#[derive(Debug)]
pub struct InFlightFetch {
    generation: Arc<Generation>,
    key: VarKey,
    owner: Rank,
    primary: bool,
    pending: PendingFetch,
}

impl InFlightFetch {
    /// Key being fetched.
    pub fn key(&self) -> &VarKey {
        &self.key
    }

    /// Rank the data comes from.
    pub fn owner(&self) -> Rank {
        self.owner
    }

    /// `true` once the reply has arrived.
    pub fn is_ready(&self) -> bool {
        self.pending.is_ready()
    }
}

struct Generations {
    old: Arc<Generation>,
    new: Arc<Generation>,
    /// Most recent first.
    retired: VecDeque<Arc<Generation>>,
}

/// Per-rank generational variable store.
pub struct DataWarehouse {
    rank: Rank,
    grid: Arc<Grid>,
    config: WarehouseConfig,
    generations: RwLock<Generations>,
    remote: RwLock<Option<Arc<dyn RemoteFetch>>>,
}

impl fmt::Debug for DataWarehouse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let g = self.generations.read();
        f.debug_struct("DataWarehouse")
            .field("rank", &self.rank)
            .field("old", &g.old.id())
            .field("new", &g.new.id())
            .field("retired", &g.retired.len())
            .field("remote", &self.remote.read().is_some())
            .finish()
    }
}

impl DataWarehouse {
    /// Create a warehouse for `rank` with an empty old generation 0 and
    /// new generation 1.
    pub fn new(
        rank: Rank,
        grid: Arc<Grid>,
        config: WarehouseConfig,
    ) -> Result<Self, WarehouseError> {
        config.validate()?;
        Ok(Self {
            rank,
            grid,
            config,
            generations: RwLock::new(Generations {
                old: Arc::new(Generation::new(GenerationId(0))),
                new: Arc::new(Generation::new(GenerationId(1))),
                retired: VecDeque::new(),
            }),
            remote: RwLock::new(None),
        })
    }

    /// Rank this warehouse belongs to.
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// The patch decomposition.
    pub fn grid(&self) -> &Arc<Grid> {
        &self.grid
    }

    /// Active configuration.
    pub fn config(&self) -> &WarehouseConfig {
        &self.config
    }

    /// Snapshot of one generation.
    pub fn generation(&self, which: Which) -> Arc<Generation> {
        let g = self.generations.read();
        match which {
            Which::Old => Arc::clone(&g.old),
            Which::New => Arc::clone(&g.new),
        }
    }

    /// Id of one generation.
    pub fn generation_id(&self, which: Which) -> GenerationId {
        self.generation(which).id()
    }

    /// Attach the transport used for data owned by other ranks.
    pub fn attach_remote(&self, remote: Arc<dyn RemoteFetch>) {
        *self.remote.write() = Some(remote);
    }

    // ── Local storage ──────────────────────────────────────────────

    /// Reserve storage for a grid variable in the new generation.
    ///
    /// Returns a zero-filled variable covering the patch plus `ghost`
    /// cells; the caller fills it and hands it back through [`put`](Self::put).
    pub fn allocate(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        ghost: u32,
    ) -> Result<GridVariable, WarehouseError> {
        let centering = grid_centering(label, "allocate")?;
        let extents = self.patch_extents(patch)?;
        let gen = self.generation(Which::New);
        let key = VarKey::new(label, patch, material);
        gen.grid
            .reserve(&key)
            .map_err(|_| WarehouseError::AllocationConflict {
                label: label.name().to_string(),
                patch,
                material,
                generation: gen.id(),
            })?;
        trace!(rank = %self.rank, label = %label, patch = %patch, ghost, "allocated");
        Ok(GridVariable::new(
            storage_window(&extents.grow(ghost), centering),
            centering,
        ))
    }

    /// Store a computed variable in the new generation.
    ///
    /// Grid variables are cropped to the patch window. A second write to
    /// the same key fails with `DuplicateWrite` unless `replace` is set,
    /// and a key recorded as owned by another rank fails with
    /// `OwnershipConflict`. Reduction variables are combined with the
    /// rank's partial instead.
    pub fn put(
        &self,
        var: impl Into<VariableInstance>,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        replace: bool,
    ) -> Result<(), WarehouseError> {
        let gen = self.generation(Which::New);
        match var.into() {
            VariableInstance::Grid(var) => {
                let centering = grid_centering(label, "put a grid value")?;
                if var.centering() != centering {
                    return Err(kind_mismatch(label, "put a differently centred grid value"));
                }
                let extents = self.patch_extents(patch)?;
                let expected = storage_window(&extents, centering);
                let owned = var
                    .crop(&expected)
                    .ok_or_else(|| WarehouseError::ExtentsMismatch {
                        label: label.name().to_string(),
                        patch,
                        expected,
                        found: var.extents(),
                    })?;
                if let Some(existing) = gen.locations.find(label, patch) {
                    if existing != self.rank {
                        return Err(WarehouseError::OwnershipConflict {
                            label: label.name().to_string(),
                            patch,
                            existing,
                            requested: self.rank,
                        });
                    }
                }
                let key = VarKey::new(label, patch, material);
                gen.grid
                    .insert(&key, Arc::new(owned), replace)
                    .map_err(|_| WarehouseError::DuplicateWrite {
                        label: label.name().to_string(),
                        patch,
                        material,
                        generation: gen.id(),
                    })?;
                if replace {
                    gen.foreign.remove(&key);
                    gen.modification_done(&key);
                }
                trace!(rank = %self.rank, label = %label, patch = %patch, replace, "put grid");
            }
            VariableInstance::Reduction(r) => {
                let op = reduction_op(label, "put a reduction value")?;
                if r.op != op {
                    return Err(kind_mismatch(label, "combine with a different operator"));
                }
                let combined = gen
                    .reductions
                    .contribute(label, material, op, r.value)
                    .map_err(|_| WarehouseError::ReductionSealed {
                        label: label.name().to_string(),
                        material,
                        generation: gen.id(),
                    })?;
                trace!(
                    rank = %self.rank,
                    label = %label,
                    patch = %patch,
                    combined,
                    "put reduction"
                );
            }
        }
        Ok(())
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Read a grid variable with `ghost` layers of halo.
    ///
    /// With `ghost == 0` the stored instance is returned without copying.
    /// Otherwise a new variable is composed over the patch grown by
    /// `ghost`, taking each value from the owning patch first and then
    /// from the other patches in ascending id order. Data owned by other
    /// ranks is fetched and may block the calling thread.
    pub fn get(
        &self,
        which: Which,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        ghost: u32,
    ) -> Result<Arc<GridVariable>, WarehouseError> {
        let centering = grid_centering(label, "get a grid value")?;
        let extents = self.patch_extents(patch)?;
        let gen = self.generation(which);
        if ghost == 0 {
            let window = storage_window(&extents, centering);
            return self.source_data(&gen, label, patch, material, window);
        }

        let region = self.ghost_region(&gen, label, patch, material, extents, ghost)?;
        let window = storage_window(&region, centering);
        let mut out = GridVariable::new(window, centering);
        let mut filled = vec![false; window.cell_count()];
        let mut remaining = filled.len();

        for src in self.sources(patch, &region) {
            let Some(src_patch) = self.grid.patch(src) else {
                continue;
            };
            let Some(part) = storage_window(&src_patch.extents, centering).intersect(&window)
            else {
                continue;
            };
            let needed = part
                .iter()
                .filter_map(|c| window.linear_index(c))
                .any(|i| !filled[i]);
            if !needed {
                continue;
            }
            let data = match self.source_data(&gen, label, src, material, part) {
                Ok(data) => data,
                // A missing neighbour surfaces below as unfilled halo.
                Err(WarehouseError::VariableNotFound { .. }) if src != patch => continue,
                Err(e) => return Err(e),
            };
            let values = out.data_mut();
            for cell in part.iter() {
                let (Some(i), Some(v)) = (window.linear_index(cell), data.get(cell)) else {
                    continue;
                };
                if !filled[i] {
                    values[i] = v;
                    filled[i] = true;
                    remaining -= 1;
                }
            }
        }

        if remaining > 0 {
            return Err(WarehouseError::GhostCellUnavailable {
                label: label.name().to_string(),
                patch,
                material,
                generation: gen.id(),
                requested: ghost,
                missing: remaining,
            });
        }
        trace!(rank = %self.rank, label = %label, patch = %patch, ghost, %which, "composed halo");
        Ok(Arc::new(out))
    }

    /// Read a reduction value: the global value once known, otherwise
    /// this rank's partial.
    pub fn get_reduction(
        &self,
        which: Which,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<f64, WarehouseError> {
        reduction_op(label, "get a reduction value")?;
        let gen = self.generation(which);
        gen.reductions
            .value(label, material)
            .ok_or_else(|| WarehouseError::ReductionNotFound {
                label: label.name().to_string(),
                material,
                generation: gen.id(),
            })
    }

    /// Halo region in cell space, after applying the boundary policy.
    fn ghost_region(
        &self,
        gen: &Generation,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        extents: Extents,
        ghost: u32,
    ) -> Result<Extents, WarehouseError> {
        let wanted = extents.grow(ghost);
        let domain = self.grid.domain();
        if domain.contains_extents(&wanted) {
            return Ok(wanted);
        }
        let clamped = wanted.intersect(&domain).unwrap_or(extents);
        match self.config.ghost_boundary {
            GhostBoundary::ClampToDomain => Ok(clamped),
            GhostBoundary::Fatal => Err(WarehouseError::GhostCellUnavailable {
                label: label.name().to_string(),
                patch,
                material,
                generation: gen.id(),
                requested: ghost,
                missing: wanted.cell_count() - clamped.cell_count(),
            }),
        }
    }

    /// Patches that may supply values for `region`: the owner first,
    /// then every other intersecting patch by ascending id.
    fn sources(&self, patch: PatchId, region: &Extents) -> Vec<PatchId> {
        std::iter::once(patch)
            .chain(
                self.grid
                    .patches_intersecting(region)
                    .into_iter()
                    .filter(|p| *p != patch),
            )
            .collect()
    }

    /// A variable for `(label, src, material)` covering at least `part`.
    fn source_data(
        &self,
        gen: &Arc<Generation>,
        label: &VarLabel,
        src: PatchId,
        material: MaterialIndex,
        part: Extents,
    ) -> Result<Arc<GridVariable>, WarehouseError> {
        let key = VarKey::new(label, src, material);
        let owner = gen.locations.find(label, src).unwrap_or(self.rank);
        if owner == self.rank {
            return gen
                .grid
                .get(&key)
                .ok_or_else(|| not_found(&key, gen.id()));
        }
        if let Some(copy) = gen.foreign.get(&key) {
            if copy.extents().contains_extents(&part) {
                return Ok(copy);
            }
        }
        debug!(
            rank = %self.rank,
            owner = %owner,
            key = %key,
            generation = %gen.id(),
            "blocking remote fetch"
        );
        let pending = self.start_fetch(gen, &key, owner, part)?;
        self.store_foreign(gen, &key, owner, pending)
    }

    // ── Remote data ────────────────────────────────────────────────

    /// Start fetching every remotely owned piece that a later
    /// [`get`](Self::get) with the same arguments would need.
    ///
    /// Pieces already held as foreign copies are skipped. Nothing
    /// blocks; resolve the returned fetches with [`settle`](Self::settle).
    pub fn prefetch(
        &self,
        which: Which,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        ghost: u32,
    ) -> Result<Vec<InFlightFetch>, WarehouseError> {
        let centering = grid_centering(label, "prefetch a grid value")?;
        let extents = self.patch_extents(patch)?;
        let gen = self.generation(which);
        let region = if ghost == 0 {
            extents
        } else {
            self.ghost_region(&gen, label, patch, material, extents, ghost)?
        };
        let window = storage_window(&region, centering);

        let sources = if ghost == 0 {
            vec![patch]
        } else {
            self.sources(patch, &region)
        };
        let mut out = Vec::new();
        for src in sources {
            let owner = gen.locations.find(label, src).unwrap_or(self.rank);
            if owner == self.rank {
                continue;
            }
            let Some(src_patch) = self.grid.patch(src) else {
                continue;
            };
            let Some(part) = storage_window(&src_patch.extents, centering).intersect(&window)
            else {
                continue;
            };
            let key = VarKey::new(label, src, material);
            if gen
                .foreign
                .get(&key)
                .is_some_and(|copy| copy.extents().contains_extents(&part))
            {
                continue;
            }
            let pending = self.start_fetch(&gen, &key, owner, part)?;
            out.push(InFlightFetch {
                generation: Arc::clone(&gen),
                key,
                owner,
                primary: src == patch,
                pending,
            });
        }
        if !out.is_empty() {
            debug!(
                rank = %self.rank,
                label = %label,
                patch = %patch,
                count = out.len(),
                "prefetch issued"
            );
        }
        Ok(out)
    }

    /// Wait for a prefetched piece and store it as a foreign copy.
    ///
    /// A neighbour the owner does not have is not an error here; the
    /// subsequent `get` reports it as missing halo.
    pub fn settle(&self, fetch: InFlightFetch) -> Result<(), WarehouseError> {
        let InFlightFetch {
            generation,
            key,
            owner,
            primary,
            pending,
        } = fetch;
        match self.store_foreign(&generation, &key, owner, pending) {
            Ok(_) => Ok(()),
            Err(WarehouseError::VariableNotFound { .. }) if !primary => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn start_fetch(
        &self,
        gen: &Generation,
        key: &VarKey,
        owner: Rank,
        window: Extents,
    ) -> Result<PendingFetch, WarehouseError> {
        let remote = self
            .remote
            .read()
            .clone()
            .ok_or(CommError::Unreachable { rank: owner })?;
        Ok(remote.request(FetchRequest {
            owner,
            label: key.label.clone(),
            patch: key.patch,
            material: key.material,
            generation: gen.id(),
            target: FetchTarget::Grid {
                window: Some(window),
            },
        }))
    }

    fn store_foreign(
        &self,
        gen: &Generation,
        key: &VarKey,
        owner: Rank,
        pending: PendingFetch,
    ) -> Result<Arc<GridVariable>, WarehouseError> {
        let bytes = pending
            .wait()
            .map_err(|e| remote_error(e, key, gen.id()))?;
        let var = Arc::new(codec::decode_grid(&bytes)?);
        // A wider copy may already be present; keep whichever covers more.
        let keep = match gen.foreign.get(key) {
            Some(existing) if existing.extents().contains_extents(&var.extents()) => false,
            _ => true,
        };
        if keep {
            gen.foreign.overwrite(key, Arc::clone(&var));
        }
        trace!(
            rank = %self.rank,
            owner = %owner,
            key = %key,
            bytes = bytes.len(),
            "foreign copy stored"
        );
        Ok(var)
    }

    // ── Ownership ──────────────────────────────────────────────────

    /// Record `rank` as the producer of `(label, patch)` in the new
    /// generation.
    pub fn register_ownership(
        &self,
        label: &VarLabel,
        patch: PatchId,
        rank: Rank,
    ) -> Result<(), WarehouseError> {
        self.patch_extents(patch)?;
        let gen = self.generation(Which::New);
        gen.locations
            .register(label, patch, rank)
            .map_err(|existing| WarehouseError::OwnershipConflict {
                label: label.name().to_string(),
                patch,
                existing,
                requested: rank,
            })
    }

    /// Note the materials the owner of `(label, patch)` stores in the new
    /// generation. Ignored until the key is registered.
    pub fn register_materials(
        &self,
        label: &VarLabel,
        patch: PatchId,
        materials: &[MaterialIndex],
    ) {
        self.generation(Which::New)
            .locations
            .add_materials(label, patch, materials.iter().copied());
    }

    /// Producer of `(label, patch)` in the new generation. Unregistered
    /// keys are assumed local and report this warehouse's rank.
    pub fn find_owner(&self, label: &VarLabel, patch: PatchId) -> Rank {
        self.generation(Which::New)
            .locations
            .find(label, patch)
            .unwrap_or(self.rank)
    }

    /// Announce that `count` tasks will replace `(label, patch, material)`
    /// in the new generation. Other ranks are told the value is not ready
    /// until every announced replacement has been put.
    pub fn expect_modifications(
        &self,
        label: &VarLabel,
        patch: PatchId,
        material: MaterialIndex,
        count: u32,
    ) -> Result<(), WarehouseError> {
        grid_centering(label, "expect modifications")?;
        self.patch_extents(patch)?;
        if count == 0 {
            return Ok(());
        }
        let gen = self.generation(Which::New);
        *gen.pending_modifications
            .lock()
            .entry(VarKey::new(label, patch, material))
            .or_insert(0) += count;
        Ok(())
    }

    // ── Generation lifecycle ───────────────────────────────────────

    /// Copy `labels` unchanged from the old to the new generation,
    /// together with their ownership records. Returns the number of
    /// values copied.
    pub fn carry_forward(&self, labels: &[VarLabel]) -> Result<usize, WarehouseError> {
        let (old, new) = {
            let g = self.generations.read();
            (Arc::clone(&g.old), Arc::clone(&g.new))
        };
        let mut copied = 0;
        for label in labels {
            for (patch, owner) in old.locations.entries_for(label) {
                new.locations
                    .register(label, patch, owner.rank)
                    .map_err(|existing| WarehouseError::OwnershipConflict {
                        label: label.name().to_string(),
                        patch,
                        existing,
                        requested: owner.rank,
                    })?;
                new.locations.add_materials(label, patch, owner.materials);
            }
            match label.reduction_op() {
                None => {
                    for (key, var) in old.grid.entries_for(label) {
                        new.grid.insert(&key, var, false).map_err(|_| {
                            WarehouseError::AllocationConflict {
                                label: label.name().to_string(),
                                patch: key.patch,
                                material: key.material,
                                generation: new.id(),
                            }
                        })?;
                        copied += 1;
                    }
                }
                Some(op) => {
                    for (material, value) in old.reductions.values_for(label) {
                        new.reductions.set_global(label, material, op, value);
                        copied += 1;
                    }
                }
            }
        }
        debug!(
            rank = %self.rank,
            from = %old.id(),
            to = %new.id(),
            labels = labels.len(),
            copied,
            "carried forward"
        );
        Ok(copied)
    }

    /// Hand a carried-forward `(label, patch)` to rank `to` in the new
    /// generation and return the previous owner if ownership moved.
    ///
    /// Every rank calls this with the same arguments. The previous owner
    /// drops its carried copies, the new owner pulls each recorded
    /// material (plus `materials`) from the previous owner's old
    /// generation, and all ranks forget foreign copies of the key. Blocks
    /// on the new owner until every transfer has arrived.
    pub fn migrate_ownership(
        &self,
        label: &VarLabel,
        patch: PatchId,
        to: Rank,
        materials: &[MaterialIndex],
    ) -> Result<Option<Rank>, WarehouseError> {
        grid_centering(label, "migrate ownership")?;
        self.patch_extents(patch)?;
        let (old, new) = {
            let g = self.generations.read();
            (Arc::clone(&g.old), Arc::clone(&g.new))
        };
        let from = new.locations.reassign(label, patch, to);
        new.locations.add_materials(label, patch, materials.iter().copied());
        let from = match from {
            Some(from) if from != to => from,
            _ => return Ok(None),
        };
        let moved: Vec<MaterialIndex> = new
            .locations
            .owner(label, patch)
            .map(|o| o.materials.into_iter().collect())
            .unwrap_or_default();

        for &material in &moved {
            let key = VarKey::new(label, patch, material);
            new.foreign.remove(&key);
            if self.rank == from {
                new.grid.remove(&key);
            }
        }
        if self.rank == to {
            let remote = self
                .remote
                .read()
                .clone()
                .ok_or(CommError::Unreachable { rank: from })?;
            let pending: Vec<(VarKey, PendingFetch)> = moved
                .iter()
                .map(|&material| {
                    let request = FetchRequest {
                        owner: from,
                        label: label.clone(),
                        patch,
                        material,
                        generation: old.id(),
                        target: FetchTarget::Grid { window: None },
                    };
                    (VarKey::new(label, patch, material), remote.request(request))
                })
                .collect();
            for (key, fetch) in pending {
                let bytes = fetch.wait().map_err(|e| remote_error(e, &key, old.id()))?;
                let var = codec::decode_grid(&bytes)?;
                new.grid.insert(&key, Arc::new(var), false).map_err(|_| {
                    WarehouseError::AllocationConflict {
                        label: label.name().to_string(),
                        patch,
                        material: key.material,
                        generation: new.id(),
                    }
                })?;
            }
        }
        debug!(
            rank = %self.rank,
            label = %label,
            patch = %patch,
            from = %from,
            to = %to,
            materials = moved.len(),
            "ownership migrated"
        );
        Ok(Some(from))
    }

    /// Seal this rank's partial for a reduction and return it.
    pub fn seal_reduction(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<f64, WarehouseError> {
        let op = reduction_op(label, "seal")?;
        Ok(self
            .generation(Which::New)
            .reductions
            .seal(label, material, op))
    }

    /// Record the value combined across all ranks.
    pub fn set_global_reduction(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
        value: f64,
    ) -> Result<(), WarehouseError> {
        let op = reduction_op(label, "set a global value")?;
        self.generation(Which::New)
            .reductions
            .set_global(label, material, op, value);
        Ok(())
    }

    /// Rotate generations: new becomes old, old is retired, and a fresh
    /// new generation is started. Returns the new generation's id.
    pub fn advance(&self) -> GenerationId {
        let mut g = self.generations.write();
        let fresh = Arc::new(Generation::new(g.new.id().next()));
        let completed = std::mem::replace(&mut g.new, fresh);
        let retired = std::mem::replace(&mut g.old, completed);
        g.retired.push_front(retired);
        g.retired.truncate(self.config.retained_generations);
        info!(
            rank = %self.rank,
            old = %g.old.id(),
            new = %g.new.id(),
            retained = g.retired.len(),
            "generations advanced"
        );
        g.new.id()
    }

    /// Throw away everything written to the new generation.
    pub fn discard_new(&self) {
        let mut g = self.generations.write();
        let id = g.new.id();
        g.new = Arc::new(Generation::new(id));
        info!(rank = %self.rank, generation = %id, "new generation discarded");
    }

    // ── Serving other ranks ────────────────────────────────────────

    /// Answer a request from another rank.
    ///
    /// Data that may still be produced in the current new generation
    /// (or in a generation this rank has not reached yet) is reported as
    /// `NotYet` so the caller can park the request.
    pub fn serve(&self, request: &ServeRequest) -> ServeOutcome {
        let (gen, current) = {
            let g = self.generations.read();
            if request.generation > g.new.id() {
                return ServeOutcome::NotYet;
            }
            let found = [&g.new, &g.old]
                .into_iter()
                .chain(g.retired.iter())
                .find(|gen| gen.id() == request.generation)
                .cloned();
            match found {
                Some(gen) => (gen, g.new.id()),
                None => {
                    let oldest = g.retired.back().unwrap_or(&g.old).id();
                    return ServeOutcome::Failed(RemoteFailure::Stale {
                        requested: request.generation,
                        oldest,
                    });
                }
            }
        };
        let in_progress = gen.id() == current;

        let encoded = match request.target {
            FetchTarget::Grid { window } => {
                if request.label.centering().is_none() {
                    return rejected(format!("'{}' is not a grid variable", request.label));
                }
                let key = VarKey::new(&request.label, request.patch, request.material);
                if in_progress && gen.pending_modifications(&key) > 0 {
                    return ServeOutcome::NotYet;
                }
                let Some(var) = gen.grid.get(&key) else {
                    return if in_progress {
                        ServeOutcome::NotYet
                    } else {
                        ServeOutcome::Failed(RemoteFailure::NotFound)
                    };
                };
                match window {
                    None => codec::encode_grid(&var),
                    Some(w) => match var.crop(&w) {
                        Some(part) => codec::encode_grid(&part),
                        None => {
                            return ServeOutcome::Failed(RemoteFailure::WindowUnavailable {
                                window: w,
                            })
                        }
                    },
                }
            }
            FetchTarget::Reduction => {
                let Some(op) = request.label.reduction_op() else {
                    return rejected(format!("'{}' is not a reduction variable", request.label));
                };
                let value = match gen.reductions.sealed_partial(&request.label, request.material) {
                    Some(v) => v,
                    None if in_progress => return ServeOutcome::NotYet,
                    None => match gen.reductions.value(&request.label, request.material) {
                        Some(v) => v,
                        None => return ServeOutcome::Failed(RemoteFailure::NotFound),
                    },
                };
                codec::encode(&VariableInstance::Reduction(ReductionVariable::new(op, value)))
            }
        };
        match encoded {
            Ok(bytes) => ServeOutcome::Ready(bytes),
            Err(e) => rejected(e.to_string()),
        }
    }

    fn patch_extents(&self, patch: PatchId) -> Result<Extents, WarehouseError> {
        self.grid
            .patch(patch)
            .map(|p| p.extents)
            .ok_or(WarehouseError::UnknownPatch { patch })
    }
}

fn grid_centering(label: &VarLabel, operation: &'static str) -> Result<Centering, WarehouseError> {
    label
        .centering()
        .ok_or_else(|| kind_mismatch(label, operation))
}

fn reduction_op(label: &VarLabel, operation: &'static str) -> Result<ReductionOp, WarehouseError> {
    label
        .reduction_op()
        .ok_or_else(|| kind_mismatch(label, operation))
}

fn kind_mismatch(label: &VarLabel, operation: &'static str) -> WarehouseError {
    WarehouseError::KindMismatch {
        label: label.name().to_string(),
        kind: label.kind(),
        operation,
    }
}

fn not_found(key: &VarKey, generation: GenerationId) -> WarehouseError {
    WarehouseError::VariableNotFound {
        label: key.label.name().to_string(),
        patch: key.patch,
        material: key.material,
        generation,
    }
}

fn rejected(reason: String) -> ServeOutcome {
    ServeOutcome::Failed(RemoteFailure::Rejected { reason })
}

/// Translate an owner's answer into the storage error it stands for.
fn remote_error(err: CommError, key: &VarKey, generation: GenerationId) -> WarehouseError {
    match err {
        CommError::Remote {
            failure: RemoteFailure::NotFound,
            ..
        } => not_found(key, generation),
        CommError::Remote {
            failure: RemoteFailure::Stale { requested, oldest },
            ..
        } => WarehouseError::StaleGeneration { requested, oldest },
        other => WarehouseError::Communication(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::pending_fetch;
    use parking_lot::Mutex;

    fn line_grid() -> Arc<Grid> {
        // Three 2x2x2 patches along x.
        Arc::new(Grid::uniform(Extents::new([0, 0, 0], [6, 2, 2]), [3, 1, 1]).unwrap())
    }

    fn warehouse() -> DataWarehouse {
        DataWarehouse::new(Rank(0), line_grid(), WarehouseConfig::default()).unwrap()
    }

    fn fill_patch(dw: &DataWarehouse, label: &VarLabel, patch: u32, value: f64) {
        let mut var = dw.allocate(label, PatchId(patch), MaterialIndex(0), 0).unwrap();
        var.fill(value);
        dw.put(var, label, PatchId(patch), MaterialIndex(0), false)
            .unwrap();
    }

    #[test]
    fn put_then_get_returns_same_data() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        let mut var = dw.allocate(&x, PatchId(1), MaterialIndex(0), 0).unwrap();
        for (i, v) in var.data_mut().iter_mut().enumerate() {
            *v = i as f64 * 0.25;
        }
        let expected = var.clone();
        dw.put(var, &x, PatchId(1), MaterialIndex(0), false).unwrap();
        let got = dw.get(Which::New, &x, PatchId(1), MaterialIndex(0), 0).unwrap();
        assert!(got.bits_eq(&expected));
    }

    #[test]
    fn allocate_twice_conflicts() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        dw.allocate(&x, PatchId(0), MaterialIndex(0), 1).unwrap();
        let err = dw.allocate(&x, PatchId(0), MaterialIndex(0), 1).unwrap_err();
        assert!(matches!(err, WarehouseError::AllocationConflict { .. }));
    }

    #[test]
    fn allocate_includes_ghost_width() {
        let dw = warehouse();
        let var = dw
            .allocate(&VarLabel::cell("X"), PatchId(0), MaterialIndex(0), 2)
            .unwrap();
        assert_eq!(var.extents(), Extents::new([-2, -2, -2], [4, 4, 4]));
    }

    #[test]
    fn put_crops_ghost_layers() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        let mut var = dw.allocate(&x, PatchId(0), MaterialIndex(0), 1).unwrap();
        var.fill(3.0);
        dw.put(var, &x, PatchId(0), MaterialIndex(0), false).unwrap();
        let got = dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 0).unwrap();
        assert_eq!(got.extents(), Extents::new([0, 0, 0], [2, 2, 2]));
    }

    #[test]
    fn duplicate_put_rejected_without_replace() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        fill_patch(&dw, &x, 0, 1.0);
        let again = GridVariable::filled(Extents::new([0, 0, 0], [2, 2, 2]), Centering::Cell, 2.0);
        let err = dw
            .put(again.clone(), &x, PatchId(0), MaterialIndex(0), false)
            .unwrap_err();
        assert_eq!(
            err,
            WarehouseError::DuplicateWrite {
                label: "X".into(),
                patch: PatchId(0),
                material: MaterialIndex(0),
                generation: GenerationId(1),
            }
        );
        dw.put(again, &x, PatchId(0), MaterialIndex(0), true).unwrap();
        let got = dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 0).unwrap();
        assert_eq!(got.data()[0], 2.0);
    }

    #[test]
    fn undersized_put_rejected() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        let small = GridVariable::new(Extents::new([0, 0, 0], [1, 1, 1]), Centering::Cell);
        let err = dw.put(small, &x, PatchId(0), MaterialIndex(0), false).unwrap_err();
        assert!(matches!(err, WarehouseError::ExtentsMismatch { .. }));
    }

    #[test]
    fn missing_key_is_not_found() {
        let dw = warehouse();
        let err = dw
            .get(Which::New, &VarLabel::cell("X"), PatchId(0), MaterialIndex(0), 0)
            .unwrap_err();
        assert!(matches!(err, WarehouseError::VariableNotFound { .. }));
    }

    #[test]
    fn ghost_composed_from_neighbours() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        for p in 0..3 {
            fill_patch(&dw, &x, p, p as f64 + 1.0);
        }
        let got = dw.get(Which::New, &x, PatchId(1), MaterialIndex(0), 1).unwrap();
        // Clamped to the domain in y and z.
        assert_eq!(got.extents(), Extents::new([1, 0, 0], [5, 2, 2]));
        assert_eq!(got[[1, 0, 0]], 1.0);
        assert_eq!(got[[2, 1, 1]], 2.0);
        assert_eq!(got[[4, 1, 1]], 3.0);
    }

    #[test]
    fn missing_neighbour_is_fatal() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        fill_patch(&dw, &x, 1, 2.0);
        fill_patch(&dw, &x, 2, 3.0);
        let err = dw
            .get(Which::New, &x, PatchId(1), MaterialIndex(0), 1)
            .unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::GhostCellUnavailable {
                requested: 1,
                missing: 4,
                ..
            }
        ));
    }

    #[test]
    fn fatal_boundary_rejects_halo_outside_domain() {
        let dw = DataWarehouse::new(
            Rank(0),
            line_grid(),
            WarehouseConfig {
                ghost_boundary: GhostBoundary::Fatal,
                ..WarehouseConfig::default()
            },
        )
        .unwrap();
        let x = VarLabel::cell("X");
        for p in 0..3 {
            fill_patch(&dw, &x, p, 1.0);
        }
        let err = dw
            .get(Which::New, &x, PatchId(1), MaterialIndex(0), 1)
            .unwrap_err();
        assert!(matches!(err, WarehouseError::GhostCellUnavailable { .. }));
    }

    #[test]
    fn node_ghost_prefers_owner_on_shared_faces() {
        let dw = warehouse();
        let u = VarLabel::node("U");
        for p in 0..3 {
            fill_patch(&dw, &u, p, p as f64 * 10.0);
        }
        let got = dw.get(Which::New, &u, PatchId(1), MaterialIndex(0), 1).unwrap();
        // x = 2 and x = 4 are shared faces of patch 1: owner wins.
        assert_eq!(got[[2, 0, 0]], 10.0);
        assert_eq!(got[[4, 0, 0]], 10.0);
        assert_eq!(got[[1, 0, 0]], 0.0);
        assert_eq!(got[[5, 0, 0]], 20.0);
    }

    #[test]
    fn reductions_combine_and_seal() {
        let dw = warehouse();
        let total = VarLabel::reduction("total", ReductionOp::Sum);
        for (p, v) in [(0, 1.0), (1, 2.0), (2, 4.0)] {
            dw.put(
                ReductionVariable::new(ReductionOp::Sum, v),
                &total,
                PatchId(p),
                MaterialIndex(0),
                false,
            )
            .unwrap();
        }
        assert_eq!(dw.get_reduction(Which::New, &total, MaterialIndex(0)), Ok(7.0));
        assert_eq!(dw.seal_reduction(&total, MaterialIndex(0)), Ok(7.0));
        let err = dw
            .put(
                ReductionVariable::new(ReductionOp::Sum, 1.0),
                &total,
                PatchId(0),
                MaterialIndex(0),
                false,
            )
            .unwrap_err();
        assert!(matches!(err, WarehouseError::ReductionSealed { .. }));
        dw.set_global_reduction(&total, MaterialIndex(0), 20.0).unwrap();
        assert_eq!(dw.get_reduction(Which::New, &total, MaterialIndex(0)), Ok(20.0));
    }

    #[test]
    fn get_on_reduction_label_is_kind_mismatch() {
        let dw = warehouse();
        let err = dw
            .get(
                Which::New,
                &VarLabel::reduction("dt", ReductionOp::Min),
                PatchId(0),
                MaterialIndex(0),
                0,
            )
            .unwrap_err();
        assert!(matches!(err, WarehouseError::KindMismatch { .. }));
    }

    #[test]
    fn ownership_defaults_to_local_and_rejects_conflicts() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        assert_eq!(dw.find_owner(&x, PatchId(2)), Rank(0));
        dw.register_ownership(&x, PatchId(2), Rank(3)).unwrap();
        assert_eq!(dw.find_owner(&x, PatchId(2)), Rank(3));
        let err = dw.register_ownership(&x, PatchId(2), Rank(1)).unwrap_err();
        assert!(matches!(
            err,
            WarehouseError::OwnershipConflict {
                existing: Rank(3),
                ..
            }
        ));
    }

    #[test]
    fn advance_rotates_and_carry_forward_copies() {
        let dw = warehouse();
        let k = VarLabel::cell("K");
        fill_patch(&dw, &k, 0, 5.0);
        dw.register_ownership(&k, PatchId(1), Rank(1)).unwrap();
        assert_eq!(dw.advance(), GenerationId(2));
        assert_eq!(dw.generation_id(Which::Old), GenerationId(1));

        assert_eq!(dw.carry_forward(std::slice::from_ref(&k)), Ok(1));
        let got = dw.get(Which::New, &k, PatchId(0), MaterialIndex(0), 0).unwrap();
        assert!(got.data().iter().all(|v| *v == 5.0));
        assert_eq!(dw.find_owner(&k, PatchId(1)), Rank(1));
    }

    #[test]
    fn discard_new_keeps_generation_id() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        fill_patch(&dw, &x, 0, 1.0);
        dw.discard_new();
        assert_eq!(dw.generation_id(Which::New), GenerationId(1));
        assert!(dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 0).is_err());
    }

    // ── Serving ────────────────────────────────────────────────────

    fn request(label: &VarLabel, patch: u32, generation: u64, target: FetchTarget) -> ServeRequest {
        ServeRequest {
            label: label.clone(),
            patch: PatchId(patch),
            material: MaterialIndex(0),
            generation: GenerationId(generation),
            target,
        }
    }

    #[test]
    fn serve_parks_until_produced() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        let req = request(&x, 0, 1, FetchTarget::Grid { window: None });
        assert_eq!(dw.serve(&req), ServeOutcome::NotYet);
        fill_patch(&dw, &x, 0, 1.5);
        let ServeOutcome::Ready(bytes) = dw.serve(&req) else {
            panic!("expected ready");
        };
        let var = codec::decode_grid(&bytes).unwrap();
        assert_eq!(var.data()[0], 1.5);
    }

    #[test]
    fn serve_waits_for_announced_modifications() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        dw.expect_modifications(&x, PatchId(0), MaterialIndex(0), 1)
            .unwrap();
        fill_patch(&dw, &x, 0, 1.0);
        let req = request(&x, 0, 1, FetchTarget::Grid { window: None });
        assert_eq!(dw.serve(&req), ServeOutcome::NotYet);

        let current = dw.get(Which::New, &x, PatchId(0), MaterialIndex(0), 0).unwrap();
        let mut var = GridVariable::clone(&current);
        var.fill(2.0);
        dw.put(var, &x, PatchId(0), MaterialIndex(0), true).unwrap();
        let ServeOutcome::Ready(bytes) = dw.serve(&req) else {
            panic!("expected ready");
        };
        assert_eq!(codec::decode_grid(&bytes).unwrap().data()[0], 2.0);
    }

    #[test]
    fn serve_crops_to_window() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        fill_patch(&dw, &x, 0, 2.0);
        let w = Extents::new([1, 0, 0], [2, 2, 2]);
        let req = request(&x, 0, 1, FetchTarget::Grid { window: Some(w) });
        let ServeOutcome::Ready(bytes) = dw.serve(&req) else {
            panic!("expected ready");
        };
        assert_eq!(codec::decode_grid(&bytes).unwrap().extents(), w);
    }

    #[test]
    fn serve_completed_generation_reports_not_found() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        dw.advance();
        let req = request(&x, 0, 1, FetchTarget::Grid { window: None });
        assert_eq!(dw.serve(&req), ServeOutcome::Failed(RemoteFailure::NotFound));
    }

    #[test]
    fn serve_stale_generation() {
        let dw = DataWarehouse::new(
            Rank(0),
            line_grid(),
            WarehouseConfig {
                retained_generations: 1,
                ..WarehouseConfig::default()
            },
        )
        .unwrap();
        for _ in 0..4 {
            dw.advance();
        }
        // new = 5, old = 4, retired = [3]
        let req = request(&VarLabel::cell("X"), 0, 1, FetchTarget::Grid { window: None });
        assert_eq!(
            dw.serve(&req),
            ServeOutcome::Failed(RemoteFailure::Stale {
                requested: GenerationId(1),
                oldest: GenerationId(3),
            })
        );
    }

    #[test]
    fn serve_reduction_waits_for_seal() {
        let dw = warehouse();
        let dt = VarLabel::reduction("dt", ReductionOp::Min);
        let req = request(&dt, 0, 1, FetchTarget::Reduction);
        dw.put(
            ReductionVariable::new(ReductionOp::Min, 0.5),
            &dt,
            PatchId(0),
            MaterialIndex(0),
            false,
        )
        .unwrap();
        assert_eq!(dw.serve(&req), ServeOutcome::NotYet);
        dw.seal_reduction(&dt, MaterialIndex(0)).unwrap();
        let ServeOutcome::Ready(bytes) = dw.serve(&req) else {
            panic!("expected ready");
        };
        assert_eq!(codec::decode_reduction(&bytes).unwrap().value, 0.5);
    }

    // ── Remote reads ───────────────────────────────────────────────

    /// Serves requests synchronously from another warehouse.
    struct Loopback {
        peer: Arc<DataWarehouse>,
        seen: Mutex<Vec<FetchRequest>>,
    }

    impl RemoteFetch for Loopback {
        fn request(&self, request: FetchRequest) -> PendingFetch {
            self.seen.lock().push(request.clone());
            let (pending, completer) = pending_fetch();
            let outcome = self.peer.serve(&ServeRequest {
                label: request.label.clone(),
                patch: request.patch,
                material: request.material,
                generation: request.generation,
                target: request.target,
            });
            match outcome {
                ServeOutcome::Ready(bytes) => completer.complete(Ok(bytes)),
                ServeOutcome::Failed(failure) => completer.complete(Err(CommError::Remote {
                    owner: request.owner,
                    failure,
                })),
                ServeOutcome::NotYet => completer.complete(Err(CommError::Timeout {
                    label: request.label.name().to_string(),
                    patch: request.patch,
                    owner: request.owner,
                    attempts: 1,
                })),
            }
            pending
        }
    }

    #[test]
    fn remote_neighbour_fetched_through_transport() {
        let grid = line_grid();
        let x = VarLabel::cell("X");
        let owner = Arc::new(
            DataWarehouse::new(Rank(1), Arc::clone(&grid), WarehouseConfig::default()).unwrap(),
        );
        fill_patch(&owner, &x, 0, 9.0);

        let local = DataWarehouse::new(Rank(0), grid, WarehouseConfig::default()).unwrap();
        let transport = Arc::new(Loopback {
            peer: Arc::clone(&owner),
            seen: Mutex::new(Vec::new()),
        });
        local.attach_remote(transport.clone());
        local.register_ownership(&x, PatchId(0), Rank(1)).unwrap();
        fill_patch(&local, &x, 1, 1.0);
        fill_patch(&local, &x, 2, 1.0);

        let fetches = local
            .prefetch(Which::New, &x, PatchId(1), MaterialIndex(0), 1)
            .unwrap();
        assert_eq!(fetches.len(), 1);
        for f in fetches {
            local.settle(f).unwrap();
        }
        let got = local.get(Which::New, &x, PatchId(1), MaterialIndex(0), 1).unwrap();
        assert_eq!(got[[1, 0, 0]], 9.0);
        // Only the one-cell-wide slab was requested, once.
        let seen = transport.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(
            seen[0].target,
            FetchTarget::Grid {
                window: Some(Extents::new([1, 0, 0], [2, 2, 2]))
            }
        );
    }

    #[test]
    fn remote_without_transport_is_unreachable() {
        let dw = warehouse();
        let x = VarLabel::cell("X");
        dw.register_ownership(&x, PatchId(0), Rank(1)).unwrap();
        let err = dw
            .get(Which::New, &x, PatchId(0), MaterialIndex(0), 0)
            .unwrap_err();
        assert_eq!(
            err,
            WarehouseError::Communication(CommError::Unreachable { rank: Rank(1) })
        );
    }
}
