//! Patch decomposition of the simulation domain.
//!
//! A [`Grid`] is an immutable set of non-overlapping [`Patch`]es. It is
//! built once by the driver and shared (usually behind an `Arc`) by the
//! warehouse and the scheduler, which only ever refer to patches by id.

use crate::error::GridError;
use crate::geometry::Extents;
use crate::id::PatchId;
use indexmap::IndexMap;
use smallvec::SmallVec;

/// A rectangular sub-domain of the grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Patch {
    /// Unique id within the grid.
    pub id: PatchId,
    /// Cells owned by this patch.
    pub extents: Extents,
}

impl Patch {
    /// Create a patch.
    pub fn new(id: impl Into<PatchId>, extents: Extents) -> Self {
        Self {
            id: id.into(),
            extents,
        }
    }
}

/// Neighbour list of one patch. 26 is the maximum for a uniform split.
type Neighbours = SmallVec<[PatchId; 8]>;

/// An immutable patch decomposition with precomputed adjacency.
#[derive(Clone, Debug)]
pub struct Grid {
    /// Patches sorted by ascending id, keyed for O(1) lookup.
    patches: IndexMap<PatchId, Patch>,
    neighbours: Vec<Neighbours>,
    domain: Extents,
}

impl Grid {
    /// Build a grid from an arbitrary list of patches.
    ///
    /// Patches are stored in ascending id order. Fails if the list is
    /// empty, if a patch is empty, if two patches share an id, or if two
    /// patches overlap.
    pub fn new(patches: Vec<Patch>) -> Result<Self, GridError> {
        if patches.is_empty() {
            return Err(GridError::Empty);
        }
        let mut sorted = patches;
        sorted.sort_by_key(|p| p.id);

        let mut map: IndexMap<PatchId, Patch> = IndexMap::with_capacity(sorted.len());
        for patch in sorted {
            if patch.extents.is_empty() {
                return Err(GridError::EmptyPatch { patch: patch.id });
            }
            if map.insert(patch.id, patch).is_some() {
                return Err(GridError::DuplicatePatch { patch: patch.id });
            }
        }

        let list: Vec<Patch> = map.values().copied().collect();
        let mut neighbours = vec![Neighbours::new(); list.len()];
        for (i, a) in list.iter().enumerate() {
            for (j, b) in list.iter().enumerate().skip(i + 1) {
                if a.extents.overlaps(&b.extents) {
                    return Err(GridError::Overlap {
                        first: a.id,
                        second: b.id,
                    });
                }
                if a.extents.touches(&b.extents) {
                    neighbours[i].push(b.id);
                    neighbours[j].push(a.id);
                }
            }
        }

        let domain = list
            .iter()
            .skip(1)
            .fold(list[0].extents, |acc, p| acc.union_bounds(&p.extents));

        Ok(Self {
            patches: map,
            neighbours,
            domain,
        })
    }

    /// Split `domain` into `divisions[d]` patches along each axis.
    ///
    /// Patch ids are assigned x-fastest starting at 0. Cells that do not
    /// divide evenly go to the last patch along each axis.
    pub fn uniform(domain: Extents, divisions: [u32; 3]) -> Result<Self, GridError> {
        let dims = domain.dims();
        for d in 0..3 {
            if divisions[d] == 0 || divisions[d] as usize > dims[d] {
                return Err(GridError::InvalidDivision {
                    axis: d,
                    divisions: divisions[d],
                    cells: dims[d],
                });
            }
        }

        let bounds = |d: usize, k: u32| -> (i32, i32) {
            let step = dims[d] as i32 / divisions[d] as i32;
            let lo = domain.low[d] + step * k as i32;
            let hi = if k + 1 == divisions[d] {
                domain.high[d]
            } else {
                lo + step
            };
            (lo, hi)
        };

        let mut patches = Vec::with_capacity((divisions[0] * divisions[1] * divisions[2]) as usize);
        let mut next_id = 0u32;
        for k in 0..divisions[2] {
            for j in 0..divisions[1] {
                for i in 0..divisions[0] {
                    let (x0, x1) = bounds(0, i);
                    let (y0, y1) = bounds(1, j);
                    let (z0, z1) = bounds(2, k);
                    patches.push(Patch::new(
                        next_id,
                        Extents::new([x0, y0, z0], [x1, y1, z1]),
                    ));
                    next_id += 1;
                }
            }
        }
        Self::new(patches)
    }

    /// Bounding box of every patch.
    pub fn domain(&self) -> Extents {
        self.domain
    }

    /// Number of patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Always `false`: a grid has at least one patch.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Look up a patch by id.
    pub fn patch(&self, id: PatchId) -> Option<&Patch> {
        self.patches.get(&id)
    }

    /// `true` if the grid has a patch with this id.
    pub fn contains(&self, id: PatchId) -> bool {
        self.patches.contains_key(&id)
    }

    /// Iterate patches in ascending id order.
    pub fn patches(&self) -> impl Iterator<Item = &Patch> + '_ {
        self.patches.values()
    }

    /// Iterate patch ids in ascending order.
    pub fn patch_ids(&self) -> impl Iterator<Item = PatchId> + '_ {
        self.patches.keys().copied()
    }

    /// Patches touching `id`, ascending. Empty for an unknown id.
    pub fn neighbours(&self, id: PatchId) -> &[PatchId] {
        match self.patches.get_index_of(&id) {
            Some(i) => &self.neighbours[i],
            None => &[],
        }
    }

    /// Ids of every patch sharing at least one cell with `region`,
    /// ascending.
    pub fn patches_intersecting(&self, region: &Extents) -> Vec<PatchId> {
        self.patches
            .values()
            .filter(|p| p.extents.overlaps(region))
            .map(|p| p.id)
            .collect()
    }

    /// Patches whose cells lie within `ghost` cells of patch `id`,
    /// excluding `id` itself, ascending.
    pub fn patches_within(&self, id: PatchId, ghost: u32) -> Vec<PatchId> {
        match self.patch(id) {
            Some(p) if ghost > 0 => {
                let halo = p.extents.grow(ghost);
                self.patches_intersecting(&halo)
                    .into_iter()
                    .filter(|other| *other != id)
                    .collect()
            }
            _ => Vec::new(),
        }
    }
}
