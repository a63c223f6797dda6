//! One data-warehouse generation.

use crate::database::{PatchDatabase, VarKey};
use crate::location::DataLocationRecord;
use crate::reduction::ReductionTable;
use parking_lot::Mutex;
use std::collections::HashMap;
use tessera_core::GenerationId;

/// Everything stored for one timestep's worth of data.
///
/// Locally produced grid data and data fetched from other ranks live in
/// separate databases, so a foreign copy can never be mistaken for an
/// owned instance.
#[derive(Debug)]
pub struct Generation {
    id: GenerationId,
    pub(crate) grid: PatchDatabase,
    pub(crate) foreign: PatchDatabase,
    pub(crate) reductions: ReductionTable,
    pub(crate) locations: DataLocationRecord,
    /// Outstanding `replace` writes per key; such keys are not served.
    pub(crate) pending_modifications: Mutex<HashMap<VarKey, u32>>,
}

impl Generation {
    /// Create an empty generation.
    pub fn new(id: GenerationId) -> Self {
        Self {
            id,
            grid: PatchDatabase::new(),
            foreign: PatchDatabase::new(),
            reductions: ReductionTable::new(),
            locations: DataLocationRecord::new(),
            pending_modifications: Mutex::new(HashMap::new()),
        }
    }

    /// Generation id.
    pub fn id(&self) -> GenerationId {
        self.id
    }

    /// Locally owned grid data.
    pub fn grid(&self) -> &PatchDatabase {
        &self.grid
    }

    /// Copies of grid data fetched from other ranks.
    pub fn foreign(&self) -> &PatchDatabase {
        &self.foreign
    }

    /// Reduction values.
    pub fn reductions(&self) -> &ReductionTable {
        &self.reductions
    }

    /// Ownership records.
    pub fn locations(&self) -> &DataLocationRecord {
        &self.locations
    }

    /// Number of announced modifications of `key` not yet written.
    pub fn pending_modifications(&self, key: &VarKey) -> u32 {
        self.pending_modifications
            .lock()
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn modification_done(&self, key: &VarKey) {
        let mut pending = self.pending_modifications.lock();
        if let Some(n) = pending.get_mut(key) {
            *n = n.saturating_sub(1);
            if *n == 0 {
                pending.remove(key);
            }
        }
    }
}
