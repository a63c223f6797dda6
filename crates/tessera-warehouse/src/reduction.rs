//! Reduction-variable aggregation for one generation.
//!
//! Contributions are combined under a single table lock: combine is a
//! read-modify-write, so the lock covers the whole operation rather than
//! just the stored value.

use indexmap::IndexMap;
use parking_lot::Mutex;
use tessera_core::{MaterialIndex, ReductionOp, VarLabel};

#[derive(Clone, Copy, Debug)]
struct ReductionEntry {
    op: ReductionOp,
    partial: Option<f64>,
    contributions: usize,
    sealed: bool,
    global: Option<f64>,
}

impl ReductionEntry {
    fn new(op: ReductionOp) -> Self {
        Self {
            op,
            partial: None,
            contributions: 0,
            sealed: false,
            global: None,
        }
    }
}

/// Snapshot of one reduction's state.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ReductionState {
    /// This rank's combined contributions, if any.
    pub partial: Option<f64>,
    /// Number of local contributions.
    pub contributions: usize,
    /// `true` once every local producer has contributed.
    pub sealed: bool,
    /// Combined value across all ranks, once known.
    pub global: Option<f64>,
}

/// Contribution rejected because the partial is already sealed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sealed;

/// Reduction values keyed by `(label, material)`.
#[derive(Debug, Default)]
pub struct ReductionTable {
    entries: Mutex<IndexMap<(VarLabel, MaterialIndex), ReductionEntry>>,
}

impl ReductionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Combine `value` into this rank's partial.
    pub fn contribute(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
        op: ReductionOp,
        value: f64,
    ) -> Result<f64, Sealed> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((label.clone(), material))
            .or_insert_with(|| ReductionEntry::new(op));
        if entry.sealed {
            return Err(Sealed);
        }
        let combined = match entry.partial {
            Some(prev) => entry.op.combine(prev, value),
            None => value,
        };
        entry.partial = Some(combined);
        entry.contributions += 1;
        Ok(combined)
    }

    /// Seal this rank's partial and return it.
    ///
    /// A reduction with no local contributions seals to the operator's
    /// identity. Sealing twice returns the same value.
    pub fn seal(&self, label: &VarLabel, material: MaterialIndex, op: ReductionOp) -> f64 {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((label.clone(), material))
            .or_insert_with(|| ReductionEntry::new(op));
        entry.sealed = true;
        entry.partial.unwrap_or_else(|| entry.op.identity())
    }

    /// Record the value combined across all ranks. Implies sealed.
    pub fn set_global(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
        op: ReductionOp,
        value: f64,
    ) {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((label.clone(), material))
            .or_insert_with(|| ReductionEntry::new(op));
        entry.sealed = true;
        entry.global = Some(value);
    }

    /// The sealed partial, or `None` while local producers are pending.
    pub fn sealed_partial(&self, label: &VarLabel, material: MaterialIndex) -> Option<f64> {
        let entries = self.entries.lock();
        let entry = entries.get(&(label.clone(), material))?;
        if entry.sealed {
            Some(entry.partial.unwrap_or_else(|| entry.op.identity()))
        } else {
            None
        }
    }

    /// The global value if known, otherwise the local partial.
    pub fn value(&self, label: &VarLabel, material: MaterialIndex) -> Option<f64> {
        let entries = self.entries.lock();
        let entry = entries.get(&(label.clone(), material))?;
        entry.global.or(entry.partial)
    }

    /// Full state of one reduction.
    pub fn state(&self, label: &VarLabel, material: MaterialIndex) -> Option<ReductionState> {
        let entries = self.entries.lock();
        entries
            .get(&(label.clone(), material))
            .map(|e| ReductionState {
                partial: e.partial,
                contributions: e.contributions,
                sealed: e.sealed,
                global: e.global,
            })
    }

    /// `(material, value)` for every reduction of `label` that has a value.
    pub fn values_for(&self, label: &VarLabel) -> Vec<(MaterialIndex, f64)> {
        let entries = self.entries.lock();
        entries
            .iter()
            .filter(|((l, _), _)| l == label)
            .filter_map(|((_, m), e)| e.global.or(e.partial).map(|v| (*m, v)))
            .collect()
    }
}
