//! Ownership records for data produced on other ranks.

use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use tessera_core::{MaterialIndex, PatchId, Rank, VarLabel};

/// The rank holding one `(label, patch)` and the materials it holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Owner {
    /// Owning rank.
    pub rank: Rank,
    /// Materials known to be stored by the owner.
    pub materials: BTreeSet<MaterialIndex>,
}

/// Maps `(label, patch)` to the rank that produces it in one generation.
///
/// Guarded by a single monitor: entries are written once per task
/// assignment and read only when a dependency is not satisfied locally.
#[derive(Debug, Default)]
pub struct DataLocationRecord {
    owners: Mutex<IndexMap<(VarLabel, PatchId), Owner>>,
}

impl DataLocationRecord {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `rank` as the owner of `(label, patch)`.
    ///
    /// Re-registering the same owner is a no-op. A different owner is
    /// rejected and the existing owner returned.
    pub fn register(&self, label: &VarLabel, patch: PatchId, rank: Rank) -> Result<(), Rank> {
        let mut owners = self.owners.lock();
        match owners.get(&(label.clone(), patch)) {
            Some(existing) if existing.rank != rank => Err(existing.rank),
            Some(_) => Ok(()),
            None => {
                owners.insert(
                    (label.clone(), patch),
                    Owner {
                        rank,
                        materials: BTreeSet::new(),
                    },
                );
                Ok(())
            }
        }
    }

    /// Add `materials` to a registered entry. Unregistered keys are
    /// left alone.
    pub fn add_materials(
        &self,
        label: &VarLabel,
        patch: PatchId,
        materials: impl IntoIterator<Item = MaterialIndex>,
    ) {
        if let Some(owner) = self.owners.lock().get_mut(&(label.clone(), patch)) {
            owner.materials.extend(materials);
        }
    }

    /// Hand `(label, patch)` to `rank`, keeping its materials. Returns
    /// the previous owner, if any.
    pub fn reassign(&self, label: &VarLabel, patch: PatchId, rank: Rank) -> Option<Rank> {
        let mut owners = self.owners.lock();
        match owners.get_mut(&(label.clone(), patch)) {
            Some(owner) => Some(std::mem::replace(&mut owner.rank, rank)),
            None => {
                owners.insert(
                    (label.clone(), patch),
                    Owner {
                        rank,
                        materials: BTreeSet::new(),
                    },
                );
                None
            }
        }
    }

    /// The recorded owner, if any.
    pub fn find(&self, label: &VarLabel, patch: PatchId) -> Option<Rank> {
        self.owners
            .lock()
            .get(&(label.clone(), patch))
            .map(|o| o.rank)
    }

    /// The full entry for `(label, patch)`.
    pub fn owner(&self, label: &VarLabel, patch: PatchId) -> Option<Owner> {
        self.owners.lock().get(&(label.clone(), patch)).cloned()
    }

    /// Every `(patch, owner)` recorded for `label`.
    pub fn entries_for(&self, label: &VarLabel) -> Vec<(PatchId, Owner)> {
        self.owners
            .lock()
            .iter()
            .filter(|((l, _), _)| l == label)
            .map(|((_, p), o)| (*p, o.clone()))
            .collect()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.owners.lock().len()
    }

    /// `true` if nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_find() {
        let rec = DataLocationRecord::new();
        let x = VarLabel::cell("X");
        rec.register(&x, PatchId(0), Rank(1)).unwrap();
        assert_eq!(rec.find(&x, PatchId(0)), Some(Rank(1)));
        assert_eq!(rec.find(&x, PatchId(1)), None);
    }

    #[test]
    fn conflicting_owner_rejected() {
        let rec = DataLocationRecord::new();
        let x = VarLabel::cell("X");
        rec.register(&x, PatchId(0), Rank(1)).unwrap();
        assert_eq!(rec.register(&x, PatchId(0), Rank(1)), Ok(()));
        assert_eq!(rec.register(&x, PatchId(0), Rank(2)), Err(Rank(1)));
    }

    #[test]
    fn reassign_keeps_materials() {
        let rec = DataLocationRecord::new();
        let x = VarLabel::cell("X");
        rec.add_materials(&x, PatchId(0), [MaterialIndex(0)]);
        assert_eq!(rec.owner(&x, PatchId(0)), None);

        rec.register(&x, PatchId(0), Rank(0)).unwrap();
        rec.add_materials(&x, PatchId(0), [MaterialIndex(2), MaterialIndex(0)]);
        assert_eq!(rec.reassign(&x, PatchId(0), Rank(1)), Some(Rank(0)));
        let owner = rec.owner(&x, PatchId(0)).unwrap();
        assert_eq!(owner.rank, Rank(1));
        assert_eq!(
            owner.materials.into_iter().collect::<Vec<_>>(),
            vec![MaterialIndex(0), MaterialIndex(2)]
        );
        assert_eq!(rec.reassign(&x, PatchId(3), Rank(1)), None);
    }
}
