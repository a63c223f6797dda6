//! Per-patch, per-material storage of grid variables.
//!
//! Each `(label, patch, material)` key owns an independently locked slot.
//! The key map itself is only locked long enough to find or create a
//! slot, so readers and writers of unrelated keys never contend on the
//! data.

use crate::variable::GridVariable;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tessera_core::{MaterialIndex, PatchId, VarLabel};

/// Storage key of a grid variable.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarKey {
    /// Variable identity.
    pub label: VarLabel,
    /// Owning patch.
    pub patch: PatchId,
    /// Material.
    pub material: MaterialIndex,
}

impl VarKey {
    /// Create a key.
    pub fn new(label: &VarLabel, patch: PatchId, material: MaterialIndex) -> Self {
        Self {
            label: label.clone(),
            patch,
            material,
        }
    }
}

impl fmt::Display for VarKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "'{}' patch {} material {}",
            self.label, self.patch, self.material
        )
    }
}

#[derive(Debug, Default)]
enum SlotState {
    #[default]
    Empty,
    Allocated,
    Ready(Arc<GridVariable>),
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
}

impl Slot {
    fn ready(&self) -> Option<Arc<GridVariable>> {
        match &*self.state.lock() {
            SlotState::Ready(var) => Some(Arc::clone(var)),
            SlotState::Empty | SlotState::Allocated => None,
        }
    }

    fn is_empty(&self) -> bool {
        matches!(*self.state.lock(), SlotState::Empty)
    }
}

/// Why a slot rejected a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotConflict {
    /// The slot was already allocated or written.
    Occupied,
    /// The slot already holds data and `replace` was not set.
    Written,
}

/// Slot storage for one generation.
#[derive(Debug, Default)]
pub struct PatchDatabase {
    slots: Mutex<IndexMap<VarKey, Arc<Slot>>>,
}

impl PatchDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &VarKey) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        Arc::clone(slots.entry(key.clone()).or_default())
    }

    fn existing(&self, key: &VarKey) -> Option<Arc<Slot>> {
        self.slots.lock().get(key).cloned()
    }

    /// Reserve the slot for a later write.
    pub fn reserve(&self, key: &VarKey) -> Result<(), SlotConflict> {
        let slot = self.slot(key);
        let mut state = slot.state.lock();
        match *state {
            SlotState::Empty => {
                *state = SlotState::Allocated;
                Ok(())
            }
            SlotState::Allocated | SlotState::Ready(_) => Err(SlotConflict::Occupied),
        }
    }

    /// Store `var` under `key`, returning the previous value if it was
    /// replaced.
    pub fn insert(
        &self,
        key: &VarKey,
        var: Arc<GridVariable>,
        replace: bool,
    ) -> Result<Option<Arc<GridVariable>>, SlotConflict> {
        let slot = self.slot(key);
        let mut state = slot.state.lock();
        match std::mem::take(&mut *state) {
            SlotState::Empty | SlotState::Allocated => {
                *state = SlotState::Ready(var);
                Ok(None)
            }
            SlotState::Ready(prev) if replace => {
                *state = SlotState::Ready(var);
                Ok(Some(prev))
            }
            ready @ SlotState::Ready(_) => {
                *state = ready;
                Err(SlotConflict::Written)
            }
        }
    }

    /// Store `var` under `key` whatever the slot held, returning the
    /// previous value.
    pub fn overwrite(&self, key: &VarKey, var: Arc<GridVariable>) -> Option<Arc<GridVariable>> {
        let slot = self.slot(key);
        let mut state = slot.state.lock();
        match std::mem::replace(&mut *state, SlotState::Ready(var)) {
            SlotState::Ready(prev) => Some(prev),
            SlotState::Empty | SlotState::Allocated => None,
        }
    }

    /// Drop the slot for `key`, returning its value if one was written.
    pub fn remove(&self, key: &VarKey) -> Option<Arc<GridVariable>> {
        let slot = self.slots.lock().shift_remove(key)?;
        slot.ready()
    }

    /// The written value for `key`, if any.
    pub fn get(&self, key: &VarKey) -> Option<Arc<GridVariable>> {
        self.existing(key)?.ready()
    }

    /// `true` if the key has been allocated or written.
    pub fn is_reserved(&self, key: &VarKey) -> bool {
        self.existing(key).is_some_and(|slot| !slot.is_empty())
    }

    /// Every written value for `label`, in insertion order.
    pub fn entries_for(&self, label: &VarLabel) -> Vec<(VarKey, Arc<GridVariable>)> {
        let slots: Vec<(VarKey, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .filter(|(k, _)| &k.label == label)
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();
        slots
            .into_iter()
            .filter_map(|(k, slot)| slot.ready().map(|var| (k, var)))
            .collect()
    }

    /// Number of written values.
    pub fn len(&self) -> usize {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        slots
            .iter()
            .filter(|s| s.ready().is_some())
            .count()
    }

    /// `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Centering, Extents};

    fn key(name: &str, patch: u32) -> VarKey {
        VarKey::new(&VarLabel::cell(name), PatchId(patch), MaterialIndex(0))
    }

    fn var(v: f64) -> Arc<GridVariable> {
        Arc::new(GridVariable::filled(
            Extents::new([0, 0, 0], [2, 2, 2]),
            Centering::Cell,
            v,
        ))
    }

    #[test]
    fn reserve_twice_conflicts() {
        let db = PatchDatabase::new();
        assert_eq!(db.reserve(&key("a", 0)), Ok(()));
        assert_eq!(db.reserve(&key("a", 0)), Err(SlotConflict::Occupied));
        assert!(db.is_reserved(&key("a", 0)));
        assert!(db.get(&key("a", 0)).is_none());
    }

    #[test]
    fn insert_then_get() {
        let db = PatchDatabase::new();
        db.insert(&key("a", 0), var(1.0), false).unwrap();
        assert_eq!(db.get(&key("a", 0)).unwrap().data()[0], 1.0);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn second_insert_requires_replace() {
        let db = PatchDatabase::new();
        db.insert(&key("a", 0), var(1.0), false).unwrap();
        assert_eq!(
            db.insert(&key("a", 0), var(2.0), false),
            Err(SlotConflict::Written)
        );
        // The rejected write leaves the original in place.
        assert_eq!(db.get(&key("a", 0)).unwrap().data()[0], 1.0);
        let prev = db.insert(&key("a", 0), var(3.0), true).unwrap();
        assert_eq!(prev.unwrap().data()[0], 1.0);
        assert_eq!(db.get(&key("a", 0)).unwrap().data()[0], 3.0);
    }

    #[test]
    fn overwrite_and_remove() {
        let db = PatchDatabase::new();
        db.reserve(&key("a", 0)).unwrap();
        assert!(db.overwrite(&key("a", 0), var(1.0)).is_none());
        assert_eq!(db.overwrite(&key("a", 0), var(2.0)).unwrap().data()[0], 1.0);
        assert_eq!(db.remove(&key("a", 0)).unwrap().data()[0], 2.0);
        assert!(db.get(&key("a", 0)).is_none());
        assert!(!db.is_reserved(&key("a", 0)));
        assert!(db.remove(&key("a", 0)).is_none());
    }

    #[test]
    fn entries_for_filters_by_label() {
        let db = PatchDatabase::new();
        db.insert(&key("a", 0), var(1.0), false).unwrap();
        db.insert(&key("a", 1), var(2.0), false).unwrap();
        db.insert(&key("b", 0), var(3.0), false).unwrap();
        db.reserve(&key("a", 2)).unwrap();
        let entries = db.entries_for(&VarLabel::cell("a"));
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].0.patch, PatchId(1));
    }
}
