//! Registry of variable labels.

use crate::error::CatalogError;
use crate::label::{VarKind, VarLabel};
use std::collections::BTreeMap;

/// Maps variable names to their [`VarLabel`].
///
/// The catalog owns label identity: registering a name twice with the
/// same kind returns the existing label, registering it with a
/// different kind is rejected. Iteration is in name order.
///
/// Built during task-graph construction and then shared read-only
/// (typically behind an `Arc`) with the exchange worker, which resolves
/// labels named in incoming requests.
#[derive(Clone, Debug, Default)]
pub struct VariableCatalog {
    labels: BTreeMap<String, VarLabel>,
}

impl VariableCatalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with `kind`, returning its label.
    pub fn register(&mut self, name: &str, kind: VarKind) -> Result<VarLabel, CatalogError> {
        if name.is_empty() {
            return Err(CatalogError::EmptyName);
        }
        if let Some(existing) = self.labels.get(name) {
            if existing.kind() != kind {
                return Err(CatalogError::LabelConflict {
                    name: name.to_string(),
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            return Ok(existing.clone());
        }
        let label = VarLabel::new(name, kind);
        self.labels.insert(name.to_string(), label.clone());
        Ok(label)
    }

    /// Register an already constructed label.
    pub fn insert(&mut self, label: &VarLabel) -> Result<VarLabel, CatalogError> {
        self.register(label.name(), label.kind())
    }

    /// Look up a label by name.
    pub fn lookup(&self, name: &str) -> Result<VarLabel, CatalogError> {
        self.labels
            .get(name)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownLabel {
                name: name.to_string(),
            })
    }

    /// `true` if `label` is registered with the same kind.
    pub fn contains(&self, label: &VarLabel) -> bool {
        self.labels
            .get(label.name())
            .is_some_and(|l| l.kind() == label.kind())
    }

    /// Number of registered labels.
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    /// `true` if no labels are registered.
    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Iterate labels in name order.
    pub fn iter(&self) -> impl Iterator<Item = &VarLabel> + '_ {
        self.labels.values()
    }
}
