//! Task declarations.
//!
//! A [`Task`] names a body, the patches and materials it runs on, and
//! three dependency lists:
//!
//! - `requires`: variables read, from the old or the new generation,
//!   optionally with a ghost halo;
//! - `computes`: variables written to the new generation (exactly once
//!   each, or contributed to for reductions);
//! - `modifies`: new-generation variables read and then replaced.
//!
//! The scheduler runs one instance of the task per selected patch.

use crate::context::TaskContext;
use crate::error::TaskError;
use smallvec::{smallvec, SmallVec};
use std::fmt;
use std::sync::Arc;
use tessera_core::{MaterialIndex, PatchId, VarLabel};
use tessera_warehouse::Which;

/// Callback invoked once per task instance.
pub type TaskBody = Arc<dyn Fn(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + Sync>;

/// Patches a task runs on.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PatchSelection {
    /// Every patch of the grid.
    #[default]
    All,
    /// Only these patches.
    Only(Vec<PatchId>),
}

/// How a task uses a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// Read.
    Requires,
    /// Written once.
    Computes,
    /// Read and replaced.
    Modifies,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Requires => "requires",
            Self::Computes => "computes",
            Self::Modifies => "modifies",
        };
        f.write_str(s)
    }
}

// ── Dependency ───────────────────────────────────────────────────

/// One declared use of a variable.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dependency {
    /// The variable.
    pub label: VarLabel,
    /// Generation read or written.
    pub which: Which,
    /// Ghost halo width (reads only).
    pub ghost: u32,
    /// Materials, or `None` for the task's own materials.
    pub materials: Option<SmallVec<[MaterialIndex; 4]>>,
}

impl Dependency {
    /// A dependency on `label` in `which` with no halo.
    pub fn new(label: &VarLabel, which: Which) -> Self {
        Self {
            label: label.clone(),
            which,
            ghost: 0,
            materials: None,
        }
    }

    /// Set the ghost width.
    pub fn ghost(mut self, ghost: u32) -> Self {
        self.ghost = ghost;
        self
    }

    /// Restrict to a material subset.
    pub fn materials(mut self, materials: impl IntoIterator<Item = MaterialIndex>) -> Self {
        self.materials = Some(materials.into_iter().collect());
        self
    }

    /// The materials this dependency covers for a task running `task_materials`.
    pub fn materials_for<'a>(&'a self, task_materials: &'a [MaterialIndex]) -> &'a [MaterialIndex] {
        self.materials.as_deref().unwrap_or(task_materials)
    }
}

// ── Task ─────────────────────────────────────────────────────────

/// A declared unit of computation.
///
/// ```ignore
/// let task = Task::new("advect", body)
///     .requires(&u, Which::Old, 1)
///     .computes(&u);
/// ```
#[derive(Clone)]
pub struct Task {
    name: String,
    body: TaskBody,
    patches: PatchSelection,
    materials: SmallVec<[MaterialIndex; 4]>,
    requires: Vec<Dependency>,
    computes: Vec<Dependency>,
    modifies: Vec<Dependency>,
}

impl Task {
    /// A task running on every patch for material 0.
    pub fn new(
        name: impl Into<String>,
        body: impl Fn(&mut TaskContext<'_>) -> Result<(), TaskError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_body(name, Arc::new(body))
    }

    /// A task with an already shared body.
    pub fn with_body(name: impl Into<String>, body: TaskBody) -> Self {
        Self {
            name: name.into(),
            body,
            patches: PatchSelection::All,
            materials: smallvec![MaterialIndex(0)],
            requires: Vec::new(),
            computes: Vec::new(),
            modifies: Vec::new(),
        }
    }

    /// Run only on `patches`.
    pub fn on_patches(mut self, patches: impl IntoIterator<Item = PatchId>) -> Self {
        self.patches = PatchSelection::Only(patches.into_iter().collect());
        self
    }

    /// Default materials for every dependency.
    pub fn materials(mut self, materials: impl IntoIterator<Item = MaterialIndex>) -> Self {
        self.materials = materials.into_iter().collect();
        self
    }

    /// Read `label` from `which` with a halo of `ghost` cells.
    pub fn requires(self, label: &VarLabel, which: Which, ghost: u32) -> Self {
        self.with_dependency(Role::Requires, Dependency::new(label, which).ghost(ghost))
    }

    /// Write `label` to the new generation.
    pub fn computes(self, label: &VarLabel) -> Self {
        self.with_dependency(Role::Computes, Dependency::new(label, Which::New))
    }

    /// Read and replace `label` in the new generation.
    pub fn modifies(self, label: &VarLabel) -> Self {
        self.with_dependency(Role::Modifies, Dependency::new(label, Which::New))
    }

    /// Add a fully specified dependency.
    pub fn with_dependency(mut self, role: Role, dep: Dependency) -> Self {
        match role {
            Role::Requires => self.requires.push(dep),
            Role::Computes => self.computes.push(dep),
            Role::Modifies => self.modifies.push(dep),
        }
        self
    }

    /// Task name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The body.
    pub fn body(&self) -> &TaskBody {
        &self.body
    }

    /// Patch selection.
    pub fn patches(&self) -> &PatchSelection {
        &self.patches
    }

    /// Default materials.
    pub fn task_materials(&self) -> &[MaterialIndex] {
        &self.materials
    }

    /// Declared reads.
    pub fn requires_list(&self) -> &[Dependency] {
        &self.requires
    }

    /// Declared writes.
    pub fn computes_list(&self) -> &[Dependency] {
        &self.computes
    }

    /// Declared read-and-replace uses.
    pub fn modifies_list(&self) -> &[Dependency] {
        &self.modifies
    }

    /// Every dependency with its role, in declaration order per role.
    pub fn dependencies(&self) -> impl Iterator<Item = (Role, &Dependency)> + '_ {
        self.requires
            .iter()
            .map(|d| (Role::Requires, d))
            .chain(self.computes.iter().map(|d| (Role::Computes, d)))
            .chain(self.modifies.iter().map(|d| (Role::Modifies, d)))
    }

    /// The declaration of `role` on `label` in `which` covering `material`.
    pub fn find(
        &self,
        role: Role,
        label: &VarLabel,
        which: Which,
        material: MaterialIndex,
    ) -> Option<&Dependency> {
        let list = match role {
            Role::Requires => &self.requires,
            Role::Computes => &self.computes,
            Role::Modifies => &self.modifies,
        };
        list.iter().find(|d| {
            d.label == *label
                && d.which == which
                && d.materials_for(&self.materials).contains(&material)
        })
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("patches", &self.patches)
            .field("materials", &self.materials)
            .field("requires", &self.requires)
            .field("computes", &self.computes)
            .field("modifies", &self.modifies)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop(_: &mut TaskContext<'_>) -> Result<(), TaskError> {
        Ok(())
    }

    #[test]
    fn builder_records_dependencies() {
        let x = VarLabel::cell("X");
        let y = VarLabel::cell("Y");
        let t = Task::new("t", noop)
            .requires(&x, Which::Old, 1)
            .computes(&y)
            .modifies(&x);
        let deps: Vec<_> = t.dependencies().map(|(r, d)| (r, d.label.name().to_string())).collect();
        assert_eq!(
            deps,
            vec![
                (Role::Requires, "X".to_string()),
                (Role::Computes, "Y".to_string()),
                (Role::Modifies, "X".to_string()),
            ]
        );
        assert_eq!(t.requires_list()[0].ghost, 1);
        assert_eq!(t.patches(), &PatchSelection::All);
    }

    #[test]
    fn find_respects_material_subsets() {
        let x = VarLabel::cell("X");
        let t = Task::new("t", noop)
            .materials([MaterialIndex(0), MaterialIndex(1)])
            .with_dependency(
                Role::Requires,
                Dependency::new(&x, Which::New).materials([MaterialIndex(1)]),
            );
        assert!(t.find(Role::Requires, &x, Which::New, MaterialIndex(1)).is_some());
        assert!(t.find(Role::Requires, &x, Which::New, MaterialIndex(0)).is_none());
        assert!(t.find(Role::Requires, &x, Which::Old, MaterialIndex(1)).is_none());
    }

    #[test]
    fn default_material_is_zero() {
        let t = Task::new("t", noop).on_patches([PatchId(3)]);
        assert_eq!(t.task_materials(), &[MaterialIndex(0)]);
        assert_eq!(t.patches(), &PatchSelection::Only(vec![PatchId(3)]));
    }
}
