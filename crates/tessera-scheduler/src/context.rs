//! Execution context passed to task bodies.

use crate::error::TaskError;
use crate::task::{Role, Task};
use smallvec::SmallVec;
use std::sync::Arc;
use tessera_core::{Extents, MaterialIndex, Patch, Rank, TimestepId, VarLabel};
use tessera_warehouse::{DataWarehouse, GridVariable, ReductionVariable, WarehouseError, Which};

/// What a task instance sees while its body runs.
///
/// Every read and write goes through the warehouse and is checked
/// against the task's declarations: reading an undeclared input or
/// writing an undeclared output fails with a [`TaskError`]. Ghost widths
/// come from the declaration, not from the call.
pub struct TaskContext<'a> {
    warehouse: &'a DataWarehouse,
    task: &'a Task,
    patch: Patch,
    timestep: TimestepId,
    written: SmallVec<[(VarLabel, MaterialIndex); 4]>,
}

impl<'a> TaskContext<'a> {
    /// Context for running `task` on `patch`.
    ///
    /// Called by the scheduler; tests may build one directly.
    pub fn new(
        warehouse: &'a DataWarehouse,
        task: &'a Task,
        patch: Patch,
        timestep: TimestepId,
    ) -> Self {
        Self {
            warehouse,
            task,
            patch,
            timestep,
            written: SmallVec::new(),
        }
    }

    /// Name of the running task.
    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// The patch this instance runs on.
    pub fn patch(&self) -> &Patch {
        &self.patch
    }

    /// Cell extents of the patch.
    pub fn extents(&self) -> Extents {
        self.patch.extents
    }

    /// Timestep being computed.
    pub fn timestep(&self) -> TimestepId {
        self.timestep
    }

    /// Rank executing the task.
    pub fn rank(&self) -> Rank {
        self.warehouse.rank()
    }

    /// The task's default materials.
    pub fn materials(&self) -> &[MaterialIndex] {
        self.task.task_materials()
    }

    /// Read a declared grid input, with its declared ghost halo.
    ///
    /// A `modifies` declaration also permits reading the new generation
    /// without a halo.
    pub fn get(
        &self,
        which: Which,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<Arc<GridVariable>, TaskError> {
        let ghost = match self.task.find(Role::Requires, label, which, material) {
            Some(dep) => dep.ghost,
            None if self.task.find(Role::Modifies, label, which, material).is_some() => 0,
            None => return Err(self.undeclared_input(label, which, material)),
        };
        Ok(self
            .warehouse
            .get(which, label, self.patch.id, material, ghost)?)
    }

    /// Read a declared reduction input.
    pub fn get_reduction(
        &self,
        which: Which,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<f64, TaskError> {
        if self.task.find(Role::Requires, label, which, material).is_none() {
            return Err(self.undeclared_input(label, which, material));
        }
        Ok(self.warehouse.get_reduction(which, label, material)?)
    }

    /// Zeroed storage for a declared output over the patch.
    pub fn allocate(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<GridVariable, TaskError> {
        if self.task.find(Role::Computes, label, Which::New, material).is_none() {
            return Err(self.undeclared_output(label, material));
        }
        Ok(self.warehouse.allocate(label, self.patch.id, material, 0)?)
    }

    /// An owned copy of a `modifies` variable, to change and put back.
    pub fn modify(
        &self,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<GridVariable, TaskError> {
        if self.task.find(Role::Modifies, label, Which::New, material).is_none() {
            return Err(self.undeclared_output(label, material));
        }
        let current = self
            .warehouse
            .get(Which::New, label, self.patch.id, material, 0)?;
        Ok(GridVariable::clone(&current))
    }

    /// Store a grid output. Replaces the existing value for `modifies`.
    pub fn put(
        &mut self,
        var: GridVariable,
        label: &VarLabel,
        material: MaterialIndex,
    ) -> Result<(), TaskError> {
        let replace = if self.task.find(Role::Computes, label, Which::New, material).is_some() {
            false
        } else if self.task.find(Role::Modifies, label, Which::New, material).is_some() {
            true
        } else {
            return Err(self.undeclared_output(label, material));
        };
        self.warehouse
            .put(var, label, self.patch.id, material, replace)?;
        self.written.push((label.clone(), material));
        Ok(())
    }

    /// Contribute to a declared reduction output.
    pub fn put_reduction(
        &mut self,
        label: &VarLabel,
        material: MaterialIndex,
        value: f64,
    ) -> Result<(), TaskError> {
        if self.task.find(Role::Computes, label, Which::New, material).is_none() {
            return Err(self.undeclared_output(label, material));
        }
        let op = label
            .reduction_op()
            .ok_or_else(|| WarehouseError::KindMismatch {
                label: label.name().to_string(),
                kind: label.kind(),
                operation: "put a reduction value",
            })?;
        self.warehouse.put(
            ReductionVariable::new(op, value),
            label,
            self.patch.id,
            material,
            false,
        )?;
        self.written.push((label.clone(), material));
        Ok(())
    }

    /// `true` if `(label, material)` was put during this run.
    pub fn has_written(&self, label: &VarLabel, material: MaterialIndex) -> bool {
        self.written
            .iter()
            .any(|(l, m)| l == label && *m == material)
    }

    /// Check that every declared `computes` and `modifies` output was put.
    ///
    /// An unwritten `modifies` would leave its announced replacement
    /// outstanding, so other ranks could never be served the value.
    pub(crate) fn check_outputs(&self) -> Result<(), TaskError> {
        let outputs = self
            .task
            .computes_list()
            .iter()
            .chain(self.task.modifies_list());
        for dep in outputs {
            for &material in dep.materials_for(self.task.task_materials()) {
                if !self.has_written(&dep.label, material) {
                    return Err(TaskError::MissingOutput {
                        task: self.task.name().to_string(),
                        label: dep.label.name().to_string(),
                        patch: self.patch.id,
                        material,
                    });
                }
            }
        }
        Ok(())
    }

    fn undeclared_input(
        &self,
        label: &VarLabel,
        which: Which,
        material: MaterialIndex,
    ) -> TaskError {
        TaskError::UndeclaredInput {
            task: self.task.name().to_string(),
            label: label.name().to_string(),
            which,
            material,
        }
    }

    fn undeclared_output(&self, label: &VarLabel, material: MaterialIndex) -> TaskError {
        TaskError::UndeclaredOutput {
            task: self.task.name().to_string(),
            label: label.name().to_string(),
            material,
        }
    }
}
