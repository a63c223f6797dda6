//! Reusable task bodies.
//!
//! Every body works on each of the task's default materials and assumes
//! cell-centred grid labels.
//!
//! - [`constant_fill`] / [`signature_fill`]: produce a label from nothing.
//! - [`copy`] / [`stencil`]: read one label, compute another.
//! - [`add_constant`]: a `modifies` body.
//! - [`contribute`] / [`sum_into`] / [`scale_by`]: reduction producers and consumers.
//! - [`fail_with`] / [`fail_on`] / [`counting`]: failure injection and call counting.

use crate::signature;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tessera_core::{MaterialIndex, PatchId, VarLabel};
use tessera_scheduler::{TaskBody, TaskContext, TaskError};
use tessera_warehouse::Which;

/// Face neighbours plus the cell itself, in a fixed order.
const STENCIL: [[i32; 3]; 7] = [
    [0, 0, 0],
    [-1, 0, 0],
    [1, 0, 0],
    [0, -1, 0],
    [0, 1, 0],
    [0, 0, -1],
    [0, 0, 1],
];

fn materials(ctx: &TaskContext<'_>) -> Vec<MaterialIndex> {
    ctx.materials().to_vec()
}

/// Writes `value` to every cell of `label`.
pub fn constant_fill(label: &VarLabel, value: f64) -> TaskBody {
    let label = label.clone();
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let mut var = ctx.allocate(&label, m)?;
            var.fill(value);
            ctx.put(var, &label, m)?;
        }
        Ok(())
    })
}

/// Writes [`signature`] of each cell to `label`.
pub fn signature_fill(label: &VarLabel) -> TaskBody {
    let label = label.clone();
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        let patch = ctx.patch().id;
        for m in materials(ctx) {
            let mut var = ctx.allocate(&label, m)?;
            for cell in ctx.extents().iter() {
                if let Some(slot) = var.get_mut(cell) {
                    *slot = signature(patch, cell);
                }
            }
            ctx.put(var, &label, m)?;
        }
        Ok(())
    })
}

/// Copies the patch's own cells of `from` into `to`.
pub fn copy(from: &VarLabel, which: Which, to: &VarLabel) -> TaskBody {
    let (from, to) = (from.clone(), to.clone());
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let input = ctx.get(which, &from, m)?;
            let mut out = ctx.allocate(&to, m)?;
            for cell in ctx.extents().iter() {
                let v = input
                    .get(cell)
                    .ok_or_else(|| TaskError::failed(format!("{from} has no value at {cell:?}")))?;
                if let Some(slot) = out.get_mut(cell) {
                    *slot = v;
                }
            }
            ctx.put(out, &to, m)?;
        }
        Ok(())
    })
}

/// `to[c]` = mean of `from` over `c` and its face neighbours present in
/// the halo.
pub fn stencil(from: &VarLabel, which: Which, to: &VarLabel) -> TaskBody {
    let (from, to) = (from.clone(), to.clone());
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let input = ctx.get(which, &from, m)?;
            let mut out = ctx.allocate(&to, m)?;
            for cell in ctx.extents().iter() {
                let mut sum = 0.0;
                let mut count = 0u32;
                for off in STENCIL {
                    let n = [cell[0] + off[0], cell[1] + off[1], cell[2] + off[2]];
                    if let Some(v) = input.get(n) {
                        sum += v;
                        count += 1;
                    }
                }
                if let Some(slot) = out.get_mut(cell) {
                    *slot = sum / f64::from(count.max(1));
                }
            }
            ctx.put(out, &to, m)?;
        }
        Ok(())
    })
}

/// Adds `delta` to every value of a `modifies` label.
pub fn add_constant(label: &VarLabel, delta: f64) -> TaskBody {
    let label = label.clone();
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let mut var = ctx.modify(&label, m)?;
            for v in var.data_mut() {
                *v += delta;
            }
            ctx.put(var, &label, m)?;
        }
        Ok(())
    })
}

/// Contributes `value` to `reduction` from every patch.
pub fn contribute(reduction: &VarLabel, value: f64) -> TaskBody {
    let reduction = reduction.clone();
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            ctx.put_reduction(&reduction, m, value)?;
        }
        Ok(())
    })
}

/// Contributes the sum of the patch's own cells of `from` to `reduction`.
pub fn sum_into(from: &VarLabel, which: Which, reduction: &VarLabel) -> TaskBody {
    let (from, reduction) = (from.clone(), reduction.clone());
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let input = ctx.get(which, &from, m)?;
            let sum: f64 = ctx.extents().iter().filter_map(|c| input.get(c)).sum();
            ctx.put_reduction(&reduction, m, sum)?;
        }
        Ok(())
    })
}

/// `to` = `from` × the new-generation value of `reduction`.
pub fn scale_by(from: &VarLabel, which: Which, reduction: &VarLabel, to: &VarLabel) -> TaskBody {
    let (from, reduction, to) = (from.clone(), reduction.clone(), to.clone());
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        for m in materials(ctx) {
            let factor = ctx.get_reduction(Which::New, &reduction, m)?;
            let input = ctx.get(which, &from, m)?;
            let mut out = ctx.allocate(&to, m)?;
            for cell in ctx.extents().iter() {
                if let (Some(v), Some(slot)) = (input.get(cell), out.get_mut(cell)) {
                    *slot = v * factor;
                }
            }
            ctx.put(out, &to, m)?;
        }
        Ok(())
    })
}

/// Always fails with `reason`.
pub fn fail_with(reason: &str) -> TaskBody {
    let reason = reason.to_string();
    Arc::new(move |_ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        Err(TaskError::failed(reason.clone()))
    })
}

/// Fails on `patch`, runs `otherwise` everywhere else.
pub fn fail_on(patch: PatchId, reason: &str, otherwise: TaskBody) -> TaskBody {
    let reason = reason.to_string();
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        if ctx.patch().id == patch {
            return Err(TaskError::failed(reason.clone()));
        }
        otherwise(ctx)
    })
}

/// Wraps `inner`, counting its invocations in `calls`.
pub fn counting(calls: Arc<AtomicUsize>, inner: TaskBody) -> TaskBody {
    Arc::new(move |ctx: &mut TaskContext<'_>| -> Result<(), TaskError> {
        calls.fetch_add(1, Ordering::SeqCst);
        inner(ctx)
    })
}
