//! Variable payloads: grid arrays and reduction scalars.
//!
//! [`VariableInstance`] is the homogeneous storage type: a sum type over
//! the two variable kinds, matched on rather than dispatched through a
//! trait object.

use serde::{Deserialize, Serialize};
use std::ops::{Index, IndexMut};
use tessera_core::{Cell, Centering, Extents, ReductionOp};

/// Storage window of a grid variable covering `cells`.
///
/// Cell-centred variables store exactly `cells`; node-centred variables
/// store the surrounding nodes.
pub fn storage_window(cells: &Extents, centering: Centering) -> Extents {
    match centering {
        Centering::Cell => *cells,
        Centering::Node => cells.node_extents(),
    }
}

/// A dense array of `f64` values over a box of indices.
///
/// Values are stored x-fastest. The box may include ghost cells beyond
/// the owning patch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridVariable {
    extents: Extents,
    centering: Centering,
    data: Vec<f64>,
}

impl GridVariable {
    /// A zero-filled variable over `extents` (already in storage space).
    pub fn new(extents: Extents, centering: Centering) -> Self {
        Self::filled(extents, centering, 0.0)
    }

    /// A variable over `extents` with every value set to `value`.
    pub fn filled(extents: Extents, centering: Centering, value: f64) -> Self {
        Self {
            extents,
            centering,
            data: vec![value; extents.cell_count()],
        }
    }

    /// Build a variable by evaluating `f` at every index, x-fastest.
    pub fn from_fn(extents: Extents, centering: Centering, mut f: impl FnMut(Cell) -> f64) -> Self {
        let data = extents.iter().map(&mut f).collect();
        Self {
            extents,
            centering,
            data,
        }
    }

    /// Storage window.
    pub fn extents(&self) -> Extents {
        self.extents
    }

    /// Cell or node centering.
    pub fn centering(&self) -> Centering {
        self.centering
    }

    /// Number of stored values.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// `true` if no values are stored.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw values, x-fastest.
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Mutable raw values, x-fastest.
    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.data
    }

    /// Value at `cell`, or `None` outside the window.
    pub fn get(&self, cell: Cell) -> Option<f64> {
        self.extents.linear_index(cell).map(|i| self.data[i])
    }

    /// Mutable value at `cell`, or `None` outside the window.
    pub fn get_mut(&mut self, cell: Cell) -> Option<&mut f64> {
        let i = self.extents.linear_index(cell)?;
        Some(&mut self.data[i])
    }

    /// Set every value to `value`.
    pub fn fill(&mut self, value: f64) {
        self.data.fill(value);
    }

    /// Iterate `(index, value)` pairs, x-fastest.
    pub fn iter(&self) -> impl Iterator<Item = (Cell, f64)> + '_ {
        self.extents.iter().zip(self.data.iter().copied())
    }

    /// Copy of the values inside `window`, or `None` if the window is
    /// not fully covered.
    pub fn crop(&self, window: &Extents) -> Option<GridVariable> {
        if !self.extents.contains_extents(window) {
            return None;
        }
        if *window == self.extents {
            return Some(self.clone());
        }
        let data = window
            .iter()
            .filter_map(|c| self.extents.linear_index(c))
            .map(|i| self.data[i])
            .collect();
        Some(GridVariable {
            extents: *window,
            centering: self.centering,
            data,
        })
    }

    /// Bitwise equality of values, treating `NaN` payloads as equal.
    pub fn bits_eq(&self, other: &GridVariable) -> bool {
        self.extents == other.extents
            && self.centering == other.centering
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

impl Index<Cell> for GridVariable {
    type Output = f64;

    fn index(&self, cell: Cell) -> &f64 {
        match self.extents.linear_index(cell) {
            Some(i) => &self.data[i],
            None => panic!("cell {cell:?} outside grid variable window {}", self.extents),
        }
    }
}

impl IndexMut<Cell> for GridVariable {
    fn index_mut(&mut self, cell: Cell) -> &mut f64 {
        match self.extents.linear_index(cell) {
            Some(i) => &mut self.data[i],
            None => panic!("cell {cell:?} outside grid variable window {}", self.extents),
        }
    }
}

/// A single scalar combined across patches and ranks.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReductionVariable {
    /// Combining operator.
    pub op: ReductionOp,
    /// Current value.
    pub value: f64,
}

impl ReductionVariable {
    /// Create a reduction value.
    pub fn new(op: ReductionOp, value: f64) -> Self {
        Self { op, value }
    }

    /// Combine `other` into this value.
    pub fn combine(&mut self, other: f64) {
        self.value = self.op.combine(self.value, other);
    }
}

/// One stored variable of either kind.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum VariableInstance {
    /// Per-patch array.
    Grid(GridVariable),
    /// Global scalar.
    Reduction(ReductionVariable),
}

impl VariableInstance {
    /// Short name of the variant, for diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Grid(_) => "grid",
            Self::Reduction(_) => "reduction",
        }
    }
}

impl From<GridVariable> for VariableInstance {
    fn from(v: GridVariable) -> Self {
        Self::Grid(v)
    }
}

impl From<ReductionVariable> for VariableInstance {
    fn from(v: ReductionVariable) -> Self {
        Self::Reduction(v)
    }
}
