//! Integer box geometry for patches, ghost regions and variable windows.
//!
//! All boxes are half-open: a cell `c` lies in `[low, high)` when
//! `low[d] <= c[d] < high[d]` for every axis `d`. Iteration and linear
//! indexing are x-fastest, then y, then z.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cell index in the global integer index space.
pub type Cell = [i32; 3];

/// A half-open axis-aligned box of cells.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Extents {
    /// Inclusive lower corner.
    pub low: Cell,
    /// Exclusive upper corner.
    pub high: Cell,
}

impl Extents {
    /// Create a box from its inclusive lower and exclusive upper corner.
    pub const fn new(low: Cell, high: Cell) -> Self {
        Self { low, high }
    }

    /// `true` if the box contains no cells.
    pub fn is_empty(&self) -> bool {
        (0..3).any(|d| self.high[d] <= self.low[d])
    }

    /// Number of cells along each axis (zero for an empty axis).
    pub fn dims(&self) -> [usize; 3] {
        let mut out = [0usize; 3];
        for (d, slot) in out.iter_mut().enumerate() {
            *slot = (self.high[d] - self.low[d]).max(0) as usize;
        }
        out
    }

    /// Total number of cells in the box.
    pub fn cell_count(&self) -> usize {
        let [x, y, z] = self.dims();
        x * y * z
    }

    /// The box widened by `width` cells on every face.
    pub fn grow(&self, width: u32) -> Self {
        let w = width as i32;
        Self {
            low: [self.low[0] - w, self.low[1] - w, self.low[2] - w],
            high: [self.high[0] + w, self.high[1] + w, self.high[2] + w],
        }
    }

    /// The box of nodes surrounding these cells (`high + 1` on every axis).
    pub fn node_extents(&self) -> Self {
        Self {
            low: self.low,
            high: [self.high[0] + 1, self.high[1] + 1, self.high[2] + 1],
        }
    }

    /// Overlap of two boxes, or `None` if they share no cell.
    pub fn intersect(&self, other: &Extents) -> Option<Extents> {
        let mut low = [0; 3];
        let mut high = [0; 3];
        for d in 0..3 {
            low[d] = self.low[d].max(other.low[d]);
            high[d] = self.high[d].min(other.high[d]);
        }
        let out = Extents { low, high };
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// `true` if the boxes share at least one cell.
    pub fn overlaps(&self, other: &Extents) -> bool {
        self.intersect(other).is_some()
    }

    /// `true` if the boxes are disjoint but adjacent across a face, edge
    /// or corner.
    pub fn touches(&self, other: &Extents) -> bool {
        !self.overlaps(other) && self.grow(1).overlaps(other)
    }

    /// `true` if `cell` lies inside the box.
    pub fn contains(&self, cell: Cell) -> bool {
        (0..3).all(|d| self.low[d] <= cell[d] && cell[d] < self.high[d])
    }

    /// `true` if every cell of `other` lies inside this box.
    ///
    /// An empty `other` is contained in every box.
    pub fn contains_extents(&self, other: &Extents) -> bool {
        other.is_empty()
            || (0..3).all(|d| self.low[d] <= other.low[d] && other.high[d] <= self.high[d])
    }

    /// Smallest box containing both boxes.
    pub fn union_bounds(&self, other: &Extents) -> Extents {
        let mut low = [0; 3];
        let mut high = [0; 3];
        for d in 0..3 {
            low[d] = self.low[d].min(other.low[d]);
            high[d] = self.high[d].max(other.high[d]);
        }
        Extents { low, high }
    }

    /// Position of `cell` in x-fastest order, or `None` if outside the box.
    pub fn linear_index(&self, cell: Cell) -> Option<usize> {
        if !self.contains(cell) {
            return None;
        }
        let [nx, ny, _] = self.dims();
        let x = (cell[0] - self.low[0]) as usize;
        let y = (cell[1] - self.low[1]) as usize;
        let z = (cell[2] - self.low[2]) as usize;
        Some(x + nx * (y + ny * z))
    }

    /// Iterate every cell in x-fastest order.
    pub fn iter(&self) -> CellIter {
        CellIter {
            extents: *self,
            next: if self.is_empty() { None } else { Some(self.low) },
        }
    }
}

impl fmt::Display for Extents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{},{},{})..[{},{},{})",
            self.low[0], self.low[1], self.low[2], self.high[0], self.high[1], self.high[2]
        )
    }
}

impl IntoIterator for &Extents {
    type Item = Cell;
    type IntoIter = CellIter;

    fn into_iter(self) -> CellIter {
        self.iter()
    }
}

/// Iterator over the cells of an [`Extents`], x-fastest.
#[derive(Clone, Debug)]
pub struct CellIter {
    extents: Extents,
    next: Option<Cell>,
}

impl Iterator for CellIter {
    type Item = Cell;

    fn next(&mut self) -> Option<Cell> {
        let current = self.next?;
        let mut step = current;
        let mut d = 0;
        self.next = loop {
            if d == 3 {
                break None;
            }
            step[d] += 1;
            if step[d] < self.extents.high[d] {
                break Some(step);
            }
            step[d] = self.extents.low[d];
            d += 1;
        };
        Some(current)
    }
}
