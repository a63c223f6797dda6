//! Variable labels: the symbolic identity of a simulation variable.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Where grid-variable values live relative to the cells of a patch.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Centering {
    /// One value per cell.
    Cell,
    /// One value per cell corner; spans `high + 1` on every axis.
    Node,
}

/// Associative, commutative operator used to combine reduction values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReductionOp {
    /// Smallest value wins.
    Min,
    /// Largest value wins.
    Max,
    /// Values are added.
    Sum,
}

impl ReductionOp {
    /// Neutral element of the operator.
    pub fn identity(self) -> f64 {
        match self {
            Self::Min => f64::INFINITY,
            Self::Max => f64::NEG_INFINITY,
            Self::Sum => 0.0,
        }
    }

    /// Combine two values.
    pub fn combine(self, a: f64, b: f64) -> f64 {
        match self {
            Self::Min => a.min(b),
            Self::Max => a.max(b),
            Self::Sum => a + b,
        }
    }

    /// Fold an iterator of values, starting from the identity.
    pub fn fold(self, values: impl IntoIterator<Item = f64>) -> f64 {
        values
            .into_iter()
            .fold(self.identity(), |acc, v| self.combine(acc, v))
    }
}

impl fmt::Display for ReductionOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Min => "min",
            Self::Max => "max",
            Self::Sum => "sum",
        };
        f.write_str(s)
    }
}

/// Type descriptor of a variable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VarKind {
    /// A per-patch array with optional ghost cells.
    Grid(Centering),
    /// A single scalar combined across every patch and rank.
    Reduction(ReductionOp),
}

impl VarKind {
    /// `true` for reduction variables.
    pub fn is_reduction(&self) -> bool {
        matches!(self, Self::Reduction(_))
    }
}

impl fmt::Display for VarKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Grid(Centering::Cell) => f.write_str("cell grid"),
            Self::Grid(Centering::Node) => f.write_str("node grid"),
            Self::Reduction(op) => write!(f, "{op} reduction"),
        }
    }
}

#[derive(Debug)]
struct LabelInner {
    name: String,
    kind: VarKind,
}

/// Immutable identity of a variable.
///
/// Cloning is cheap (the name is shared). Equality, ordering and
/// hashing look at the name only, so two labels with the same name
/// denote the same variable; the [`VariableCatalog`](crate::VariableCatalog)
/// guarantees that a name is never registered with two different kinds.
#[derive(Clone)]
pub struct VarLabel(Arc<LabelInner>);

impl VarLabel {
    /// Create a label. Prefer [`VariableCatalog::register`](crate::VariableCatalog::register),
    /// which rejects conflicting redefinitions.
    pub fn new(name: impl Into<String>, kind: VarKind) -> Self {
        Self(Arc::new(LabelInner {
            name: name.into(),
            kind,
        }))
    }

    /// Shorthand for a cell-centred grid label.
    pub fn cell(name: impl Into<String>) -> Self {
        Self::new(name, VarKind::Grid(Centering::Cell))
    }

    /// Shorthand for a node-centred grid label.
    pub fn node(name: impl Into<String>) -> Self {
        Self::new(name, VarKind::Grid(Centering::Node))
    }

    /// Shorthand for a reduction label.
    pub fn reduction(name: impl Into<String>, op: ReductionOp) -> Self {
        Self::new(name, VarKind::Reduction(op))
    }

    /// The variable name.
    pub fn name(&self) -> &str {
        &self.0.name
    }

    /// The type descriptor.
    pub fn kind(&self) -> VarKind {
        self.0.kind
    }

    /// `true` for reduction variables.
    pub fn is_reduction(&self) -> bool {
        self.0.kind.is_reduction()
    }

    /// The reduction operator, if this is a reduction label.
    pub fn reduction_op(&self) -> Option<ReductionOp> {
        match self.0.kind {
            VarKind::Reduction(op) => Some(op),
            VarKind::Grid(_) => None,
        }
    }

    /// The centering, if this is a grid label.
    pub fn centering(&self) -> Option<Centering> {
        match self.0.kind {
            VarKind::Grid(c) => Some(c),
            VarKind::Reduction(_) => None,
        }
    }
}

impl PartialEq for VarLabel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0) || self.0.name == other.0.name
    }
}

impl Eq for VarLabel {}

impl PartialOrd for VarLabel {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarLabel {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.name.cmp(&other.0.name)
    }
}

impl Hash for VarLabel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.name.hash(state);
    }
}

impl fmt::Debug for VarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VarLabel({:?}, {})", self.0.name, self.0.kind)
    }
}

impl fmt::Display for VarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.name)
    }
}
