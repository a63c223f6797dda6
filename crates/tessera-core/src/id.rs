//! Strongly-typed identifiers for patches, materials, ranks and generations.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a patch within a [`Grid`](crate::Grid).
///
/// Patch ids are unique within a grid but need not be contiguous.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatchId(pub u32);

impl fmt::Display for PatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PatchId {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Identifies which material occupies a patch.
///
/// Variables are keyed by `(label, patch, material)`.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MaterialIndex(pub u32);

impl fmt::Display for MaterialIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for MaterialIndex {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// A process (MPI rank) taking part in a run.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Rank(pub u32);

impl Rank {
    /// Index of this rank into per-rank tables.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Rank {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for Rank {
    fn from(v: u32) -> Self {
        Self(v)
    }
}

/// Monotonically increasing timestep counter.
///
/// Incremented each time the scheduler completes a timestep and rotates
/// the warehouse generations.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct TimestepId(pub u64);

impl TimestepId {
    /// The timestep following this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for TimestepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for TimestepId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Identifies one data-warehouse generation.
///
/// The "new" generation of timestep `n` becomes the "old" generation
/// of timestep `n + 1` without changing its id.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct GenerationId(pub u64);

impl GenerationId {
    /// The generation created after this one.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for GenerationId {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

/// Correlates a remote request with its reply.
///
/// Tags are allocated per requesting rank and are reused on retries of
/// the same request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag(pub u64);

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tag {
    fn from(v: u64) -> Self {
        Self(v)
    }
}
