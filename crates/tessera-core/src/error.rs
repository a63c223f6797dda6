//! Error types shared across the Tessera workspace.
//!
//! Organised by subsystem: label registration, grid construction and
//! cross-rank communication. Storage, graph and scheduling errors live
//! in the crates that raise them.

use crate::geometry::Extents;
use crate::id::{GenerationId, PatchId, Rank};
use crate::label::VarKind;
use serde::{Deserialize, Serialize};

/// Errors from [`VariableCatalog`](crate::VariableCatalog) registration and lookup.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CatalogError {
    /// Labels must have a non-empty name.
    #[error("variable label name must not be empty")]
    EmptyName,
    /// The name is already registered with a different kind.
    #[error("label '{name}' already registered as {existing}, cannot re-register as {requested}")]
    LabelConflict {
        /// The conflicting name.
        name: String,
        /// Kind already in the catalog.
        existing: VarKind,
        /// Kind of the rejected registration.
        requested: VarKind,
    },
    /// No label with this name has been registered.
    #[error("unknown label '{name}'")]
    UnknownLabel {
        /// The name that was looked up.
        name: String,
    },
}

/// Errors from [`Grid`](crate::Grid) construction.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum GridError {
    /// A grid needs at least one patch.
    #[error("grid has no patches")]
    Empty,
    /// A patch contains no cells.
    #[error("patch {patch} has empty extents")]
    EmptyPatch {
        /// The offending patch.
        patch: PatchId,
    },
    /// Two patches share an id.
    #[error("duplicate patch id {patch}")]
    DuplicatePatch {
        /// The repeated id.
        patch: PatchId,
    },
    /// Two patches share cells.
    #[error("patches {first} and {second} overlap")]
    Overlap {
        /// Lower id of the pair.
        first: PatchId,
        /// Higher id of the pair.
        second: PatchId,
    },
    /// A uniform split was asked for zero patches, or more patches than
    /// cells, along an axis.
    #[error("cannot split {cells} cells into {divisions} patches along axis {axis}")]
    InvalidDivision {
        /// Axis index (0 = x).
        axis: usize,
        /// Requested number of patches.
        divisions: u32,
        /// Cells available along the axis.
        cells: usize,
    },
}

/// Reason a serving rank could not answer a remote request.
///
/// Travels inside reply frames, so it carries only plain data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum RemoteFailure {
    /// The owner has no instance of the key in a completed generation.
    #[error("not found on owner")]
    NotFound,
    /// The requested generation has been retired past the retention window.
    #[error("generation {requested} no longer retained (oldest is {oldest})")]
    Stale {
        /// Generation asked for.
        requested: GenerationId,
        /// Oldest generation the owner still holds.
        oldest: GenerationId,
    },
    /// The owner holds the key but cannot cover the requested window.
    #[error("owner cannot cover window {window}")]
    WindowUnavailable {
        /// Window asked for.
        window: Extents,
    },
    /// Any other rejection (unknown label, kind mismatch, ...).
    #[error("{reason}")]
    Rejected {
        /// Description from the owner.
        reason: String,
    },
}

/// Errors from cross-rank communication.
///
/// Remote fetches are retried with backoff; these errors are what
/// remains once the retry budget is spent or the transport is gone.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CommError {
    /// No reply arrived within the retry budget.
    #[error("request for '{label}' on patch {patch} from rank {owner} timed out after {attempts} attempts")]
    Timeout {
        /// Label requested.
        label: String,
        /// Patch requested.
        patch: PatchId,
        /// Rank the request was addressed to.
        owner: Rank,
        /// Number of sends, including the first.
        attempts: u32,
    },
    /// The rank does not exist in this cluster.
    #[error("rank {rank} is not part of the cluster")]
    Unreachable {
        /// The addressed rank.
        rank: Rank,
    },
    /// The local exchange worker has exited.
    #[error("exchange worker disconnected")]
    Disconnected,
    /// The local exchange worker is draining and accepts no new requests.
    #[error("exchange is shutting down")]
    ShuttingDown,
    /// A frame or payload could not be decoded.
    #[error("codec error: {reason}")]
    Codec {
        /// Decoder message.
        reason: String,
    },
    /// The owner answered with a failure.
    #[error("rank {owner} rejected request: {failure}")]
    Remote {
        /// Rank that answered.
        owner: Rank,
        /// What went wrong on the owner.
        failure: RemoteFailure,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_label_and_owner() {
        let e = CommError::Timeout {
            label: "X".into(),
            patch: PatchId(0),
            owner: Rank(1),
            attempts: 4,
        };
        let msg = e.to_string();
        assert!(msg.contains("'X'"));
        assert!(msg.contains("rank 1"));
        assert!(msg.contains("4 attempts"));
    }

    #[test]
    fn remote_failure_wraps_into_comm_error() {
        let e = CommError::Remote {
            owner: Rank(2),
            failure: RemoteFailure::Stale {
                requested: GenerationId(1),
                oldest: GenerationId(3),
            },
        };
        assert!(e.to_string().contains("no longer retained"));
    }
}
