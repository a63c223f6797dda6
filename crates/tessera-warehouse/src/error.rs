//! Warehouse error types.
//!
//! Every storage error names the label, patch, material and generation
//! involved so that a failing timestep can be diagnosed from the error
//! alone.

use tessera_core::{CommError, Extents, GenerationId, MaterialIndex, PatchId, Rank, VarKind};

/// Errors from [`DataWarehouse`](crate::DataWarehouse) operations.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WarehouseError {
    /// An instance already exists for the key in the new generation.
    #[error("allocation conflict: '{label}' patch {patch} material {material} already exists in generation {generation}")]
    AllocationConflict {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Material index.
        material: MaterialIndex,
        /// Generation written.
        generation: GenerationId,
    },
    /// A second `put` without `replace` for the same key.
    #[error("duplicate write: '{label}' patch {patch} material {material} already written in generation {generation}")]
    DuplicateWrite {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Material index.
        material: MaterialIndex,
        /// Generation written.
        generation: GenerationId,
    },
    /// No instance exists and no producer can supply one.
    #[error("variable not found: '{label}' patch {patch} material {material} in generation {generation}")]
    VariableNotFound {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Material index.
        material: MaterialIndex,
        /// Generation read.
        generation: GenerationId,
    },
    /// No reduction value exists for the key.
    #[error("reduction not found: '{label}' material {material} in generation {generation}")]
    ReductionNotFound {
        /// Label name.
        label: String,
        /// Material index.
        material: MaterialIndex,
        /// Generation read.
        generation: GenerationId,
    },
    /// Fewer ghost layers are available than requested.
    #[error("ghost cells unavailable: '{label}' patch {patch} material {material} generation {generation}: {missing} of the requested {requested}-wide halo cannot be filled")]
    GhostCellUnavailable {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Material index.
        material: MaterialIndex,
        /// Generation read.
        generation: GenerationId,
        /// Requested ghost width.
        requested: u32,
        /// Number of values that could not be filled.
        missing: usize,
    },
    /// The operation does not apply to the label's kind.
    #[error("'{label}' is a {kind} variable, cannot {operation}")]
    KindMismatch {
        /// Label name.
        label: String,
        /// Kind registered for the label.
        kind: VarKind,
        /// Operation attempted.
        operation: &'static str,
    },
    /// A stored grid variable does not cover its patch.
    #[error("'{label}' patch {patch}: variable window {found} does not cover {expected}")]
    ExtentsMismatch {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Window the patch requires.
        expected: Extents,
        /// Window supplied.
        found: Extents,
    },
    /// The patch is not part of the grid.
    #[error("unknown patch {patch}")]
    UnknownPatch {
        /// The missing id.
        patch: PatchId,
    },
    /// A key was assigned to two different ranks in one generation.
    #[error("ownership conflict: '{label}' patch {patch} already owned by rank {existing}, cannot assign to rank {requested}")]
    OwnershipConflict {
        /// Label name.
        label: String,
        /// Patch id.
        patch: PatchId,
        /// Rank already recorded.
        existing: Rank,
        /// Rank rejected.
        requested: Rank,
    },
    /// The generation is older than the retention window.
    #[error("generation {requested} is stale (oldest retained is {oldest})")]
    StaleGeneration {
        /// Generation asked for.
        requested: GenerationId,
        /// Oldest generation still held.
        oldest: GenerationId,
    },
    /// A reduction contribution arrived after the rank's partial was sealed.
    #[error("reduction '{label}' material {material} already sealed in generation {generation}")]
    ReductionSealed {
        /// Label name.
        label: String,
        /// Material index.
        material: MaterialIndex,
        /// Generation written.
        generation: GenerationId,
    },
    /// Invalid warehouse configuration.
    #[error("invalid warehouse configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },
    /// A remote fetch failed after its retry budget.
    #[error(transparent)]
    Communication(#[from] CommError),
    /// A payload could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors from payload serialization.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Encoding failed.
    #[error("failed to encode variable payload: {reason}")]
    Encode {
        /// Encoder message.
        reason: String,
    },
    /// Decoding failed.
    #[error("failed to decode variable payload: {reason}")]
    Decode {
        /// Decoder message.
        reason: String,
    },
    /// The payload decoded to the wrong variant.
    #[error("expected a {expected} payload, got {found}")]
    UnexpectedKind {
        /// Variant wanted.
        expected: &'static str,
        /// Variant received.
        found: &'static str,
    },
}

impl From<CodecError> for CommError {
    fn from(e: CodecError) -> Self {
        CommError::Codec {
            reason: e.to_string(),
        }
    }
}
