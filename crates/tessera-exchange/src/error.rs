//! Exchange error types.

use tessera_core::{CommError, Rank};
use tessera_warehouse::CodecError;

/// Errors from setting up or using the exchange layer.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ExchangeError {
    /// Invalid exchange configuration.
    #[error("invalid exchange configuration: {reason}")]
    InvalidConfig {
        /// What is wrong.
        reason: String,
    },
    /// The endpoint's rank does not match the warehouse it serves.
    #[error("endpoint for rank {endpoint} cannot serve warehouse of rank {warehouse}")]
    RankMismatch {
        /// Rank of the transport endpoint.
        endpoint: Rank,
        /// Rank of the warehouse.
        warehouse: Rank,
    },
    /// The worker thread could not be started.
    #[error("failed to spawn exchange worker: {reason}")]
    Spawn {
        /// OS error message.
        reason: String,
    },
    /// A wire frame could not be encoded or decoded.
    #[error("wire codec error: {reason}")]
    Wire {
        /// Codec message.
        reason: String,
    },
    /// A collective was asked for a label that is not a reduction.
    #[error("'{label}' is not a reduction variable")]
    NotAReduction {
        /// Label name.
        label: String,
    },
    /// A payload could not be decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// A request failed after its retry budget.
    #[error(transparent)]
    Comm(#[from] CommError),
}
