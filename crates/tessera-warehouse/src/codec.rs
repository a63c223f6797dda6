//! Serialization of variable payloads.
//!
//! The byte layout is bincode's and only has to agree between ranks of
//! the same build. Used for remote transfers and exposed for external
//! checkpoint layers.

use crate::error::CodecError;
use crate::variable::{GridVariable, ReductionVariable, VariableInstance};
use bincode::config;
use serde::Serialize;

/// Borrowed mirror of [`VariableInstance::Grid`]. Variant index and
/// payload match, so it serializes to identical bytes.
#[derive(Serialize)]
enum VariableRef<'a> {
    Grid(&'a GridVariable),
}

/// Encode a variable for transfer.
pub fn encode(var: &VariableInstance) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(var, config::standard()).map_err(|e| CodecError::Encode {
        reason: e.to_string(),
    })
}

/// Encode a grid variable without copying it into a [`VariableInstance`].
pub fn encode_grid(var: &GridVariable) -> Result<Vec<u8>, CodecError> {
    bincode::serde::encode_to_vec(VariableRef::Grid(var), config::standard()).map_err(|e| {
        CodecError::Encode {
            reason: e.to_string(),
        }
    })
}

/// Decode a transferred variable.
pub fn decode(bytes: &[u8]) -> Result<VariableInstance, CodecError> {
    bincode::serde::decode_from_slice(bytes, config::standard())
        .map(|(var, _)| var)
        .map_err(|e| CodecError::Decode {
            reason: e.to_string(),
        })
}

/// Decode a payload that must be a grid variable.
pub fn decode_grid(bytes: &[u8]) -> Result<GridVariable, CodecError> {
    match decode(bytes)? {
        VariableInstance::Grid(v) => Ok(v),
        other => Err(CodecError::UnexpectedKind {
            expected: "grid",
            found: other.kind_name(),
        }),
    }
}

/// Decode a payload that must be a reduction variable.
pub fn decode_reduction(bytes: &[u8]) -> Result<ReductionVariable, CodecError> {
    match decode(bytes)? {
        VariableInstance::Reduction(v) => Ok(v),
        other => Err(CodecError::UnexpectedKind {
            expected: "reduction",
            found: other.kind_name(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_core::{Centering, Extents, ReductionOp};

    #[test]
    fn grid_payload_survives_transfer() {
        let var = GridVariable::from_fn(
            Extents::new([-1, 0, 0], [3, 2, 1]),
            Centering::Cell,
            |c| c[0] as f64 * 0.1 + c[1] as f64,
        );
        let bytes = encode(&VariableInstance::Grid(var.clone())).unwrap();
        assert!(decode_grid(&bytes).unwrap().bits_eq(&var));
    }

    #[test]
    fn borrowed_encoding_matches_owned() {
        let var = GridVariable::filled(Extents::new([0, 0, 0], [2, 1, 1]), Centering::Node, 4.0);
        assert_eq!(
            encode_grid(&var).unwrap(),
            encode(&VariableInstance::Grid(var)).unwrap()
        );
    }

    #[test]
    fn wrong_kind_is_reported() {
        let bytes = encode(&VariableInstance::Reduction(ReductionVariable::new(
            ReductionOp::Sum,
            2.0,
        )))
        .unwrap();
        assert_eq!(
            decode_grid(&bytes).unwrap_err(),
            CodecError::UnexpectedKind {
                expected: "grid",
                found: "reduction"
            }
        );
    }

    #[test]
    fn truncated_payload_fails_to_decode() {
        let bytes = encode(&VariableInstance::Reduction(ReductionVariable::new(
            ReductionOp::Max,
            2.0,
        )))
        .unwrap();
        assert!(matches!(
            decode(&bytes[..bytes.len() - 1]),
            Err(CodecError::Decode { .. })
        ));
    }
}
