//! Wire frames exchanged between ranks.
//!
//! Frames are encoded with bincode. The layout is private to a build:
//! both ends of a run always share the same code.

use crate::error::ExchangeError;
use serde::{Deserialize, Serialize};
use tessera_core::{Extents, GenerationId, MaterialIndex, PatchId, Rank, RemoteFailure, Tag};

/// What a request asks for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestKind {
    /// Grid data for one patch, optionally windowed.
    Grid,
    /// The owner's sealed reduction partial.
    Reduction,
    /// Sentinel telling the receiving worker to drain and exit.
    Quit,
}

/// A request for variable data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFrame {
    /// Requesting rank.
    pub from: Rank,
    /// Owning rank.
    pub to: Rank,
    /// Correlates the reply; reused by retries.
    pub tag: Tag,
    /// Grid, reduction or quit.
    pub kind: RequestKind,
    /// Label name, resolved through the owner's catalog.
    pub label: String,
    /// Patch id.
    pub patch: PatchId,
    /// Material.
    pub material: MaterialIndex,
    /// Generation on the owner.
    pub generation: GenerationId,
    /// Window for grid requests.
    pub window: Option<Extents>,
}

impl RequestFrame {
    /// The quit sentinel addressed to `rank` itself.
    pub fn quit(rank: Rank) -> Self {
        Self {
            from: rank,
            to: rank,
            tag: Tag(0),
            kind: RequestKind::Quit,
            label: String::new(),
            patch: PatchId(0),
            material: MaterialIndex(0),
            generation: GenerationId(0),
            window: None,
        }
    }
}

/// The answer to a [`RequestFrame`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyFrame {
    /// Answering rank.
    pub from: Rank,
    /// Requesting rank.
    pub to: Rank,
    /// Tag of the request.
    pub tag: Tag,
    /// Payload length in bytes (zero on failure).
    pub len: u64,
    /// Encoded variable, or why it could not be served.
    pub payload: Result<Vec<u8>, RemoteFailure>,
}

impl ReplyFrame {
    /// Build a reply, filling in the payload length.
    pub fn new(from: Rank, to: Rank, tag: Tag, payload: Result<Vec<u8>, RemoteFailure>) -> Self {
        let len = payload.as_ref().map_or(0, |b| b.len() as u64);
        Self {
            from,
            to,
            tag,
            len,
            payload,
        }
    }
}

/// Anything that travels through an inbox.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Frame {
    /// A request (including the quit sentinel).
    Request(RequestFrame),
    /// A reply.
    Reply(ReplyFrame),
}

/// Encode a frame.
pub fn encode(frame: &Frame) -> Result<Vec<u8>, ExchangeError> {
    bincode::serde::encode_to_vec(frame, bincode::config::standard()).map_err(|e| {
        ExchangeError::Wire {
            reason: e.to_string(),
        }
    })
}

/// Decode a frame.
pub fn decode(bytes: &[u8]) -> Result<Frame, ExchangeError> {
    bincode::serde::decode_from_slice(bytes, bincode::config::standard())
        .map(|(frame, _)| frame)
        .map_err(|e| ExchangeError::Wire {
            reason: e.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reply_len_matches_payload() {
        let r = ReplyFrame::new(Rank(1), Rank(0), Tag(3), Ok(vec![0; 17]));
        assert_eq!(r.len, 17);
        let f = ReplyFrame::new(Rank(1), Rank(0), Tag(3), Err(RemoteFailure::NotFound));
        assert_eq!(f.len, 0);
    }

    #[test]
    fn request_frame_decodes_to_itself() {
        let frame = Frame::Request(RequestFrame {
            from: Rank(0),
            to: Rank(1),
            tag: Tag(9),
            kind: RequestKind::Grid,
            label: "X".into(),
            patch: PatchId(4),
            material: MaterialIndex(1),
            generation: GenerationId(2),
            window: Some(Extents::new([0, 0, 0], [1, 2, 3])),
        });
        assert_eq!(decode(&encode(&frame).unwrap()).unwrap(), frame);
    }

    #[test]
    fn garbage_is_a_wire_error() {
        assert!(matches!(
            decode(&[0xff, 0xff, 0xff, 0xff, 0xff]),
            Err(ExchangeError::Wire { .. })
        ));
    }
}
