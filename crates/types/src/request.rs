//! Client requests and the entries that order them.

use crate::{Digest, RequestId, SeqNo, ViewNumber};
use serde::{Deserialize, Serialize};

/// An opaque client request submitted to the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub id: RequestId,
    pub payload: Vec<u8>,
}

impl ClientRequest {
    pub fn new(id: RequestId, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id,
            payload: payload.into(),
        }
    }

    /// Digest over the request id and payload.
    pub fn digest(&self) -> Digest {
        Digest::of_parts(&[&self.id.0.to_le_bytes(), &self.payload])
    }
}

/// A finalized log entry as handed to the ledger.
///
/// Once produced it is never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedEntry {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub request: ClientRequest,
}

/// Evidence that a quorum prepared `digest` at `(view, seq)`.
///
/// Carried in view-change votes so the next primary can re-propose anything
/// that might already have committed somewhere.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreparedCertificate {
    pub view: ViewNumber,
    pub seq: SeqNo,
    pub digest: Digest,
    pub request: ClientRequest,
}
