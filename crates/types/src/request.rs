//! Client requests and request acknowledgements.

use crate::{ClientId, Digest, ReqNo};
use serde::{Deserialize, Serialize};

/// A client request body.
///
/// The payload is opaque to the protocol; only its host-computed digest
/// participates in ordering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub client_id: ClientId,
    pub req_no: ReqNo,
    pub data: Vec<u8>,
}

impl Request {
    /// Canonical encoding fed to the host's hashing collaborator: the client
    /// identity, the little-endian request number, and the payload.
    pub fn hash_input(&self) -> Vec<Vec<u8>> {
        vec![
            self.client_id.as_bytes().to_vec(),
            self.req_no.0.to_le_bytes().to_vec(),
            self.data.clone(),
        ]
    }
}

/// Acknowledgement that a replica has seen (and hashed) a client request.
///
/// An ack backed by a some-correct quorum proves at least one honest replica
/// vouches for the request, which is what allows a batch to reference it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestAck {
    pub client_id: ClientId,
    pub req_no: ReqNo,
    pub digest: Digest,
}
