//! Action records emitted by the state machine and the host's completions.

use crate::Msg;
use ordinal_types::{ClientId, Digest, EpochNo, NodeId, ReqNo, Request, RequestAck, SeqNo};
use serde::{Deserialize, Serialize};

/// A message addressed to a single peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unicast {
    pub target: NodeId,
    pub msg: Msg,
}

/// The resumption context attached to a hash request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashOrigin {
    /// Hash of a client request body; resumes the request window.
    Request { client_id: ClientId, req_no: ReqNo },
    /// Hash of a batch's canonical encoding; resumes the sequence slot.
    Batch { epoch: EpochNo, seq_no: SeqNo },
}

/// A hashing job for the host. `data` chunks are hashed in order as one
/// input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashRequest {
    pub data: Vec<Vec<u8>>,
    pub origin: HashOrigin,
}

/// A batch awaiting application-level validation before this replica will
/// prepare it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateRequest {
    pub epoch: EpochNo,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub batch: Vec<RequestAck>,
}

/// A write-ahead-log entry for the host to persist.
///
/// The host must apply persists before transmitting the messages of the same
/// [`Actions`] record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PersistRequest {
    /// A preprepared batch.
    QEntry {
        epoch: EpochNo,
        seq_no: SeqNo,
        digest: Digest,
        requests: Vec<RequestAck>,
    },
    /// A prepared slot.
    PEntry {
        epoch: EpochNo,
        seq_no: SeqNo,
        digest: Digest,
    },
    /// A local checkpoint value.
    CEntry { seq_no: SeqNo, value: Digest },
}

impl PersistRequest {
    /// Identifier the host echoes back in its acknowledgement.
    pub fn id(&self) -> PersistId {
        match self {
            PersistRequest::QEntry { epoch, seq_no, .. } => PersistId::QEntry {
                epoch: *epoch,
                seq_no: *seq_no,
            },
            PersistRequest::PEntry { epoch, seq_no, .. } => PersistId::PEntry {
                epoch: *epoch,
                seq_no: *seq_no,
            },
            PersistRequest::CEntry { seq_no, .. } => PersistId::CEntry { seq_no: *seq_no },
        }
    }
}

/// Identifies a persisted entry in a [`PersistAck`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PersistId {
    QEntry { epoch: EpochNo, seq_no: SeqNo },
    PEntry { epoch: EpochNo, seq_no: SeqNo },
    CEntry { seq_no: SeqNo },
}

/// A committed batch, delivered to the application in strict sequence
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitEntry {
    pub epoch: EpochNo,
    pub seq_no: SeqNo,
    pub digest: Digest,
    pub batch: Vec<RequestAck>,
    /// Set on checkpoint-aligned sequences; the host computes the
    /// application-state value and answers with a [`CheckpointResult`].
    pub checkpoint: bool,
}

/// Everything the state machine wants done after one event cycle.
///
/// Lists preserve the order entries were appended in. The host must execute
/// `persist` before sending `broadcast`/`unicast`, and must answer `hash`,
/// `validate`, `persist` and checkpoint-flagged `commits` via
/// [`ActionResults`], each at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actions {
    pub broadcast: Vec<Msg>,
    pub unicast: Vec<Unicast>,
    pub hash: Vec<HashRequest>,
    pub validate: Vec<ValidateRequest>,
    pub persist: Vec<PersistRequest>,
    pub commits: Vec<CommitEntry>,
}

impl Actions {
    pub fn is_empty(&self) -> bool {
        self.broadcast.is_empty()
            && self.unicast.is_empty()
            && self.hash.is_empty()
            && self.validate.is_empty()
            && self.persist.is_empty()
            && self.commits.is_empty()
    }

    pub fn clear(&mut self) {
        self.broadcast.clear();
        self.unicast.clear();
        self.hash.clear();
        self.validate.clear();
        self.persist.clear();
        self.commits.clear();
    }

    /// Append another record, preserving its internal order.
    pub fn append(&mut self, mut other: Actions) {
        self.broadcast.append(&mut other.broadcast);
        self.unicast.append(&mut other.unicast);
        self.hash.append(&mut other.hash);
        self.validate.append(&mut other.validate);
        self.persist.append(&mut other.persist);
        self.commits.append(&mut other.commits);
    }

    pub fn send(&mut self, msg: Msg) {
        self.broadcast.push(msg);
    }

    pub fn send_to(&mut self, target: NodeId, msg: Msg) {
        self.unicast.push(Unicast { target, msg });
    }

    /// Request a hash of a client request body.
    pub fn hash_request(&mut self, request: &Request) {
        self.hash.push(HashRequest {
            data: request.hash_input(),
            origin: HashOrigin::Request {
                client_id: request.client_id.clone(),
                req_no: request.req_no,
            },
        });
    }

    /// Request a hash of a batch's canonical encoding (the referenced
    /// request digests, in order).
    pub fn hash_batch(&mut self, epoch: EpochNo, seq_no: SeqNo, batch: &[RequestAck]) {
        self.hash.push(HashRequest {
            data: batch.iter().map(|ack| ack.digest.as_bytes().to_vec()).collect(),
            origin: HashOrigin::Batch { epoch, seq_no },
        });
    }
}

/// Digest computed by the host for a [`HashRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashResult {
    pub digest: Digest,
    pub origin: HashOrigin,
}

/// Outcome of an application-level validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidateResult {
    pub epoch: EpochNo,
    pub seq_no: SeqNo,
    pub valid: bool,
}

/// Acknowledgement that a [`PersistRequest`] reached the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistAck {
    pub id: PersistId,
}

/// The application-state value the host computed for a checkpoint sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointResult {
    pub seq_no: SeqNo,
    pub value: Digest,
}

/// Completions of previously requested actions, delivered back into the
/// state machine by the host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionResults {
    pub hashes: Vec<HashResult>,
    pub validations: Vec<ValidateResult>,
    pub persisted: Vec<PersistAck>,
    pub checkpoints: Vec<CheckpointResult>,
}

impl ActionResults {
    pub fn is_empty(&self) -> bool {
        self.hashes.is_empty()
            && self.validations.is_empty()
            && self.persisted.is_empty()
            && self.checkpoints.is_empty()
    }
}
