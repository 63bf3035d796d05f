//! Wire protocol messages.

use ordinal_types::{Digest, EpochNo, NodeId, Request, RequestAck, SeqNo};
use serde::{Deserialize, Serialize};

/// All messages exchanged between replicas.
///
/// The transport (signing, framing, delivery) is a host concern; the core
/// only sees structured variants. The epoch-change family is carried for the
/// external epoch-change collaborator and is never originated or consumed by
/// the ordering core itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Msg {
    /// Leader's batch proposal for a sequence slot.
    Preprepare {
        epoch: EpochNo,
        seq_no: SeqNo,
        batch: Vec<RequestAck>,
    },

    /// Vote that the sender preprepared the digest at the slot.
    Prepare {
        epoch: EpochNo,
        seq_no: SeqNo,
        digest: Digest,
    },

    /// Vote that the sender prepared the digest at the slot.
    Commit {
        epoch: EpochNo,
        seq_no: SeqNo,
        digest: Digest,
    },

    /// The sender's application-state value at a checkpoint sequence.
    Checkpoint { seq_no: SeqNo, value: Digest },

    /// The sender has seen (and hashed) the referenced client request.
    RequestAck(RequestAck),

    /// A request body forwarded to the leader of its bucket.
    Forward {
        epoch: EpochNo,
        bucket: u64,
        request: Request,
    },

    /// A request body broadcast by a leader so followers can resolve the
    /// acks referenced by its preprepare.
    ForwardRequest { request: Request, digest: Digest },

    // Epoch-change family, opaque to the ordering core.
    EpochChange { epoch: EpochNo, payload: Vec<u8> },
    Echo { epoch: EpochNo, payload: Vec<u8> },
    Ready { epoch: EpochNo, payload: Vec<u8> },
    Suspect { epoch: EpochNo, suspect: NodeId },
    NewEpoch { epoch: EpochNo, payload: Vec<u8> },
}

/// Discriminant of a [`Msg`], used for admission bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum MsgKind {
    Preprepare,
    Prepare,
    Commit,
    Checkpoint,
    RequestAck,
    Forward,
    ForwardRequest,
    EpochChange,
    Echo,
    Ready,
    Suspect,
    NewEpoch,
}

impl Msg {
    pub fn kind(&self) -> MsgKind {
        match self {
            Msg::Preprepare { .. } => MsgKind::Preprepare,
            Msg::Prepare { .. } => MsgKind::Prepare,
            Msg::Commit { .. } => MsgKind::Commit,
            Msg::Checkpoint { .. } => MsgKind::Checkpoint,
            Msg::RequestAck(_) => MsgKind::RequestAck,
            Msg::Forward { .. } => MsgKind::Forward,
            Msg::ForwardRequest { .. } => MsgKind::ForwardRequest,
            Msg::EpochChange { .. } => MsgKind::EpochChange,
            Msg::Echo { .. } => MsgKind::Echo,
            Msg::Ready { .. } => MsgKind::Ready,
            Msg::Suspect { .. } => MsgKind::Suspect,
            Msg::NewEpoch { .. } => MsgKind::NewEpoch,
        }
    }

    /// The epoch the message is scoped to, if any. Checkpoints, request acks
    /// and forwarded request bodies are epoch-free.
    pub fn epoch(&self) -> Option<EpochNo> {
        match self {
            Msg::Preprepare { epoch, .. }
            | Msg::Prepare { epoch, .. }
            | Msg::Commit { epoch, .. }
            | Msg::Forward { epoch, .. } => Some(*epoch),
            Msg::Checkpoint { .. } | Msg::RequestAck(_) | Msg::ForwardRequest { .. } => None,
            Msg::EpochChange { epoch, .. }
            | Msg::Echo { epoch, .. }
            | Msg::Ready { epoch, .. }
            | Msg::Suspect { epoch, .. }
            | Msg::NewEpoch { epoch, .. } => Some(*epoch),
        }
    }

    /// The sequence the message addresses, if any.
    pub fn seq_no(&self) -> Option<SeqNo> {
        match self {
            Msg::Preprepare { seq_no, .. }
            | Msg::Prepare { seq_no, .. }
            | Msg::Commit { seq_no, .. }
            | Msg::Checkpoint { seq_no, .. } => Some(*seq_no),
            _ => None,
        }
    }

    /// Whether this variant belongs to the external epoch-change protocol.
    pub fn is_epoch_change(&self) -> bool {
        matches!(
            self.kind(),
            MsgKind::EpochChange
                | MsgKind::Echo
                | MsgKind::Ready
                | MsgKind::Suspect
                | MsgKind::NewEpoch
        )
    }
}
