//! Per-peer message admission.

use ordinal_core::{Msg, MsgKind, NodeBucketStatus, NodeStatus};
use ordinal_types::{Digest, EpochNo, NodeId, SeqNo};
use std::collections::{BTreeMap, HashSet, VecDeque};
use tracing::debug;

/// Why a message was not admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    WrongEpoch,
    OutOfWatermarks,
    Duplicate,
}

/// Outcome of admission-checking one inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    /// In-window and epoch-matching; route it.
    Accept,
    /// The peer has no active epoch yet; the message is parked until one is
    /// installed.
    Buffered,
    /// Rejected. Not an error; observable only through the counters.
    Dropped(DropReason),
}

/// Admission state for a single peer.
///
/// Epoch-scoped messages are only admitted for the peer's currently active
/// epoch, sequence-scoped messages only within the shared watermark window,
/// and a `(kind, seq_no, digest)` tuple is only admitted once. Everything
/// else is dropped silently — Byzantine peers do not get to make us do work.
pub struct NodeMsgs {
    id: NodeId,
    number_of_buckets: u64,

    active_epoch: Option<EpochNo>,
    /// Messages parked while no epoch is active for this peer.
    buffered: VecDeque<Msg>,
    /// Capacity of the parking buffer; older messages fall off the front.
    buffer_size: usize,

    /// Admitted vote/checkpoint identities, pruned as watermarks advance.
    admitted_votes: HashSet<(MsgKind, SeqNo, Digest)>,

    /// Highest admitted prepare/commit per bucket, for the status surface.
    last_prepare: BTreeMap<u64, SeqNo>,
    last_commit: BTreeMap<u64, SeqNo>,
    last_checkpoint: SeqNo,

    admitted: u64,
    rejected: u64,
}

impl NodeMsgs {
    pub fn new(id: NodeId, number_of_buckets: u64, buffer_size: usize) -> Self {
        Self {
            id,
            number_of_buckets,
            active_epoch: None,
            buffered: VecDeque::new(),
            buffer_size: buffer_size.max(1),
            admitted_votes: HashSet::new(),
            last_prepare: BTreeMap::new(),
            last_commit: BTreeMap::new(),
            last_checkpoint: SeqNo(0),
            admitted: 0,
            rejected: 0,
        }
    }

    /// Admission-check a message against the current watermark window.
    pub fn process(&mut self, msg: &Msg, low: SeqNo, high: SeqNo) -> Admission {
        // The epoch-change family belongs to the external collaborator and
        // deliberately spans epochs; it bypasses the epoch filter.
        if !msg.is_epoch_change() {
            if let Some(epoch) = msg.epoch() {
                match self.active_epoch {
                    None => {
                        if self.buffered.len() == self.buffer_size {
                            self.buffered.pop_front();
                        }
                        self.buffered.push_back(msg.clone());
                        return Admission::Buffered;
                    }
                    Some(active) if active != epoch => {
                        return self.drop(msg, DropReason::WrongEpoch);
                    }
                    Some(_) => {}
                }
            }
        }

        if let Some(seq_no) = msg.seq_no() {
            if seq_no < low || seq_no > high {
                return self.drop(msg, DropReason::OutOfWatermarks);
            }
        }

        // Votes and checkpoints are only admitted once per identity.
        let vote_key = match msg {
            Msg::Prepare {
                seq_no, digest, ..
            } => Some((MsgKind::Prepare, *seq_no, digest.clone())),
            Msg::Commit {
                seq_no, digest, ..
            } => Some((MsgKind::Commit, *seq_no, digest.clone())),
            Msg::Checkpoint { seq_no, value } => {
                Some((MsgKind::Checkpoint, *seq_no, value.clone()))
            }
            _ => None,
        };
        if let Some(key) = vote_key {
            if !self.admitted_votes.insert(key) {
                return self.drop(msg, DropReason::Duplicate);
            }
        }

        self.admitted += 1;
        self.note_progress(msg);
        Admission::Accept
    }

    fn drop(&mut self, msg: &Msg, reason: DropReason) -> Admission {
        self.rejected += 1;
        debug!(peer = %self.id, kind = ?msg.kind(), ?reason, "dropping message");
        Admission::Dropped(reason)
    }

    fn note_progress(&mut self, msg: &Msg) {
        match msg {
            Msg::Prepare { seq_no, .. } => {
                let bucket = seq_no.bucket(self.number_of_buckets).0;
                let last = self.last_prepare.entry(bucket).or_default();
                if *seq_no > *last {
                    *last = *seq_no;
                }
            }
            Msg::Commit { seq_no, .. } => {
                let bucket = seq_no.bucket(self.number_of_buckets).0;
                let last = self.last_commit.entry(bucket).or_default();
                if *seq_no > *last {
                    *last = *seq_no;
                }
            }
            Msg::Checkpoint { seq_no, .. } => {
                if *seq_no > self.last_checkpoint {
                    self.last_checkpoint = *seq_no;
                }
            }
            _ => {}
        }
    }

    /// Install the peer's active epoch and hand back anything parked for
    /// re-processing.
    ///
    /// Admitted-vote identities are reset: the new epoch's slots start from
    /// a clean vote history.
    pub fn set_active_epoch(&mut self, epoch: EpochNo) -> Vec<Msg> {
        self.active_epoch = Some(epoch);
        self.admitted_votes.clear();
        self.buffered.drain(..).collect()
    }

    pub fn active_epoch(&self) -> Option<EpochNo> {
        self.active_epoch
    }

    /// Forget admitted identities below the new low watermark.
    pub fn truncate(&mut self, low: SeqNo) {
        self.admitted_votes.retain(|(_, seq_no, _)| *seq_no >= low);
    }

    pub fn status(&self, leaders: Option<&[NodeId]>) -> NodeStatus {
        let bucket_statuses = (0..self.number_of_buckets)
            .map(|bucket| NodeBucketStatus {
                bucket_id: bucket,
                is_leader: leaders
                    .map(|l| l.get(bucket as usize) == Some(&self.id))
                    .unwrap_or(false),
                last_prepare: self.last_prepare.get(&bucket).copied().unwrap_or_default(),
                last_commit: self.last_commit.get(&bucket).copied().unwrap_or_default(),
            })
            .collect();

        NodeStatus {
            id: self.id,
            bucket_statuses,
            last_checkpoint: self.last_checkpoint,
            admitted: self.admitted,
            rejected: self.rejected,
            // Filled in by the state machine from protocol evidence.
            suspicions: 0,
        }
    }
}
