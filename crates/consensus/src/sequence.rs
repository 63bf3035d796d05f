//! Per-sequence three-phase slot.

use crate::state::FatalError;
use ordinal_core::{Actions, CommitEntry, Msg, PersistId, PersistRequest, ValidateRequest};
use ordinal_types::{Digest, EpochNo, NodeId, Request, RequestAck, SeqNo, SequenceState};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, trace, warn};

/// One slot of the totally ordered log.
///
/// Tracks the batch bound to the sequence, the digest once the host hashed
/// it, and the prepare/commit vote sets. State only ever moves forward:
/// `Allocated → PendingRequests → Preprepared → Prepared → Committed`, and
/// every outbound action is emitted at most once for the slot's lifetime
/// (modulo `tick` re-issuing unacknowledged hash/persist work).
pub struct Sequence {
    epoch: EpochNo,
    seq_no: SeqNo,
    leader: NodeId,
    local_id: NodeId,
    intersection_quorum: usize,

    state: SequenceState,
    /// We lead this bucket and cut the batch ourselves.
    owned: bool,
    batch: Option<Vec<RequestAck>>,
    digest: Option<Digest>,
    /// Referenced requests whose bodies are not yet available locally.
    missing: BTreeSet<RequestAck>,

    /// First vote per peer; later votes with a different digest are counted
    /// as evidence but never replace the original.
    prepares: BTreeMap<NodeId, Digest>,
    commits: BTreeMap<NodeId, Digest>,
    mismatched_votes: u64,

    hash_requested: bool,
    needs_validation: bool,
    validation_resolved: bool,
    invalid: bool,
    prepare_sent: bool,

    q_entry_issued: bool,
    q_entry_persisted: bool,
    p_entry_issued: bool,
    p_entry_persisted: bool,
    delivered: bool,
}

impl Sequence {
    pub fn new(
        epoch: EpochNo,
        seq_no: SeqNo,
        leader: NodeId,
        local_id: NodeId,
        intersection_quorum: usize,
    ) -> Self {
        Self {
            epoch,
            seq_no,
            leader,
            local_id,
            intersection_quorum,
            state: SequenceState::Allocated,
            owned: false,
            batch: None,
            digest: None,
            missing: BTreeSet::new(),
            prepares: BTreeMap::new(),
            commits: BTreeMap::new(),
            mismatched_votes: 0,
            hash_requested: false,
            needs_validation: false,
            validation_resolved: false,
            invalid: false,
            prepare_sent: false,
            q_entry_issued: false,
            q_entry_persisted: false,
            p_entry_issued: false,
            p_entry_persisted: false,
            delivered: false,
        }
    }

    pub fn state(&self) -> SequenceState {
        self.state
    }

    pub fn seq_no(&self) -> SeqNo {
        self.seq_no
    }

    pub fn leader(&self) -> NodeId {
        self.leader
    }

    pub fn is_committed(&self) -> bool {
        self.state == SequenceState::Committed
    }

    pub fn is_delivered(&self) -> bool {
        self.delivered
    }

    pub fn mismatched_votes(&self) -> u64 {
        self.mismatched_votes
    }

    /// Whether the slot already carries a batch (its own or the leader's).
    pub fn has_batch(&self) -> bool {
        self.batch.is_some()
    }

    pub fn batch(&self) -> Option<&[RequestAck]> {
        self.batch.as_deref()
    }

    /// Whether this replica cut the slot's batch as bucket leader.
    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Bind the leader's batch to this slot.
    ///
    /// `missing` is the subset of acks whose bodies are not locally
    /// available yet; hashing is deferred until they all arrive. A second
    /// preprepare carrying a different batch is leader equivocation and is
    /// fatal; an identical one is a retransmission and is ignored.
    pub fn start_batch(
        &mut self,
        batch: Vec<RequestAck>,
        missing: BTreeSet<RequestAck>,
        actions: &mut Actions,
    ) -> Result<(), FatalError> {
        if let Some(existing) = &self.batch {
            if *existing != batch {
                return Err(FatalError::PreprepareEquivocation {
                    leader: self.leader,
                    epoch: self.epoch,
                    seq_no: self.seq_no,
                });
            }
            trace!(seq_no = %self.seq_no, "duplicate preprepare");
            return Ok(());
        }

        debug!(seq_no = %self.seq_no, requests = batch.len(), missing = missing.len(), "batch bound");
        self.batch = Some(batch);
        self.missing = missing;
        self.state = SequenceState::PendingRequests;
        self.maybe_request_hash(actions);
        Ok(())
    }

    /// Bind a batch this leader cut itself.
    pub fn start_owned_batch(&mut self, batch: Vec<RequestAck>, actions: &mut Actions) {
        self.owned = true;
        self.batch = Some(batch);
        self.state = SequenceState::PendingRequests;
        self.maybe_request_hash(actions);
    }

    /// A referenced request body became available.
    pub fn record_request_available(&mut self, ack: &RequestAck, actions: &mut Actions) {
        if self.missing.remove(ack) {
            self.maybe_request_hash(actions);
        }
    }

    fn maybe_request_hash(&mut self, actions: &mut Actions) {
        if !self.missing.is_empty() || self.digest.is_some() || self.hash_requested {
            return;
        }
        if let Some(batch) = &self.batch {
            self.hash_requested = true;
            actions.hash_batch(self.epoch, self.seq_no, batch);
        }
    }

    /// The host computed the batch digest.
    ///
    /// `all_correct` reports whether every referenced request was backed by
    /// a some-correct ack quorum at binding time; if not, the batch goes to
    /// application validation before this replica will prepare it.
    /// `forwards` carries the request bodies an owning leader re-broadcasts
    /// with its preprepare.
    pub fn apply_digest(
        &mut self,
        digest: Digest,
        all_correct: bool,
        forwards: Vec<(Request, Digest)>,
        actions: &mut Actions,
    ) {
        if self.digest.is_some() || self.state != SequenceState::PendingRequests {
            trace!(seq_no = %self.seq_no, "stale digest result");
            return;
        }
        let Some(batch) = self.batch.clone() else {
            return;
        };

        self.digest = Some(digest.clone());
        self.state = SequenceState::Preprepared;
        self.q_entry_issued = true;

        if self.owned {
            for (request, request_digest) in forwards {
                actions.send(Msg::ForwardRequest {
                    request,
                    digest: request_digest,
                });
            }
            actions.send(Msg::Preprepare {
                epoch: self.epoch,
                seq_no: self.seq_no,
                batch: batch.clone(),
            });
        } else {
            // The preprepare stands in for the leader's prepare.
            self.prepares.entry(self.leader).or_insert(digest.clone());

            if all_correct {
                self.send_prepare(&digest, actions);
            } else {
                debug!(seq_no = %self.seq_no, "batch references unproven requests, validating");
                self.needs_validation = true;
                actions.validate.push(ValidateRequest {
                    epoch: self.epoch,
                    seq_no: self.seq_no,
                    digest: digest.clone(),
                    batch: batch.clone(),
                });
            }
        }

        actions.persist.push(PersistRequest::QEntry {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest,
            requests: batch,
        });

        self.evaluate(actions);
    }

    fn send_prepare(&mut self, digest: &Digest, actions: &mut Actions) {
        if self.prepare_sent {
            return;
        }
        self.prepare_sent = true;
        actions.send(Msg::Prepare {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest: digest.clone(),
        });
    }

    /// Our own preprepare came back through the loopback; it doubles as the
    /// leader's prepare.
    pub fn record_implicit_prepare(&mut self, actions: &mut Actions) {
        if let Some(digest) = self.digest.clone() {
            self.prepares.entry(self.leader).or_insert(digest);
            self.evaluate(actions);
        }
    }

    pub fn apply_validate_result(&mut self, valid: bool, actions: &mut Actions) {
        if !self.needs_validation || self.validation_resolved {
            return;
        }
        self.validation_resolved = true;

        if !valid {
            warn!(seq_no = %self.seq_no, leader = %self.leader, "batch failed validation");
            self.invalid = true;
            return;
        }

        if let Some(digest) = self.digest.clone() {
            self.send_prepare(&digest, actions);
        }
        self.evaluate(actions);
    }

    pub fn apply_prepare(&mut self, source: NodeId, digest: Digest, actions: &mut Actions) {
        self.record_vote(true, source, digest);
        self.evaluate(actions);
    }

    pub fn apply_commit(&mut self, source: NodeId, digest: Digest, actions: &mut Actions) {
        self.record_vote(false, source, digest);
        self.evaluate(actions);
    }

    fn record_vote(&mut self, prepare: bool, source: NodeId, digest: Digest) {
        let votes = if prepare {
            &mut self.prepares
        } else {
            &mut self.commits
        };
        match votes.get(&source) {
            None => {
                votes.insert(source, digest);
            }
            Some(existing) if *existing == digest => {}
            Some(_) => {
                // Evidence of a conflicting vote; the first one stands.
                self.mismatched_votes += 1;
                warn!(seq_no = %self.seq_no, %source, "conflicting vote recorded");
            }
        }
    }

    fn matching(&self, votes: &BTreeMap<NodeId, Digest>) -> usize {
        match &self.digest {
            Some(digest) => votes.values().filter(|v| *v == digest).count(),
            None => 0,
        }
    }

    /// Re-check quorum conditions; transitions fire here and nowhere else.
    fn evaluate(&mut self, actions: &mut Actions) {
        if self.invalid {
            return;
        }

        if self.state == SequenceState::Preprepared {
            let digest = match &self.digest {
                Some(d) => d.clone(),
                None => return,
            };
            let self_prepared = self.prepares.get(&self.local_id) == Some(&digest);
            if self_prepared && self.matching(&self.prepares) >= self.intersection_quorum {
                self.state = SequenceState::Prepared;
                self.p_entry_issued = true;
                actions.persist.push(PersistRequest::PEntry {
                    epoch: self.epoch,
                    seq_no: self.seq_no,
                    digest: digest.clone(),
                });
                actions.send(Msg::Commit {
                    epoch: self.epoch,
                    seq_no: self.seq_no,
                    digest,
                });
                debug!(seq_no = %self.seq_no, "prepared");
            }
        }

        if self.state == SequenceState::Prepared
            && self.matching(&self.commits) >= self.intersection_quorum
        {
            self.state = SequenceState::Committed;
            debug!(seq_no = %self.seq_no, "committed");
        }
    }

    /// Assemble the commit entry once the epoch releases this slot for
    /// delivery.
    pub fn deliver(&mut self, checkpoint: bool) -> Option<CommitEntry> {
        if !self.is_committed() || self.delivered {
            return None;
        }
        let (digest, batch) = match (&self.digest, &self.batch) {
            (Some(d), Some(b)) => (d.clone(), b.clone()),
            _ => return None,
        };
        self.delivered = true;
        Some(CommitEntry {
            epoch: self.epoch,
            seq_no: self.seq_no,
            digest,
            batch,
            checkpoint,
        })
    }

    pub fn apply_persist_ack(&mut self, id: PersistId) {
        match id {
            PersistId::QEntry { epoch, seq_no } if epoch == self.epoch && seq_no == self.seq_no => {
                self.q_entry_persisted = true;
            }
            PersistId::PEntry { epoch, seq_no } if epoch == self.epoch && seq_no == self.seq_no => {
                self.p_entry_persisted = true;
            }
            _ => {}
        }
    }

    /// Re-issue outstanding host work; all records are idempotent.
    pub fn tick(&mut self, actions: &mut Actions) {
        if self.hash_requested && self.digest.is_none() {
            if let Some(batch) = &self.batch {
                actions.hash_batch(self.epoch, self.seq_no, batch);
            }
        }
        let (digest, batch) = match (&self.digest, &self.batch) {
            (Some(d), Some(b)) => (d.clone(), b.clone()),
            _ => return,
        };
        if self.q_entry_issued && !self.q_entry_persisted {
            actions.persist.push(PersistRequest::QEntry {
                epoch: self.epoch,
                seq_no: self.seq_no,
                digest: digest.clone(),
                requests: batch.clone(),
            });
        }
        if self.p_entry_issued && !self.p_entry_persisted {
            actions.persist.push(PersistRequest::PEntry {
                epoch: self.epoch,
                seq_no: self.seq_no,
                digest: digest.clone(),
            });
        }
        if self.needs_validation && !self.validation_resolved {
            actions.validate.push(ValidateRequest {
                epoch: self.epoch,
                seq_no: self.seq_no,
                digest,
                batch,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ack(digest: &str) -> RequestAck {
        RequestAck {
            client_id: ordinal_types::ClientId::from("client-1"),
            req_no: ordinal_types::ReqNo(1),
            digest: Digest::from(digest),
        }
    }

    fn slot(leader: u64, local: u64, quorum: usize) -> Sequence {
        Sequence::new(EpochNo(2), SeqNo(2), NodeId(leader), NodeId(local), quorum)
    }

    #[test]
    fn follower_walks_three_phases() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();

        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();
        assert_eq!(s.state(), SequenceState::PendingRequests);
        assert_eq!(actions.hash.len(), 1);

        let mut actions = Actions::default();
        s.apply_digest(Digest::from("batch-digest"), true, vec![], &mut actions);
        assert_eq!(s.state(), SequenceState::Preprepared);
        assert!(matches!(actions.broadcast[0], Msg::Prepare { .. }));
        assert_eq!(actions.persist.len(), 1);

        // Own prepare loops back, then one more peer: 3 with the implicit
        // leader prepare.
        let mut actions = Actions::default();
        s.apply_prepare(NodeId(0), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.state(), SequenceState::Preprepared);
        s.apply_prepare(NodeId(2), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.state(), SequenceState::Prepared);
        assert!(matches!(actions.broadcast[0], Msg::Commit { .. }));

        let mut actions = Actions::default();
        s.apply_commit(NodeId(0), Digest::from("batch-digest"), &mut actions);
        s.apply_commit(NodeId(2), Digest::from("batch-digest"), &mut actions);
        s.apply_commit(NodeId(3), Digest::from("batch-digest"), &mut actions);
        assert!(s.is_committed());

        let entry = s.deliver(false).expect("deliverable");
        assert_eq!(entry.digest, Digest::from("batch-digest"));
        assert!(s.deliver(false).is_none());
    }

    #[test]
    fn conflicting_preprepare_is_fatal() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("a")], BTreeSet::new(), &mut actions)
            .unwrap();
        // Retransmission is fine.
        assert!(s
            .start_batch(vec![ack("a")], BTreeSet::new(), &mut actions)
            .is_ok());
        let err = s
            .start_batch(vec![ack("b")], BTreeSet::new(), &mut actions)
            .unwrap_err();
        assert!(matches!(err, FatalError::PreprepareEquivocation { .. }));
    }

    #[test]
    fn votes_before_digest_are_buffered() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.apply_prepare(NodeId(2), Digest::from("batch-digest"), &mut actions);
        s.apply_commit(NodeId(2), Digest::from("batch-digest"), &mut actions);
        assert!(actions.is_empty());

        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();
        let mut actions = Actions::default();
        s.apply_digest(Digest::from("batch-digest"), true, vec![], &mut actions);
        // Buffered peer prepare + implicit leader prepare + our own loopback.
        s.apply_prepare(NodeId(0), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.state(), SequenceState::Prepared);
    }

    #[test]
    fn mismatched_votes_do_not_count() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();
        s.apply_digest(Digest::from("batch-digest"), true, vec![], &mut actions);

        let mut actions = Actions::default();
        s.apply_prepare(NodeId(0), Digest::from("batch-digest"), &mut actions);
        s.apply_prepare(NodeId(2), Digest::from("forged"), &mut actions);
        assert_eq!(s.state(), SequenceState::Preprepared);

        // The same peer voting twice with a different digest is evidence.
        s.apply_prepare(NodeId(2), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.mismatched_votes(), 1);
        assert_eq!(s.state(), SequenceState::Preprepared);

        s.apply_prepare(NodeId(1), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.state(), SequenceState::Prepared);
    }

    #[test]
    fn quorum_without_own_prepare_does_not_fire() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();
        s.apply_digest(Digest::from("batch-digest"), true, vec![], &mut actions);

        let mut actions = Actions::default();
        s.apply_prepare(NodeId(1), Digest::from("batch-digest"), &mut actions);
        s.apply_prepare(NodeId(2), Digest::from("batch-digest"), &mut actions);
        // Leader implicit + peers 1 and 2 reach the quorum size, but our own
        // prepare has not looped back yet.
        assert_eq!(s.state(), SequenceState::Preprepared);

        s.apply_prepare(NodeId(0), Digest::from("batch-digest"), &mut actions);
        assert_eq!(s.state(), SequenceState::Prepared);
    }

    #[test]
    fn unproven_batch_waits_for_validation() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();

        let mut actions = Actions::default();
        s.apply_digest(Digest::from("batch-digest"), false, vec![], &mut actions);
        assert!(actions.broadcast.is_empty());
        assert_eq!(actions.validate.len(), 1);

        let mut actions = Actions::default();
        s.apply_validate_result(true, &mut actions);
        assert!(matches!(actions.broadcast[0], Msg::Prepare { .. }));
    }

    #[test]
    fn invalid_batch_never_prepares() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();
        s.apply_digest(Digest::from("batch-digest"), false, vec![], &mut actions);

        let mut actions = Actions::default();
        s.apply_validate_result(false, &mut actions);
        assert!(actions.is_empty());

        for peer in 0..4 {
            s.apply_prepare(NodeId(peer), Digest::from("batch-digest"), &mut actions);
        }
        assert_eq!(s.state(), SequenceState::Preprepared);
        assert!(actions.is_empty());
    }

    #[test]
    fn missing_requests_defer_hashing() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        let missing = BTreeSet::from([ack("request-digest")]);
        s.start_batch(vec![ack("request-digest")], missing, &mut actions)
            .unwrap();
        assert!(actions.hash.is_empty());
        assert_eq!(s.state(), SequenceState::PendingRequests);

        s.record_request_available(&ack("request-digest"), &mut actions);
        assert_eq!(actions.hash.len(), 1);
    }

    #[test]
    fn tick_reissues_unacknowledged_work() {
        let mut s = slot(3, 0, 3);
        let mut actions = Actions::default();
        s.start_batch(vec![ack("request-digest")], BTreeSet::new(), &mut actions)
            .unwrap();

        let mut actions = Actions::default();
        s.tick(&mut actions);
        assert_eq!(actions.hash.len(), 1);

        let mut actions = Actions::default();
        s.apply_digest(Digest::from("batch-digest"), true, vec![], &mut actions);

        let mut actions = Actions::default();
        s.tick(&mut actions);
        assert_eq!(actions.hash.len(), 0);
        assert_eq!(actions.persist.len(), 1);

        s.apply_persist_ack(PersistId::QEntry {
            epoch: EpochNo(2),
            seq_no: SeqNo(2),
        });
        let mut actions = Actions::default();
        s.tick(&mut actions);
        assert!(actions.is_empty());
    }
}
