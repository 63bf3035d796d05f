//! The active epoch: in-window slots, leader routing, batching, delivery.

use crate::checkpoints::CheckpointTracker;
use crate::requests::{ReadyRequest, RequestPool};
use crate::sequence::Sequence;
use crate::state::FatalError;
use ordinal_core::{Actions, BucketStatus, Msg, PersistId};
use ordinal_types::{
    BucketId, Config, Digest, EpochConfig, EpochNo, NetworkConfig, NodeId, RequestAck, SeqNo,
};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

#[derive(Default)]
struct PendingBatch {
    acks: Vec<RequestAck>,
    bytes: usize,
}

/// Owns the consecutive range of sequences the current epoch may order.
///
/// Slots exist for every sequence in `(low_watermark, high_watermark]`; the
/// window slides forward as checkpoints stabilize, discarding everything it
/// leaves behind. Leaders cut batches into the columns of the buckets they
/// lead; committed slots are released to the host in strict sequence order
/// across all buckets.
pub struct ActiveEpoch {
    config: EpochConfig,
    network: Arc<NetworkConfig>,
    local: Arc<Config>,

    sequences: BTreeMap<SeqNo, Sequence>,
    low_watermark: SeqNo,
    high_watermark: SeqNo,
    /// Last sequence this epoch is allowed to order.
    final_seq: SeqNo,

    /// Ready requests awaiting batching, per locally led bucket.
    pending: BTreeMap<BucketId, PendingBatch>,
    /// Next sequence each locally led bucket would cut a batch into.
    next_alloc: BTreeMap<BucketId, SeqNo>,
    /// Next sequence to release to the host. A committed slot is withheld
    /// until every lower slot in the epoch has been delivered, so the
    /// commit stream has no gaps.
    next_deliverable: SeqNo,

    /// Slots parked on request bodies that have not arrived yet.
    waiting: BTreeMap<RequestAck, Vec<SeqNo>>,

    /// Per-leader evidence: failed validations of batches they proposed.
    suspicions: BTreeMap<NodeId, u64>,
    rejected_preprepares: u64,
}

impl ActiveEpoch {
    pub fn new(config: EpochConfig, network: Arc<NetworkConfig>, local: Arc<Config>) -> Self {
        let low = config.starting_checkpoint.seq_no;
        let final_seq = SeqNo(low.0 + network.max_epoch_length);
        let high = SeqNo((low.0 + network.watermark_width).min(final_seq.0));

        let mut epoch = Self {
            config,
            network,
            local,
            sequences: BTreeMap::new(),
            low_watermark: low,
            high_watermark: high,
            final_seq,
            pending: BTreeMap::new(),
            next_alloc: BTreeMap::new(),
            next_deliverable: SeqNo(low.0 + 1),
            waiting: BTreeMap::new(),
            suspicions: BTreeMap::new(),
            rejected_preprepares: 0,
        };

        epoch.allocate_window();
        for bucket in 0..epoch.network.number_of_buckets {
            if epoch.leads(BucketId(bucket)) {
                let first = epoch.first_column_seq_above(BucketId(bucket), low);
                epoch.next_alloc.insert(BucketId(bucket), first);
            }
        }

        info!(
            epoch = %epoch.config.number,
            low = %epoch.low_watermark,
            high = %epoch.high_watermark,
            "epoch active"
        );
        epoch
    }

    pub fn epoch_no(&self) -> EpochNo {
        self.config.number
    }

    pub fn low_watermark(&self) -> SeqNo {
        self.low_watermark
    }

    pub fn high_watermark(&self) -> SeqNo {
        self.high_watermark
    }

    pub fn leaders(&self) -> &[NodeId] {
        &self.config.leaders
    }

    pub fn suspicions_of(&self, node: NodeId) -> u64 {
        self.suspicions.get(&node).copied().unwrap_or(0)
    }

    fn leads(&self, bucket: BucketId) -> bool {
        self.config.leaders.get(bucket.0 as usize) == Some(&self.local.id)
    }

    /// Smallest sequence strictly above `seq` in `bucket`'s column.
    fn first_column_seq_above(&self, bucket: BucketId, seq: SeqNo) -> SeqNo {
        let buckets = self.network.number_of_buckets;
        let base = seq.0 + 1;
        SeqNo(base + (bucket.0 + buckets - base % buckets) % buckets)
    }

    /// Create slots for every in-window sequence that lacks one.
    fn allocate_window(&mut self) {
        let quorum = self.network.intersection_quorum();
        for seq in self.low_watermark.0 + 1..=self.high_watermark.0 {
            let seq_no = SeqNo(seq);
            let leader = self.config.leader_of(seq_no, &self.network);
            let epoch_no = self.config.number;
            let local_id = self.local.id;
            self.sequences
                .entry(seq_no)
                .or_insert_with(|| Sequence::new(epoch_no, seq_no, leader, local_id, quorum));
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Protocol messages
    // ═══════════════════════════════════════════════════════════════════════

    pub fn apply_preprepare(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        batch: Vec<RequestAck>,
        pool: &RequestPool,
    ) -> Result<Actions, FatalError> {
        let mut actions = Actions::default();
        let Some(slot) = self.sequences.get_mut(&seq_no) else {
            trace!(%seq_no, "no slot for preprepare");
            return Ok(actions);
        };

        if slot.leader() != source {
            self.rejected_preprepares += 1;
            warn!(%seq_no, %source, leader = %slot.leader(), "preprepare from non-leader");
            return Ok(actions);
        }

        if slot.has_batch() {
            // Retransmission check (a different batch is equivocation), then
            // count the leader's preprepare as its prepare.
            slot.start_batch(batch, BTreeSet::new(), &mut actions)?;
            slot.record_implicit_prepare(&mut actions);
        } else {
            let missing: BTreeSet<RequestAck> = batch
                .iter()
                .filter(|ack| pool.body(ack).is_none())
                .cloned()
                .collect();
            for ack in &missing {
                self.waiting.entry(ack.clone()).or_default().push(seq_no);
            }
            slot.start_batch(batch, missing, &mut actions)?;
        }

        self.drain_deliveries(&mut actions);
        Ok(actions)
    }

    pub fn apply_prepare(&mut self, source: NodeId, seq_no: SeqNo, digest: Digest) -> Actions {
        let mut actions = Actions::default();
        if let Some(slot) = self.sequences.get_mut(&seq_no) {
            slot.apply_prepare(source, digest, &mut actions);
            self.drain_deliveries(&mut actions);
        }
        actions
    }

    pub fn apply_commit(&mut self, source: NodeId, seq_no: SeqNo, digest: Digest) -> Actions {
        let mut actions = Actions::default();
        if let Some(slot) = self.sequences.get_mut(&seq_no) {
            slot.apply_commit(source, digest, &mut actions);
            self.drain_deliveries(&mut actions);
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Requests and batching
    // ═══════════════════════════════════════════════════════════════════════

    /// A request became correct and available: batch it if we lead its
    /// bucket, otherwise forward the body to the leader.
    pub fn on_request_ready(&mut self, ready: ReadyRequest, pool: &mut RequestPool) -> Actions {
        let mut actions = Actions::default();
        let bucket = BucketId(ready.ack.digest.bucket(self.network.number_of_buckets));

        if self.leads(bucket) {
            let pending = self.pending.entry(bucket).or_default();
            pending.bytes += ready.size;
            pending.acks.push(ready.ack);
            self.maybe_cut(bucket, &mut actions);
        } else if pool.mark_forwarded(&ready.ack) {
            if let Some(request) = pool.body(&ready.ack) {
                let leader = self.config.leaders[bucket.0 as usize];
                actions.send_to(
                    leader,
                    Msg::Forward {
                        epoch: self.config.number,
                        bucket: bucket.0,
                        request: request.clone(),
                    },
                );
            }
        }
        actions
    }

    /// A request body arrived; wake any slots parked on it.
    pub fn on_request_available(&mut self, ack: &RequestAck) -> Actions {
        let mut actions = Actions::default();
        if let Some(seqs) = self.waiting.remove(ack) {
            for seq_no in seqs {
                if let Some(slot) = self.sequences.get_mut(&seq_no) {
                    slot.record_request_available(ack, &mut actions);
                }
            }
        }
        actions
    }

    fn maybe_cut(&mut self, bucket: BucketId, actions: &mut Actions) {
        let cut_size = self.local.batch_parameters.cut_size_bytes;
        let Some(pending) = self.pending.get_mut(&bucket) else {
            return;
        };
        if pending.acks.is_empty() || pending.bytes < cut_size {
            return;
        }

        let Some(seq_no) = self.next_alloc.get(&bucket).copied() else {
            return;
        };
        if seq_no > self.high_watermark || seq_no > self.final_seq {
            trace!(%bucket, %seq_no, "batch held back at window edge");
            return;
        }

        let batch = std::mem::take(pending);
        let Some(slot) = self.sequences.get_mut(&seq_no) else {
            return;
        };
        debug!(%bucket, %seq_no, requests = batch.acks.len(), "cutting batch");
        slot.start_owned_batch(batch.acks, actions);
        self.next_alloc
            .insert(bucket, SeqNo(seq_no.0 + self.network.number_of_buckets));
    }

    /// Try to cut in every led bucket; used after the window advances.
    fn cut_where_possible(&mut self, actions: &mut Actions) {
        let buckets: Vec<BucketId> = self.pending.keys().copied().collect();
        for bucket in buckets {
            self.maybe_cut(bucket, actions);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Host completions
    // ═══════════════════════════════════════════════════════════════════════

    pub fn apply_batch_digest(&mut self, seq_no: SeqNo, digest: Digest, pool: &RequestPool) -> Actions {
        let mut actions = Actions::default();
        let Some(slot) = self.sequences.get_mut(&seq_no) else {
            return actions;
        };
        let Some(batch) = slot.batch() else {
            return actions;
        };

        let all_correct = batch.iter().all(|ack| pool.is_correct(ack));
        let forwards = if slot.is_owned() {
            batch
                .iter()
                .filter_map(|ack| pool.body(ack).map(|req| (req.clone(), ack.digest.clone())))
                .collect()
        } else {
            Vec::new()
        };

        slot.apply_digest(digest, all_correct, forwards, &mut actions);
        self.drain_deliveries(&mut actions);
        actions
    }

    pub fn apply_validate_result(&mut self, seq_no: SeqNo, valid: bool) -> Actions {
        let mut actions = Actions::default();
        let Some(slot) = self.sequences.get_mut(&seq_no) else {
            return actions;
        };
        let leader = slot.leader();
        slot.apply_validate_result(valid, &mut actions);
        if !valid {
            *self.suspicions.entry(leader).or_default() += 1;
        }
        self.drain_deliveries(&mut actions);
        actions
    }

    pub fn apply_persist_ack(&mut self, id: PersistId) {
        let seq_no = match id {
            PersistId::QEntry { epoch, seq_no } | PersistId::PEntry { epoch, seq_no } => {
                if epoch != self.config.number {
                    return;
                }
                seq_no
            }
            PersistId::CEntry { .. } => return,
        };
        if let Some(slot) = self.sequences.get_mut(&seq_no) {
            slot.apply_persist_ack(id);
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Delivery and watermarks
    // ═══════════════════════════════════════════════════════════════════════

    /// Release committed slots in strict sequence order: a committed slot at
    /// S is withheld until every slot below S in the epoch has committed and
    /// been delivered, whichever bucket it belongs to.
    fn drain_deliveries(&mut self, actions: &mut Actions) {
        let interval = self.network.checkpoint_interval;
        while self.next_deliverable <= self.high_watermark {
            let next = self.next_deliverable;
            let Some(slot) = self.sequences.get_mut(&next) else {
                break;
            };
            let checkpoint = next.0 % interval == 0;
            match slot.deliver(checkpoint) {
                Some(entry) => {
                    debug!(seq_no = %next, checkpoint, "delivering commit");
                    actions.commits.push(entry);
                    self.next_deliverable = SeqNo(next.0 + 1);
                }
                None => break,
            }
        }
    }

    /// Slide the window over every freshly stable checkpoint. Returns true
    /// if the watermarks moved; the caller is responsible for truncating the
    /// tracker and the per-peer gates.
    pub fn advance_watermarks(&mut self, tracker: &CheckpointTracker, actions: &mut Actions) -> bool {
        let interval = self.network.checkpoint_interval;
        let mut moved = false;
        while self.low_watermark < self.final_seq
            && tracker.is_stable(SeqNo(self.low_watermark.0 + interval))
        {
            self.low_watermark = SeqNo(self.low_watermark.0 + interval);
            moved = true;
        }
        if !moved {
            return false;
        }

        let low = self.low_watermark;
        self.high_watermark = SeqNo((low.0 + self.network.watermark_width).min(self.final_seq.0));
        info!(low = %low, high = %self.high_watermark, "watermarks advanced");

        self.sequences.retain(|seq_no, _| *seq_no >= low);
        self.waiting.retain(|_, seqs| {
            seqs.retain(|s| *s >= low);
            !seqs.is_empty()
        });
        self.allocate_window();

        // Everything at or below a stable checkpoint is final network-wide;
        // if we had not delivered it ourselves, delivery resumes above it.
        if self.next_deliverable <= low {
            debug!(from = %self.next_deliverable, to = %SeqNo(low.0 + 1), "delivery cursor jumps past checkpoint");
            self.next_deliverable = SeqNo(low.0 + 1);
        }

        for bucket in 0..self.network.number_of_buckets {
            let bucket = BucketId(bucket);
            let first = self.first_column_seq_above(bucket, low);
            if let Some(next) = self.next_alloc.get_mut(&bucket) {
                if *next < first {
                    *next = first;
                }
            }
        }

        // The wider window may unblock batches that were held at the edge.
        self.cut_where_possible(actions);
        self.drain_deliveries(actions);
        true
    }

    pub fn tick(&mut self) -> Actions {
        let mut actions = Actions::default();
        for slot in self.sequences.values_mut() {
            slot.tick(&mut actions);
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Status
    // ═══════════════════════════════════════════════════════════════════════

    pub fn status(&self) -> Vec<BucketStatus> {
        (0..self.network.number_of_buckets)
            .map(|bucket| {
                let bucket = BucketId(bucket);
                let mut seq = self.first_column_seq_above(bucket, self.low_watermark);
                let mut sequences = Vec::new();
                while seq <= self.high_watermark {
                    let state = self
                        .sequences
                        .get(&seq)
                        .map(|slot| slot.state())
                        .unwrap_or(ordinal_types::SequenceState::Uninitialized);
                    sequences.push((seq, state));
                    seq = SeqNo(seq.0 + self.network.number_of_buckets);
                }
                BucketStatus {
                    id: bucket.0,
                    leader: self.leads(bucket),
                    sequences,
                }
            })
            .collect()
    }

    /// Total conflicting-vote evidence across live slots.
    pub fn mismatched_votes(&self) -> u64 {
        self.sequences.values().map(Sequence::mismatched_votes).sum()
    }

    /// Preprepares dropped because their sender did not lead the slot's
    /// bucket.
    pub fn rejected_preprepares(&self) -> u64 {
        self.rejected_preprepares
    }
}
