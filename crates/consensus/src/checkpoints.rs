//! Checkpoint agreement tracking.

use crate::state::FatalError;
use ordinal_core::{Actions, CheckpointStatus, Msg, PersistRequest};
use ordinal_types::{ConfigError, Digest, NetworkConfig, NodeId, SeqNo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tracks per-sequence checkpoint agreement.
///
/// The map is of bounded size: a checkpoint is kept while it is within the
/// watermarks, or while it is the highest checkpoint reported by some peer
/// and still stable locally.
pub struct CheckpointTracker {
    /// Highest checkpoint sequence reported by each peer.
    highest_checkpoint: BTreeMap<NodeId, SeqNo>,

    checkpoints: BTreeMap<SeqNo, Checkpoint>,

    network: Arc<NetworkConfig>,
    local_id: NodeId,
}

impl CheckpointTracker {
    /// Build a tracker seeded with checkpoints the host recovered from its
    /// log. The earliest supplied checkpoint anchors the watermark window
    /// and is treated as stable; an empty set is a configuration error.
    pub fn new(
        initial_checkpoints: &BTreeMap<SeqNo, Digest>,
        network: Arc<NetworkConfig>,
        local_id: NodeId,
    ) -> Result<Self, ConfigError> {
        if initial_checkpoints.is_empty() {
            return Err(ConfigError::EmptyInitialCheckpoints);
        }

        let mut tracker = Self {
            highest_checkpoint: BTreeMap::new(),
            checkpoints: BTreeMap::new(),
            network,
            local_id,
        };

        for (seq_no, value) in initial_checkpoints {
            let local_id = tracker.local_id;
            let cp = tracker.checkpoint(*seq_no);
            // Seeding our own value cannot disagree with a committed value
            // that does not exist yet, so this cannot fault.
            let _ = cp.apply_msg(local_id, value.clone());
        }

        // The earliest recovered checkpoint is network-agreed by construction:
        // the host only logs checkpoint entries it produced from delivered
        // commits.
        if let Some((_, earliest)) = tracker.checkpoints.iter_mut().next() {
            earliest.stable = true;
        }

        Ok(tracker)
    }

    fn checkpoint(&mut self, seq_no: SeqNo) -> &mut Checkpoint {
        let network = self.network.clone();
        let local_id = self.local_id;
        self.checkpoints
            .entry(seq_no)
            .or_insert_with(|| Checkpoint::new(seq_no, network, local_id))
    }

    /// Record a peer's checkpoint message. Returns whether the checkpoint
    /// changed state (became stable or obsolete).
    pub fn apply_checkpoint_msg(
        &mut self,
        source: NodeId,
        seq_no: SeqNo,
        value: Digest,
    ) -> Result<bool, FatalError> {
        let local_id = self.local_id;

        let highest = self.highest_checkpoint.entry(source).or_default();
        if seq_no > *highest {
            *highest = seq_no;
        }

        let cp = self.checkpoint(seq_no);
        let was_local = source == local_id;
        let changed = cp.apply_msg(source, value)?;
        if changed {
            debug!(
                %seq_no,
                stable = cp.stable,
                obsolete = cp.obsolete,
                local = was_local,
                "checkpoint state change"
            );
        }
        Ok(changed)
    }

    /// The host finished computing the local checkpoint value: broadcast it,
    /// log it, and record it as our own agreement.
    pub fn apply_checkpoint_result(
        &mut self,
        seq_no: SeqNo,
        value: Digest,
    ) -> Result<(Actions, bool), FatalError> {
        let mut actions = Actions::default();
        actions.send(Msg::Checkpoint {
            seq_no,
            value: value.clone(),
        });
        actions.persist.push(PersistRequest::CEntry {
            seq_no,
            value: value.clone(),
        });

        let changed = self.apply_checkpoint_msg(self.local_id, seq_no, value)?;
        Ok((actions, changed))
    }

    /// Whether the checkpoint at `seq_no` is known stable.
    pub fn is_stable(&self, seq_no: SeqNo) -> bool {
        self.checkpoints
            .get(&seq_no)
            .map(|cp| cp.stable)
            .unwrap_or(false)
    }

    /// Drop checkpoints below the new low watermark, retaining any that is
    /// still the highest stable checkpoint reported by some peer.
    pub fn truncate(&mut self, low_seq_no: SeqNo) {
        let highest = &self.highest_checkpoint;
        self.checkpoints.retain(|seq_no, cp| {
            *seq_no >= low_seq_no || (cp.stable && highest.values().any(|h| h == seq_no))
        });
    }

    /// Highest checkpoint sequence reported by `peer`, if any.
    pub fn highest_for(&self, peer: NodeId) -> Option<SeqNo> {
        self.highest_checkpoint.get(&peer).copied()
    }

    pub fn status(&self) -> Vec<CheckpointStatus> {
        self.checkpoints.values().map(Checkpoint::status).collect()
    }
}

/// Agreement state for one checkpoint sequence.
struct Checkpoint {
    seq_no: SeqNo,
    network: Arc<NetworkConfig>,
    local_id: NodeId,

    /// Per-value agreement sets.
    values: BTreeMap<Digest, Vec<NodeId>>,
    /// The value backed by a some-correct quorum, once reached.
    committed_value: Option<Digest>,
    /// The locally computed value, once known.
    my_value: Option<Digest>,
    stable: bool,
    obsolete: bool,
}

impl Checkpoint {
    fn new(seq_no: SeqNo, network: Arc<NetworkConfig>, local_id: NodeId) -> Self {
        Self {
            seq_no,
            network,
            local_id,
            values: BTreeMap::new(),
            committed_value: None,
            my_value: None,
            stable: false,
            obsolete: false,
        }
    }

    fn apply_msg(&mut self, source: NodeId, value: Digest) -> Result<bool, FatalError> {
        let mut state_change = false;

        let agreeing = self.values.entry(value.clone()).or_default();
        if agreeing.contains(&source) {
            return Ok(false);
        }
        agreeing.push(source);
        let agreements = agreeing.len();

        if agreements == self.network.some_correct_quorum() && self.committed_value.is_none() {
            self.committed_value = Some(value.clone());
        }

        if source == self.local_id {
            self.my_value = Some(value);
        }

        // Once both our own value and the network-committed value exist, they
        // must match bit-for-bit; anything else breaks the fault assumptions.
        if let (Some(my), Some(committed)) = (&self.my_value, &self.committed_value) {
            if !self.stable {
                if my != committed {
                    warn!(seq_no = %self.seq_no, "local checkpoint disagrees with committed value");
                    return Err(FatalError::CheckpointDisagreement {
                        seq_no: self.seq_no,
                    });
                }

                // >= rather than ==: our own agreement may arrive after the
                // network already crossed the quorum.
                let committed_agreements = self
                    .values
                    .get(committed)
                    .map(|nodes| nodes.len())
                    .unwrap_or(0);
                if committed_agreements >= self.network.intersection_quorum() {
                    self.stable = true;
                    state_change = true;
                    info!(seq_no = %self.seq_no, "checkpoint stable");
                }
            }
        }

        // Distinct voters, not votes: a Byzantine peer may vote for several
        // values, and obsolescence requires every node to have spoken.
        let distinct_voters: usize = {
            let mut voters: Vec<NodeId> = self.values.values().flatten().copied().collect();
            voters.sort_unstable();
            voters.dedup();
            voters.len()
        };
        if distinct_voters == self.network.node_count() && !self.obsolete {
            self.obsolete = true;
            state_change = true;
        }

        Ok(state_change)
    }

    fn status(&self) -> CheckpointStatus {
        let max_agreements = self.values.values().map(Vec::len).max().unwrap_or(0);
        CheckpointStatus {
            seq_no: self.seq_no,
            max_agreements,
            net_quorum: self.committed_value.is_some(),
            local_decision: self.my_value.is_some(),
            stable: self.stable,
        }
    }
}
