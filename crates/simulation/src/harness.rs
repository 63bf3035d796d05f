//! The cluster harness.

use ordinal_consensus::{FatalError, StateMachine};
use ordinal_core::{
    ActionResults, Actions, CheckpointResult, CommitEntry, HashResult, Msg, PersistAck, Status,
    ValidateResult,
};
use ordinal_types::{
    BatchParameters, ClientId, Config, Digest, EpochConfig, NetworkConfig, NodeId, SeqNo,
};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use sha2::{Digest as _, Sha256};
use std::collections::{BTreeMap, VecDeque};
use tracing::{debug, warn};

/// Shape of the simulated network.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub nodes: u64,
    pub f: u64,
    pub checkpoint_interval: u64,
    pub number_of_buckets: u64,
    pub watermark_width: u64,
    pub max_epoch_length: u64,
    pub cut_size_bytes: usize,
    /// Deliver queued events in seeded-random order instead of FIFO.
    pub shuffle: bool,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            nodes: 4,
            f: 1,
            checkpoint_interval: 5,
            number_of_buckets: 1,
            watermark_width: 10,
            max_epoch_length: 1000,
            cut_size_bytes: 1,
            shuffle: false,
        }
    }
}

/// Counters collected while driving the cluster.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClusterStats {
    pub events_processed: u64,
    pub messages_sent: u64,
    pub hash_requests: u64,
    pub persist_requests: u64,
    pub validate_requests: u64,
    pub commits_delivered: u64,
}

enum Event {
    Deliver {
        to: NodeId,
        from: NodeId,
        msg: Msg,
    },
    Complete {
        to: NodeId,
        results: ActionResults,
    },
}

/// N replicas plus the host services they delegate to.
///
/// Broadcasts loop back to the sender, hashing is real (sha256), validation
/// always succeeds, and persistence acks immediately — the harness is the
/// well-behaved host; Byzantine behavior is injected by tests through
/// hand-crafted messages.
pub struct Cluster {
    machines: Vec<StateMachine>,
    queue: VecDeque<Event>,
    delivered: Vec<Vec<CommitEntry>>,
    halted: Vec<Option<FatalError>>,
    rng: ChaCha8Rng,
    shuffle: bool,
    nodes: u64,
    stats: ClusterStats,
}

impl Cluster {
    pub fn new(config: ClusterConfig, seed: u64) -> Self {
        let network = NetworkConfig {
            nodes: (0..config.nodes).map(NodeId).collect(),
            f: config.f,
            checkpoint_interval: config.checkpoint_interval,
            number_of_buckets: config.number_of_buckets,
            max_epoch_length: config.max_epoch_length,
            watermark_width: config.watermark_width,
        };
        let initial = BTreeMap::from([(SeqNo(0), Digest::default())]);

        let machines = (0..config.nodes)
            .map(|id| {
                let local = Config {
                    id: NodeId(id),
                    // Every replica fronts the same logical client, the way
                    // a client library submits to the whole network.
                    client_id: ClientId::from("client-1"),
                    batch_parameters: BatchParameters {
                        cut_size_bytes: config.cut_size_bytes,
                    },
                    buffer_size: 64,
                };
                StateMachine::new(network.clone(), local, &initial)
                    .expect("cluster configuration must be valid")
            })
            .collect();

        Self {
            machines,
            queue: VecDeque::new(),
            delivered: (0..config.nodes).map(|_| Vec::new()).collect(),
            halted: (0..config.nodes).map(|_| None).collect(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            shuffle: config.shuffle,
            nodes: config.nodes,
            stats: ClusterStats::default(),
        }
    }

    /// Install the same active epoch on every replica.
    pub fn install_epoch(&mut self, epoch: EpochConfig) {
        for id in 0..self.nodes {
            let actions = self.machines[id as usize]
                .set_active_epoch(epoch.clone())
                .expect("epoch installation");
            self.execute(NodeId(id), actions);
        }
    }

    /// Submit a proposal to one replica.
    pub fn propose(&mut self, node: NodeId, data: Vec<u8>) {
        if self.halted[node.0 as usize].is_some() {
            return;
        }
        match self.machines[node.0 as usize].propose(data) {
            Ok(actions) => self.execute(node, actions),
            Err(err) => self.note_halt(node, err),
        }
    }

    /// Submit a proposal to every replica, as a broadcasting client would.
    pub fn submit(&mut self, data: Vec<u8>) {
        for id in 0..self.nodes {
            self.propose(NodeId(id), data.clone());
        }
    }

    /// Drain the event queue. Returns the number of events processed; the
    /// step cap guards against runaway loops.
    pub fn run(&mut self) -> u64 {
        let mut processed = 0u64;
        while processed < 1_000_000 {
            let Some(event) = self.pop_event() else {
                break;
            };
            processed += 1;
            self.stats.events_processed += 1;
            self.dispatch(event);
        }
        processed
    }

    fn pop_event(&mut self) -> Option<Event> {
        if self.queue.is_empty() {
            return None;
        }
        if self.shuffle {
            let idx = self.rng.gen_range(0..self.queue.len());
            self.queue.remove(idx)
        } else {
            self.queue.pop_front()
        }
    }

    fn dispatch(&mut self, event: Event) {
        let (node, result) = match event {
            Event::Deliver { to, from, msg } => {
                if self.halted[to.0 as usize].is_some() {
                    return;
                }
                (to, self.machines[to.0 as usize].step(from, msg))
            }
            Event::Complete { to, results } => {
                if self.halted[to.0 as usize].is_some() {
                    return;
                }
                (to, self.machines[to.0 as usize].apply(results))
            }
        };
        match result {
            Ok(actions) => self.execute(node, actions),
            Err(err) => self.note_halt(node, err),
        }
    }

    fn note_halt(&mut self, node: NodeId, err: FatalError) {
        warn!(%node, %err, "replica halted");
        self.halted[node.0 as usize] = Some(err);
    }

    /// Play host for one actions record.
    fn execute(&mut self, node: NodeId, actions: Actions) {
        let Actions {
            broadcast,
            unicast,
            hash,
            validate,
            persist,
            commits,
        } = actions;

        for msg in broadcast {
            // Broadcast includes the sender; the loopback carries its own
            // votes back into the machine.
            for to in 0..self.nodes {
                self.stats.messages_sent += 1;
                self.queue.push_back(Event::Deliver {
                    to: NodeId(to),
                    from: node,
                    msg: msg.clone(),
                });
            }
        }
        for unicast in unicast {
            self.stats.messages_sent += 1;
            self.queue.push_back(Event::Deliver {
                to: unicast.target,
                from: node,
                msg: unicast.msg,
            });
        }

        let mut results = ActionResults::default();
        for request in hash {
            self.stats.hash_requests += 1;
            let mut hasher = Sha256::new();
            for chunk in &request.data {
                hasher.update(chunk);
            }
            results.hashes.push(HashResult {
                digest: Digest::from(hasher.finalize().to_vec()),
                origin: request.origin,
            });
        }
        for request in validate {
            self.stats.validate_requests += 1;
            results.validations.push(ValidateResult {
                epoch: request.epoch,
                seq_no: request.seq_no,
                valid: true,
            });
        }
        for request in persist {
            self.stats.persist_requests += 1;
            results.persisted.push(PersistAck { id: request.id() });
        }

        for entry in commits {
            self.stats.commits_delivered += 1;
            debug!(%node, seq_no = %entry.seq_no, "commit delivered");
            if entry.checkpoint {
                results.checkpoints.push(CheckpointResult {
                    seq_no: entry.seq_no,
                    value: checkpoint_value(&entry),
                });
            }
            self.delivered[node.0 as usize].push(entry);
        }

        if !results.is_empty() {
            self.queue.push_back(Event::Complete { to: node, results });
        }
    }

    pub fn delivered(&self, node: NodeId) -> &[CommitEntry] {
        &self.delivered[node.0 as usize]
    }

    pub fn halted(&self, node: NodeId) -> Option<&FatalError> {
        self.halted[node.0 as usize].as_ref()
    }

    pub fn status(&self, node: NodeId) -> Status {
        self.machines[node.0 as usize].status()
    }

    pub fn stats(&self) -> &ClusterStats {
        &self.stats
    }

    pub fn node_count(&self) -> u64 {
        self.nodes
    }
}

/// The application-state value at a checkpoint: a digest over the committed
/// batch identity. Identical across honest replicas by agreement.
fn checkpoint_value(entry: &CommitEntry) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(b"checkpoint");
    hasher.update(entry.seq_no.0.to_le_bytes());
    hasher.update(entry.digest.as_bytes());
    Digest::from(hasher.finalize().to_vec())
}
