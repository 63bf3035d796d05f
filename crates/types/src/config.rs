//! Local and network configuration.

use crate::{ClientId, Digest, NodeId, SeqNo};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors detected while validating configuration at construction time.
///
/// The state machine refuses to start on any of these.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("node set is empty")]
    EmptyNodeSet,

    #[error("{n} nodes cannot tolerate {f} faults, need at least {min}", min = 3 * .f + 1)]
    InsufficientNodes { n: u64, f: u64 },

    #[error("node set must be exactly 0..N-1 without duplicates")]
    InconsistentNodeSet,

    #[error("checkpoint interval must be positive")]
    ZeroCheckpointInterval,

    #[error("bucket count must be positive")]
    ZeroBuckets,

    #[error("watermark width {width} must be a positive multiple of the checkpoint interval {interval}")]
    InvalidWatermarkWidth { width: u64, interval: u64 },

    #[error("max epoch length must be positive")]
    ZeroEpochLength,

    #[error("epoch {epoch} declares {actual} leaders, expected one per bucket ({expected})")]
    LeaderCount {
        epoch: u64,
        expected: u64,
        actual: u64,
    },

    #[error("epoch {epoch} assigns leadership to unknown {leader}")]
    UnknownLeader { epoch: u64, leader: NodeId },

    #[error("local {id} is not a member of the node set")]
    UnknownLocalNode { id: NodeId },

    #[error("initial checkpoint set is empty")]
    EmptyInitialCheckpoints,
}

/// Static network parameters, immutable within an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Participating replicas, `0..N-1`.
    pub nodes: Vec<NodeId>,
    /// Maximum number of Byzantine faults tolerated.
    pub f: u64,
    /// Sequences between checkpoints (K).
    pub checkpoint_interval: u64,
    /// Number of buckets the sequence space is partitioned into (B).
    pub number_of_buckets: u64,
    /// Upper bound on sequences ordered within a single epoch.
    pub max_epoch_length: u64,
    /// Width of the watermark window, a multiple of the checkpoint interval.
    pub watermark_width: u64,
}

impl NetworkConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.nodes.is_empty() {
            return Err(ConfigError::EmptyNodeSet);
        }
        let n = self.nodes.len() as u64;
        if n < 3 * self.f + 1 {
            return Err(ConfigError::InsufficientNodes { n, f: self.f });
        }
        let mut sorted: Vec<u64> = self.nodes.iter().map(|id| id.0).collect();
        sorted.sort_unstable();
        if sorted.iter().enumerate().any(|(i, id)| *id != i as u64) {
            return Err(ConfigError::InconsistentNodeSet);
        }
        if self.checkpoint_interval == 0 {
            return Err(ConfigError::ZeroCheckpointInterval);
        }
        if self.number_of_buckets == 0 {
            return Err(ConfigError::ZeroBuckets);
        }
        if self.watermark_width == 0 || self.watermark_width % self.checkpoint_interval != 0 {
            return Err(ConfigError::InvalidWatermarkWidth {
                width: self.watermark_width,
                interval: self.checkpoint_interval,
            });
        }
        if self.max_epoch_length == 0 {
            return Err(ConfigError::ZeroEpochLength);
        }
        Ok(())
    }

    /// Total number of replicas.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// F+1: any such set contains at least one honest replica.
    pub fn some_correct_quorum(&self) -> usize {
        (self.f + 1) as usize
    }

    /// ceil((N+F+1)/2): any two such sets share an honest replica. Equals
    /// 2F+1 when N = 3F+1.
    pub fn intersection_quorum(&self) -> usize {
        let n = self.nodes.len() as u64;
        ((n + self.f + 2) / 2) as usize
    }
}

/// Batch cutting parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchParameters {
    /// A leader cuts a batch once the pending payload bytes for one of its
    /// buckets reach this size.
    pub cut_size_bytes: usize,
}

/// Local replica configuration, provided by the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// This replica's identity.
    pub id: NodeId,
    /// Identity of the client whose proposals are attributed locally.
    pub client_id: ClientId,
    pub batch_parameters: BatchParameters,
    /// Channel capacity used by the serializer.
    pub buffer_size: usize,
}

/// A checkpoint the network has already agreed on, anchoring an epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StableCheckpoint {
    pub seq_no: SeqNo,
    pub value: Digest,
}

/// Leader assignment for one epoch, supplied by the epoch-change
/// collaborator. `leaders[b]` leads bucket `b`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochConfig {
    pub number: crate::EpochNo,
    pub leaders: Vec<NodeId>,
    pub starting_checkpoint: StableCheckpoint,
}

impl EpochConfig {
    pub fn validate(&self, network: &NetworkConfig) -> Result<(), ConfigError> {
        if self.leaders.len() as u64 != network.number_of_buckets {
            return Err(ConfigError::LeaderCount {
                epoch: self.number.0,
                expected: network.number_of_buckets,
                actual: self.leaders.len() as u64,
            });
        }
        for leader in &self.leaders {
            if !network.nodes.contains(leader) {
                return Err(ConfigError::UnknownLeader {
                    epoch: self.number.0,
                    leader: *leader,
                });
            }
        }
        Ok(())
    }

    /// Leader of the bucket owning `seq_no`.
    pub fn leader_of(&self, seq_no: SeqNo, network: &NetworkConfig) -> NodeId {
        self.leaders[seq_no.bucket(network.number_of_buckets).0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn network(n: u64, f: u64) -> NetworkConfig {
        NetworkConfig {
            nodes: (0..n).map(NodeId).collect(),
            f,
            checkpoint_interval: 5,
            number_of_buckets: 1,
            max_epoch_length: 200,
            watermark_width: 20,
        }
    }

    #[test]
    fn quorum_sizes() {
        let c = network(1, 0);
        assert_eq!(c.some_correct_quorum(), 1);
        assert_eq!(c.intersection_quorum(), 1);

        let c = network(4, 1);
        assert_eq!(c.some_correct_quorum(), 2);
        assert_eq!(c.intersection_quorum(), 3);

        let c = network(7, 2);
        assert_eq!(c.some_correct_quorum(), 3);
        assert_eq!(c.intersection_quorum(), 5);

        // N > 3F+1: the intersection quorum grows with N.
        let c = network(5, 1);
        assert_eq!(c.intersection_quorum(), 4);
    }

    #[test]
    fn rejects_too_few_nodes() {
        let c = network(3, 1);
        assert_eq!(
            c.validate(),
            Err(ConfigError::InsufficientNodes { n: 3, f: 1 })
        );
    }

    #[test]
    fn rejects_inconsistent_node_set() {
        let mut c = network(4, 1);
        c.nodes[2] = NodeId(9);
        assert_eq!(c.validate(), Err(ConfigError::InconsistentNodeSet));
    }

    #[test]
    fn rejects_misaligned_watermark_width() {
        let mut c = network(4, 1);
        c.watermark_width = 7;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::InvalidWatermarkWidth { .. })
        ));
    }

    #[test]
    fn epoch_leader_table_is_checked() {
        let mut net = network(4, 1);
        net.number_of_buckets = 4;
        let epoch = EpochConfig {
            number: crate::EpochNo(2),
            leaders: vec![NodeId(0), NodeId(1)],
            starting_checkpoint: StableCheckpoint::default(),
        };
        assert!(matches!(
            epoch.validate(&net),
            Err(ConfigError::LeaderCount { .. })
        ));

        let epoch = EpochConfig {
            number: crate::EpochNo(2),
            leaders: vec![NodeId(0), NodeId(1), NodeId(2), NodeId(7)],
            starting_checkpoint: StableCheckpoint::default(),
        };
        assert!(matches!(
            epoch.validate(&net),
            Err(ConfigError::UnknownLeader { .. })
        ));
    }

    #[test]
    fn leader_routing_follows_buckets() {
        let mut net = network(4, 1);
        net.number_of_buckets = 4;
        let epoch = EpochConfig {
            number: crate::EpochNo(2),
            leaders: vec![NodeId(0), NodeId(1), NodeId(3), NodeId(2)],
            starting_checkpoint: StableCheckpoint::default(),
        };
        assert_eq!(epoch.leader_of(SeqNo(2), &net), NodeId(3));
        assert_eq!(epoch.leader_of(SeqNo(6), &net), NodeId(3));
        assert_eq!(epoch.leader_of(SeqNo(4), &net), NodeId(0));
    }
}
