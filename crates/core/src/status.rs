//! Structured status snapshot.
//!
//! The snapshot is plain data assembled by the state machine for the host's
//! observability; nothing in the protocol consumes it. The `Display` impl is
//! the only formatting in the workspace — a fixed-width grid of the watermark
//! window with one column per in-window sequence.

use ordinal_types::{ClientId, EpochNo, NodeId, ReqNo, SeqNo, SequenceState};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Snapshot of one replica's protocol state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub node_id: NodeId,
    pub low_watermark: SeqNo,
    pub high_watermark: SeqNo,
    /// The installed epoch; `None` before the collaborator activates one.
    /// After a terminal fault this keeps reporting the epoch that was active
    /// at the fault.
    pub active_epoch: Option<EpochNo>,
    pub nodes: Vec<NodeStatus>,
    pub buckets: Vec<BucketStatus>,
    pub checkpoints: Vec<CheckpointStatus>,
    pub request_windows: Vec<RequestWindowStatus>,
}

/// Per-peer progress and admission counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub bucket_statuses: Vec<NodeBucketStatus>,
    /// Highest checkpoint sequence observed from this peer.
    pub last_checkpoint: SeqNo,
    pub admitted: u64,
    pub rejected: u64,
    /// Times this peer was suspected (failed validations it led, conflicting
    /// votes it cast).
    pub suspicions: u64,
}

/// A peer's progress within one bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeBucketStatus {
    pub bucket_id: u64,
    pub is_leader: bool,
    pub last_prepare: SeqNo,
    pub last_commit: SeqNo,
}

/// The local view of one bucket's sequence column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketStatus {
    pub id: u64,
    /// Whether the local node leads this bucket.
    pub leader: bool,
    /// Slot states for the bucket's in-window sequences, ascending.
    pub sequences: Vec<(SeqNo, SequenceState)>,
}

/// Agreement progress of one tracked checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointStatus {
    pub seq_no: SeqNo,
    /// Size of the largest per-value agreement set.
    pub max_agreements: usize,
    /// A some-correct quorum agreed on a value.
    pub net_quorum: bool,
    /// The local value is known.
    pub local_decision: bool,
    pub stable: bool,
}

/// Progress of one client's request window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestWindowStatus {
    pub client_id: ClientId,
    pub low_req_no: ReqNo,
    pub high_req_no: ReqNo,
    /// Request numbers proven correct by a some-correct quorum of acks.
    pub correct: Vec<ReqNo>,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "===========================================")?;
        write!(
            f,
            "NodeID={}, LowWatermark={}, HighWatermark={}",
            self.node_id.0, self.low_watermark, self.high_watermark
        )?;
        match self.active_epoch {
            Some(epoch) => writeln!(f, ", Epoch={}", epoch.0)?,
            None => writeln!(f, ", Epoch=<none>")?,
        }
        writeln!(f, "===========================================")?;

        if self.low_watermark == self.high_watermark {
            writeln!(f, "=== Empty Watermarks ===")?;
            return Ok(());
        }
        if self.high_watermark.0 - self.low_watermark.0 > 10_000 {
            writeln!(
                f,
                "=== Suspiciously wide watermarks [{}, {}] ===",
                self.low_watermark, self.high_watermark
            )?;
            return Ok(());
        }

        let columns: Vec<u64> = (self.low_watermark.0 + 1..=self.high_watermark.0).collect();
        let rule = "--".repeat(columns.len() + 1);

        // Sequence numbers, one digit row per decimal magnitude.
        let digits = self.high_watermark.0.to_string().len() as u32;
        for i in (0..digits).rev() {
            let magnitude = 10u64.pow(i);
            for seq in &columns {
                write!(f, " {}", seq / magnitude % 10)?;
            }
            writeln!(f)?;
        }

        for node in &self.nodes {
            writeln!(f, "{rule}")?;
            writeln!(f, "=== Node {} ===", node.id.0)?;
            for bucket in &node.bucket_statuses {
                for seq in &columns {
                    let mark = if *seq == node.last_checkpoint.0 {
                        'X'
                    } else if *seq == bucket.last_commit.0 {
                        'C'
                    } else if *seq == bucket.last_prepare.0 {
                        'P'
                    } else {
                        ' '
                    };
                    write!(f, "|{mark}")?;
                }
                if bucket.is_leader {
                    writeln!(f, "| Bucket={} (Leader)", bucket.bucket_id)?;
                } else {
                    writeln!(f, "| Bucket={}", bucket.bucket_id)?;
                }
            }
        }

        writeln!(f, "{rule}")?;
        writeln!(f, "=== Buckets ===")?;
        for bucket in &self.buckets {
            for seq in &columns {
                let mark = bucket
                    .sequences
                    .iter()
                    .find(|(s, _)| s.0 == *seq)
                    .map(|(_, state)| state.marker())
                    .unwrap_or(' ');
                write!(f, "|{mark}")?;
            }
            if bucket.leader {
                writeln!(f, "| Bucket={} (LocalLeader)", bucket.id)?;
            } else {
                writeln!(f, "| Bucket={}", bucket.id)?;
            }
        }

        writeln!(f, "{rule}")?;
        writeln!(f, "=== Checkpoints ===")?;
        for cp in &self.checkpoints {
            let state = match (cp.net_quorum, cp.local_decision) {
                (true, false) => "network",
                (true, true) => {
                    if cp.stable {
                        "stable"
                    } else {
                        "agreed"
                    }
                }
                (false, true) => "local",
                (false, false) => "pending",
            };
            writeln!(
                f,
                "| SeqNo={} MaxAgreements={} ({state})",
                cp.seq_no, cp.max_agreements
            )?;
        }

        writeln!(f, "{rule}")?;
        writeln!(f, "=== Request Windows ===")?;
        for window in &self.request_windows {
            writeln!(
                f,
                "Client {} L/H {}/{} : {:?}",
                window.client_id,
                window.low_req_no,
                window.high_req_no,
                window.correct.iter().map(|r| r.0).collect::<Vec<_>>()
            )?;
        }

        Ok(())
    }
}
