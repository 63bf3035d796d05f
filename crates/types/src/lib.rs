//! Core types for the ordinal total-ordering protocol.
//!
//! This crate provides the foundational types used throughout the
//! implementation:
//!
//! - **Identifiers**: NodeId, SeqNo, EpochNo, BucketId, client identities
//! - **Opaque values**: Digest (host-produced hashes and checkpoint values)
//! - **Requests**: Request bodies and request acknowledgements
//! - **Configuration**: local and network configuration, quorum math
//!
//! # Design Philosophy
//!
//! This crate is self-contained and depends on no other workspace crates,
//! making it the foundation layer. All types are plain data; the protocol
//! logic lives in `ordinal-consensus`.

mod config;
mod digest;
mod ids;
mod request;

pub use config::{
    BatchParameters, Config, ConfigError, EpochConfig, NetworkConfig, StableCheckpoint,
};
pub use digest::Digest;
pub use ids::{BucketId, ClientId, EpochNo, NodeId, ReqNo, SeqNo};
pub use request::{Request, RequestAck};

use serde::{Deserialize, Serialize};

/// Lifecycle of a single sequence slot.
///
/// A slot progresses monotonically through these states; there is no
/// regression within the slot's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SequenceState {
    /// No slot exists yet.
    Uninitialized,
    /// The slot was created within the watermark window.
    Allocated,
    /// A preprepare was accepted but referenced requests are not all
    /// available locally, or the batch digest has not been computed.
    PendingRequests,
    /// The batch digest is bound and the q-entry was issued for persistence.
    Preprepared,
    /// An intersection quorum of prepares (including our own) matched the
    /// bound digest and the p-entry was issued.
    Prepared,
    /// An intersection quorum of commits matched the bound digest.
    Committed,
}

impl SequenceState {
    /// Single-character marker used by the status renderer.
    pub fn marker(&self) -> char {
        match self {
            SequenceState::Uninitialized => ' ',
            SequenceState::Allocated => 'A',
            SequenceState::PendingRequests => 'F',
            SequenceState::Preprepared => 'Q',
            SequenceState::Prepared => 'P',
            SequenceState::Committed => 'C',
        }
    }
}
