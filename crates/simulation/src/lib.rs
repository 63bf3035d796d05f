//! Deterministic simulation of an ordinal cluster.
//!
//! The harness owns N state machines and plays host for all of them:
//! it hashes (sha256), validates, persists and routes messages, feeding
//! every action's outcome back into the originating machine as the real
//! host would. Event delivery order is deterministic for a given seed, so
//! two runs with the same seed produce identical commit streams — and runs
//! with different seeds must produce identical *logs*, which is exactly the
//! agreement property the tests lean on.

mod harness;

pub use harness::{Cluster, ClusterConfig, ClusterStats};
