//! Byzantine fault tolerant total-ordering state machine.
//!
//! This crate implements the deterministic core of the protocol as a
//! synchronous, event-driven model. Given N replicas of which at most F are
//! Byzantine (N ≥ 3F+1), it totally orders client requests and produces a
//! stable commit sequence plus periodic checkpoints.
//!
//! # Architecture
//!
//! The [`StateMachine`] consumes inputs and returns [`ordinal_core::Actions`]:
//!
//! - `propose(data)` → a hash request for the local client's next request
//! - `step(source, msg)` → admission through the per-peer gate, then routing
//!   to the active epoch, the checkpoint tracker or the request pool
//! - `apply(results)` → resumption of slots and checkpoints on completed
//!   hashing, validation and persistence
//! - `tick()` → idempotent re-emission of outstanding work
//!
//! All I/O is performed by the host; the machine only requests it. The only
//! error that escapes the event loop is a [`FatalError`] — a violation of
//! the Byzantine fault assumptions — after which the machine is permanently
//! halted.
//!
//! # Sequence slots and buckets
//!
//! The sequence space is striped across B buckets (`bucket(s) = s mod B`),
//! each with a fixed leader per epoch, so independent leaders order disjoint
//! sequence columns in parallel. Each in-window sequence owns a slot that
//! walks the three-phase protocol: preprepare (leader proposes a batch),
//! prepare (an intersection quorum vouches for the digest), commit (an
//! intersection quorum prepared). Committed slots are delivered to the host
//! in strict sequence order: a committed slot is withheld until every lower
//! slot in the epoch has been delivered, so the commit stream never has a
//! gap.
//!
//! # Checkpoints and watermarks
//!
//! Every K sequences the host computes an application-state value; once a
//! some-correct quorum agrees on the value and an intersection quorum of
//! agreement accumulates, the checkpoint is stable and the watermark window
//! slides forward, garbage-collecting everything below it.

mod checkpoints;
mod epoch;
mod nodemsgs;
mod requests;
mod sequence;
mod state;

pub use checkpoints::CheckpointTracker;
pub use epoch::ActiveEpoch;
pub use nodemsgs::{Admission, DropReason, NodeMsgs};
pub use requests::{PoolUpdate, ReadyRequest, RequestPool};
pub use sequence::Sequence;
pub use state::{FatalError, StateMachine, StateMachineError};
