//! Message, action and status types for the ordinal core.
//!
//! The consensus state machine is built on a simple event-driven model:
//!
//! ```text
//! inputs (propose / step / tick / results) → StateMachine → Actions
//! ```
//!
//! The state machine is:
//! - **Synchronous**: no async, no I/O
//! - **Deterministic**: same state + input = same actions
//! - **Pure-ish**: mutates itself, but delegates hashing, validation,
//!   persistence and transport to the host via [`Actions`]
//!
//! The host executes each [`Actions`] record and feeds the outcomes back as
//! [`ActionResults`]. This crate defines that boundary; the machine itself
//! lives in `ordinal-consensus`.

mod action;
mod message;
mod status;

pub use action::{
    ActionResults, Actions, CheckpointResult, CommitEntry, HashOrigin, HashRequest, HashResult,
    PersistAck, PersistId, PersistRequest, Unicast, ValidateRequest, ValidateResult,
};
pub use message::{Msg, MsgKind};
pub use status::{
    BucketStatus, CheckpointStatus, NodeBucketStatus, NodeStatus, RequestWindowStatus, Status,
};
