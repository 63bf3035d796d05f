//! Host-facing event loop for the ordering core.
//!
//! The state machine in `ordinal-consensus` is synchronous and
//! single-threaded; this crate wraps it in a [`Serializer`] that funnels the
//! host's concurrent input streams (proposals, inbound messages, timer
//! ticks, completed action results) through one event at a time and hands
//! the accumulated [`ordinal_core::Actions`] back, one record per event
//! cycle.
//!
//! The host may run unbounded parallel hashing, validation and persistence
//! workers; their results re-enter the loop through the results channel and
//! are serialized like every other input.

mod serializer;

pub use serializer::{Serializer, SerializerHandle};
