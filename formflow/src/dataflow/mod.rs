//! Core dataflow primitives
//!
//! - **[`Relay`]** - Type-safe event streaming using simple channels
//! - **[`DroppableTask`]** - Spawned loop that stops when its owner is dropped
//!
//! The store owns one dispatcher loop fed by a relay; everything that reacts to a
//! value change is started from that loop, never from inside `set_value` itself.

pub mod relay;
pub mod task;

pub use relay::{Relay, relay};
pub use task::DroppableTask;
