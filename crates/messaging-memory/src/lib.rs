//! In-memory loopback implementation of the relay messaging transport
//! contracts, used as the reference transport and in tests. Each
//! [`MemoryTransportManager`] is an isolated universe: destinations,
//! subscriptions and correlators are not shared between instances.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

mod group;
mod manager;

pub use group::MemoryProcessingGroup;
pub use manager::{AckRecord, MemoryTransportManager};
