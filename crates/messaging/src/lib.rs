//! Transport-agnostic messaging client for typed send, subscribe and
//! request/reply over pluggable broker transports.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

/// Acknowledgement delegate and the deferred-ack scheduler behind it.
pub mod ack;

/// The messaging client facade.
pub mod client;

/// Client configuration.
pub mod config;

/// Explicit event-dispatch registry for bounded-context consumers.
pub mod dispatch;

/// Endpoints address destinations on a named transport.
pub mod endpoint;

/// Error types surfaced to callers.
pub mod error;

/// Handler traits implemented by message consumers.
pub mod handler;

mod operations;
mod registry;
mod tracker;

/// Format-keyed serialization of application messages.
pub mod serializer;

/// Contracts presented by the transport layer.
pub mod transport;

/// Wire-type name resolution for application message types.
pub mod type_name;

pub use client::MessagingClient;
pub use config::ClientConfig;
pub use endpoint::Endpoint;
pub use error::Error;

use bytes::Bytes;

/// A message as it travels through a transport: an opaque payload plus the
/// wire-type name identifying its schema.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BinaryMessage {
    /// Serialized payload bytes.
    pub payload: Bytes,

    /// Wire-type name of the payload schema.
    pub wire_type: String,
}

impl BinaryMessage {
    /// Creates a new binary message.
    #[must_use]
    pub fn new(payload: Bytes, wire_type: impl Into<String>) -> Self {
        Self {
            payload,
            wire_type: wire_type.into(),
        }
    }
}
