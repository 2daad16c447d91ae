use crate::serializer::SerializationError;
use crate::transport::TransportError;

use thiserror::Error as ThisError;

/// Errors surfaced to callers of the messaging client.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A caller-supplied argument was invalid.
    #[error("invalid argument: {0}")]
    Argument(String),

    /// The operation was attempted after shutdown began, or a waiting
    /// request was cancelled because the client is shutting down.
    #[error("client is shutting down")]
    ShuttingDown,

    /// A request did not receive a response before its deadline.
    #[error("request timed out")]
    Timeout,

    /// A response arrived but could not be processed.
    #[error("response processing failed: {0}")]
    Processing(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The transport layer reported a failure.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A caller-supplied value could not be serialized.
    #[error(transparent)]
    Serialization(#[from] SerializationError),
}
