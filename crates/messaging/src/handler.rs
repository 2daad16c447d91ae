use crate::ack::Acker;
use crate::serializer::{SerializationError, Serializer};
use crate::type_name::{MessageType, wire_type_name};

use std::any::Any;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;

/// Handles messages of a single schema. The client acknowledges the
/// message itself: accepted on `Ok`, rejected for delayed redelivery on
/// `Err`.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static
where
    T: MessageType,
{
    /// The error type for the handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handles one message.
    async fn handle(&self, message: T) -> Result<(), Self::Error>;
}

/// Handles messages of a single schema with explicit acknowledgement
/// control.
#[async_trait]
pub trait AckMessageHandler<T>: Send + Sync + 'static
where
    T: MessageType,
{
    /// The error type for the handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handles one message. The acker commits or rejects the delivery;
    /// if the handler returns `Err` without having used it, the client
    /// rejects the message for delayed redelivery.
    async fn handle(&self, message: T, acker: Acker) -> Result<(), Self::Error>;
}

/// Handles messages of several schemas delivered on one destination.
#[async_trait]
pub trait MultiHandler: Send + Sync + 'static {
    /// The error type for the handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handles a message decoded through the known-types registry.
    /// Downcast to the expected schema types.
    async fn handle(&self, message: Box<dyn Any + Send>, acker: Acker)
    -> Result<(), Self::Error>;

    /// Called for messages whose wire-type name is not in the registry.
    /// Acknowledgement is the handler's responsibility here; errors are
    /// logged and swallowed.
    async fn handle_unknown(&self, wire_type: &str, acker: Acker) -> Result<(), Self::Error>;
}

/// Serves requests of one schema, producing a typed response.
#[async_trait]
pub trait ServiceHandler<Req>: Send + Sync + 'static
where
    Req: MessageType,
{
    /// The response type sent back to the requester.
    type Response: MessageType;

    /// The error type for the handler.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Handles one request.
    async fn handle(&self, request: Req) -> Result<Self::Response, Self::Error>;
}

type Decoder<S> = fn(&S, &str, &[u8]) -> Result<Box<dyn Any + Send>, SerializationError>;

fn decode_erased<T, S>(
    serializer: &S,
    format: &str,
    payload: &[u8],
) -> Result<Box<dyn Any + Send>, SerializationError>
where
    T: MessageType,
    S: Serializer,
{
    serializer
        .deserialize::<T>(format, payload)
        .map(|value| Box::new(value) as Box<dyn Any + Send>)
}

/// The schemas a multi-schema subscription can decode, keyed by
/// wire-type name.
pub struct KnownTypes<S> {
    decoders: HashMap<Arc<str>, Decoder<S>>,
}

impl<S: Serializer> KnownTypes<S> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            decoders: HashMap::new(),
        }
    }

    /// Adds `T` to the registry under its wire-type name.
    #[must_use]
    pub fn with<T: MessageType>(mut self) -> Self {
        self.decoders
            .insert(wire_type_name::<T>(), decode_erased::<T, S>);
        self
    }

    /// Whether the registry can decode the given wire-type name.
    #[must_use]
    pub fn contains(&self, wire_type: &str) -> bool {
        self.decoders.contains_key(wire_type)
    }

    pub(crate) fn decode(
        &self,
        wire_type: &str,
        serializer: &S,
        format: &str,
        payload: &[u8],
    ) -> Option<Result<Box<dyn Any + Send>, SerializationError>> {
        self.decoders
            .get(wire_type)
            .map(|decode| decode(serializer, format, payload))
    }
}

impl<S: Serializer> Default for KnownTypes<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Clone for KnownTypes<S> {
    fn clone(&self) -> Self {
        Self {
            decoders: self.decoders.clone(),
        }
    }
}

impl<S> Debug for KnownTypes<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KnownTypes")
            .field("wire_types", &self.decoders.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::serializer::{FORMAT_JSON, FormatSerializer};

    use serde::{Deserialize, Serialize};

    #[derive(Debug, Deserialize, PartialEq, Serialize)]
    struct Ping {
        seq: u32,
    }

    impl MessageType for Ping {}

    #[test]
    fn decodes_registered_schema() {
        let known = KnownTypes::<FormatSerializer>::new().with::<Ping>();
        let serializer = FormatSerializer::new();
        let payload = serializer.serialize(FORMAT_JSON, &Ping { seq: 3 }).unwrap();

        let decoded = known
            .decode("Ping", &serializer, FORMAT_JSON, &payload)
            .expect("schema should be known")
            .expect("payload should decode");
        assert_eq!(decoded.downcast::<Ping>().unwrap().seq, 3);
    }

    #[test]
    fn unknown_wire_type_is_none() {
        let known = KnownTypes::<FormatSerializer>::new().with::<Ping>();
        let serializer = FormatSerializer::new();
        assert!(
            known
                .decode("Pong", &serializer, FORMAT_JSON, b"{}")
                .is_none()
        );
    }
}
