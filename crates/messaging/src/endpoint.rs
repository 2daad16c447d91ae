use crate::error::Error;

/// Addresses a destination on a named transport, together with the
/// serialization format used for messages exchanged with it.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Endpoint {
    transport_id: String,
    destination: String,
    format: String,
    shared_destination: bool,
}

impl Endpoint {
    /// Creates a new endpoint.
    ///
    /// # Errors
    ///
    /// Returns an argument error if the destination is empty.
    pub fn new(
        transport_id: impl Into<String>,
        destination: impl Into<String>,
        format: impl Into<String>,
    ) -> Result<Self, Error> {
        let destination = destination.into();
        if destination.is_empty() {
            return Err(Error::Argument("endpoint destination is empty".into()));
        }

        Ok(Self {
            transport_id: transport_id.into(),
            destination,
            format: format.into(),
            shared_destination: false,
        })
    }

    /// Marks the destination as shared between multiple message schemas.
    /// Subscribers to a shared destination filter by wire-type name at the
    /// transport layer.
    #[must_use]
    pub const fn shared(mut self) -> Self {
        self.shared_destination = true;
        self
    }

    /// The transport this endpoint lives on.
    #[must_use]
    pub fn transport_id(&self) -> &str {
        &self.transport_id
    }

    /// The destination name.
    #[must_use]
    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// The serialization format for messages on this endpoint.
    #[must_use]
    pub fn format(&self) -> &str {
        &self.format
    }

    /// Whether the destination is multiplexed across message schemas.
    #[must_use]
    pub const fn is_shared_destination(&self) -> bool {
        self.shared_destination
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_destination() {
        let result = Endpoint::new("amqp", "", "cbor");
        assert!(matches!(result, Err(Error::Argument(_))));
    }

    #[test]
    fn equality_is_structural() {
        let a = Endpoint::new("amqp", "orders", "cbor").unwrap();
        let b = Endpoint::new("amqp", "orders", "cbor").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, b.clone().shared());
    }
}
