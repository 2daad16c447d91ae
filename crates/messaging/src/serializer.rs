use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// The CBOR serialization format.
pub const FORMAT_CBOR: &str = "cbor";

/// The JSON serialization format.
pub const FORMAT_JSON: &str = "json";

/// Errors raised by the serialization layer.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The requested format has no registered codec.
    #[error("unknown serialization format: {0}")]
    UnknownFormat(String),

    /// The value could not be encoded.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The payload could not be decoded.
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Format-keyed serialization of application messages.
pub trait Serializer: Send + Sync + 'static {
    /// Serializes a value in the given format.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is unknown or the value cannot be
    /// encoded.
    fn serialize<T: Serialize>(&self, format: &str, value: &T)
    -> Result<Bytes, SerializationError>;

    /// Deserializes a payload in the given format.
    ///
    /// # Errors
    ///
    /// Returns an error if the format is unknown or the payload does not
    /// decode as `T`.
    fn deserialize<T: DeserializeOwned>(
        &self,
        format: &str,
        payload: &[u8],
    ) -> Result<T, SerializationError>;
}

/// Serializer supporting the built-in CBOR and JSON formats.
#[derive(Clone, Copy, Debug, Default)]
pub struct FormatSerializer;

impl FormatSerializer {
    /// Creates the serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Serializer for FormatSerializer {
    fn serialize<T: Serialize>(
        &self,
        format: &str,
        value: &T,
    ) -> Result<Bytes, SerializationError> {
        match format {
            FORMAT_CBOR => {
                let mut buf = Vec::new();
                ciborium::ser::into_writer(value, &mut buf)
                    .map_err(|e| SerializationError::Encode(e.to_string()))?;
                Ok(Bytes::from(buf))
            }
            FORMAT_JSON => serde_json::to_vec(value)
                .map(Bytes::from)
                .map_err(|e| SerializationError::Encode(e.to_string())),
            other => Err(SerializationError::UnknownFormat(other.to_string())),
        }
    }

    fn deserialize<T: DeserializeOwned>(
        &self,
        format: &str,
        payload: &[u8],
    ) -> Result<T, SerializationError> {
        match format {
            FORMAT_CBOR => ciborium::de::from_reader(payload)
                .map_err(|e| SerializationError::Decode(e.to_string())),
            FORMAT_JSON => serde_json::from_slice(payload)
                .map_err(|e| SerializationError::Decode(e.to_string())),
            other => Err(SerializationError::UnknownFormat(other.to_string())),
        }
    }
}
