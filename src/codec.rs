//! Message encoding and decoding
//!
//! The processor only needs "bytes in, typed value out" and "typed value in,
//! bytes out plus schema metadata". [`JsonCodec`] implements both with a type
//! registry keyed by [`Message::MESSAGE_TYPE`]; the type tag travels in the
//! [`MESSAGE_TYPE_HEADER`] record header.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProcessorError, ProcessorResult};
use crate::message::{DynMessage, Message, UnknownMessage};
use crate::record::Headers;

/// Header carrying the message type tag
pub const MESSAGE_TYPE_HEADER: &str = "krimson.message-type";

/// Header carrying the schema id, when the codec assigns one
pub const SCHEMA_ID_HEADER: &str = "krimson.schema-id";

/// Encoded payload plus the schema metadata to attach to the record
#[derive(Debug, Clone)]
pub struct EncodedMessage {
    /// Serialized value
    pub payload: Bytes,
    /// Type tag of the value
    pub message_type: String,
    /// Schema id assigned at registration
    pub schema_id: Option<u32>,
}

/// Turns outbound values into bytes
pub trait Serializer: Send + Sync {
    /// Serialize a value destined for `topic`
    fn serialize(&self, topic: &str, message: &dyn DynMessage) -> ProcessorResult<EncodedMessage>;
}

/// Turns inbound bytes into typed values
pub trait Deserializer: Send + Sync {
    /// Decode a payload using the record headers for type resolution
    fn deserialize(
        &self,
        topic: &str,
        payload: Option<&[u8]>,
        headers: &Headers,
    ) -> ProcessorResult<Arc<dyn DynMessage>>;
}

type EncodeFn = Arc<dyn Fn(&dyn DynMessage) -> ProcessorResult<Vec<u8>> + Send + Sync>;
type DecodeFn = Arc<dyn Fn(&[u8]) -> ProcessorResult<Arc<dyn DynMessage>> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    schema_id: u32,
    encode: EncodeFn,
    decode: DecodeFn,
}

/// JSON codec with a registry of known message types
#[derive(Clone, Default)]
pub struct JsonCodec {
    types: HashMap<&'static str, Registration>,
}

impl JsonCodec {
    /// Create an empty codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a message type; schema ids are assigned in registration order
    pub fn register<T>(mut self) -> Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let schema_id = self.types.len() as u32 + 1;
        let encode: EncodeFn = Arc::new(|message: &dyn DynMessage| {
            let value = message.as_any().downcast_ref::<T>().ok_or_else(|| {
                ProcessorError::Codec(format!(
                    "value of type '{}' is not a {}",
                    message.message_type(),
                    T::MESSAGE_TYPE
                ))
            })?;
            serde_json::to_vec(value)
                .map_err(|e| ProcessorError::Codec(format!("JSON encode error: {e}")))
        });
        let decode: DecodeFn = Arc::new(|payload: &[u8]| {
            let value: T = serde_json::from_slice(payload)
                .map_err(|e| ProcessorError::Codec(format!("JSON decode error: {e}")))?;
            Ok(Arc::new(value) as Arc<dyn DynMessage>)
        });
        self.types.entry(T::MESSAGE_TYPE).or_insert(Registration {
            schema_id,
            encode,
            decode,
        });
        self
    }

    /// Whether a type tag is registered
    pub fn is_registered(&self, message_type: &str) -> bool {
        self.types.contains_key(message_type)
    }
}

impl Serializer for JsonCodec {
    fn serialize(&self, topic: &str, message: &dyn DynMessage) -> ProcessorResult<EncodedMessage> {
        let message_type = message.message_type();
        let registration = self.types.get(message_type).ok_or_else(|| {
            ProcessorError::Codec(format!(
                "message type '{message_type}' is not registered for topic '{topic}'"
            ))
        })?;
        let payload = (registration.encode)(message)?;
        Ok(EncodedMessage {
            payload: Bytes::from(payload),
            message_type: message_type.to_string(),
            schema_id: Some(registration.schema_id),
        })
    }
}

impl Deserializer for JsonCodec {
    fn deserialize(
        &self,
        _topic: &str,
        payload: Option<&[u8]>,
        headers: &Headers,
    ) -> ProcessorResult<Arc<dyn DynMessage>> {
        let message_type = headers.get(MESSAGE_TYPE_HEADER).cloned().flatten();
        let registration = message_type
            .as_deref()
            .and_then(|message_type| self.types.get(message_type));

        match (registration, payload) {
            (Some(registration), Some(payload)) => (registration.decode)(payload),
            _ => Ok(Arc::new(UnknownMessage {
                message_type,
                payload: payload.map(Bytes::copy_from_slice),
            })),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Greeting {
        text: String,
    }

    impl Message for Greeting {
        const MESSAGE_TYPE: &'static str = "test.Greeting";
    }

    fn headers_for(message_type: &str) -> Headers {
        let mut headers = Headers::new();
        headers.insert(MESSAGE_TYPE_HEADER.to_string(), Some(message_type.to_string()));
        headers
    }

    #[test]
    fn test_json_codec_roundtrip() {
        let codec = JsonCodec::new().register::<Greeting>();
        let greeting = Greeting {
            text: "hello".into(),
        };

        let encoded = codec.serialize("greetings", &greeting).unwrap();
        assert_eq!(encoded.message_type, "test.Greeting");
        assert_eq!(encoded.schema_id, Some(1));

        let decoded = codec
            .deserialize("greetings", Some(&encoded.payload), &headers_for("test.Greeting"))
            .unwrap();
        assert_eq!(decoded.as_any().downcast_ref::<Greeting>(), Some(&greeting));
    }

    #[test]
    fn test_unregistered_type_decodes_as_unknown() {
        let codec = JsonCodec::new().register::<Greeting>();
        let decoded = codec
            .deserialize("greetings", Some(b"{}"), &headers_for("test.Other"))
            .unwrap();
        assert_eq!(decoded.message_type(), "test.Other");
        assert!(decoded.as_any().is::<UnknownMessage>());
    }

    #[test]
    fn test_registered_type_without_payload_decodes_as_unknown() {
        let codec = JsonCodec::new().register::<Greeting>();
        let decoded = codec
            .deserialize("greetings", None, &headers_for("test.Greeting"))
            .unwrap();
        assert_eq!(decoded.message_type(), "test.Greeting");
        assert!(decoded.as_any().is::<UnknownMessage>());
    }

    #[test]
    fn test_malformed_payload_is_codec_error() {
        let codec = JsonCodec::new().register::<Greeting>();
        let result = codec.deserialize("greetings", Some(b"not json"), &headers_for("test.Greeting"));
        assert!(matches!(result, Err(ProcessorError::Codec(_))));
    }

    #[test]
    fn test_serialize_unregistered_type_fails() {
        let codec = JsonCodec::new();
        let result = codec.serialize("greetings", &Greeting { text: "x".into() });
        assert!(matches!(result, Err(ProcessorError::Codec(_))));
    }
}
