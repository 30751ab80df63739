// src/rabbitmq/envelope.rs

use serde::{de::DeserializeOwned, Serialize};

use super::errors::{PubSubError, Result};

pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Serialized payload plus the content-type tag it travels with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub content_type: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    /// Encodes `value` as JSON. Fails only for values serde_json cannot
    /// represent, e.g. maps with non-string keys.
    pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        let payload = serde_json::to_vec(value)?;
        Ok(Envelope {
            content_type: JSON_CONTENT_TYPE.to_string(),
            payload,
        })
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        decode_payload(Some(&self.content_type), &self.payload)
    }
}

/// Decodes a delivered payload. A missing content type is tolerated; a
/// foreign one is not. Media-type parameters such as `charset` are ignored.
pub fn decode_payload<T: DeserializeOwned>(content_type: Option<&str>, payload: &[u8]) -> Result<T> {
    if let Some(content_type) = content_type {
        let media_type = content_type.split(';').next().map_or("", str::trim);
        if !media_type.eq_ignore_ascii_case(JSON_CONTENT_TYPE) {
            return Err(PubSubError::DeliveryDecodeError(format!(
                "unsupported content type '{}'",
                content_type
            )));
        }
    }

    serde_json::from_slice(payload).map_err(|e| PubSubError::DeliveryDecodeError(e.to_string()))
}
