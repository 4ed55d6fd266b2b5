//! Message envelope shared by the queue engines.
//!
//! The design follows the AMQP delivery / Kafka message shape: an opaque
//! engine-assigned id, a content type selecting the codec, the encoded body
//! and its length, a creation time and free-form string metadata.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Content type of JSON encoded bodies.
pub const MIME_JSON: &str = "application/json";

/// String metadata attached to a message.
pub type Metadata = HashMap<String, String>;

/// Errors that can occur while encoding or decoding messages.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported content type: {0}")]
    UnsupportedContentType(String),

    #[error("Missing field: {0}")]
    MissingField(&'static str),

    #[error("Malformed field '{field}': {reason}")]
    Malformed { field: &'static str, reason: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Codec selected by content type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Json,
}

impl Codec {
    /// Resolve the codec for a content type. An empty tag means JSON.
    pub fn for_content_type(content_type: &str) -> Result<Self, CodecError> {
        match content_type {
            "" | MIME_JSON => Ok(Codec::Json),
            other => Err(CodecError::UnsupportedContentType(other.to_string())),
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::to_vec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Codec::Json => Ok(serde_json::from_slice(bytes)?),
        }
    }
}

/// An encoded queue message.
///
/// `content_length` is fixed when the body is set and always equals the
/// body's byte length.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    /// Engine-assigned identifier, empty until the message is stored.
    pub id: String,
    pub content_type: String,
    pub created_at: DateTime<Utc>,
    pub metadata: Metadata,
    content_length: usize,
    body: Vec<u8>,
}

impl Message {
    /// Create a message around an already encoded body.
    pub fn new(content_type: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            id: String::new(),
            content_type: content_type.into(),
            created_at: Utc::now(),
            metadata: Metadata::new(),
            content_length: body.len(),
            body,
        }
    }

    /// Rebuild a stored message. The caller has already checked that
    /// `content_length` matches the body.
    pub(crate) fn from_parts(
        id: String,
        content_type: String,
        created_at: DateTime<Utc>,
        metadata: Metadata,
        body: Vec<u8>,
    ) -> Self {
        Self {
            id,
            content_type,
            created_at,
            metadata,
            content_length: body.len(),
            body,
        }
    }

    /// Content length in bytes.
    pub fn content_length(&self) -> usize {
        self.content_length
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn codec(&self) -> Result<Codec, CodecError> {
        Codec::for_content_type(&self.content_type)
    }

    /// Decode the body into a typed message.
    pub fn decode<T: DeserializeOwned>(self) -> Result<TypedMessage<T>, CodecError> {
        let payload = self.codec()?.decode(&self.body)?;
        Ok(TypedMessage {
            message: self,
            payload,
        })
    }
}

/// A message together with its strongly typed payload.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    /// Envelope. Its body is empty until the message is encoded.
    pub message: Message,
    pub payload: T,
}

impl<T> TypedMessage<T> {
    /// Create a JSON message stamped with the current time.
    pub fn new(payload: T) -> Self {
        Self {
            message: Message::new(MIME_JSON, Vec::new()),
            payload,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.message.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.message.content_type = content_type.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.message.id
    }

    pub fn metadata(&self) -> &Metadata {
        &self.message.metadata
    }
}

impl<T: Serialize> TypedMessage<T> {
    /// Encode the payload with the codec of the content type.
    pub fn encode(&self) -> Result<Message, CodecError> {
        let body = self.message.codec()?.encode(&self.payload)?;
        Ok(Message {
            id: self.message.id.clone(),
            content_type: self.message.content_type.clone(),
            created_at: self.message.created_at,
            metadata: self.message.metadata.clone(),
            content_length: body.len(),
            body,
        })
    }
}
