//! Stream entry encoding of a `Message`.
//!
//! Every entry carries five fields:
//! - `ct`: content type
//! - `cl`: body length in bytes, as a decimal string
//! - `ca`: creation time, RFC 3339 with nanoseconds
//! - `mt`: metadata, encoded with the content type's codec
//! - `bd`: encoded body

use chrono::{DateTime, SecondsFormat, Utc};

use super::log::RawMessage;
use crate::queue::message::{Codec, CodecError, Message, Metadata};

pub const FIELD_CONTENT_TYPE: &str = "ct";
pub const FIELD_CONTENT_LENGTH: &str = "cl";
pub const FIELD_CREATED_AT: &str = "ca";
pub const FIELD_METADATA: &str = "mt";
pub const FIELD_BODY: &str = "bd";

/// Encode a message into stream entry fields.
pub fn to_fields(msg: &Message) -> Result<Vec<(String, Vec<u8>)>, CodecError> {
    let metadata = msg.codec()?.encode(&msg.metadata)?;
    Ok(vec![
        (FIELD_CONTENT_TYPE.to_string(), msg.content_type.clone().into_bytes()),
        (
            FIELD_CONTENT_LENGTH.to_string(),
            msg.content_length().to_string().into_bytes(),
        ),
        (
            FIELD_CREATED_AT.to_string(),
            msg.created_at
                .to_rfc3339_opts(SecondsFormat::Nanos, true)
                .into_bytes(),
        ),
        (FIELD_METADATA.to_string(), metadata),
        (FIELD_BODY.to_string(), msg.body().to_vec()),
    ])
}

/// Decode a stream entry. All five fields are required.
pub fn from_raw(raw: &RawMessage) -> Result<Message, CodecError> {
    let field = |name: &'static str| raw.get(name).ok_or(CodecError::MissingField(name));
    let text = |name: &'static str| {
        field(name).and_then(|value| {
            std::str::from_utf8(value).map_err(|e| CodecError::Malformed {
                field: name,
                reason: e.to_string(),
            })
        })
    };

    let content_type = text(FIELD_CONTENT_TYPE)?.to_string();
    let content_length: usize = text(FIELD_CONTENT_LENGTH)?
        .parse()
        .map_err(|e: std::num::ParseIntError| CodecError::Malformed {
            field: FIELD_CONTENT_LENGTH,
            reason: e.to_string(),
        })?;
    let created_at = DateTime::parse_from_rfc3339(text(FIELD_CREATED_AT)?)
        .map_err(|e| CodecError::Malformed {
            field: FIELD_CREATED_AT,
            reason: e.to_string(),
        })?
        .with_timezone(&Utc);
    let metadata = field(FIELD_METADATA)?;
    let body = field(FIELD_BODY)?;

    if content_length != body.len() {
        return Err(CodecError::Malformed {
            field: FIELD_CONTENT_LENGTH,
            reason: format!("declared {} bytes, body has {}", content_length, body.len()),
        });
    }

    let codec = Codec::for_content_type(&content_type)?;
    let metadata: Option<Metadata> = codec.decode(metadata)?;

    Ok(Message::from_parts(
        raw.id.clone(),
        content_type,
        created_at,
        metadata.unwrap_or_default(),
        body.to_vec(),
    ))
}
