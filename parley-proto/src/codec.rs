//! JSON encoding of outbound envelopes and decoding of inbound ones.
//!
//! Decoding is a two-step affair: the frame is parsed as untyped JSON, then
//! dispatched on its `type` (and, for commands, `command_type`) tag into
//! [`Inbound`]. Field-name variance inside message records is delegated to
//! [`crate::normalize`].

use serde_json::{Map, Value};

use crate::envelope::{Inbound, Outbound, ReadCounts, ReadStatusUpdate};
use crate::message::{ConversationId, MessageId, Reader};
use crate::normalize::{self, Skipped};
use crate::typing::TypingStatus;

/// Fallback reason for an `error` envelope without one.
const UNKNOWN_ERROR: &str = "unknown error";

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization of an outbound envelope failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The frame is not valid JSON.
    #[error("malformed frame: {0}")]
    Malformed(String),
    /// The frame is JSON but not an object.
    #[error("frame is not a JSON object")]
    NotAnObject,
    /// The frame has no string `type` field.
    #[error("frame has no type tag")]
    MissingType,
    /// A field the envelope type requires is absent.
    #[error("{tag} envelope is missing {field}")]
    MissingField {
        /// Envelope type tag.
        tag: &'static str,
        /// Name of the absent field.
        field: &'static str,
    },
}

/// Encodes an [`Outbound`] envelope as a JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode(envelope: &Outbound) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into an [`Inbound`] envelope.
///
/// # Errors
///
/// Returns [`CodecError`] if the frame is not a JSON object with a `type`
/// tag, or if a recognized envelope lacks a field it cannot do without.
/// Unrecognized tags are not errors; they decode to [`Inbound::Unknown`].
pub fn decode(frame: &str) -> Result<Inbound, CodecError> {
    let value: Value =
        serde_json::from_str(frame).map_err(|e| CodecError::Malformed(e.to_string()))?;
    decode_value(&value)
}

/// Decodes an already-parsed JSON value into an [`Inbound`] envelope.
///
/// # Errors
///
/// Same as [`decode`], minus JSON syntax errors.
pub fn decode_value(value: &Value) -> Result<Inbound, CodecError> {
    let obj = value.as_object().ok_or(CodecError::NotAnObject)?;
    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;

    match tag {
        "connection_established" => Ok(Inbound::ConnectionEstablished {
            user_id: obj.get("user_id").and_then(normalize::user_id_from_value),
        }),
        "message_sent" => Ok(Inbound::MessageSent {
            message_id: message_id_at(obj, &["message_id", "id"]),
            conversation_id: conversation_of(obj),
        }),
        "new_message" if normalize::edited_flag(value) => edited(obj, "new_message"),
        "new_message" => match normalize::message_from_value(value, None) {
            Ok(message) => Ok(Inbound::NewMessage(message)),
            Err(Skipped::MissingId | Skipped::NotAnObject) => Err(CodecError::MissingField {
                tag: "new_message",
                field: "message_id",
            }),
            Err(Skipped::Command | Skipped::Empty) => Ok(Inbound::Unknown {
                tag: "new_message".to_string(),
            }),
        },
        "message_edited" => edited(obj, "message_edited"),
        "command_message" => command(obj),
        "typing_status" => Ok(typing(obj).map_or_else(
            || Inbound::Unknown {
                tag: tag.to_string(),
            },
            Inbound::Typing,
        )),
        "error" => Ok(Inbound::Error {
            message: ["message", "error", "detail"]
                .iter()
                .find_map(|k| obj.get(*k).and_then(Value::as_str))
                .unwrap_or(UNKNOWN_ERROR)
                .to_string(),
        }),
        "pong" => Ok(Inbound::Pong),
        other => Ok(Inbound::Unknown {
            tag: other.to_string(),
        }),
    }
}

fn message_id_at(obj: &Map<String, Value>, keys: &[&str]) -> Option<MessageId> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(normalize::string_from_value)
        .map(MessageId::new)
}

fn conversation_of(obj: &Map<String, Value>) -> Option<ConversationId> {
    obj.get("conversation_id")
        .and_then(normalize::string_from_value)
        .map(ConversationId::new)
}

fn edited(obj: &Map<String, Value>, tag: &'static str) -> Result<Inbound, CodecError> {
    let message_id = message_id_at(obj, &["message_id", "id"]).ok_or(CodecError::MissingField {
        tag,
        field: "message_id",
    })?;
    Ok(Inbound::MessageEdited {
        message_id,
        conversation_id: conversation_of(obj),
        content: obj
            .get("content")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string),
    })
}

fn command(obj: &Map<String, Value>) -> Result<Inbound, CodecError> {
    let command_type = obj
        .get("command_type")
        .and_then(Value::as_str)
        .unwrap_or_default();
    let empty = Map::new();
    let data = obj
        .get("command_data")
        .and_then(Value::as_object)
        .unwrap_or(&empty);

    match command_type {
        "recall" => Ok(Inbound::Recall {
            message_id: message_id_at(data, &["recalled_message_id"]).ok_or(
                CodecError::MissingField {
                    tag: "recall",
                    field: "recalled_message_id",
                },
            )?,
            conversation_id: conversation_of(obj),
        }),
        "edit" => Ok(Inbound::MessageEdited {
            message_id: message_id_at(data, &["edited_message_id"]).ok_or(
                CodecError::MissingField {
                    tag: "edit",
                    field: "edited_message_id",
                },
            )?,
            conversation_id: conversation_of(obj),
            content: data
                .get("new_content")
                .and_then(Value::as_str)
                .map(str::to_string),
        }),
        "read_status" => Ok(Inbound::ReadStatus(read_status(obj, data))),
        other => Ok(Inbound::Unknown {
            tag: format!("command_message/{other}"),
        }),
    }
}

fn read_status(obj: &Map<String, Value>, data: &Map<String, Value>) -> ReadStatusUpdate {
    let message_ids = match data.get("message_ids") {
        Some(Value::Array(ids)) => ids
            .iter()
            .filter_map(normalize::string_from_value)
            .map(MessageId::new)
            .collect(),
        _ => message_id_at(data, &["message_id"]).into_iter().collect(),
    };
    let status = data
        .get("read_status")
        .and_then(Value::as_object)
        .unwrap_or(data);
    let count = |key: &str| {
        status
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|n| u32::try_from(n).ok())
    };
    let counts = match (count("read_count"), count("total_recipients")) {
        (None, None) => None,
        (read, total) => Some(ReadCounts {
            read_count: read.unwrap_or(0),
            total_recipients: total.unwrap_or(0),
        }),
    };
    let readers = |key: &str| -> Vec<Reader> {
        status
            .get(key)
            .cloned()
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    };
    ReadStatusUpdate {
        conversation_id: conversation_of(obj),
        message_ids,
        counts,
        readers: readers("readers"),
        unread_users: readers("unread_users"),
    }
}

fn typing(obj: &Map<String, Value>) -> Option<TypingStatus> {
    Some(TypingStatus {
        user_id: obj.get("user_id").and_then(normalize::user_id_from_value)?,
        conversation_id: conversation_of(obj),
        is_typing: obj.get("is_typing").and_then(Value::as_bool)?,
    })
}
