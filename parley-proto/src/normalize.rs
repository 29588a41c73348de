//! Coalescing of heterogeneous backend records into [`Message`].
//!
//! The backend names the same value differently depending on the endpoint
//! and serializer version. Each canonical field is read from an ordered list
//! of candidate locations; the first one present wins:
//!
//! | Field | Candidates, in order | Fallback |
//! |-------|----------------------|----------|
//! | id | `id`, `message_id` | record skipped |
//! | sender id | `sender_id`, `sender.id`, `sender.user_id`, numeric `sender` | none |
//! | sender name | `sender_name`, `sender.username`, `sender.userName` | [`UNKNOWN_SENDER`] |
//! | created at | `timestamp`, `created_at` | now |
//! | kind | `message_type` | text |
//! | conversation | `conversation_id`, `conversation` | caller default |
//! | edited | `is_edited`, `isEdited`, `edited` | false |
//! | reply | `reply_to`, `quoted_message`, `reply_to_message` | none |
//!
//! This module is the only place that knows those alternate names.

use serde_json::{Map, Value};

use crate::message::{
    ConversationId, MediaRef, Message, MessageId, MessageKind, RECALL_TOMBSTONE, ReplyRef,
    Timestamp, UNKNOWN_SENDER, UserId,
};

/// Why a raw record did not become a [`Message`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Skipped {
    /// The record is not a JSON object.
    #[error("record is not an object")]
    NotAnObject,
    /// Neither `id` nor `message_id` is present.
    #[error("record has no message id")]
    MissingId,
    /// Command messages never reach a timeline.
    #[error("command message")]
    Command,
    /// A text message with no text and no attachment.
    #[error("empty text message")]
    Empty,
}

/// Normalizes one raw backend record.
///
/// `default_conversation` is used when the record does not name its own
/// conversation (history pages usually omit it).
///
/// # Errors
///
/// Returns [`Skipped`] for records that must not be shown: commands, empty
/// text, or records without an id.
pub fn message_from_value(
    raw: &Value,
    default_conversation: Option<&ConversationId>,
) -> Result<Message, Skipped> {
    let obj = raw.as_object().ok_or(Skipped::NotAnObject)?;
    let id = first_string(obj, &["id", "message_id"])
        .map(MessageId::new)
        .ok_or(Skipped::MissingId)?;

    let kind = obj
        .get("message_type")
        .and_then(Value::as_str)
        .and_then(MessageKind::parse)
        .unwrap_or_default();
    if kind == MessageKind::Command {
        return Err(Skipped::Command);
    }

    let is_recalled = obj.get("is_recalled").and_then(Value::as_bool) == Some(true);
    let content = if is_recalled {
        RECALL_TOMBSTONE.to_string()
    } else {
        obj.get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    };

    let message = Message {
        id,
        conversation_id: first_string(obj, &["conversation_id", "conversation"])
            .map(ConversationId::new)
            .or_else(|| default_conversation.cloned()),
        sender_id: sender_id(obj),
        sender_name: sender_name(obj),
        content,
        kind,
        media: media(obj, kind),
        created_at: first_timestamp(obj, &["timestamp", "created_at"]).unwrap_or_else(Timestamp::now),
        is_recalled,
        is_edited: is_edited(obj),
        reply_to: reply_ref(obj),
    };

    if message.is_displayable() {
        Ok(message)
    } else {
        Err(Skipped::Empty)
    }
}

/// Resolves a media location against the backend's base URL.
///
/// `data:` URLs and absolute `http(s)` URLs are kept; plain `http` is
/// upgraded when `force_https` is set. Relative paths are joined to `base`.
#[must_use]
pub fn resolve_media_url(raw: &str, base: &str, force_https: bool) -> String {
    let raw = raw.trim();
    if raw.is_empty() || raw.starts_with("data:") || raw.starts_with("https://") {
        return raw.to_string();
    }
    if let Some(rest) = raw.strip_prefix("http://") {
        return if force_https {
            format!("https://{rest}")
        } else {
            raw.to_string()
        };
    }
    let base = base.trim_end_matches('/');
    if raw.starts_with('/') {
        format!("{base}{raw}")
    } else {
        format!("{base}/{raw}")
    }
}

/// Reads a user id from a string or integer value. Non-numeric input yields
/// `None`.
#[must_use]
pub fn user_id_from_value(value: &Value) -> Option<UserId> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .map(UserId::new),
        Value::String(s) => s.trim().parse::<i64>().ok().map(UserId::new),
        _ => None,
    }
}

/// Reads a string-or-number field as a string.
#[must_use]
pub fn string_from_value(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Reads a timestamp from epoch milliseconds or an ISO 8601 string.
#[must_use]
pub fn timestamp_from_value(value: &Value) -> Option<Timestamp> {
    match value {
        Value::Number(n) => n.as_i64().map(Timestamp::from_millis),
        Value::String(s) => Timestamp::parse(s),
        _ => None,
    }
}

fn first_string(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(string_from_value)
}

fn first_timestamp(obj: &Map<String, Value>, keys: &[&str]) -> Option<Timestamp> {
    keys.iter()
        .filter_map(|k| obj.get(*k))
        .find_map(timestamp_from_value)
}

fn nested<'a>(obj: &'a Map<String, Value>, outer: &str, inner: &str) -> Option<&'a Value> {
    obj.get(outer)?.as_object()?.get(inner)
}

fn sender_id(obj: &Map<String, Value>) -> Option<UserId> {
    let candidate = obj
        .get("sender_id")
        .filter(|v| !v.is_null())
        .or_else(|| nested(obj, "sender", "id"))
        .or_else(|| nested(obj, "sender", "user_id"))
        .or_else(|| obj.get("sender").filter(|v| !v.is_object()))?;
    user_id_from_value(candidate)
}

fn non_empty_str(value: Option<&Value>) -> Option<&str> {
    value.and_then(Value::as_str).filter(|s| !s.is_empty())
}

fn sender_name(obj: &Map<String, Value>) -> String {
    non_empty_str(obj.get("sender_name"))
        .or_else(|| non_empty_str(nested(obj, "sender", "username")))
        .or_else(|| non_empty_str(nested(obj, "sender", "userName")))
        .unwrap_or(UNKNOWN_SENDER)
        .to_string()
}

/// Whether a raw record carries any spelling of the edited flag set to `true`.
#[must_use]
pub fn edited_flag(raw: &Value) -> bool {
    raw.as_object().is_some_and(is_edited)
}

fn is_edited(obj: &Map<String, Value>) -> bool {
    ["is_edited", "isEdited", "edited"]
        .iter()
        .any(|k| obj.get(*k).and_then(Value::as_bool) == Some(true))
}

fn duration(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn media(obj: &Map<String, Value>, kind: MessageKind) -> Option<MediaRef> {
    let url = |key: &str| {
        obj.get(key)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };
    match kind {
        MessageKind::Audio => url("audio_url").map(|u| MediaRef {
            url: u,
            duration: duration(obj.get("audio_duration")),
            thumbnail_url: None,
        }),
        MessageKind::Video => url("video_url").map(|u| MediaRef {
            url: u,
            duration: duration(obj.get("video_duration")),
            thumbnail_url: url("video_thumbnail_url"),
        }),
        _ => url("image_url").map(MediaRef::url),
    }
}

fn reply_from_object(obj: &Map<String, Value>) -> Option<ReplyRef> {
    let message_id = first_string(obj, &["message_id", "id"])?;
    Some(ReplyRef {
        message_id: MessageId::new(message_id),
        content: obj
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        sender_name: non_empty_str(obj.get("sender_name"))
            .or_else(|| non_empty_str(nested(obj, "sender", "username")))
            .unwrap_or(UNKNOWN_SENDER)
            .to_string(),
    })
}

fn reply_ref(obj: &Map<String, Value>) -> Option<ReplyRef> {
    match obj.get("reply_to") {
        Some(Value::String(id)) if !id.is_empty() => {
            return Some(ReplyRef {
                message_id: MessageId::new(id.clone()),
                content: non_empty_str(obj.get("reply_to_content"))
                    .or_else(|| non_empty_str(obj.get("quote_text")))
                    .unwrap_or_default()
                    .to_string(),
                sender_name: non_empty_str(obj.get("reply_to_sender_name"))
                    .unwrap_or(UNKNOWN_SENDER)
                    .to_string(),
            });
        }
        Some(Value::Number(n)) => {
            return Some(ReplyRef {
                message_id: MessageId::new(n.to_string()),
                content: String::new(),
                sender_name: UNKNOWN_SENDER.to_string(),
            });
        }
        Some(Value::Object(inner)) => {
            if let Some(reply) = reply_from_object(inner) {
                return Some(reply);
            }
        }
        _ => {}
    }
    ["quoted_message", "reply_to_message"]
        .iter()
        .filter_map(|k| obj.get(*k)?.as_object())
        .find_map(reply_from_object)
}
