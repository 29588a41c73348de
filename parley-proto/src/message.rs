//! Canonical message model for the `Parley` client.
//!
//! Every message the client shows has been normalized into a [`Message`],
//! whether it arrived in a history page, over the live stream, or was
//! synthesized locally as a provisional send. Backend field-name variance
//! is absorbed in [`crate::normalize`] before anything reaches this shape.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Prefix marking a client-generated message id that is awaiting confirmation.
pub const PROVISIONAL_PREFIX: &str = "temp_";

/// Content shown in place of a recalled message.
pub const RECALL_TOMBSTONE: &str = "[message recalled]";

/// Display name used when no sender name can be recovered.
pub const UNKNOWN_SENDER: &str = "unknown";

/// Identifier of a message within a conversation.
///
/// Either assigned by the server or generated locally with the
/// [`PROVISIONAL_PREFIX`] while a send is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    /// Wraps a server-assigned identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a fresh provisional identifier (`temp_` + UUID v7).
    #[must_use]
    pub fn provisional() -> Self {
        Self(format!("{PROVISIONAL_PREFIX}{}", Uuid::now_v7().simple()))
    }

    /// Whether this id was generated locally and not yet confirmed.
    #[must_use]
    pub fn is_provisional(&self) -> bool {
        self.0.starts_with(PROVISIONAL_PREFIX)
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifies a conversation (1:1 or group thread).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Wraps a server-assigned conversation identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string form of this id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Numeric account identifier of a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(i64);

impl UserId {
    /// Wraps a raw account number.
    #[must_use]
    pub const fn new(id: i64) -> Self {
        Self(id)
    }

    /// Returns the raw account number.
    #[must_use]
    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Millisecond-precision UTC timestamp, the sole ordering key of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Returns the current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(chrono::Utc::now().timestamp_millis())
    }

    /// Creates a timestamp from milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn from_millis(ms: i64) -> Self {
        Self(ms)
    }

    /// Returns milliseconds since the UNIX epoch.
    #[must_use]
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Absolute distance between two timestamps in milliseconds.
    #[must_use]
    pub const fn abs_diff(self, other: Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Parses an epoch-millisecond string or an ISO 8601 date-time.
    ///
    /// Date-times without an offset are taken as UTC.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(ms) = raw.parse::<i64>() {
            return Some(Self(ms));
        }
        if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
            return Some(Self(dt.timestamp_millis()));
        }
        chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|naive| Self(naive.and_utc().timestamp_millis()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match chrono::DateTime::from_timestamp_millis(self.0) {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%S%.3fZ")),
            None => write!(f, "{}ms", self.0),
        }
    }
}

/// Payload kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Plain text.
    #[default]
    Text,
    /// Image with optional caption.
    Image,
    /// Voice or audio clip.
    Audio,
    /// Video clip.
    Video,
    /// Sticker or emoji.
    Emoji,
    /// Control message; never shown in a timeline.
    Command,
}

impl MessageKind {
    /// Parses a wire `message_type` value.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "audio" => Some(Self::Audio),
            "video" => Some(Self::Video),
            "emoji" => Some(Self::Emoji),
            "command" => Some(Self::Command),
            _ => None,
        }
    }

    /// Returns the wire `message_type` value.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Emoji => "emoji",
            Self::Command => "command",
        }
    }

    /// Whether messages of this kind carry an uploaded file.
    #[must_use]
    pub const fn is_media(self) -> bool {
        matches!(self, Self::Image | Self::Audio | Self::Video)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Uploaded file attached to an image, audio, or video message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRef {
    /// Location of the file.
    pub url: String,
    /// Playback length in seconds (audio and video).
    pub duration: Option<f64>,
    /// Poster frame (video).
    pub thumbnail_url: Option<String>,
}

impl MediaRef {
    /// A media reference with only a URL.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            duration: None,
            thumbnail_url: None,
        }
    }
}

/// Back-reference from a reply to the message it quotes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyRef {
    /// Id of the quoted message.
    pub message_id: MessageId,
    /// Quoted text, empty when it could not be resolved.
    pub content: String,
    /// Display name of the quoted message's author.
    pub sender_name: String,
}

impl ReplyRef {
    /// Whether the quoted text and author are both known.
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        !self.content.is_empty() && self.sender_name != UNKNOWN_SENDER
    }
}

/// A message in canonical, post-normalization form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Server-assigned or provisional id.
    pub id: MessageId,
    /// Owning conversation. `None` only for a provisional send to a
    /// recipient with whom no conversation exists yet.
    pub conversation_id: Option<ConversationId>,
    /// Author's account id; `None` when the payload carried nothing numeric.
    pub sender_id: Option<UserId>,
    /// Author's display name.
    pub sender_name: String,
    /// Text payload (or caption for media).
    pub content: String,
    /// Payload kind.
    pub kind: MessageKind,
    /// Attached file, for media kinds.
    pub media: Option<MediaRef>,
    /// Ordering key.
    pub created_at: Timestamp,
    /// One-way latch; content holds [`RECALL_TOMBSTONE`] once set.
    pub is_recalled: bool,
    /// One-way latch.
    pub is_edited: bool,
    /// Quoted message, if this is a reply.
    pub reply_to: Option<ReplyRef>,
}

impl Message {
    /// Whether this message belongs in a visible timeline.
    ///
    /// Commands never do; neither does a text message with no text and no
    /// attachment.
    #[must_use]
    pub fn is_displayable(&self) -> bool {
        match self.kind {
            MessageKind::Command => false,
            MessageKind::Text => !self.content.trim().is_empty() || self.media.is_some(),
            _ => true,
        }
    }

    /// Whether `user` authored this message.
    #[must_use]
    pub fn is_from(&self, user: UserId) -> bool {
        self.sender_id == Some(user)
    }

    /// Whether two messages carry the same payload: same kind and, for media
    /// kinds, the same file URL, otherwise the same text.
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        if self.kind != other.kind {
            return false;
        }
        if self.kind.is_media() {
            match (&self.media, &other.media) {
                (Some(a), Some(b)) => a.url == b.url,
                _ => false,
            }
        } else {
            self.content == other.content
        }
    }

    /// Latches the recall flag and replaces the content with the tombstone.
    ///
    /// Returns `false` if the message was already recalled.
    pub fn recall(&mut self) -> bool {
        if self.is_recalled {
            return false;
        }
        self.is_recalled = true;
        RECALL_TOMBSTONE.clone_into(&mut self.content);
        true
    }
}

/// Per-participant entry in a read-status report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reader {
    /// Participant's account id, as sent by the server.
    pub user_id: serde_json::Value,
    /// Participant's display name.
    #[serde(default)]
    pub username: String,
    /// When the message was read, if it was.
    #[serde(default)]
    pub read_at: Option<String>,
}

/// Sender-observed read state of one message. Ephemeral; not part of
/// message identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadStatus {
    /// Message this report describes.
    pub message_id: MessageId,
    /// Recipients, excluding the sender.
    #[serde(default)]
    pub total_recipients: u32,
    /// Recipients who have read it.
    #[serde(default)]
    pub read_count: u32,
    /// Who has read it.
    #[serde(default)]
    pub readers: Vec<Reader>,
    /// Who has not.
    #[serde(default)]
    pub unread_users: Vec<Reader>,
}

impl ReadStatus {
    /// Whether every recipient has read the message.
    #[must_use]
    pub const fn read_by_all(&self) -> bool {
        self.total_recipients > 0 && self.read_count >= self.total_recipients
    }

    /// Whether `user` appears among the unread recipients.
    #[must_use]
    pub fn is_unread_by(&self, user: UserId) -> bool {
        let want = user.get().to_string();
        self.unread_users.iter().any(|r| match &r.user_id {
            serde_json::Value::Number(n) => n.as_i64() == Some(user.get()),
            serde_json::Value::String(s) => *s == want,
            _ => false,
        })
    }
}
