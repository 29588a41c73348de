//! REST collaborator calls made alongside the chat stream.
//!
//! [`ChatApi`] is the seam: [`http::HttpChatApi`] talks to the backend
//! with `reqwest`, [`memory::MemoryChatApi`] is a scripted stand-in for
//! tests. Responses that carry message records are returned as raw JSON
//! and normalized by the caller through `parley_proto::normalize`.

pub mod http;
pub mod memory;

use std::future::Future;

use serde::Deserialize;
use serde_json::Value;

use parley_proto::message::{ConversationId, MessageId, MessageKind, ReadStatus};

/// Errors returned by [`ChatApi`] calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {}", reason.as_deref().unwrap_or("no reason given"))]
    Status {
        /// HTTP status code.
        status: u16,
        /// Server-supplied reason (`message`, `error` or `detail`).
        reason: Option<String>,
    },

    /// The request did not complete.
    #[error("request failed: {0}")]
    Request(String),

    /// The response body had an unexpected shape.
    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    /// HTTP status, when the server answered.
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Request(_) | Self::Decode(_) => None,
        }
    }

    /// Server-supplied reason, when present.
    #[must_use]
    pub fn reason(&self) -> Option<&str> {
        match self {
            Self::Status { reason, .. } => reason.as_deref(),
            Self::Request(_) | Self::Decode(_) => None,
        }
    }
}

/// Extracts the reason from an error body: `message`, then `error`, then
/// `detail`.
#[must_use]
pub fn reason_from_body(body: &Value) -> Option<String> {
    ["message", "error", "detail"]
        .iter()
        .find_map(|k| body.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// One page of message history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Page {
    /// Raw message records; `None` when the page had no result array.
    pub results: Option<Vec<Value>>,
    /// Absolute URL of the next page.
    pub next: Option<String>,
}

/// Answer to an editability pre-flight.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Editability {
    /// Whether the server will accept an edit.
    #[serde(default)]
    pub is_editable: bool,
    /// Why not, when refused.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Result of an edit request.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EditOutcome {
    /// Whether the edit was applied.
    #[serde(default)]
    pub success: bool,
    /// The updated message record.
    #[serde(default)]
    pub edited_message: Option<Value>,
    /// Server note or refusal reason.
    #[serde(default)]
    pub message: Option<String>,
}

/// File handed to [`ChatApi::upload_media`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaUpload {
    /// Image, audio or video.
    pub kind: MessageKind,
    /// Original file name.
    pub file_name: String,
    /// MIME type.
    pub mime: String,
    /// File contents.
    pub bytes: Vec<u8>,
}

/// Location returned by an upload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UploadedMedia {
    /// Where the file now lives.
    pub url: String,
    /// Length in seconds, for audio and video.
    #[serde(default)]
    pub duration: Option<f64>,
    /// Poster frame, for video.
    #[serde(default)]
    pub thumbnail_url: Option<String>,
}

/// A media message posted to an existing conversation.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPost {
    /// Image, audio, video or emoji.
    pub kind: MessageKind,
    /// Uploaded file location.
    pub media: UploadedMedia,
    /// Optional caption.
    pub caption: Option<String>,
}

/// REST operations the sync core depends on.
pub trait ChatApi: Send + Sync + 'static {
    /// Fetch one history page: the first page when `cursor` is `None`,
    /// otherwise the page at the server-provided `next` URL.
    fn fetch_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&str>,
        page_size: u32,
    ) -> impl Future<Output = Result<Page, ApiError>> + Send;

    /// Send a reply; returns the created message record.
    fn send_reply(
        &self,
        conversation: &ConversationId,
        content: &str,
        reply_to: &MessageId,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// Post a media message; returns the created message record.
    fn post_media(
        &self,
        conversation: &ConversationId,
        post: &MediaPost,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// Ask whether a message may still be edited.
    fn editable(
        &self,
        message: &MessageId,
    ) -> impl Future<Output = Result<Editability, ApiError>> + Send;

    /// Replace a message's text.
    fn edit(
        &self,
        message: &MessageId,
        content: &str,
    ) -> impl Future<Output = Result<EditOutcome, ApiError>> + Send;

    /// Withdraw a message.
    fn recall(&self, message: &MessageId) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Mark the conversation read up to `up_to`, or entirely when `None`.
    fn mark_read(
        &self,
        conversation: &ConversationId,
        up_to: Option<&MessageId>,
    ) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Fetch the read state of one message.
    fn read_status(
        &self,
        message: &MessageId,
    ) -> impl Future<Output = Result<ReadStatus, ApiError>> + Send;

    /// Upload a file and return its location.
    fn upload_media(
        &self,
        upload: MediaUpload,
    ) -> impl Future<Output = Result<UploadedMedia, ApiError>> + Send;
}
