//! HTTP client for the chat backend's REST endpoints.
//!
//! All paths live under `<base>/api/chat/` and authenticate with a bearer
//! token. Non-success statuses become [`ApiError::Status`] carrying the
//! reason from the error body.

use std::time::Duration;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use parley_proto::message::{ConversationId, MessageId, MessageKind, ReadStatus, Reader};

use super::{
    ApiError, ChatApi, EditOutcome, Editability, MediaPost, MediaUpload, Page, UploadedMedia,
    reason_from_body,
};

/// Per-request timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// REST client backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: reqwest::Client,
    base_url: String,
}

/// Read-status body as the backend sends it (no message id).
#[derive(Debug, Deserialize)]
struct ReadStatusBody {
    #[serde(default)]
    total_recipients: u32,
    #[serde(default)]
    read_count: u32,
    #[serde(default)]
    readers: Vec<Reader>,
    #[serde(default)]
    unread_users: Vec<Reader>,
}

impl HttpChatApi {
    /// Creates a client for the backend at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Request`] if the token is not a valid header
    /// value or the HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>, token: &str) -> Result<Self, ApiError> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|e| ApiError::Request(format!("invalid token header value: {e}")))?;
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Request(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/chat/{path}", self.base_url)
    }

    /// Sends the request and maps transport failures and error statuses.
    async fn execute(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ApiError> {
        let response = request
            .send()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.json::<Value>().await.ok();
        let reason = body.as_ref().and_then(reason_from_body);
        tracing::debug!(status = status.as_u16(), reason = ?reason, "backend refused request");
        Err(ApiError::Status {
            status: status.as_u16(),
            reason,
        })
    }

    async fn json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T, ApiError> {
        self.execute(request)
            .await?
            .json::<T>()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))
    }
}

/// Builds the JSON body of a media message.
fn media_body(post: &MediaPost) -> Result<Value, ApiError> {
    let mut body = Map::new();
    let media = &post.media;
    match post.kind {
        MessageKind::Image => {
            body.insert("image_url".into(), json!(media.url));
        }
        MessageKind::Audio => {
            body.insert("audio_url".into(), json!(media.url));
            if let Some(d) = media.duration {
                body.insert("audio_duration".into(), json!(d));
            }
        }
        MessageKind::Video => {
            body.insert("video_url".into(), json!(media.url));
            if let Some(d) = media.duration {
                body.insert("video_duration".into(), json!(d));
            }
            if let Some(t) = &media.thumbnail_url {
                body.insert("video_thumbnail_url".into(), json!(t));
            }
        }
        // The emoji endpoint takes a `:code:` in place of a file location.
        MessageKind::Emoji => {
            body.insert("emoji_code".into(), json!(media.url));
        }
        MessageKind::Text | MessageKind::Command => {
            return Err(ApiError::Decode(format!(
                "{} is not a media kind",
                post.kind.as_str()
            )));
        }
    }
    if let Some(caption) = post.caption.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        body.insert("caption".into(), json!(caption));
    }
    Ok(Value::Object(body))
}

impl ChatApi for HttpChatApi {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&str>,
        page_size: u32,
    ) -> Result<Page, ApiError> {
        let request = match cursor {
            Some(next) => self.client.get(next),
            None => self
                .client
                .get(self.url(&format!("conversations/{conversation}/messages/")))
                .query(&[("page_size", page_size)]),
        };
        let body: Value = self.json(request).await?;
        Ok(match body {
            Value::Array(results) => Page {
                results: Some(results),
                next: None,
            },
            Value::Object(mut obj) => Page {
                results: match obj.remove("results") {
                    Some(Value::Array(results)) => Some(results),
                    _ => None,
                },
                next: obj
                    .get("next")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            },
            _ => Page::default(),
        })
    }

    async fn send_reply(
        &self,
        conversation: &ConversationId,
        content: &str,
        reply_to: &MessageId,
    ) -> Result<Value, ApiError> {
        let request = self
            .client
            .post(self.url(&format!("conversations/{conversation}/messages/send/")))
            .json(&json!({ "content": content, "reply_to": reply_to }));
        self.json(request).await
    }

    async fn post_media(
        &self,
        conversation: &ConversationId,
        post: &MediaPost,
    ) -> Result<Value, ApiError> {
        let body = media_body(post)?;
        let path = format!("conversations/{conversation}/{}_message/", post.kind.as_str());
        self.json(self.client.post(self.url(&path)).json(&body)).await
    }

    async fn editable(&self, message: &MessageId) -> Result<Editability, ApiError> {
        self.json(self.client.get(self.url(&format!("messages/{message}/editable/"))))
            .await
    }

    async fn edit(&self, message: &MessageId, content: &str) -> Result<EditOutcome, ApiError> {
        let request = self
            .client
            .put(self.url(&format!("messages/{message}/edit/")))
            .json(&json!({ "content": content }));
        self.json(request).await
    }

    async fn recall(&self, message: &MessageId) -> Result<(), ApiError> {
        self.execute(self.client.put(self.url(&format!("messages/{message}/recall/"))))
            .await
            .map(drop)
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        up_to: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        let body = up_to.map_or_else(|| json!({}), |id| json!({ "message_id": id }));
        let request = self
            .client
            .post(self.url(&format!("conversations/{conversation}/mark_read/")))
            .json(&body);
        self.execute(request).await.map(drop)
    }

    async fn read_status(&self, message: &MessageId) -> Result<ReadStatus, ApiError> {
        let body: ReadStatusBody = self
            .json(self.client.get(self.url(&format!("messages/{message}/read_status/"))))
            .await?;
        Ok(ReadStatus {
            message_id: message.clone(),
            total_recipients: body.total_recipients,
            read_count: body.read_count,
            readers: body.readers,
            unread_users: body.unread_users,
        })
    }

    async fn upload_media(&self, upload: MediaUpload) -> Result<UploadedMedia, ApiError> {
        let part = reqwest::multipart::Part::bytes(upload.bytes)
            .file_name(upload.file_name)
            .mime_str(&upload.mime)
            .map_err(|e| ApiError::Request(format!("invalid MIME type: {e}")))?;
        let (path, form) = match upload.kind {
            MessageKind::Image => (
                "upload/image/",
                reqwest::multipart::Form::new().part("image", part),
            ),
            kind => (
                "upload/media/",
                reqwest::multipart::Form::new()
                    .part("file", part)
                    .text("media_type", kind.as_str()),
            ),
        };
        self.json(self.client.post(self.url(path)).multipart(form))
            .await
    }
}
