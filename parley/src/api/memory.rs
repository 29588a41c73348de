//! Scripted in-memory [`ChatApi`] for testing.
//!
//! History is served from pages registered with
//! [`MemoryChatApi::set_history`]; every other call succeeds with a
//! plausible body unless a failure was injected with
//! [`MemoryChatApi::fail`]. All calls are recorded for assertions.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{Value, json};

use parley_proto::message::{ConversationId, MessageId, ReadStatus, Timestamp, UserId};

use super::{
    ApiError, ChatApi, EditOutcome, Editability, MediaPost, MediaUpload, Page, UploadedMedia,
};

/// Operation selector for failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Op {
    /// [`ChatApi::fetch_page`].
    FetchPage,
    /// [`ChatApi::send_reply`].
    SendReply,
    /// [`ChatApi::post_media`].
    PostMedia,
    /// [`ChatApi::editable`].
    Editable,
    /// [`ChatApi::edit`].
    Edit,
    /// [`ChatApi::recall`].
    Recall,
    /// [`ChatApi::mark_read`].
    MarkRead,
    /// [`ChatApi::read_status`].
    ReadStatus,
    /// [`ChatApi::upload_media`].
    Upload,
}

/// A recorded call.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    /// History page request.
    FetchPage {
        /// Conversation fetched.
        conversation: ConversationId,
        /// Page cursor, `None` for the first page.
        cursor: Option<String>,
    },
    /// Reply sent.
    SendReply {
        /// Target conversation.
        conversation: ConversationId,
        /// Reply text.
        content: String,
        /// Quoted message.
        reply_to: MessageId,
    },
    /// Media message posted.
    PostMedia {
        /// Target conversation.
        conversation: ConversationId,
        /// Posted attachment.
        post: MediaPost,
    },
    /// Editability pre-flight.
    Editable(MessageId),
    /// Edit request.
    Edit {
        /// Edited message.
        message: MessageId,
        /// New text.
        content: String,
    },
    /// Recall request.
    Recall(MessageId),
    /// Mark-read request.
    MarkRead {
        /// Conversation marked.
        conversation: ConversationId,
        /// Newest message read.
        up_to: Option<MessageId>,
    },
    /// Read-status lookup.
    ReadStatus(MessageId),
    /// Upload.
    Upload(String),
}

#[derive(Default)]
struct State {
    pages: HashMap<ConversationId, Vec<Vec<Value>>>,
    failing_pages: HashMap<(ConversationId, usize), ApiError>,
    failures: HashMap<Op, ApiError>,
    editability: Option<Editability>,
    read_statuses: HashMap<MessageId, ReadStatus>,
    calls: Vec<Call>,
    next_id: u64,
}

/// In-memory backend.
pub struct MemoryChatApi {
    user: UserId,
    page_delay: Mutex<Option<Duration>>,
    recall_delay: Mutex<Option<Duration>>,
    state: Mutex<State>,
}

impl MemoryChatApi {
    /// Creates a backend that attributes created messages to `user`.
    #[must_use]
    pub fn new(user: UserId) -> Self {
        Self {
            user,
            page_delay: Mutex::new(None),
            recall_delay: Mutex::new(None),
            state: Mutex::new(State::default()),
        }
    }

    /// Serve `pages` as the history of `conversation`, oldest page first.
    pub fn set_history(&self, conversation: &ConversationId, pages: Vec<Vec<Value>>) {
        self.state.lock().pages.insert(conversation.clone(), pages);
    }

    /// Fail the page at `index` of `conversation`'s history.
    pub fn fail_page(&self, conversation: &ConversationId, index: usize, err: ApiError) {
        self.state
            .lock()
            .failing_pages
            .insert((conversation.clone(), index), err);
    }

    /// Delay every page response.
    pub fn set_page_delay(&self, delay: Duration) {
        *self.page_delay.lock() = Some(delay);
    }

    /// Delay every recall response.
    pub fn set_recall_delay(&self, delay: Duration) {
        *self.recall_delay.lock() = Some(delay);
    }

    /// Fail every call to `op` with `err` until [`MemoryChatApi::succeed`].
    pub fn fail(&self, op: Op, err: ApiError) {
        self.state.lock().failures.insert(op, err);
    }

    /// Stop failing `op`.
    pub fn succeed(&self, op: Op) {
        self.state.lock().failures.remove(&op);
    }

    /// Answer editability pre-flights with `answer`.
    pub fn set_editability(&self, answer: Editability) {
        self.state.lock().editability = Some(answer);
    }

    /// Answer read-status lookups for `status.message_id` with `status`.
    pub fn set_read_status(&self, status: ReadStatus) {
        self.state
            .lock()
            .read_statuses
            .insert(status.message_id.clone(), status);
    }

    /// Calls made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Record `call` and return the injected failure for `op`, if any.
    fn record(&self, op: Op, call: Call) -> Result<(), ApiError> {
        let mut state = self.state.lock();
        state.calls.push(call);
        state.failures.get(&op).cloned().map_or(Ok(()), Err)
    }

    fn next_id(&self) -> String {
        let mut state = self.state.lock();
        state.next_id += 1;
        format!("srv-{}", state.next_id)
    }
}

/// Cursor format used for pages after the first.
fn cursor_for(conversation: &ConversationId, index: usize) -> String {
    format!("memory://{conversation}/page/{index}")
}

impl ChatApi for MemoryChatApi {
    async fn fetch_page(
        &self,
        conversation: &ConversationId,
        cursor: Option<&str>,
        _page_size: u32,
    ) -> Result<Page, ApiError> {
        self.record(
            Op::FetchPage,
            Call::FetchPage {
                conversation: conversation.clone(),
                cursor: cursor.map(str::to_string),
            },
        )?;
        let delay = *self.page_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let index = cursor
            .and_then(|c| c.rsplit('/').next())
            .and_then(|n| n.parse::<usize>().ok())
            .unwrap_or(0);
        let state = self.state.lock();
        if let Some(err) = state.failing_pages.get(&(conversation.clone(), index)) {
            return Err(err.clone());
        }
        let pages = state.pages.get(conversation);
        let results = pages.and_then(|p| p.get(index)).cloned().unwrap_or_default();
        let next = pages
            .filter(|p| index + 1 < p.len())
            .map(|_| cursor_for(conversation, index + 1));
        Ok(Page {
            results: Some(results),
            next,
        })
    }

    async fn send_reply(
        &self,
        conversation: &ConversationId,
        content: &str,
        reply_to: &MessageId,
    ) -> Result<Value, ApiError> {
        self.record(
            Op::SendReply,
            Call::SendReply {
                conversation: conversation.clone(),
                content: content.to_string(),
                reply_to: reply_to.clone(),
            },
        )?;
        Ok(json!({
            "id": self.next_id(),
            "conversation_id": conversation,
            "sender_id": self.user.get(),
            "content": content,
            "message_type": "text",
            "timestamp": Timestamp::now().as_millis(),
            "reply_to": reply_to,
        }))
    }

    async fn post_media(
        &self,
        conversation: &ConversationId,
        post: &MediaPost,
    ) -> Result<Value, ApiError> {
        self.record(
            Op::PostMedia,
            Call::PostMedia {
                conversation: conversation.clone(),
                post: post.clone(),
            },
        )?;
        Ok(json!({
            "id": self.next_id(),
            "conversation_id": conversation,
            "sender_id": self.user.get(),
            "content": post.caption.clone().unwrap_or_default(),
            "message_type": post.kind,
            "timestamp": Timestamp::now().as_millis(),
        }))
    }

    async fn editable(&self, message: &MessageId) -> Result<Editability, ApiError> {
        self.record(Op::Editable, Call::Editable(message.clone()))?;
        Ok(self.state.lock().editability.clone().unwrap_or(Editability {
            is_editable: true,
            reason: None,
        }))
    }

    async fn edit(&self, message: &MessageId, content: &str) -> Result<EditOutcome, ApiError> {
        self.record(
            Op::Edit,
            Call::Edit {
                message: message.clone(),
                content: content.to_string(),
            },
        )?;
        Ok(EditOutcome {
            success: true,
            edited_message: Some(json!({"id": message, "content": content, "is_edited": true})),
            message: None,
        })
    }

    async fn recall(&self, message: &MessageId) -> Result<(), ApiError> {
        let delay = *self.recall_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.record(Op::Recall, Call::Recall(message.clone()))
    }

    async fn mark_read(
        &self,
        conversation: &ConversationId,
        up_to: Option<&MessageId>,
    ) -> Result<(), ApiError> {
        self.record(
            Op::MarkRead,
            Call::MarkRead {
                conversation: conversation.clone(),
                up_to: up_to.cloned(),
            },
        )
    }

    async fn read_status(&self, message: &MessageId) -> Result<ReadStatus, ApiError> {
        self.record(Op::ReadStatus, Call::ReadStatus(message.clone()))?;
        self.state
            .lock()
            .read_statuses
            .get(message)
            .cloned()
            .ok_or(ApiError::Status {
                status: 404,
                reason: Some("message not found".into()),
            })
    }

    async fn upload_media(&self, upload: MediaUpload) -> Result<UploadedMedia, ApiError> {
        self.record(Op::Upload, Call::Upload(upload.file_name.clone()))?;
        Ok(UploadedMedia {
            url: format!("/media/{}", upload.file_name),
            duration: None,
            thumbnail_url: None,
        })
    }
}
