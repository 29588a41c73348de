//! Outbound commands: turning user intent into envelopes and REST calls.
//!
//! [`CommandBuilder`] applies every optimistic change through the
//! [`SyncEngine`] and undoes it when the server refuses. Guard failures
//! come back as distinct [`SendError`] variants so the caller can show a
//! specific reason.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use parley_proto::envelope::{Outbound, OutboundMedia, Target};
use parley_proto::message::{
    ConversationId, MediaRef, Message, MessageId, MessageKind, Timestamp, UserId,
};
use parley_proto::normalize::message_from_value;

use crate::api::{ApiError, ChatApi, MediaPost, MediaUpload};
use crate::sync::Notice;
use crate::sync::engine::SyncEngine;
use crate::transport::session::TransportSession;
use crate::transport::{Dialer, TransportError};

use super::ack::SendLatch;
use super::typing::TypingDebouncer;

/// Display name of provisional entries until the server echo replaces them.
pub const LOCAL_SENDER_NAME: &str = "me";

/// Why a command was not carried out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    /// Nothing to send.
    #[error("message is empty")]
    EmptyMessage,

    /// Another send has not been confirmed yet.
    #[error("a message is still being sent")]
    SendInProgress,

    /// No conversation or recipient is selected.
    #[error("no conversation selected")]
    NoConversation,

    /// The stream is down.
    #[error("not connected to the chat server")]
    NotConnected,

    /// `submit_edit` without `start_edit`.
    #[error("no message is being edited")]
    NotEditing,

    /// The target message does not exist (locally or on the server).
    #[error("message missing")]
    MessageMissing,

    /// The target message belongs to someone else.
    #[error("not your message")]
    NotYourMessage,

    /// The target message was already recalled.
    #[error("message was recalled")]
    Recalled,

    /// The message is older than the edit window.
    #[error("messages can only be edited within {} minutes", .0.as_secs() / 60)]
    EditWindowExpired(Duration),

    /// The server says the message cannot be edited.
    #[error("cannot edit: {0}")]
    EditRefused(String),

    /// The server rejected the request with a reason.
    #[error("rejected: {0}")]
    Rejected(String),

    /// A REST call failed.
    #[error("request failed: {0}")]
    Api(ApiError),

    /// The stream refused the envelope.
    #[error("stream error: {0}")]
    Transport(#[from] TransportError),
}

impl SendError {
    /// Map a REST failure on a message-targeted call to a user-facing
    /// reason: 404 is a missing message, 403 someone else's, 400 carries
    /// the server's reason.
    #[must_use]
    pub fn from_api(err: ApiError) -> Self {
        match err.status() {
            Some(404) => Self::MessageMissing,
            Some(403) => Self::NotYourMessage,
            Some(400) => Self::Rejected(err.reason().unwrap_or("bad request").to_string()),
            _ => Self::Api(err),
        }
    }
}

/// Timing knobs for [`CommandBuilder`].
#[derive(Debug, Clone)]
pub struct CommandConfig {
    /// Latch auto-release after a send.
    pub send_latch_timeout: Duration,
    /// Idle time after which typing stops.
    pub typing_idle: Duration,
    /// How long after creation a message may be edited.
    pub edit_window: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            send_latch_timeout: Duration::from_secs(3),
            typing_idle: Duration::from_secs(1),
            edit_window: Duration::from_secs(120),
        }
    }
}

struct Shared<D: Dialer, A: ChatApi> {
    transport: TransportSession<D>,
    api: Arc<A>,
    engine: Arc<Mutex<SyncEngine>>,
    latch: SendLatch,
    typing: Mutex<TypingDebouncer>,
    typing_timer: Mutex<Option<JoinHandle<()>>>,
    notices: mpsc::Sender<Notice>,
    config: CommandConfig,
}

/// Translates user intent into protocol traffic with optimistic updates.
pub struct CommandBuilder<D: Dialer, A: ChatApi> {
    shared: Arc<Shared<D, A>>,
}

impl<D: Dialer, A: ChatApi> Clone for CommandBuilder<D, A> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<D: Dialer, A: ChatApi> CommandBuilder<D, A> {
    /// Wire a builder to its collaborators.
    #[must_use]
    pub fn new(
        transport: TransportSession<D>,
        api: Arc<A>,
        engine: Arc<Mutex<SyncEngine>>,
        notices: mpsc::Sender<Notice>,
        config: CommandConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                transport,
                api,
                engine,
                latch: SendLatch::new(config.send_latch_timeout),
                typing: Mutex::new(TypingDebouncer::default()),
                typing_timer: Mutex::new(None),
                notices,
                config,
            }),
        }
    }

    /// The send latch, released by the session when a send is confirmed.
    #[must_use]
    pub fn latch(&self) -> &SendLatch {
        &self.shared.latch
    }

    // -----------------------------------------------------------------------
    // Sends
    // -----------------------------------------------------------------------

    /// Send a text message over the stream with a provisional entry.
    ///
    /// Returns the provisional id. The entry collapses into the server copy
    /// when it arrives.
    ///
    /// # Errors
    ///
    /// Returns a guard failure ([`SendError::EmptyMessage`],
    /// [`SendError::NotConnected`], [`SendError::NoConversation`],
    /// [`SendError::SendInProgress`]) or the stream failure.
    pub async fn send_text(&self, text: &str) -> Result<MessageId, SendError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        if !self.shared.transport.is_connected() {
            return Err(SendError::NotConnected);
        }
        let (target, conversation_id, local_user) = {
            let engine = self.shared.engine.lock();
            let target = match (engine.conversation_id(), engine.peer()) {
                (Some(id), _) => Target::Conversation {
                    conversation_id: id.clone(),
                },
                (None, Some(peer)) => Target::Receiver { receiver_id: peer },
                (None, None) => return Err(SendError::NoConversation),
            };
            (target, engine.conversation_id().cloned(), engine.local_user())
        };
        if !self.shared.latch.try_acquire() {
            return Err(SendError::SendInProgress);
        }
        self.stop_typing().await;

        let provisional = Message {
            id: MessageId::provisional(),
            conversation_id,
            sender_id: Some(local_user),
            sender_name: LOCAL_SENDER_NAME.to_string(),
            content: content.to_string(),
            kind: MessageKind::Text,
            media: None,
            created_at: Timestamp::now(),
            is_recalled: false,
            is_edited: false,
            reply_to: None,
        };
        let id = provisional.id.clone();
        self.shared.engine.lock().insert_provisional(provisional);

        if let Err(err) = self.shared.transport.send(Outbound::text(content, target)).await {
            tracing::warn!(message_id = %id, err = %err, "send failed, dropping provisional entry");
            self.shared.engine.lock().discard_provisional(&id);
            self.shared.latch.release();
            return Err(err.into());
        }
        tracing::debug!(message_id = %id, "text sent");
        Ok(id)
    }

    /// Send a reply through the REST endpoint and show the confirmed copy.
    ///
    /// # Errors
    ///
    /// Returns a guard failure or the REST failure.
    pub async fn send_reply(&self, text: &str, reply_to: &MessageId) -> Result<MessageId, SendError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let conversation = self.require_conversation()?;
        if self.shared.engine.lock().message(reply_to).is_none() {
            return Err(SendError::MessageMissing);
        }
        if !self.shared.latch.try_acquire() {
            return Err(SendError::SendInProgress);
        }
        self.stop_typing().await;

        let result = self.shared.api.send_reply(&conversation, content, reply_to).await;
        self.shared.latch.release();
        let body = result.map_err(|err| match err.status() {
            Some(400) => SendError::Rejected(err.reason().unwrap_or("bad request").to_string()),
            _ => SendError::Api(err),
        })?;
        self.append_from_body(&body, &conversation)
    }

    /// Upload a file and post it as a media message.
    ///
    /// No provisional entry is shown; the confirmed copy is appended from
    /// the response.
    ///
    /// # Errors
    ///
    /// Returns a guard failure or the REST failure.
    pub async fn send_media(
        &self,
        upload: MediaUpload,
        caption: Option<String>,
    ) -> Result<MessageId, SendError> {
        if !upload.kind.is_media() || upload.kind == MessageKind::Emoji {
            return Err(SendError::Rejected(format!(
                "{} cannot be uploaded",
                upload.kind.as_str()
            )));
        }
        let conversation = self.require_conversation()?;
        if !self.shared.latch.try_acquire() {
            return Err(SendError::SendInProgress);
        }
        let kind = upload.kind;
        let result = async {
            let media = self.shared.api.upload_media(upload).await?;
            let post = MediaPost {
                kind,
                media,
                caption,
            };
            self.shared.api.post_media(&conversation, &post).await
        }
        .await;
        self.shared.latch.release();
        let body = result.map_err(SendError::Api)?;
        self.append_from_body(&body, &conversation)
    }

    /// Post an emoji message. `code` is the emoji's `:code:`.
    ///
    /// # Errors
    ///
    /// Returns a guard failure or the REST failure.
    pub async fn send_emoji(&self, code: &str) -> Result<MessageId, SendError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let conversation = self.require_conversation()?;
        if !self.shared.latch.try_acquire() {
            return Err(SendError::SendInProgress);
        }
        let post = MediaPost {
            kind: MessageKind::Emoji,
            media: crate::api::UploadedMedia {
                url: code.to_string(),
                duration: None,
                thumbnail_url: None,
            },
            caption: None,
        };
        let result = self.shared.api.post_media(&conversation, &post).await;
        self.shared.latch.release();
        let body = result.map_err(SendError::Api)?;
        self.append_from_body(&body, &conversation)
    }

    /// Send an already-uploaded attachment over the stream.
    ///
    /// # Errors
    ///
    /// Returns a guard failure or the stream failure.
    pub async fn send_media_envelope(
        &self,
        kind: MessageKind,
        media: &MediaRef,
        caption: &str,
    ) -> Result<(), SendError> {
        if !self.shared.transport.is_connected() {
            return Err(SendError::NotConnected);
        }
        let conversation_id = self.require_conversation()?;
        if !self.shared.latch.try_acquire() {
            return Err(SendError::SendInProgress);
        }
        let envelope = Outbound::ChatMessage {
            content: caption.trim().to_string(),
            message_type: kind,
            target: Target::Conversation { conversation_id },
            media: Some(outbound_media(kind, media)),
            timestamp: None,
        };
        if let Err(err) = self.shared.transport.send(envelope).await {
            self.shared.latch.release();
            return Err(err.into());
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Edit
    // -----------------------------------------------------------------------

    /// Enter edit mode on one of the local user's messages.
    ///
    /// Checks the edit window locally, then asks the server. Returns the
    /// current text to pre-fill the editor with.
    ///
    /// # Errors
    ///
    /// Returns why the message cannot be edited.
    pub async fn start_edit(&self, id: &MessageId) -> Result<String, SendError> {
        let message = self.own_message(id)?;
        let age = Timestamp::now().abs_diff(message.created_at);
        let window = self.shared.config.edit_window;
        if u128::from(age) > window.as_millis() {
            return Err(SendError::EditWindowExpired(window));
        }

        let answer = self
            .shared
            .api
            .editable(id)
            .await
            .map_err(SendError::from_api)?;
        if !answer.is_editable {
            return Err(SendError::EditRefused(
                answer.reason.unwrap_or_else(|| "not editable".into()),
            ));
        }
        self.shared
            .engine
            .lock()
            .enter_edit(id)
            .ok_or(SendError::MessageMissing)
    }

    /// Leave edit mode, restoring the text if an edit was applied.
    pub fn cancel_edit(&self) -> Option<MessageId> {
        self.shared.engine.lock().cancel_edit()
    }

    /// Apply `text` to the message in edit mode and send it.
    ///
    /// The new text is shown immediately and reverted if the server
    /// refuses; edit mode then stays open with the original text.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::NotEditing`], [`SendError::EmptyMessage`], or the
    /// mapped server refusal.
    pub async fn submit_edit(&self, text: &str) -> Result<MessageId, SendError> {
        let content = text.trim();
        if content.is_empty() {
            return Err(SendError::EmptyMessage);
        }
        let id = self
            .shared
            .engine
            .lock()
            .apply_optimistic_edit(content)
            .ok_or(SendError::NotEditing)?;

        let failure = match self.shared.api.edit(&id, content).await {
            Ok(outcome) if outcome.success => {
                let confirmed = outcome
                    .edited_message
                    .as_ref()
                    .and_then(|m| m.get("content"))
                    .and_then(serde_json::Value::as_str)
                    .filter(|c| !c.is_empty())
                    .unwrap_or(content)
                    .to_string();
                self.shared.engine.lock().confirm_edit(&id, Some(&confirmed));
                tracing::info!(message_id = %id, "edit confirmed");
                self.notify(Notice::EditConfirmed(id.clone()));
                return Ok(id);
            }
            Ok(outcome) => {
                SendError::EditRefused(outcome.message.unwrap_or_else(|| "edit failed".into()))
            }
            Err(err) => SendError::from_api(err),
        };

        tracing::warn!(message_id = %id, err = %failure, "edit failed, reverting");
        if let Some((message_id, draft)) = self.shared.engine.lock().rollback_edit() {
            self.notify(Notice::EditFailed {
                message_id,
                reason: failure.to_string(),
                draft,
            });
        }
        Err(failure)
    }

    // -----------------------------------------------------------------------
    // Recall
    // -----------------------------------------------------------------------

    /// Recall one of the local user's messages.
    ///
    /// The tombstone is shown before the request; a failure restores the
    /// message exactly as it was.
    ///
    /// # Errors
    ///
    /// Returns why the message cannot be recalled or the mapped refusal.
    pub async fn recall(&self, id: &MessageId) -> Result<(), SendError> {
        self.own_message(id)?;
        let previous = self
            .shared
            .engine
            .lock()
            .begin_recall(id)
            .ok_or(SendError::Recalled)?;

        match self.shared.api.recall(id).await {
            Ok(()) => {
                self.shared.engine.lock().confirm_recall(id);
                tracing::info!(message_id = %id, "message recalled");
                self.notify(Notice::RecallSucceeded(id.clone()));
                Ok(())
            }
            Err(err) => {
                let failure = SendError::from_api(err);
                if !self.shared.engine.lock().abort_recall(previous) {
                    tracing::info!(message_id = %id, err = %failure, "recall request failed after stream confirmed it");
                    self.notify(Notice::RecallSucceeded(id.clone()));
                    return Ok(());
                }
                tracing::warn!(message_id = %id, err = %failure, "recall failed, restored");
                self.notify(Notice::RecallFailed {
                    message_id: id.clone(),
                    reason: failure.to_string(),
                });
                Err(failure)
            }
        }
    }

    // -----------------------------------------------------------------------
    // Typing and read receipts
    // -----------------------------------------------------------------------

    /// React to the input field changing. Announces typing at most once per
    /// burst and stops it after the idle timeout or when `text` is empty.
    pub async fn input_changed(&self, text: &str) {
        let (change, generation) = {
            let mut typing = self.shared.typing.lock();
            let change = typing.on_input(text);
            (change, typing.generation())
        };
        if let Some(state) = change {
            self.announce_typing(state).await;
        }

        let armed = if text.trim().is_empty() {
            None
        } else {
            let builder = self.clone();
            let idle = self.shared.config.typing_idle;
            Some(tokio::spawn(async move {
                tokio::time::sleep(idle).await;
                let change = builder.shared.typing.lock().on_idle(generation);
                if let Some(state) = change {
                    builder.announce_typing(state).await;
                }
            }))
        };
        if let Some(previous) = std::mem::replace(&mut *self.shared.typing_timer.lock(), armed) {
            previous.abort();
        }
    }

    /// Stop typing now.
    pub async fn stop_typing(&self) {
        if let Some(timer) = self.shared.typing_timer.lock().take() {
            timer.abort();
        }
        let change = self.shared.typing.lock().stop();
        if let Some(state) = change {
            self.announce_typing(state).await;
        }
    }

    /// Acknowledge reading `conversation_id` up to `message_id` over the
    /// stream.
    pub async fn send_read_receipt(&self, conversation_id: ConversationId, message_id: MessageId) {
        if !self.shared.transport.is_connected() {
            return;
        }
        let envelope = Outbound::ReadReceipt {
            conversation_id,
            message_id: Some(message_id),
            timestamp: None,
        };
        if let Err(err) = self.shared.transport.send(envelope).await {
            tracing::debug!(err = %err, "read receipt not sent");
        }
    }

    /// Mark a loaded history read up to the newest message from someone
    /// else, or the whole conversation if there is none.
    pub async fn mark_history_read(&self, conversation: &ConversationId, history: &[Message]) {
        let local = self.shared.engine.lock().local_user();
        let newest_foreign = newest_from_others(history, local);
        if let Err(err) = self
            .shared
            .api
            .mark_read(conversation, newest_foreign.as_ref())
            .await
        {
            tracing::warn!(conversation_id = %conversation, err = %err, "mark read failed");
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn announce_typing(&self, is_typing: bool) {
        let conversation_id = self.shared.engine.lock().conversation_id().cloned();
        let Some(conversation_id) = conversation_id else {
            return;
        };
        if !self.shared.transport.is_connected() {
            return;
        }
        let envelope = Outbound::Typing {
            conversation_id,
            is_typing,
            timestamp: None,
        };
        if let Err(err) = self.shared.transport.send(envelope).await {
            tracing::debug!(err = %err, is_typing, "typing state not sent");
        }
    }

    fn require_conversation(&self) -> Result<ConversationId, SendError> {
        self.shared
            .engine
            .lock()
            .conversation_id()
            .cloned()
            .ok_or(SendError::NoConversation)
    }

    /// A confirmed message owned by the local user.
    fn own_message(&self, id: &MessageId) -> Result<Message, SendError> {
        let engine = self.shared.engine.lock();
        let message = engine
            .message(id)
            .filter(|m| !m.id.is_provisional())
            .ok_or(SendError::MessageMissing)?;
        if !message.is_from(engine.local_user()) {
            return Err(SendError::NotYourMessage);
        }
        if message.is_recalled {
            return Err(SendError::Recalled);
        }
        Ok(message)
    }

    fn append_from_body(
        &self,
        body: &serde_json::Value,
        conversation: &ConversationId,
    ) -> Result<MessageId, SendError> {
        let message = message_from_value(body, Some(conversation)).map_err(|skipped| {
            SendError::Api(ApiError::Decode(format!("unusable message in response: {skipped}")))
        })?;
        let id = message.id.clone();
        self.shared.engine.lock().append_confirmed(message);
        tracing::debug!(message_id = %id, "confirmed message appended");
        Ok(id)
    }

    fn notify(&self, notice: Notice) {
        if self.shared.notices.try_send(notice).is_err() {
            tracing::debug!("notice dropped, channel full or closed");
        }
    }
}

/// Newest message in `history` not written by `local`.
#[must_use]
pub fn newest_from_others(history: &[Message], local: UserId) -> Option<MessageId> {
    history
        .iter()
        .filter(|m| !m.is_from(local) && !m.id.is_provisional())
        .max_by_key(|m| m.created_at)
        .map(|m| m.id.clone())
}

fn outbound_media(kind: MessageKind, media: &MediaRef) -> OutboundMedia {
    let mut fields = OutboundMedia::default();
    match kind {
        MessageKind::Image => fields.image_url = Some(media.url.clone()),
        MessageKind::Audio => {
            fields.audio_url = Some(media.url.clone());
            fields.audio_duration = media.duration;
        }
        MessageKind::Video => {
            fields.video_url = Some(media.url.clone());
            fields.video_duration = media.duration;
            fields.video_thumbnail_url.clone_from(&media.thumbnail_url);
        }
        MessageKind::Text | MessageKind::Emoji | MessageKind::Command => {}
    }
    fields
}
