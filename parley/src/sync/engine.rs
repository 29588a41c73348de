//! The reconciliation engine.
//!
//! Holds the message list of one conversation context and applies every
//! mutation to a working copy that replaces the published snapshot in one
//! step. Live envelopes are dispatched in a fixed precedence: server
//! error, send confirmation, recall, read status, edit, new message.
//! Corrections (recall, edit, read status) for ids not in the list are
//! dropped.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use parley_proto::envelope::{Inbound, ReadStatusUpdate};
use parley_proto::message::{ConversationId, Message, MessageId, UserId};

use super::merge;
use super::read_status::ReadStatusTable;
use super::{Notice, SyncEffect, Timeline};

/// Engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The authenticated user.
    pub local_user: UserId,
    /// Window for treating two same-payload messages as one delivery.
    pub duplicate_window: Duration,
    /// Window within which a confirmed own message replaces an already
    /// confirmed entry with the same payload.
    pub echo_window: Duration,
    /// Base URL that relative media locations are resolved against.
    pub media_base: String,
    /// Upgrade absolute `http` media URLs to `https`.
    pub force_https_media: bool,
}

impl EngineConfig {
    /// Settings with the default duplicate window and no media base.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            duplicate_window: Duration::from_secs(2),
            echo_window: Duration::from_secs(5),
            media_base: String::new(),
            force_https_media: false,
        }
    }
}

/// An edit the local user has open.
#[derive(Debug, Clone, PartialEq, Eq)]
struct EditInFlight {
    message_id: MessageId,
    /// Content before the edit, restored on failure.
    original: String,
    /// Whether the new content was applied and sent.
    submitted: bool,
}

/// Conversation-scoped state, dropped as a whole on switch or clear.
#[derive(Debug, Default)]
struct ConversationContext {
    conversation_id: Option<ConversationId>,
    /// Recipient for first-contact sends.
    peer: Option<UserId>,
    /// Ids whose arrival already produced its effects.
    processed: HashSet<MessageId>,
    editing: Option<EditInFlight>,
    /// Optimistic recalls awaiting their REST result, with whether the
    /// server already announced the recall on the stream.
    pending_recalls: HashMap<MessageId, bool>,
}

/// Owner of the active conversation's message list.
pub struct SyncEngine {
    config: EngineConfig,
    context: ConversationContext,
    read_status: ReadStatusTable,
    timeline: watch::Sender<Timeline>,
}

impl SyncEngine {
    /// An engine with no conversation and an empty list.
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let (timeline, _) = watch::channel(Arc::new(Vec::new()));
        Self {
            config,
            context: ConversationContext::default(),
            read_status: ReadStatusTable::default(),
            timeline,
        }
    }

    /// The authenticated user.
    #[must_use]
    pub const fn local_user(&self) -> UserId {
        self.config.local_user
    }

    /// Current snapshot.
    #[must_use]
    pub fn snapshot(&self) -> Timeline {
        Arc::clone(&self.timeline.borrow())
    }

    /// Receiver that observes every published snapshot.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Timeline> {
        self.timeline.subscribe()
    }

    /// Conversation of the active context, once known.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        self.context.conversation_id.as_ref()
    }

    /// First-contact recipient of the active context.
    #[must_use]
    pub const fn peer(&self) -> Option<UserId> {
        self.context.peer
    }

    /// A copy of one message.
    #[must_use]
    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.timeline.borrow().iter().find(|m| &m.id == id).cloned()
    }

    /// Read-status side table.
    #[must_use]
    pub const fn read_status(&self) -> &ReadStatusTable {
        &self.read_status
    }

    /// Mutable read-status side table.
    pub const fn read_status_mut(&mut self) -> &mut ReadStatusTable {
        &mut self.read_status
    }

    /// Message currently in edit mode.
    #[must_use]
    pub fn editing(&self) -> Option<&MessageId> {
        self.context.editing.as_ref().map(|e| &e.message_id)
    }

    /// Start a fresh context for `conversation_id` (or a first-contact
    /// conversation with `peer`), dropping the list and every
    /// conversation-scoped guard.
    pub fn reset(&mut self, conversation_id: Option<ConversationId>, peer: Option<UserId>) {
        self.context = ConversationContext {
            conversation_id,
            peer,
            ..ConversationContext::default()
        };
        self.read_status.clear();
        self.publish(Vec::new());
    }

    /// Adopt `id` if the context has no conversation yet. Returns whether
    /// it was adopted.
    pub fn adopt_conversation(&mut self, id: &ConversationId) -> bool {
        if self.context.conversation_id.is_some() {
            return false;
        }
        tracing::info!(conversation_id = %id, "conversation id adopted");
        self.context.conversation_id = Some(id.clone());
        true
    }

    /// Empty the list of `conversation_id` if it is the active one.
    ///
    /// Resets the processed-id set and any open edit. Returns whether
    /// anything was cleared.
    pub fn clear(&mut self, conversation_id: &ConversationId) -> bool {
        if self.context.conversation_id.as_ref() != Some(conversation_id) {
            return false;
        }
        self.context.processed.clear();
        self.context.editing = None;
        self.read_status.clear();
        self.publish(Vec::new());
        tracing::info!(conversation_id = %conversation_id, "conversation cleared");
        true
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    /// Merge a fetched batch into the list.
    ///
    /// Known ids are updated (edited and recalled flags never reset),
    /// provisional entries whose confirmation is in the batch collapse into
    /// it, and the result is re-sorted.
    ///
    /// History ids are not added to the processed set: history never
    /// notifies, and a live copy of a listed id is caught by the id lookup.
    pub fn ingest_history(&mut self, messages: Vec<Message>) {
        let mut list = self.working_copy();
        let mut rest = Vec::with_capacity(messages.len());
        for mut message in messages {
            if !message.is_displayable() {
                continue;
            }
            self.prepare(&mut message);
            if merge::position(&list, &message.id).is_none()
                && message.is_from(self.config.local_user)
                && let Some(at) = merge::find_provisional(&list, &message)
            {
                merge::replace_confirmed(&mut list, at, message);
                continue;
            }
            rest.push(message);
        }
        let mut merged = merge::merge_history(&list, rest);
        let lookup = merged.clone();
        for message in &mut merged {
            merge::resolve_reply(&lookup, message);
        }
        tracing::debug!(count = merged.len(), "history merged");
        self.publish(merged);
    }

    // -----------------------------------------------------------------------
    // Live events
    // -----------------------------------------------------------------------

    /// Apply one live envelope and return the follow-up work.
    pub fn ingest_live(&mut self, inbound: Inbound) -> Vec<SyncEffect> {
        match inbound {
            Inbound::Error { message } => self.on_server_error(message),
            Inbound::MessageSent {
                message_id,
                conversation_id,
            } => {
                tracing::debug!(message_id = ?message_id, "send confirmed");
                let mut effects = vec![SyncEffect::ReleaseSendLatch];
                if let Some(id) = conversation_id
                    && self.adopt_conversation(&id)
                {
                    effects.push(SyncEffect::ConversationAdopted {
                        conversation_id: id,
                        load_history: false,
                    });
                }
                effects
            }
            Inbound::Recall {
                message_id,
                conversation_id,
            } => {
                if self.is_foreign(conversation_id.as_ref()) {
                    return Vec::new();
                }
                self.on_recall(&message_id)
            }
            Inbound::ReadStatus(update) => {
                if self.is_foreign(update.conversation_id.as_ref()) {
                    return Vec::new();
                }
                self.on_read_status(update)
            }
            Inbound::MessageEdited {
                message_id,
                conversation_id,
                content,
            } => {
                if self.is_foreign(conversation_id.as_ref()) {
                    return Vec::new();
                }
                self.on_edit(&message_id, content.as_deref())
            }
            Inbound::NewMessage(message) => {
                if self.is_foreign(message.conversation_id.as_ref()) {
                    tracing::debug!(message_id = %message.id, "message for another conversation");
                    return Vec::new();
                }
                self.on_new_message(message)
            }
            Inbound::ConnectionEstablished { user_id } => {
                tracing::debug!(user_id = ?user_id, "stream session established");
                Vec::new()
            }
            Inbound::Typing(_) | Inbound::Pong => Vec::new(),
            Inbound::Unknown { tag } => {
                tracing::debug!(%tag, "ignoring unhandled envelope");
                Vec::new()
            }
        }
    }

    fn on_server_error(&mut self, reason: String) -> Vec<SyncEffect> {
        match self.rollback_edit() {
            Some((message_id, draft)) => {
                tracing::warn!(message_id = %message_id, %reason, "edit rejected by server");
                vec![SyncEffect::Notify(Notice::EditFailed {
                    message_id,
                    reason,
                    draft,
                })]
            }
            None => {
                tracing::warn!(%reason, "server error");
                vec![SyncEffect::Notify(Notice::ServerError(reason))]
            }
        }
    }

    fn on_recall(&mut self, id: &MessageId) -> Vec<SyncEffect> {
        if let Some(confirmed) = self.context.pending_recalls.get_mut(id) {
            tracing::debug!(message_id = %id, "own recall confirmed on stream");
            *confirmed = true;
        }
        let mut list = self.working_copy();
        let Some(sender) = merge::apply_recall(&mut list, id) else {
            tracing::debug!(message_id = %id, "recall for unknown or recalled message dropped");
            return Vec::new();
        };
        let sender_name = list
            .iter()
            .find(|m| &m.id == id)
            .map(|m| m.sender_name.clone())
            .unwrap_or_default();
        if self.editing() == Some(id) {
            self.context.editing = None;
        }
        self.publish(list);
        if sender == Some(self.config.local_user) {
            return Vec::new();
        }
        vec![SyncEffect::Notify(Notice::Recalled {
            message_id: id.clone(),
            sender_name,
        })]
    }

    fn on_read_status(&mut self, mut update: ReadStatusUpdate) -> Vec<SyncEffect> {
        let timeline = self.snapshot();
        update.message_ids.retain(|id| {
            let known = merge::position(&timeline, id).is_some();
            if !known {
                tracing::debug!(message_id = %id, "read status for unknown message dropped");
            }
            known
        });
        if update.message_ids.is_empty() {
            return Vec::new();
        }
        match update.statuses() {
            Some(statuses) => {
                for status in statuses {
                    self.read_status.apply(status);
                }
                vec![SyncEffect::Notify(Notice::ReadStatusUpdated(
                    update.message_ids,
                ))]
            }
            None => vec![SyncEffect::RefreshReadStatus(update.message_ids)],
        }
    }

    fn on_edit(&mut self, id: &MessageId, content: Option<&str>) -> Vec<SyncEffect> {
        let mut list = self.working_copy();
        if !merge::apply_edit(&mut list, id, content) {
            tracing::debug!(message_id = %id, "edit for unknown message dropped");
            return Vec::new();
        }
        self.publish(list);
        if self.editing() == Some(id) {
            self.context.editing = None;
            return vec![SyncEffect::Notify(Notice::EditConfirmed(id.clone()))];
        }
        Vec::new()
    }

    fn on_new_message(&mut self, mut message: Message) -> Vec<SyncEffect> {
        let mut effects = Vec::new();
        if self.context.processed.contains(&message.id) {
            tracing::trace!(message_id = %message.id, "already processed");
            return effects;
        }
        if !message.is_displayable() {
            return effects;
        }
        if let Some(id) = message.conversation_id.clone()
            && self.adopt_conversation(&id)
        {
            effects.push(SyncEffect::ConversationAdopted {
                conversation_id: id,
                load_history: true,
            });
        }
        self.prepare(&mut message);
        let mut list = self.working_copy();
        self.context.processed.insert(message.id.clone());

        if let Some(at) = merge::position(&list, &message.id) {
            let existing = &list[at];
            let changed = (message.is_recalled && !existing.is_recalled)
                || (message.is_edited && !existing.is_edited)
                || message.content != existing.content;
            if changed {
                merge::resolve_reply(&list, &mut message);
                list[at] = merge::merge_entry(&list[at], message);
                merge::sort_chronological(&mut list);
                self.publish(list);
            }
            return effects;
        }

        merge::resolve_reply(&list, &mut message);

        if message.is_from(self.config.local_user) {
            let slot = merge::find_provisional(&list, &message).or_else(|| {
                merge::find_near_duplicate(&list, &message, self.config.echo_window)
            });
            match slot {
                Some(at) => {
                    tracing::debug!(
                        replaced = %list[at].id,
                        message_id = %message.id,
                        "own message confirmed"
                    );
                    merge::replace_confirmed(&mut list, at, message);
                }
                None => list.push(message),
            }
            merge::sort_chronological(&mut list);
            self.publish(list);
            effects.push(SyncEffect::ReleaseSendLatch);
            return effects;
        }

        if merge::find_near_duplicate(&list, &message, self.config.duplicate_window).is_some() {
            tracing::debug!(message_id = %message.id, "duplicate delivery dropped");
            return effects;
        }

        let notice = Notice::NewMessage {
            conversation_id: message.conversation_id.clone(),
            message_id: message.id.clone(),
            sender_name: message.sender_name.clone(),
            preview: if message.kind.is_media() && message.content.is_empty() {
                format!("[{}]", message.kind.as_str())
            } else {
                message.content.clone()
            },
        };
        let receipt = message
            .conversation_id
            .clone()
            .map(|conversation_id| SyncEffect::SendReadReceipt {
                conversation_id,
                message_id: message.id.clone(),
            });
        list.push(message);
        merge::sort_chronological(&mut list);
        self.publish(list);
        effects.push(SyncEffect::Notify(notice));
        effects.extend(receipt);
        effects
    }

    // -----------------------------------------------------------------------
    // Optimistic updates driven by outbound commands
    // -----------------------------------------------------------------------

    /// Show a just-sent message before the server confirms it.
    pub fn insert_provisional(&mut self, message: Message) {
        let mut list = self.working_copy();
        list.push(message);
        merge::sort_chronological(&mut list);
        self.publish(list);
    }

    /// Remove a provisional entry whose send failed.
    pub fn discard_provisional(&mut self, id: &MessageId) -> bool {
        if !id.is_provisional() {
            return false;
        }
        let mut list = self.working_copy();
        let before = list.len();
        list.retain(|m| &m.id != id);
        let removed = list.len() != before;
        if removed {
            self.publish(list);
        }
        removed
    }

    /// Add a message the server already confirmed over a direct call.
    ///
    /// The id is marked processed so its live echo has no effect.
    pub fn append_confirmed(&mut self, mut message: Message) {
        self.prepare(&mut message);
        self.context.processed.insert(message.id.clone());
        let mut list = self.working_copy();
        merge::resolve_reply(&list, &mut message);
        match merge::position(&list, &message.id) {
            Some(at) => list[at] = merge::merge_entry(&list[at], message),
            None => list.push(message),
        }
        merge::sort_chronological(&mut list);
        self.publish(list);
    }

    /// Open edit mode on `id`. Returns the current text, or `None` if the
    /// message is unknown or recalled.
    pub fn enter_edit(&mut self, id: &MessageId) -> Option<String> {
        let message = self.message(id).filter(|m| !m.is_recalled)?;
        self.context.editing = Some(EditInFlight {
            message_id: id.clone(),
            original: message.content.clone(),
            submitted: false,
        });
        Some(message.content)
    }

    /// Close edit mode without changes.
    pub fn cancel_edit(&mut self) -> Option<MessageId> {
        let edit = self.context.editing.take()?;
        if edit.submitted {
            self.set_content(&edit.message_id, &edit.original);
        }
        Some(edit.message_id)
    }

    /// Show `content` on the message in edit mode while the edit request
    /// is in flight. The edited flag is left to the confirmation.
    pub fn apply_optimistic_edit(&mut self, content: &str) -> Option<MessageId> {
        let edit = self.context.editing.as_mut()?;
        edit.submitted = true;
        let id = edit.message_id.clone();
        self.set_content(&id, content);
        Some(id)
    }

    /// Record a confirmed edit and leave edit mode.
    pub fn confirm_edit(&mut self, id: &MessageId, content: Option<&str>) {
        let mut list = self.working_copy();
        if merge::apply_edit(&mut list, id, content) {
            self.publish(list);
        }
        if self.editing() == Some(id) {
            self.context.editing = None;
        }
    }

    /// Undo a submitted edit. Edit mode stays open on the message.
    /// Returns the message and its restored text, or `None` if no edit was
    /// submitted (for example, it was already rolled back).
    pub fn rollback_edit(&mut self) -> Option<(MessageId, String)> {
        let edit = self.context.editing.as_mut().filter(|e| e.submitted)?;
        edit.submitted = false;
        let (id, original) = (edit.message_id.clone(), edit.original.clone());
        self.set_content(&id, &original);
        Some((id, original))
    }

    /// Mark `id` recalled ahead of the server. Returns the entry as it was,
    /// or `None` if it is unknown or already recalled.
    pub fn begin_recall(&mut self, id: &MessageId) -> Option<Message> {
        let previous = self.message(id).filter(|m| !m.is_recalled)?;
        let mut list = self.working_copy();
        merge::apply_recall(&mut list, id)?;
        self.context.pending_recalls.insert(id.clone(), false);
        self.publish(list);
        Some(previous)
    }

    /// The server accepted a recall started with [`Self::begin_recall`].
    pub fn confirm_recall(&mut self, id: &MessageId) {
        self.context.pending_recalls.remove(id);
    }

    /// The recall request failed: put the entry back exactly as it was.
    ///
    /// Returns `false` and keeps the tombstone when the stream already
    /// announced the recall while the request was in flight.
    pub fn abort_recall(&mut self, previous: Message) -> bool {
        if self.context.pending_recalls.remove(&previous.id) == Some(true) {
            return false;
        }
        let mut list = self.working_copy();
        if let Some(at) = merge::position(&list, &previous.id) {
            list[at] = previous;
            self.publish(list);
        }
        true
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    fn working_copy(&self) -> Vec<Message> {
        self.timeline.borrow().as_ref().clone()
    }

    fn publish(&self, list: Vec<Message>) {
        self.timeline.send_replace(Arc::new(list));
    }

    /// A conversation id that names another conversation than the active one.
    fn is_foreign(&self, conversation_id: Option<&ConversationId>) -> bool {
        matches!(
            (conversation_id, &self.context.conversation_id),
            (Some(theirs), Some(ours)) if theirs != ours
        )
    }

    fn prepare(&self, message: &mut Message) {
        if message.conversation_id.is_none() {
            message.conversation_id.clone_from(&self.context.conversation_id);
        }
        if !self.config.media_base.is_empty() {
            merge::resolve_media(
                message,
                &self.config.media_base,
                self.config.force_https_media,
            );
        }
    }

    fn set_content(&self, id: &MessageId, content: &str) {
        let mut list = self.working_copy();
        if let Some(entry) = list.iter_mut().find(|m| &m.id == id && !m.is_recalled) {
            content.clone_into(&mut entry.content);
            self.publish(list);
        }
    }
}
