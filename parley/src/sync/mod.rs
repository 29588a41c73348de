//! Reconciliation of history, live events and optimistic local state.
//!
//! [`engine::SyncEngine`] owns the message list of the active conversation
//! and is the only thing that mutates it. Inputs that need follow-up I/O
//! (read receipts, history loads, read-status lookups) come back as
//! [`SyncEffect`]s for the session to carry out.

pub mod engine;
pub mod merge;
pub mod read_status;

use std::sync::Arc;

use parley_proto::message::{ConversationId, Message, MessageId};

/// Immutable snapshot of a conversation's messages, oldest first.
pub type Timeline = Arc<Vec<Message>>;

/// User-facing notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    /// A message from another participant arrived.
    NewMessage {
        /// Conversation it belongs to.
        conversation_id: Option<ConversationId>,
        /// The message.
        message_id: MessageId,
        /// Author's display name.
        sender_name: String,
        /// Text, or the kind for attachments.
        preview: String,
    },
    /// Another participant withdrew a message.
    Recalled {
        /// The withdrawn message.
        message_id: MessageId,
        /// Author's display name.
        sender_name: String,
    },
    /// The local user's recall went through.
    RecallSucceeded(MessageId),
    /// The local user's recall failed and was undone.
    RecallFailed {
        /// Message that stays visible.
        message_id: MessageId,
        /// Why.
        reason: String,
    },
    /// An edit was confirmed.
    EditConfirmed(MessageId),
    /// An edit was refused and undone; edit mode is open again.
    EditFailed {
        /// Message being edited.
        message_id: MessageId,
        /// Why.
        reason: String,
        /// Text restored in the editor.
        draft: String,
    },
    /// Read state of some messages changed.
    ReadStatusUpdated(Vec<MessageId>),
    /// The server reported an error unrelated to an edit.
    ServerError(String),
    /// Someone started or stopped typing in the active conversation.
    TypingChanged {
        /// Conversation.
        conversation_id: ConversationId,
        /// How many others are typing now.
        typing: usize,
    },
    /// A stream operation failed (connect, send).
    TransportFault(String),
    /// The stream connected.
    Connected,
    /// The stream is down.
    ConnectionLost {
        /// Human-readable explanation.
        reason: String,
        /// Whether a reconnect is worth offering.
        retry: bool,
    },
}

/// Follow-up work produced by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEffect {
    /// Show a notice.
    Notify(Notice),
    /// Acknowledge reading up to `message_id`.
    SendReadReceipt {
        /// Conversation acknowledged.
        conversation_id: ConversationId,
        /// Newest message read.
        message_id: MessageId,
    },
    /// The active context learned its conversation id.
    ConversationAdopted {
        /// The id.
        conversation_id: ConversationId,
        /// Whether the history should be loaded now.
        load_history: bool,
    },
    /// Re-query the read state of these messages, even previously refused
    /// ones.
    RefreshReadStatus(Vec<MessageId>),
    /// A send was confirmed; the send latch may be released.
    ReleaseSendLatch,
}
