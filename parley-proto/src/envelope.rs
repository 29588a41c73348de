//! Envelope types exchanged over the chat stream.
//!
//! Outbound envelopes are built by the client and serialized with a `type`
//! tag. Inbound envelopes are decoded by [`crate::codec::decode`] into the
//! closed [`Inbound`] sum type; unrecognized `type` or `command_type` tags
//! become [`Inbound::Unknown`] and are ignored downstream.

use serde::Serialize;

use crate::message::{
    ConversationId, Message, MessageId, MessageKind, ReadStatus, Reader, Timestamp, UserId,
};
use crate::typing::TypingStatus;

/// Where a chat message is addressed.
///
/// `Receiver` is only used before a 1:1 conversation exists; the server
/// creates the conversation and reports its id in `message_sent`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Target {
    /// An existing conversation.
    Conversation {
        /// Conversation id.
        conversation_id: ConversationId,
    },
    /// A user with whom no conversation exists yet.
    Receiver {
        /// Recipient's account id.
        receiver_id: UserId,
    },
}

impl Target {
    /// The conversation, when addressed to one.
    #[must_use]
    pub const fn conversation(&self) -> Option<&ConversationId> {
        match self {
            Self::Conversation { conversation_id } => Some(conversation_id),
            Self::Receiver { .. } => None,
        }
    }
}

/// Attachment fields of an outbound chat message, flattened into the envelope.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct OutboundMedia {
    /// Image location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Audio location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_url: Option<String>,
    /// Audio length in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub audio_duration: Option<f64>,
    /// Video location.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_url: Option<String>,
    /// Video length in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_duration: Option<f64>,
    /// Video poster frame.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_thumbnail_url: Option<String>,
}

/// Command carried by a `command_message` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "command_type", content = "command_data", rename_all = "snake_case")]
pub enum OutboundCommand {
    /// Withdraw a message.
    Recall {
        /// Message to withdraw.
        recalled_message_id: MessageId,
    },
    /// Replace a message's text.
    Edit {
        /// Message being edited.
        edited_message_id: MessageId,
        /// Replacement text.
        new_content: String,
    },
}

/// An envelope sent from client to server.
///
/// Every variant carries an optional `timestamp`; the transport session
/// stamps the send time when it is `None`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    /// A new chat message.
    ChatMessage {
        /// Text or caption.
        content: String,
        /// Payload kind.
        message_type: MessageKind,
        /// Conversation or first-contact recipient.
        #[serde(flatten)]
        target: Target,
        /// Attachment fields, for media sends.
        #[serde(flatten)]
        media: Option<OutboundMedia>,
        /// Send time in epoch milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// The local user started or stopped typing.
    Typing {
        /// Conversation being typed in.
        conversation_id: ConversationId,
        /// Current state.
        is_typing: bool,
        /// Send time in epoch milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// The local user has read the conversation up to `message_id`.
    ReadReceipt {
        /// Conversation being acknowledged.
        conversation_id: ConversationId,
        /// Newest message read; `None` marks the whole conversation.
        #[serde(skip_serializing_if = "Option::is_none")]
        message_id: Option<MessageId>,
        /// Send time in epoch milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// A recall or edit command.
    CommandMessage {
        /// Conversation the target message belongs to.
        conversation_id: ConversationId,
        /// The command.
        #[serde(flatten)]
        command: OutboundCommand,
        /// Send time in epoch milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
    /// Keep-alive.
    Ping {
        /// Send time in epoch milliseconds.
        #[serde(skip_serializing_if = "Option::is_none")]
        timestamp: Option<Timestamp>,
    },
}

impl Outbound {
    /// Builds a plain text message for a conversation or recipient.
    pub fn text(content: impl Into<String>, target: Target) -> Self {
        Self::ChatMessage {
            content: content.into(),
            message_type: MessageKind::Text,
            target,
            media: None,
            timestamp: None,
        }
    }

    /// Builds a keep-alive ping.
    #[must_use]
    pub const fn ping() -> Self {
        Self::Ping { timestamp: None }
    }

    /// The wire `type` tag of this envelope.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ChatMessage { .. } => "chat_message",
            Self::Typing { .. } => "typing",
            Self::ReadReceipt { .. } => "read_receipt",
            Self::CommandMessage { .. } => "command_message",
            Self::Ping { .. } => "ping",
        }
    }

    /// The send-time stamp, if set.
    #[must_use]
    pub const fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Self::ChatMessage { timestamp, .. }
            | Self::Typing { timestamp, .. }
            | Self::ReadReceipt { timestamp, .. }
            | Self::CommandMessage { timestamp, .. }
            | Self::Ping { timestamp } => *timestamp,
        }
    }

    /// Sets the send-time stamp if the caller left it empty.
    pub fn stamp(&mut self, now: Timestamp) {
        let (Self::ChatMessage { timestamp, .. }
        | Self::Typing { timestamp, .. }
        | Self::ReadReceipt { timestamp, .. }
        | Self::CommandMessage { timestamp, .. }
        | Self::Ping { timestamp }) = self;
        timestamp.get_or_insert(now);
    }
}

/// Counts carried by a `read_status` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadCounts {
    /// Recipients who have read the message.
    pub read_count: u32,
    /// Recipients, excluding the sender.
    pub total_recipients: u32,
}

/// A batch read-status update pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadStatusUpdate {
    /// Conversation the messages belong to.
    pub conversation_id: Option<ConversationId>,
    /// Messages whose read state changed.
    pub message_ids: Vec<MessageId>,
    /// New counts, when the server included them. `None` means the client
    /// should re-query each message.
    pub counts: Option<ReadCounts>,
    /// Participants who have read, when listed.
    pub readers: Vec<Reader>,
    /// Participants who have not, when listed.
    pub unread_users: Vec<Reader>,
}

impl ReadStatusUpdate {
    /// Per-message reports built from the pushed counts, or `None` when the
    /// server sent ids only.
    #[must_use]
    pub fn statuses(&self) -> Option<Vec<ReadStatus>> {
        let counts = self.counts?;
        Some(
            self.message_ids
                .iter()
                .map(|id| ReadStatus {
                    message_id: id.clone(),
                    total_recipients: counts.total_recipients,
                    read_count: counts.read_count,
                    readers: self.readers.clone(),
                    unread_users: self.unread_users.clone(),
                })
                .collect(),
        )
    }
}

/// An envelope received from the server, decoded into a closed set.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// The server accepted the stream.
    ConnectionEstablished {
        /// The authenticated user, when reported.
        user_id: Option<UserId>,
    },
    /// Acknowledgment of an outbound `chat_message`.
    MessageSent {
        /// Server id assigned to the message.
        message_id: Option<MessageId>,
        /// Conversation the message landed in (newly created for first contact).
        conversation_id: Option<ConversationId>,
    },
    /// A message pushed by the server, already normalized.
    NewMessage(Message),
    /// A message's text changed. Also produced for a `new_message` flagged
    /// as edited and for an inbound `edit` command.
    MessageEdited {
        /// Edited message.
        message_id: MessageId,
        /// Conversation of the edited message.
        conversation_id: Option<ConversationId>,
        /// Replacement text, when present.
        content: Option<String>,
    },
    /// A message was withdrawn.
    Recall {
        /// Withdrawn message.
        message_id: MessageId,
        /// Conversation of the withdrawn message.
        conversation_id: Option<ConversationId>,
    },
    /// Read state of one or more messages changed.
    ReadStatus(ReadStatusUpdate),
    /// Another participant started or stopped typing.
    Typing(TypingStatus),
    /// The server rejected something the client sent.
    Error {
        /// Server-supplied reason.
        message: String,
    },
    /// Reply to a keep-alive ping.
    Pong,
    /// A `type` or `command_type` this client does not handle.
    Unknown {
        /// The unrecognized tag.
        tag: String,
    },
}

impl Inbound {
    /// Conversation named by the envelope, if any.
    #[must_use]
    pub const fn conversation_id(&self) -> Option<&ConversationId> {
        match self {
            Self::MessageSent {
                conversation_id, ..
            }
            | Self::MessageEdited {
                conversation_id, ..
            }
            | Self::Recall {
                conversation_id, ..
            } => conversation_id.as_ref(),
            Self::NewMessage(m) => m.conversation_id.as_ref(),
            Self::ReadStatus(update) => update.conversation_id.as_ref(),
            Self::Typing(t) => t.conversation_id.as_ref(),
            Self::ConnectionEstablished { .. }
            | Self::Error { .. }
            | Self::Pong
            | Self::Unknown { .. } => None,
        }
    }
}
