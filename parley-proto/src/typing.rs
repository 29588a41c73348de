//! Typing indicator pushed by the server for other participants.

use serde::{Deserialize, Serialize};

use crate::message::{ConversationId, UserId};

/// Another participant started or stopped typing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypingStatus {
    /// The participant who is typing (or stopped).
    pub user_id: UserId,
    /// Conversation where typing is occurring, when reported.
    pub conversation_id: Option<ConversationId>,
    /// Whether the participant is currently typing.
    pub is_typing: bool,
}
