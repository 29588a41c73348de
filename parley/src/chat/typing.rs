//! Typing indicators: debouncing our own, tracking everyone else's.

use std::collections::{HashMap, HashSet};

use parley_proto::message::{ConversationId, UserId};
use parley_proto::typing::TypingStatus;

/// Debounce state for the local user's typing indicator.
///
/// Every method returns the state to announce, or `None` when nothing
/// should be sent. Consecutive announcements never repeat a state.
#[derive(Debug, Default)]
pub struct TypingDebouncer {
    announced: bool,
    /// Bumped on every keystroke; an idle timer only fires for the
    /// generation it was armed with.
    generation: u64,
}

impl TypingDebouncer {
    /// React to the input field changing to `text`.
    ///
    /// Empty input stops typing immediately. Otherwise the idle timer is
    /// re-armed (see [`Self::generation`]) and `true` is announced once per
    /// burst.
    pub fn on_input(&mut self, text: &str) -> Option<bool> {
        if text.trim().is_empty() {
            return self.stop();
        }
        self.generation += 1;
        if self.announced {
            return None;
        }
        self.announced = true;
        Some(true)
    }

    /// The idle timer armed at `generation` expired.
    pub fn on_idle(&mut self, generation: u64) -> Option<bool> {
        if generation != self.generation {
            return None;
        }
        self.stop()
    }

    /// Stop typing now, for a send or a conversation switch.
    pub fn stop(&mut self) -> Option<bool> {
        self.generation += 1;
        if !self.announced {
            return None;
        }
        self.announced = false;
        Some(false)
    }

    /// Generation an idle timer should be armed with.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether `true` is the last announced state.
    #[must_use]
    pub const fn is_announced(&self) -> bool {
        self.announced
    }
}

/// Who else is typing, per conversation.
#[derive(Debug)]
pub struct TypingRoster {
    local_user: UserId,
    typing: HashMap<ConversationId, HashSet<UserId>>,
}

impl TypingRoster {
    /// An empty roster that ignores echoes of `local_user`.
    #[must_use]
    pub fn new(local_user: UserId) -> Self {
        Self {
            local_user,
            typing: HashMap::new(),
        }
    }

    /// Apply a pushed status. Returns the conversation and its new typing
    /// count when the set changed.
    pub fn apply(&mut self, status: &TypingStatus) -> Option<(ConversationId, usize)> {
        if status.user_id == self.local_user {
            return None;
        }
        let conversation = status.conversation_id.clone()?;
        let users = self.typing.entry(conversation.clone()).or_default();
        let changed = if status.is_typing {
            users.insert(status.user_id)
        } else {
            users.remove(&status.user_id)
        };
        changed.then(|| (conversation, users.len()))
    }

    /// Users typing in `conversation`, in id order.
    #[must_use]
    pub fn typing_in(&self, conversation: &ConversationId) -> Vec<UserId> {
        let mut users: Vec<_> = self
            .typing
            .get(conversation)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        users.sort_unstable();
        users
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.typing.clear();
    }
}
