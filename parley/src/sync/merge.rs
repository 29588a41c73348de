//! Pure list operations behind the reconciliation engine.
//!
//! Every function takes the current list by reference or by mutable
//! reference to a working copy; the engine publishes the copy only after
//! the whole operation succeeded.

use std::collections::HashMap;
use std::time::Duration;

use parley_proto::message::{MediaRef, Message, MessageId, UNKNOWN_SENDER, UserId};
use parley_proto::normalize::resolve_media_url;

/// Stable sort by creation time; ties keep insertion order.
pub fn sort_chronological(list: &mut [Message]) {
    list.sort_by_key(|m| m.created_at);
}

/// Position of `id` in `list`.
#[must_use]
pub fn position(list: &[Message], id: &MessageId) -> Option<usize> {
    list.iter().position(|m| &m.id == id)
}

/// Merges an existing entry with a fresher copy of the same message.
///
/// The fresher copy wins, except that the edited and recalled latches
/// never go back to `false`, and a recalled message stays a tombstone.
#[must_use]
pub fn merge_entry(existing: &Message, mut incoming: Message) -> Message {
    incoming.is_edited |= existing.is_edited;
    if existing.is_recalled {
        incoming.recall();
    }
    if incoming.reply_to.is_none() {
        incoming.reply_to.clone_from(&existing.reply_to);
    }
    if incoming.conversation_id.is_none() {
        incoming.conversation_id.clone_from(&existing.conversation_id);
    }
    incoming
}

/// Merges a fetched history batch into `current`.
///
/// Entries with a known id are updated through [`merge_entry`]; new ids
/// are appended. Duplicate ids inside the batch collapse the same way.
/// The result is sorted.
#[must_use]
pub fn merge_history(current: &[Message], incoming: Vec<Message>) -> Vec<Message> {
    let mut merged = current.to_vec();
    let mut index: HashMap<MessageId, usize> = merged
        .iter()
        .enumerate()
        .map(|(i, m)| (m.id.clone(), i))
        .collect();
    for message in incoming {
        if let Some(&i) = index.get(&message.id) {
            merged[i] = merge_entry(&merged[i], message);
        } else {
            index.insert(message.id.clone(), merged.len());
            merged.push(message);
        }
    }
    sort_chronological(&mut merged);
    merged
}

/// Finds the provisional entry a confirmed own message replaces: same
/// sender and same payload. Not time-gated.
#[must_use]
pub fn find_provisional(list: &[Message], confirmed: &Message) -> Option<usize> {
    list.iter().position(|m| {
        m.id.is_provisional() && m.sender_id == confirmed.sender_id && m.same_payload(confirmed)
    })
}

/// Finds an entry that is another delivery of `message`: different id,
/// not provisional, same sender, same payload, created within `window`.
#[must_use]
pub fn find_near_duplicate(list: &[Message], message: &Message, window: Duration) -> Option<usize> {
    let window_ms = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
    list.iter().position(|m| {
        m.id != message.id
            && !m.id.is_provisional()
            && m.sender_id == message.sender_id
            && m.same_payload(message)
            && m.created_at.abs_diff(message.created_at) <= window_ms
    })
}

/// Replaces the entry at `at` with its confirmed counterpart, keeping the
/// position and carrying forward what only the local copy knew.
///
/// The conversation id is adopted from the confirmation only when the
/// local entry had none.
pub fn replace_confirmed(list: &mut [Message], at: usize, confirmed: Message) {
    let local = &list[at];
    let conversation_id = local
        .conversation_id
        .clone()
        .or_else(|| confirmed.conversation_id.clone());
    let mut merged = merge_entry(local, confirmed);
    merged.conversation_id = conversation_id;
    list[at] = merged;
}

/// Applies an edit. Returns `false` if the id is unknown.
///
/// A recalled message keeps its tombstone but still latches the edited
/// flag. `None` content keeps the current text.
pub fn apply_edit(list: &mut [Message], id: &MessageId, content: Option<&str>) -> bool {
    let Some(entry) = list.iter_mut().find(|m| &m.id == id) else {
        return false;
    };
    if !entry.is_recalled {
        if let Some(text) = content.filter(|t| !t.is_empty()) {
            text.clone_into(&mut entry.content);
        }
    }
    entry.is_edited = true;
    true
}

/// Applies a recall. Returns the entry's sender if the recall changed
/// anything, `None` if the id is unknown or already recalled.
pub fn apply_recall(list: &mut [Message], id: &MessageId) -> Option<Option<UserId>> {
    let entry = list.iter_mut().find(|m| &m.id == id)?;
    entry.recall().then_some(entry.sender_id)
}

/// Fills an unresolved reply reference from the local list.
pub fn resolve_reply(list: &[Message], message: &mut Message) {
    let Some(reply) = message.reply_to.as_mut() else {
        return;
    };
    if reply.is_resolved() {
        return;
    }
    if let Some(original) = list.iter().find(|m| m.id == reply.message_id) {
        if reply.content.is_empty() {
            reply.content.clone_from(&original.content);
        }
        if reply.sender_name.is_empty() || reply.sender_name == UNKNOWN_SENDER {
            reply.sender_name.clone_from(&original.sender_name);
        }
    }
}

/// Resolves relative media locations against the backend base URL.
pub fn resolve_media(message: &mut Message, base: &str, force_https: bool) {
    let Some(MediaRef {
        url, thumbnail_url, ..
    }) = message.media.as_mut()
    else {
        return;
    };
    *url = resolve_media_url(url, base, force_https);
    if let Some(thumb) = thumbnail_url.as_mut() {
        *thumb = resolve_media_url(thumb, base, force_https);
    }
}
