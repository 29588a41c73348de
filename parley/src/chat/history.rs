//! Paginated history retrieval.
//!
//! [`HistoryFetcher`] walks the `next` cursors of a conversation's message
//! pages, normalizes every record, and returns one chronologically sorted
//! batch. Failures never escape: a failed page ends the walk and whatever
//! was collected so far is returned.
//!
//! Only one fetch per conversation runs at a time. A second call while one
//! is in flight returns `None` immediately.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use parley_proto::message::{ConversationId, Message};
use parley_proto::normalize::message_from_value;

use crate::api::ChatApi;

/// Upper bound on pages followed in one fetch, against a server that
/// keeps returning a `next` cursor.
const MAX_PAGES: usize = 200;

/// In-flight guard table. Each claim carries a ticket so that a stale
/// guard released after [`HistoryFetcher::forget`] cannot drop a newer claim.
#[derive(Default)]
struct InFlight {
    claims: HashMap<ConversationId, u64>,
    next_ticket: u64,
}

/// Releases a conversation's claim when the fetch ends or is cancelled.
struct Claim {
    table: Arc<Mutex<InFlight>>,
    conversation: ConversationId,
    ticket: u64,
}

impl Drop for Claim {
    fn drop(&mut self) {
        let mut table = self.table.lock();
        if table.claims.get(&self.conversation) == Some(&self.ticket) {
            table.claims.remove(&self.conversation);
        }
    }
}

/// Fetches and normalizes a conversation's history.
pub struct HistoryFetcher<A: ChatApi> {
    api: Arc<A>,
    page_size: u32,
    in_flight: Arc<Mutex<InFlight>>,
}

impl<A: ChatApi> Clone for HistoryFetcher<A> {
    fn clone(&self) -> Self {
        Self {
            api: Arc::clone(&self.api),
            page_size: self.page_size,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<A: ChatApi> HistoryFetcher<A> {
    /// A fetcher requesting `page_size` messages per page.
    #[must_use]
    pub fn new(api: Arc<A>, page_size: u32) -> Self {
        Self {
            api,
            page_size,
            in_flight: Arc::new(Mutex::new(InFlight::default())),
        }
    }

    /// Whether a fetch for `conversation` is running.
    #[must_use]
    pub fn is_fetching(&self, conversation: &ConversationId) -> bool {
        self.in_flight.lock().claims.contains_key(conversation)
    }

    /// Drop the in-flight guard of `conversation`, so the next call fetches
    /// even if an older fetch is still winding down.
    pub fn forget(&self, conversation: &ConversationId) {
        self.in_flight.lock().claims.remove(conversation);
    }

    /// Fetch the whole history of `conversation`.
    ///
    /// Returns `None` if a fetch for the same conversation is already in
    /// flight, otherwise the (possibly partial) sorted batch.
    pub async fn fetch(&self, conversation: &ConversationId) -> Option<Vec<Message>> {
        let _claim = self.claim(conversation)?;
        let mut messages = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = match self
                .api
                .fetch_page(conversation, cursor.as_deref(), self.page_size)
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    tracing::warn!(
                        conversation_id = %conversation,
                        page = pages,
                        err = %err,
                        "history page failed, keeping partial result"
                    );
                    break;
                }
            };
            pages += 1;

            let Some(results) = page.results else {
                tracing::debug!(conversation_id = %conversation, "page without results ends history");
                break;
            };
            for raw in &results {
                match message_from_value(raw, Some(conversation)) {
                    Ok(message) => messages.push(message),
                    Err(skipped) => {
                        tracing::trace!(reason = %skipped, "history record skipped");
                    }
                }
            }

            match page.next.filter(|next| !next.is_empty()) {
                Some(next) if pages < MAX_PAGES => cursor = Some(next),
                Some(_) => {
                    tracing::warn!(conversation_id = %conversation, pages, "page limit reached");
                    break;
                }
                None => break,
            }
        }

        messages.sort_by_key(|m| m.created_at);
        tracing::info!(
            conversation_id = %conversation,
            count = messages.len(),
            pages,
            "history fetched"
        );
        Some(messages)
    }

    fn claim(&self, conversation: &ConversationId) -> Option<Claim> {
        let mut table = self.in_flight.lock();
        if table.claims.contains_key(conversation) {
            tracing::debug!(conversation_id = %conversation, "history fetch already in flight");
            return None;
        }
        table.next_ticket += 1;
        let ticket = table.next_ticket;
        table.claims.insert(conversation.clone(), ticket);
        Some(Claim {
            table: Arc::clone(&self.in_flight),
            conversation: conversation.clone(),
            ticket,
        })
    }
}
