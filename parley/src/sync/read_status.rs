//! Side table of per-message read state.
//!
//! Read state is sender-observed and ephemeral; it never touches the
//! message entries. Lookups that the server refused with 404 or 403 are
//! remembered and not repeated unless forced, and provisional ids are never
//! looked up at all.

use std::collections::{HashMap, HashSet};

use parley_proto::message::{MessageId, ReadStatus};

use crate::api::ApiError;

/// Read state keyed by message id.
#[derive(Debug, Default)]
pub struct ReadStatusTable {
    statuses: HashMap<MessageId, ReadStatus>,
    failed: HashSet<MessageId>,
    in_flight: HashSet<MessageId>,
}

impl ReadStatusTable {
    /// Latest known read state of `id`.
    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&ReadStatus> {
        self.statuses.get(id)
    }

    /// Number of messages with known read state.
    #[must_use]
    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    /// Whether no read state is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Store a report pushed by the server or returned by a lookup.
    pub fn apply(&mut self, status: ReadStatus) {
        self.failed.remove(&status.message_id);
        self.statuses.insert(status.message_id.clone(), status);
    }

    /// Claim a lookup for `id`.
    ///
    /// Returns `false` when the lookup should not be made: the id is
    /// provisional, a lookup is already running, or an earlier lookup was
    /// refused and `force` is not set.
    pub fn begin_lookup(&mut self, id: &MessageId, force: bool) -> bool {
        if id.is_provisional() || self.in_flight.contains(id) {
            return false;
        }
        if self.failed.contains(id) {
            if !force {
                return false;
            }
            self.failed.remove(id);
        }
        self.in_flight.insert(id.clone());
        true
    }

    /// Record the outcome of a lookup claimed with [`Self::begin_lookup`].
    pub fn finish_lookup(&mut self, id: &MessageId, result: Result<ReadStatus, &ApiError>) {
        self.in_flight.remove(id);
        match result {
            Ok(status) => self.apply(status),
            Err(err) if matches!(err.status(), Some(403 | 404)) => {
                tracing::debug!(message_id = %id, err = %err, "read status unavailable");
                self.failed.insert(id.clone());
            }
            Err(err) => tracing::warn!(message_id = %id, err = %err, "read status lookup failed"),
        }
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.statuses.clear();
        self.failed.clear();
        self.in_flight.clear();
    }
}
