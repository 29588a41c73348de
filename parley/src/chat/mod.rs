//! Chat application layer.
//!
//! Everything between a user action and the wire: the outbound
//! [`send::CommandBuilder`], the paginated [`history::HistoryFetcher`],
//! typing debounce, the send latch and the cleared-conversation markers.

pub mod ack;
pub mod cleared;
pub mod history;
pub mod send;
pub mod typing;

pub use ack::SendLatch;
pub use cleared::{ClearedMarkers, StoreError};
pub use history::HistoryFetcher;
pub use send::{CommandBuilder, CommandConfig, SendError};
pub use typing::{TypingDebouncer, TypingRoster};
