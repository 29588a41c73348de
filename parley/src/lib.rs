//! `Parley`: real-time chat message synchronization core.
//!
//! Keeps one conversation's message list consistent while history pages,
//! live stream events and the user's own optimistic edits arrive in any
//! order.

pub mod api;
pub mod chat;
pub mod config;
pub mod net;
pub mod session;
pub mod sync;
pub mod transport;
