//! Shared protocol definitions for the `Parley` chat stream.

pub mod codec;
pub mod envelope;
pub mod message;
pub mod normalize;
pub mod typing;
