//! Synchronous component state. Each sub-store is owned by exactly one
//! session object and only mutated through its methods.

pub mod achievements;
pub mod messages;
pub mod unread;

pub use achievements::WatermarkState;
pub use messages::{MessageStore, RemoteInsertOutcome, ResolveOutcome};
pub use unread::{UnreadScope, UnreadState};
