//! Narrow interfaces to the authoritative backing store, plus the concrete
//! implementations the core ships with.

pub mod memory;
pub mod realtime;
pub mod rest;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{AchievementGrant, Conversation, MessageRecord, NewMessage, UserId};
use crate::store::UnreadScope;

pub use memory::MemoryBackend;
pub use realtime::RealtimeSocket;
pub use rest::{RestBackend, RestConfig};

/// Request/response side of the backing store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Persist a new message; returns the confirmed row.
    async fn write_message(&self, message: NewMessage) -> Result<MessageRecord>;

    /// Full history of a conversation, ascending by `created_at`.
    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>>;

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation>;

    /// Flip every unread row of `conversation_id` addressed to `recipient`.
    async fn mark_read(&self, conversation_id: &str, recipient: &UserId) -> Result<()>;

    async fn count_unread(&self, recipient: &UserId, scope: &UnreadScope) -> Result<u64>;

    /// Speculative evaluation that may create grants as a side effect.
    async fn evaluate_achievements(&self, user: &UserId) -> Result<()>;

    /// Grants for `user` strictly newer than `after`, newest first.
    async fn recent_grants(
        &self,
        user: &UserId,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchievementGrant>>;

    /// Human-readable names for the given users. Unknown ids are omitted.
    async fn display_names(&self, users: &[UserId]) -> Result<HashMap<UserId, String>>;
}

pub type SharedBackend = Arc<dyn Backend>;
