//! In-process authoritative store.
//!
//! Implements both [`Backend`] and [`RealtimeTransport`] over plain
//! collections, with switches for the failure modes the core has to survive:
//! failed writes and queries, dropped connections, refused reconnects and
//! slow acknowledgements.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::Backend;
use crate::channel::{ChangeEvent, ChangeKind, ChangeStream, ChannelFilter, RealtimeTransport};
use crate::clock::{SharedClock, SystemClock};
use crate::constants::{tables, EVALUATE_ACHIEVEMENTS_RPC};
use crate::error::{Result, SyncError};
use crate::models::{AchievementGrant, Conversation, MessageRecord, NewMessage, UserId};
use crate::store::UnreadScope;

struct Subscriber {
    table: String,
    filter: ChannelFilter,
    tx: mpsc::UnboundedSender<Result<ChangeEvent>>,
}

#[derive(Default)]
struct Faults {
    failing_writes: usize,
    failing_queries: bool,
    failing_rpc: bool,
    refusing_connections: bool,
    write_delay: Duration,
    query_delay: Duration,
}

#[derive(Default)]
struct MemoryState {
    messages: Vec<MessageRecord>,
    conversations: HashMap<String, Conversation>,
    grants: Vec<AchievementGrant>,
    /// Achievement ids the next evaluation RPC will grant, per user
    pending_awards: HashMap<UserId, Vec<String>>,
    profiles: HashMap<UserId, String>,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    faults: Faults,
    rpc_calls: usize,
}

impl MemoryState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:06}", prefix, self.next_id)
    }

    fn publish(&mut self, table: &str, kind: ChangeKind, row: serde_json::Value) {
        self.subscribers.retain(|sub| {
            if sub.table != table || !sub.filter.matches(&row) {
                return !sub.tx.is_closed();
            }
            let event = ChangeEvent::new(table, kind, row.clone());
            sub.tx.send(Ok(event)).is_ok()
        });
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    clock: SharedClock,
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryBackend")
            .field("messages", &state.messages.len())
            .field("grants", &state.grants.len())
            .field("subscribers", &state.subscribers.len())
            .finish()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::with_clock(std::sync::Arc::new(SystemClock))
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            clock,
        }
    }

    // ===== Seeding =====

    pub fn add_profile(&self, user: &UserId, name: &str) {
        self.state.lock().profiles.insert(user.clone(), name.to_string());
    }

    pub fn add_conversation(&self, conversation: Conversation) {
        self.state
            .lock()
            .conversations
            .insert(conversation.id.clone(), conversation);
    }

    /// A write made by another client (typically the other participant).
    /// Visible to queries and pushed to matching subscribers.
    pub fn insert_message(
        &self,
        conversation_id: &str,
        sender: &UserId,
        recipient: &UserId,
        body: &str,
    ) -> MessageRecord {
        let mut state = self.state.lock();
        let record = MessageRecord {
            id: state.next_id("m"),
            conversation_id: conversation_id.to_string(),
            sender_id: sender.clone(),
            recipient_id: recipient.clone(),
            body: body.to_string(),
            created_at: self.clock.now(),
            read: false,
            client_ref: None,
        };
        Self::store_message(&mut state, record.clone());
        record
    }

    /// Re-deliver an existing row to subscribers, as an at-least-once feed may.
    pub fn replay_insert(&self, message_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(record) = state.messages.iter().find(|m| m.id == message_id).cloned() else {
            return false;
        };
        let row = serde_json::to_value(&record).unwrap_or_default();
        state.publish(tables::MESSAGES, ChangeKind::Insert, row);
        true
    }

    /// A grant created server-side (e.g. by a database trigger).
    pub fn insert_grant(&self, user: &UserId, achievement_id: &str, at: DateTime<Utc>) -> AchievementGrant {
        let mut state = self.state.lock();
        let grant = AchievementGrant {
            id: state.next_id("g"),
            achievement_id: achievement_id.to_string(),
            user_id: user.clone(),
            granted_at: at,
            achievement: None,
        };
        Self::store_grant(&mut state, grant.clone());
        grant
    }

    /// Make the next evaluation RPC for `user` grant `achievement_id`.
    pub fn award_on_evaluation(&self, user: &UserId, achievement_id: &str) {
        self.state
            .lock()
            .pending_awards
            .entry(user.clone())
            .or_default()
            .push(achievement_id.to_string());
    }

    // ===== Fault injection =====

    pub fn fail_next_writes(&self, count: usize) {
        self.state.lock().faults.failing_writes = count;
    }

    pub fn set_failing_queries(&self, failing: bool) {
        self.state.lock().faults.failing_queries = failing;
    }

    pub fn set_failing_rpc(&self, failing: bool) {
        self.state.lock().faults.failing_rpc = failing;
    }

    pub fn set_refusing_connections(&self, refusing: bool) {
        self.state.lock().faults.refusing_connections = refusing;
    }

    /// Delay between a write becoming visible (and pushed) and its ack.
    pub fn set_write_delay(&self, delay: Duration) {
        self.state.lock().faults.write_delay = delay;
    }

    /// Delay between a history query taking its snapshot and returning it.
    pub fn set_query_delay(&self, delay: Duration) {
        self.state.lock().faults.query_delay = delay;
    }

    /// Close every open realtime connection.
    pub fn drop_connections(&self) -> usize {
        let mut state = self.state.lock();
        let dropped = state.subscribers.len();
        state.subscribers.clear();
        dropped
    }

    // ===== Inspection =====

    pub fn messages(&self, conversation_id: &str) -> Vec<MessageRecord> {
        self.state
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub fn connection_count(&self) -> usize {
        let mut state = self.state.lock();
        state.subscribers.retain(|s| !s.tx.is_closed());
        state.subscribers.len()
    }

    pub fn rpc_calls(&self) -> usize {
        self.state.lock().rpc_calls
    }

    // ===== Internals =====

    fn store_message(state: &mut MemoryState, record: MessageRecord) {
        if let Some(conv) = state.conversations.get_mut(&record.conversation_id) {
            conv.touch(record.created_at, &record.body);
        }
        let row = serde_json::to_value(&record).unwrap_or_default();
        state.messages.push(record);
        state.publish(tables::MESSAGES, ChangeKind::Insert, row);
    }

    fn store_grant(state: &mut MemoryState, grant: AchievementGrant) {
        let row = serde_json::to_value(&grant).unwrap_or_default();
        state.grants.push(grant);
        state.publish(tables::USER_ACHIEVEMENTS, ChangeKind::Insert, row);
    }

    fn check_queries(&self) -> Result<()> {
        if self.state.lock().faults.failing_queries {
            return Err(SyncError::Query("memory backend: queries disabled".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn write_message(&self, message: NewMessage) -> Result<MessageRecord> {
        let (record, delay) = {
            let mut state = self.state.lock();
            if state.faults.failing_writes > 0 {
                state.faults.failing_writes -= 1;
                return Err(SyncError::Write("memory backend: write rejected".into()));
            }
            let record = MessageRecord {
                id: state.next_id("m"),
                conversation_id: message.conversation_id,
                sender_id: message.sender_id,
                recipient_id: message.recipient_id,
                body: message.body,
                created_at: self.clock.now(),
                read: false,
                client_ref: Some(message.client_ref),
            };
            Self::store_message(&mut state, record.clone());
            (record, state.faults.write_delay)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(record)
    }

    async fn query_messages(&self, conversation_id: &str) -> Result<Vec<MessageRecord>> {
        self.check_queries()?;
        let mut rows = self.messages(conversation_id);
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let delay = self.state.lock().faults.query_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(rows)
    }

    async fn conversation(&self, conversation_id: &str) -> Result<Conversation> {
        self.check_queries()?;
        self.state
            .lock()
            .conversations
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| SyncError::Query(format!("conversation {} not found", conversation_id)))
    }

    async fn mark_read(&self, conversation_id: &str, recipient: &UserId) -> Result<()> {
        let mut state = self.state.lock();
        if state.faults.failing_writes > 0 {
            state.faults.failing_writes -= 1;
            return Err(SyncError::Write("memory backend: write rejected".into()));
        }

        let mut updated = Vec::new();
        for row in state.messages.iter_mut() {
            if row.conversation_id == conversation_id && &row.recipient_id == recipient && !row.read {
                row.read = true;
                updated.push(serde_json::to_value(&*row).unwrap_or_default());
            }
        }
        for row in updated {
            state.publish(tables::MESSAGES, ChangeKind::Update, row);
        }
        Ok(())
    }

    async fn count_unread(&self, recipient: &UserId, scope: &UnreadScope) -> Result<u64> {
        self.check_queries()?;
        let state = self.state.lock();
        let count = state
            .messages
            .iter()
            .filter(|m| &m.recipient_id == recipient && !m.read)
            .filter(|m| match scope {
                UnreadScope::All => true,
                UnreadScope::Conversation(id) => &m.conversation_id == id,
            })
            .count();
        Ok(count as u64)
    }

    async fn evaluate_achievements(&self, user: &UserId) -> Result<()> {
        let mut state = self.state.lock();
        state.rpc_calls += 1;
        if state.faults.failing_rpc {
            return Err(SyncError::Rpc {
                name: EVALUATE_ACHIEVEMENTS_RPC.to_string(),
                message: "memory backend: rpc disabled".into(),
            });
        }

        let awards = state.pending_awards.remove(user).unwrap_or_default();
        for achievement_id in awards {
            let grant = AchievementGrant {
                id: state.next_id("g"),
                achievement_id,
                user_id: user.clone(),
                granted_at: self.clock.now(),
                achievement: None,
            };
            Self::store_grant(&mut state, grant);
        }
        Ok(())
    }

    async fn recent_grants(
        &self,
        user: &UserId,
        after: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<AchievementGrant>> {
        self.check_queries()?;
        let state = self.state.lock();
        let mut grants: Vec<AchievementGrant> = state
            .grants
            .iter()
            .filter(|g| &g.user_id == user && g.granted_at > after)
            .cloned()
            .collect();
        grants.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        grants.truncate(limit);
        Ok(grants)
    }

    async fn display_names(&self, users: &[UserId]) -> Result<HashMap<UserId, String>> {
        self.check_queries()?;
        let state = self.state.lock();
        Ok(users
            .iter()
            .filter_map(|u| state.profiles.get(u).map(|name| (u.clone(), name.clone())))
            .collect())
    }
}

#[async_trait]
impl RealtimeTransport for MemoryBackend {
    async fn connect(&self, table: &str, filter: &ChannelFilter) -> Result<ChangeStream> {
        let mut state = self.state.lock();
        if state.faults.refusing_connections {
            return Err(SyncError::subscription(table, "memory backend: connection refused"));
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            table: table.to_string(),
            filter: filter.clone(),
            tx,
        });
        Ok(futures::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn backend() -> MemoryBackend {
        MemoryBackend::with_clock(Arc::new(ManualClock::new(t0())))
    }

    #[tokio::test]
    async fn test_write_echoes_client_ref() {
        let backend = backend();
        let record = backend
            .write_message(NewMessage {
                conversation_id: "C123".into(),
                sender_id: UserId::new("a"),
                recipient_id: UserId::new("b"),
                body: "Oi".into(),
                client_ref: "tmp-1".into(),
            })
            .await
            .unwrap();

        assert_eq!(record.client_ref.as_deref(), Some("tmp-1"));
        assert_eq!(backend.query_messages("C123").await.unwrap(), vec![record]);
    }

    #[tokio::test]
    async fn test_push_respects_filter() {
        let backend = backend();
        let filter = ChannelFilter::new("recipient_id", "b").unwrap();
        let mut stream = backend.connect(tables::MESSAGES, &filter).await.unwrap();

        backend.insert_message("C1", &UserId::new("b"), &UserId::new("a"), "not for b");
        let mine = backend.insert_message("C1", &UserId::new("a"), &UserId::new("b"), "for b");

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.kind, ChangeKind::Insert);
        assert_eq!(event.decode::<MessageRecord>().unwrap(), mine);
    }

    #[tokio::test]
    async fn test_mark_read_and_count() {
        let backend = backend();
        let me = UserId::new("b");
        for _ in 0..3 {
            backend.insert_message("C1", &UserId::new("a"), &me, "x");
        }
        backend.insert_message("C2", &UserId::new("a"), &me, "y");

        assert_eq!(backend.count_unread(&me, &UnreadScope::All).await.unwrap(), 4);
        backend.mark_read("C1", &me).await.unwrap();
        assert_eq!(backend.count_unread(&me, &UnreadScope::All).await.unwrap(), 1);
        assert_eq!(
            backend
                .count_unread(&me, &UnreadScope::Conversation("C1".into()))
                .await
                .unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_drop_connections_ends_streams() {
        let backend = backend();
        let filter = ChannelFilter::new("user_id", "u").unwrap();
        let mut stream = backend.connect(tables::USER_ACHIEVEMENTS, &filter).await.unwrap();
        assert_eq!(backend.drop_connections(), 1);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_evaluation_materializes_awards() {
        let backend = backend();
        let user = UserId::new("u");
        backend.award_on_evaluation(&user, "first-workout");

        backend.evaluate_achievements(&user).await.unwrap();
        let grants = backend
            .recent_grants(&user, t0() - chrono::Duration::seconds(1), 1)
            .await
            .unwrap();
        assert_eq!(grants.len(), 1);
        assert_eq!(grants[0].achievement_id, "first-workout");

        // Awards are consumed
        backend.evaluate_achievements(&user).await.unwrap();
        assert_eq!(backend.rpc_calls(), 2);
    }
}
