//! Live view of one conversation: authoritative history, optimistic sends and
//! pushed inserts merged into a single de-duplicated sequence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::channel::{ChangeKind, ChannelFilter, ChannelMessage, ChannelReceiver, SubscriptionHandle};
use crate::constants::{columns, tables, UNKNOWN_SENDER_LABEL};
use crate::error::{Result, SyncError};
use crate::events::{emit, CoreEvent};
use crate::models::{
    Conversation, Message, MessageId, MessageRecord, NewMessage, NotificationPayload, UserId,
};
use crate::store::{MessageStore, RemoteInsertOutcome};
use crate::tasks::TaskScope;

struct SessionState {
    conversation: Conversation,
    store: MessageStore,
    loads_issued: u64,
    loads_applied: u64,
}

struct SessionInner {
    ctx: SessionContext,
    conversation_id: String,
    counterpart: UserId,
    state: Mutex<SessionState>,
    tasks: TaskScope,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

#[derive(Clone)]
pub struct ConversationSession {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("conversation_id", &self.inner.conversation_id)
            .field("messages", &self.inner.state.lock().store.len())
            .finish()
    }
}

impl ConversationSession {
    /// Build the session and subscribe to the conversation's inserts and
    /// updates. Call [`load`](Self::load) afterwards for the history.
    pub fn open(ctx: SessionContext, conversation: Conversation) -> Result<Self> {
        let me = ctx.identity.user_id.clone();
        let counterpart = conversation
            .counterpart(&me)
            .cloned()
            .ok_or_else(|| SyncError::Query(format!("{} is not a participant of {}", me, conversation.id)))?;
        let filter = ChannelFilter::new(columns::CONVERSATION_ID, conversation.id.clone())?;

        let conversation_id = conversation.id.clone();
        let store = MessageStore::new(conversation_id.clone(), me, ctx.config.window_capacity);
        let inner = Arc::new(SessionInner {
            conversation_id,
            counterpart,
            state: Mutex::new(SessionState {
                conversation,
                store,
                loads_issued: 0,
                loads_applied: 0,
            }),
            tasks: TaskScope::new("conversation"),
            subscription: Mutex::new(None),
            ctx,
        });

        let (handle, rx) = inner.ctx.channel.subscribe(tables::MESSAGES, filter);
        *inner.subscription.lock() = Some(handle);
        inner.tasks.spawn(pump(Arc::downgrade(&inner), rx));

        info!(conversation = %inner.conversation_id, "conversation opened");
        Ok(Self { inner })
    }

    pub fn conversation_id(&self) -> &str {
        &self.inner.conversation_id
    }

    pub fn conversation(&self) -> Conversation {
        self.inner.state.lock().conversation.clone()
    }

    pub fn messages(&self) -> Vec<Message> {
        self.inner.state.lock().store.messages().to_vec()
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.tasks.is_closed()
    }

    /// Replace the sequence with the authoritative history. A load that
    /// finishes after a newer one has been applied is discarded; a failed
    /// query leaves the sequence untouched. Entries acked or pushed while the
    /// query was in flight survive even if the snapshot missed them.
    pub async fn load(&self) -> Result<usize> {
        let inner = &self.inner;
        let (ticket, mark) = {
            let mut state = inner.state.lock();
            state.loads_issued += 1;
            (state.loads_issued, state.store.begin_load())
        };

        let records = inner
            .ctx
            .backend
            .query_messages(&inner.conversation_id)
            .await
            .map_err(|e| {
                warn!(conversation = %inner.conversation_id, error = %e, "history load failed");
                e
            })?;
        let labels = self.resolve_labels(&records).await;

        let len = {
            let mut state = inner.state.lock();
            if inner.tasks.is_closed() {
                return Err(SyncError::Closed("conversation session"));
            }
            if ticket <= state.loads_applied {
                debug!(conversation = %inner.conversation_id, ticket, "stale load discarded");
                return Ok(state.store.len());
            }
            state.loads_applied = ticket;
            if let Some(last) = records.last() {
                state.conversation.touch(last.created_at, &last.body);
            }
            state.store.set_labels(labels);
            state.store.replace_history(records, mark);
            state.store.len()
        };

        self.changed();
        Ok(len)
    }

    /// Optimistically append `body` and write it. The returned message is the
    /// confirmed entry; on failure the entry stays visible in `Error`.
    pub async fn send(&self, body: &str) -> Result<Message> {
        let body = body.trim();
        if body.is_empty() {
            return Err(SyncError::EmptyMessage);
        }
        self.ensure_open()?;
        let inner = &self.inner;

        let me = inner.ctx.identity.user_id.clone();
        let message = Message::provisional(
            MessageId::provisional(),
            &inner.conversation_id,
            me,
            inner.counterpart.clone(),
            body.to_string(),
            inner.ctx.clock.now(),
        );
        let request = message.to_new_message();
        let id = inner.state.lock().store.insert_provisional(message);
        debug!(conversation = %inner.conversation_id, id = %id, "provisional message inserted");
        self.changed();

        self.complete_write(id, request).await
    }

    /// Re-issue the write of a message that failed to send.
    pub async fn retry(&self, id: &MessageId) -> Result<Message> {
        self.ensure_open()?;
        let request = self.inner.state.lock().store.begin_retry(id)?;
        self.changed();
        self.complete_write(id.clone(), request).await
    }

    /// Merge an insert pushed by the change feed.
    pub fn on_remote_insert(&self, record: MessageRecord) -> RemoteInsertOutcome {
        if self.is_closed() {
            return RemoteInsertOutcome::Ignored;
        }
        let inner = &self.inner;
        let me = &inner.ctx.identity.user_id;
        let incoming = &record.recipient_id == me && &record.sender_id != me;
        let message_id = record.id.clone();

        let (outcome, arrival) = {
            let mut state = inner.state.lock();
            let (created_at, body) = (record.created_at, record.body.clone());
            let outcome = state.store.apply_remote_insert(record.clone());
            if matches!(outcome, RemoteInsertOutcome::Appended | RemoteInsertOutcome::Reconciled) {
                state.conversation.touch(created_at, &body);
            }
            let arrival = (outcome == RemoteInsertOutcome::Appended && incoming).then(|| {
                NotificationPayload::MessageArrival {
                    conversation_id: record.conversation_id.clone(),
                    message_id: record.id.clone(),
                    sender_label: state.store.label_for(&record.sender_id).map(str::to_string),
                    sender_id: record.sender_id.clone(),
                    preview: body,
                }
            });
            (outcome, arrival)
        };
        debug!(conversation = %inner.conversation_id, id = %message_id, ?outcome, "remote insert");

        if let Some(payload) = arrival {
            inner.ctx.notifier.show(payload);
        }
        if outcome != RemoteInsertOutcome::Duplicate && outcome != RemoteInsertOutcome::Ignored {
            emit(
                &inner.ctx.events,
                CoreEvent::RemoteMessage {
                    conversation_id: inner.conversation_id.clone(),
                    message_id,
                    outcome,
                },
            );
            self.changed();
        }
        outcome
    }

    /// Merge an update pushed by the change feed (read receipts).
    pub fn on_remote_update(&self, record: &MessageRecord) -> bool {
        if self.is_closed() {
            return false;
        }
        let changed = self.inner.state.lock().store.apply_remote_update(record);
        if changed {
            self.changed();
        }
        changed
    }

    /// Mark every incoming message read, locally first and then remotely.
    /// The local flags stay set if the write fails.
    pub async fn mark_read(&self) -> Result<usize> {
        self.ensure_open()?;
        let inner = &self.inner;
        let flipped = inner.state.lock().store.mark_incoming_read();
        if flipped > 0 {
            self.changed();
        }

        inner
            .ctx
            .backend
            .mark_read(&inner.conversation_id, &inner.ctx.identity.user_id)
            .await
            .map_err(|e| {
                warn!(conversation = %inner.conversation_id, error = %e, "mark read failed");
                e
            })?;
        Ok(flipped)
    }

    /// Stop the channel pump and every pending task. Nothing mutates the
    /// sequence afterwards.
    pub fn teardown(&self) {
        self.inner.tasks.shutdown();
        if let Some(handle) = self.inner.subscription.lock().take() {
            handle.unsubscribe();
        }
        info!(conversation = %self.inner.conversation_id, "conversation closed");
    }

    async fn complete_write(&self, id: MessageId, request: NewMessage) -> Result<Message> {
        let inner = &self.inner;
        let result = inner.ctx.backend.write_message(request).await;

        let confirmed = {
            let mut state = inner.state.lock();
            if inner.tasks.is_closed() {
                return Err(SyncError::Closed("conversation session"));
            }
            let outcome = state.store.resolve_send(&id, result.clone());
            debug!(conversation = %inner.conversation_id, id = %id, ?outcome, "write resolved");
            result.map(|record| {
                let confirmed_id = MessageId::Confirmed(record.id.clone());
                state
                    .store
                    .get(&confirmed_id)
                    .cloned()
                    .unwrap_or_else(|| Message::from_record(record, &inner.ctx.identity.user_id))
            })
        };

        self.changed();
        if let Err(e) = &confirmed {
            warn!(conversation = %inner.conversation_id, id = %id, error = %e, "send failed");
        }
        confirmed
    }

    /// Sender labels for every author in `records`. Own messages use the
    /// identity's display name; anything unresolved falls back to a fixed label.
    async fn resolve_labels(&self, records: &[MessageRecord]) -> HashMap<UserId, String> {
        let identity = &self.inner.ctx.identity;
        let senders: Vec<UserId> = records
            .iter()
            .map(|r| r.sender_id.clone())
            .chain(std::iter::once(self.inner.counterpart.clone()))
            .filter(|id| !identity.is(id))
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let mut labels = match self.inner.ctx.backend.display_names(&senders).await {
            Ok(names) => names,
            Err(e) => {
                warn!(error = %e, "display name lookup failed");
                HashMap::new()
            }
        };
        for sender in senders {
            labels
                .entry(sender)
                .or_insert_with(|| UNKNOWN_SENDER_LABEL.to_string());
        }
        labels.insert(
            identity.user_id.clone(),
            identity
                .display_name
                .clone()
                .unwrap_or_else(|| UNKNOWN_SENDER_LABEL.to_string()),
        );
        labels
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SyncError::Closed("conversation session"));
        }
        Ok(())
    }

    fn changed(&self) {
        emit(
            &self.inner.ctx.events,
            CoreEvent::MessagesChanged {
                conversation_id: self.inner.conversation_id.clone(),
            },
        );
    }
}

async fn pump(inner: Weak<SessionInner>, mut rx: ChannelReceiver) {
    while let Some(message) = rx.recv().await {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let session = ConversationSession { inner: strong };

        match message {
            ChannelMessage::Change(event) => match event.kind {
                ChangeKind::Insert => match event.decode::<MessageRecord>() {
                    Ok(record) => {
                        session.on_remote_insert(record);
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable insert"),
                },
                ChangeKind::Update => match event.decode::<MessageRecord>() {
                    Ok(record) => {
                        session.on_remote_update(&record);
                    }
                    Err(e) => warn!(error = %e, "dropping undecodable update"),
                },
                ChangeKind::Delete => debug!("ignoring message delete"),
            },
            ChannelMessage::Resubscribed => {
                info!(conversation = %session.conversation_id(), "reloading after reconnect");
                if let Err(e) = session.load().await {
                    debug!(error = %e, "reload after reconnect failed");
                }
            }
        }
    }
}
