//! Unread count kept in step with the store by re-querying it. Channel events
//! only ever trigger a (debounced) refresh; their payloads are never counted.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::backend::SharedBackend;
use crate::channel::{ChannelFilter, ChannelMessage, ChannelReceiver, SubscriptionHandle};
use crate::constants::{columns, tables};
use crate::error::{Result, SyncError};
use crate::events::{emit, CoreEvent, EventSender};
use crate::models::UserId;
use crate::store::{UnreadScope, UnreadState};
use crate::tasks::TaskScope;

const REFRESH_KEY: &str = "refresh";

struct CounterInner {
    backend: SharedBackend,
    me: UserId,
    scope: UnreadScope,
    debounce: Duration,
    state: Mutex<UnreadState>,
    tx: watch::Sender<u64>,
    events: EventSender,
    tasks: TaskScope,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Drop for CounterInner {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

#[derive(Clone)]
pub struct UnreadCounter {
    inner: Arc<CounterInner>,
}

impl std::fmt::Debug for UnreadCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnreadCounter")
            .field("scope", &self.inner.scope)
            .field("count", &self.current())
            .finish()
    }
}

impl UnreadCounter {
    /// Subscribe to everything addressed to the identity. The count stays at
    /// zero (and unknown) until the first [`refresh`](Self::refresh).
    pub fn start(ctx: &SessionContext, scope: UnreadScope) -> Result<Self> {
        let me = ctx.identity.user_id.clone();
        let filter = ChannelFilter::new(columns::RECIPIENT_ID, me.as_str())?;
        let (tx, _) = watch::channel(0);

        let inner = Arc::new(CounterInner {
            backend: ctx.backend.clone(),
            me,
            scope,
            debounce: ctx.config.unread_debounce(),
            state: Mutex::new(UnreadState::new()),
            tx,
            events: ctx.events.clone(),
            tasks: TaskScope::new("unread"),
            subscription: Mutex::new(None),
        });

        let (handle, rx) = ctx.channel.subscribe(tables::MESSAGES, filter);
        *inner.subscription.lock() = Some(handle);
        inner.tasks.spawn(pump(Arc::downgrade(&inner), rx));

        info!(user = %inner.me, scope = ?inner.scope, "unread counter started");
        Ok(Self { inner })
    }

    pub fn current(&self) -> u64 {
        self.inner.state.lock().count()
    }

    /// Whether an authoritative count has been applied yet.
    pub fn is_known(&self) -> bool {
        self.inner.state.lock().is_known()
    }

    pub fn scope(&self) -> &UnreadScope {
        &self.inner.scope
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.tx.subscribe()
    }

    /// Query the count and apply it unless a newer refresh already landed.
    /// On failure the previous count is kept.
    pub async fn refresh(&self) -> Result<u64> {
        let inner = &self.inner;
        let ticket = inner.state.lock().begin_refresh();

        let count = inner
            .backend
            .count_unread(&inner.me, &inner.scope)
            .await
            .map_err(|e| {
                warn!(user = %inner.me, error = %e, "unread refresh failed");
                e
            })?;

        let (changed, current) = {
            let mut state = inner.state.lock();
            if inner.tasks.is_closed() {
                return Err(SyncError::Closed("unread counter"));
            }
            let changed = state.apply(ticket, count);
            (changed, state.count())
        };

        if changed {
            debug!(user = %inner.me, count = current, "unread count changed");
            inner.tx.send_replace(current);
            emit(&inner.events, CoreEvent::UnreadChanged(current));
        }
        Ok(current)
    }

    /// Schedule a refresh for a channel message. Bursts coalesce into the
    /// refresh already pending.
    pub fn on_event(&self, message: &ChannelMessage) {
        if let (UnreadScope::Conversation(id), ChannelMessage::Change(event)) = (&self.inner.scope, message) {
            let touches_scope = event
                .record
                .get(columns::CONVERSATION_ID)
                .and_then(|v| v.as_str())
                .map_or(true, |conv| conv == id);
            if !touches_scope {
                return;
            }
        }

        let weak = Arc::downgrade(&self.inner);
        self.inner
            .tasks
            .schedule_if_idle(REFRESH_KEY, self.inner.debounce, async move {
                if let Some(inner) = weak.upgrade() {
                    let _ = UnreadCounter { inner }.refresh().await;
                }
            });
    }

    pub fn teardown(&self) {
        self.inner.tasks.shutdown();
        if let Some(handle) = self.inner.subscription.lock().take() {
            handle.unsubscribe();
        }
        info!(user = %self.inner.me, "unread counter stopped");
    }
}

async fn pump(inner: Weak<CounterInner>, mut rx: ChannelReceiver) {
    while let Some(message) = rx.recv().await {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        UnreadCounter { inner: strong }.on_event(&message);
    }
}
