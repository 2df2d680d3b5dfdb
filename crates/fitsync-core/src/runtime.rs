use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::info;

use crate::backend::SharedBackend;
use crate::channel::{EventChannel, RealtimeTransport};
use crate::clock::{SharedClock, SystemClock};
use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::EventReceiver;
use crate::models::{Identity, Message, MessageId, Notification, NotificationKind};
use crate::notifications::{NotificationDispatcher, NotificationView};
use crate::session::{AchievementWatcher, ConversationSession, SessionContext, UnreadCounter};
use crate::stats::SharedSubscriptionStats;
use crate::store::UnreadScope;

/// Everything built for one signed-in identity.
struct UserSession {
    ctx: SessionContext,
    unread: UnreadCounter,
    achievements: AchievementWatcher,
    conversations: HashMap<String, ConversationSession>,
}

impl UserSession {
    fn teardown(self) {
        for (_, session) in self.conversations {
            session.teardown();
        }
        self.unread.teardown();
        self.achievements.teardown();
        self.ctx.notifier.teardown();
    }
}

/// Composition root: owns the per-user components and rebuilds all of them
/// when the identity changes.
pub struct SyncCore {
    backend: SharedBackend,
    transport: Arc<dyn RealtimeTransport>,
    clock: SharedClock,
    config: SyncConfig,
    session: Mutex<Option<UserSession>>,
    events_rx: Option<EventReceiver>,
    subscription_stats: Mutex<SharedSubscriptionStats>,
}

impl SyncCore {
    pub async fn start(
        identity: Identity,
        backend: SharedBackend,
        transport: Arc<dyn RealtimeTransport>,
        config: SyncConfig,
    ) -> Result<Self> {
        Self::start_with_clock(identity, backend, transport, config, Arc::new(SystemClock)).await
    }

    pub async fn start_with_clock(
        identity: Identity,
        backend: SharedBackend,
        transport: Arc<dyn RealtimeTransport>,
        config: SyncConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        let mut core = Self {
            backend,
            transport,
            clock,
            config,
            session: Mutex::new(None),
            events_rx: None,
            subscription_stats: Mutex::new(SharedSubscriptionStats::new()),
        };
        let events_rx = core.install(identity).await?;
        core.events_rx = Some(events_rx);
        Ok(core)
    }

    /// Presentation event stream. Can be taken once per identity.
    pub fn take_event_rx(&mut self) -> Option<EventReceiver> {
        self.events_rx.take()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.session.lock().as_ref().map(|s| s.ctx.identity.clone())
    }

    pub fn subscription_stats(&self) -> SharedSubscriptionStats {
        self.subscription_stats.lock().clone()
    }

    /// Open (or reuse) the live session of a conversation and load its history.
    pub async fn open_conversation(&self, conversation_id: &str) -> Result<ConversationSession> {
        let ctx = {
            let guard = self.session.lock();
            let user = guard.as_ref().ok_or(SyncError::Closed("sync core"))?;
            if let Some(existing) = user.conversations.get(conversation_id) {
                return Ok(existing.clone());
            }
            user.ctx.clone()
        };

        let conversation = self.backend.conversation(conversation_id).await?;
        let session = ConversationSession::open(ctx, conversation)?;

        // Another open may have raced this one; keep whichever landed first
        let session = {
            let mut guard = self.session.lock();
            let user = guard.as_mut().ok_or(SyncError::Closed("sync core"))?;
            match user.conversations.get(conversation_id) {
                Some(existing) => {
                    session.teardown();
                    return Ok(existing.clone());
                }
                None => {
                    user.conversations
                        .insert(conversation_id.to_string(), session.clone());
                    session
                }
            }
        };

        session.load().await?;
        Ok(session)
    }

    pub fn close_conversation(&self, conversation_id: &str) -> bool {
        let removed = self
            .session
            .lock()
            .as_mut()
            .and_then(|user| user.conversations.remove(conversation_id));
        match removed {
            Some(session) => {
                session.teardown();
                true
            }
            None => false,
        }
    }

    /// Tear down everything built for the current identity and start over
    /// for `identity`. A fresh event stream is available from
    /// [`take_event_rx`](Self::take_event_rx) afterwards.
    pub async fn switch_identity(&mut self, identity: Identity) -> Result<()> {
        if let Some(previous) = self.session.lock().take() {
            info!(from = %previous.ctx.identity.user_id, to = %identity.user_id, "switching identity");
            previous.teardown();
        }
        let events_rx = self.install(identity).await?;
        self.events_rx = Some(events_rx);
        Ok(())
    }

    pub fn shutdown(&self) {
        if let Some(user) = self.session.lock().take() {
            info!(user = %user.ctx.identity.user_id, "sync core shutting down");
            user.teardown();
        }
    }

    // ===== Presentation accessors =====

    pub fn conversation(&self, conversation_id: &str) -> Option<ConversationSession> {
        self.session
            .lock()
            .as_ref()
            .and_then(|user| user.conversations.get(conversation_id).cloned())
    }

    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.conversation(conversation_id)
            .map(|s| s.messages())
            .unwrap_or_default()
    }

    pub async fn send(&self, conversation_id: &str, body: &str) -> Result<Message> {
        self.open_session(conversation_id)?.send(body).await
    }

    pub async fn retry(&self, conversation_id: &str, id: &MessageId) -> Result<Message> {
        self.open_session(conversation_id)?.retry(id).await
    }

    /// Mark the conversation read and re-query the unread count.
    pub async fn mark_read(&self, conversation_id: &str) -> Result<u64> {
        self.open_session(conversation_id)?.mark_read().await?;
        self.unread()?.refresh().await
    }

    pub fn unread_count(&self) -> u64 {
        self.unread().map(|u| u.current()).unwrap_or_default()
    }

    pub fn watch_unread(&self) -> Result<watch::Receiver<u64>> {
        Ok(self.unread()?.subscribe())
    }

    pub async fn refresh_unread(&self) -> Result<u64> {
        self.unread()?.refresh().await
    }

    pub fn achievements(&self) -> Result<AchievementWatcher> {
        self.session
            .lock()
            .as_ref()
            .map(|user| user.achievements.clone())
            .ok_or(SyncError::Closed("sync core"))
    }

    pub fn notification(&self, kind: NotificationKind) -> Option<Notification> {
        self.notifier().ok()?.current(kind)
    }

    pub fn watch_notifications(&self) -> Result<watch::Receiver<NotificationView>> {
        Ok(self.notifier()?.subscribe())
    }

    pub fn dismiss(&self, kind: NotificationKind) {
        if let Ok(notifier) = self.notifier() {
            notifier.dismiss(kind);
        }
    }

    // ===== Internals =====

    async fn install(&self, identity: Identity) -> Result<EventReceiver> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let channel = EventChannel::new(Arc::clone(&self.transport), &self.config);
        *self.subscription_stats.lock() = channel.stats();

        let ctx = SessionContext {
            identity,
            backend: Arc::clone(&self.backend),
            channel,
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
            notifier: NotificationDispatcher::new(&self.config),
            events: events_tx,
        };
        let unread = UnreadCounter::start(&ctx, UnreadScope::All)?;
        let achievements = AchievementWatcher::start(&ctx)?;
        info!(user = %ctx.identity.user_id, "sync core started");

        *self.session.lock() = Some(UserSession {
            ctx,
            unread: unread.clone(),
            achievements,
            conversations: HashMap::new(),
        });

        // Failure leaves the count unknown until the next channel event
        let _ = unread.refresh().await;
        Ok(events_rx)
    }

    fn open_session(&self, conversation_id: &str) -> Result<ConversationSession> {
        self.conversation(conversation_id)
            .ok_or_else(|| SyncError::Closed("conversation session"))
    }

    fn unread(&self) -> Result<UnreadCounter> {
        self.session
            .lock()
            .as_ref()
            .map(|user| user.unread.clone())
            .ok_or(SyncError::Closed("sync core"))
    }

    fn notifier(&self) -> Result<NotificationDispatcher> {
        self.session
            .lock()
            .as_ref()
            .map(|user| user.ctx.notifier.clone())
            .ok_or(SyncError::Closed("sync core"))
    }
}

impl Drop for SyncCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}
