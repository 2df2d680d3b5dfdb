//! Surfaces achievement grants exactly once.
//!
//! Grants are only ever discovered by querying past a watermark. Push events
//! and the evaluation RPC just schedule that query a little later, so the
//! notification always reflects the store and never a raw payload.

use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::SessionContext;
use crate::backend::SharedBackend;
use crate::channel::{ChangeKind, ChannelFilter, ChannelMessage, ChannelReceiver, SubscriptionHandle};
use crate::clock::SharedClock;
use crate::constants::{columns, tables};
use crate::error::{Result, SyncError};
use crate::events::{emit, CoreEvent, EventSender};
use crate::models::{AchievementGrant, NotificationPayload, UserId};
use crate::notifications::NotificationDispatcher;
use crate::store::WatermarkState;
use crate::tasks::TaskScope;

const EVALUATION_RECHECK_KEY: &str = "evaluation-recheck";
const PUSH_RECHECK_KEY: &str = "push-recheck";

struct WatcherInner {
    backend: SharedBackend,
    clock: SharedClock,
    me: UserId,
    evaluation_delay: Duration,
    push_delay: Duration,
    state: Mutex<WatermarkState>,
    notifier: NotificationDispatcher,
    events: EventSender,
    tasks: TaskScope,
    subscription: Mutex<Option<SubscriptionHandle>>,
}

impl Drop for WatcherInner {
    fn drop(&mut self) {
        self.tasks.shutdown();
    }
}

#[derive(Clone)]
pub struct AchievementWatcher {
    inner: Arc<WatcherInner>,
}

impl std::fmt::Debug for AchievementWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AchievementWatcher")
            .field("user", &self.inner.me)
            .field("watermark", &self.watermark())
            .finish()
    }
}

impl AchievementWatcher {
    /// Start watching grants for the identity. Nothing granted before this
    /// moment is ever surfaced.
    pub fn start(ctx: &SessionContext) -> Result<Self> {
        let me = ctx.identity.user_id.clone();
        let filter = ChannelFilter::new(columns::USER_ID, me.as_str())?;

        let inner = Arc::new(WatcherInner {
            backend: ctx.backend.clone(),
            clock: ctx.clock.clone(),
            evaluation_delay: ctx.config.evaluation_recheck_delay(),
            push_delay: ctx.config.push_recheck_delay(),
            state: Mutex::new(WatermarkState::new(ctx.clock.now())),
            notifier: ctx.notifier.clone(),
            events: ctx.events.clone(),
            tasks: TaskScope::new("achievements"),
            subscription: Mutex::new(None),
            me,
        });

        let (handle, rx) = ctx.channel.subscribe(tables::USER_ACHIEVEMENTS, filter);
        *inner.subscription.lock() = Some(handle);
        inner.tasks.spawn(pump(Arc::downgrade(&inner), rx));

        info!(user = %inner.me, watermark = %inner.state.lock().watermark(), "achievement watcher started");
        Ok(Self { inner })
    }

    pub fn watermark(&self) -> chrono::DateTime<chrono::Utc> {
        self.inner.state.lock().watermark()
    }

    /// Latest surfaced grant not yet taken by the presentation layer.
    pub fn current(&self) -> Option<AchievementGrant> {
        self.inner.state.lock().current().cloned()
    }

    pub fn take_current(&self) -> Option<AchievementGrant> {
        self.inner.state.lock().take_current()
    }

    /// Look for a grant newer than the watermark and surface it. Returns the
    /// surfaced grant, if any.
    pub async fn check_for_new(&self) -> Result<Option<AchievementGrant>> {
        let inner = &self.inner;
        let issued_with = inner.state.lock().watermark();

        let candidates = inner
            .backend
            .recent_grants(&inner.me, issued_with, 1)
            .await
            .map_err(|e| {
                warn!(user = %inner.me, error = %e, "achievement check failed");
                e
            })?;

        let surfaced = {
            let mut state = inner.state.lock();
            if inner.tasks.is_closed() {
                return Err(SyncError::Closed("achievement watcher"));
            }
            state.accept(issued_with, candidates, inner.clock.now())
        };

        if let Some(grant) = &surfaced {
            info!(user = %inner.me, grant = %grant.id, achievement = grant.title(), "achievement surfaced");
            inner.notifier.show(NotificationPayload::Achievement(grant.clone()));
            emit(&inner.events, CoreEvent::AchievementSurfaced(grant.clone()));
        }
        Ok(surfaced)
    }

    /// Ask the store to evaluate achievements, then look for new grants after
    /// the recheck delay whether or not the call succeeded.
    pub async fn trigger_evaluation(&self) -> Result<()> {
        let inner = &self.inner;
        if inner.tasks.is_closed() {
            return Err(SyncError::Closed("achievement watcher"));
        }

        let result = inner.backend.evaluate_achievements(&inner.me).await;
        if let Err(e) = &result {
            warn!(user = %inner.me, error = %e, "achievement evaluation failed");
        }
        self.schedule_check(EVALUATION_RECHECK_KEY, inner.evaluation_delay, true);
        result
    }

    /// A grant row was pushed. The payload is not trusted as-is; a watermark
    /// query runs shortly after instead.
    pub fn on_push_event(&self, grant: Option<&AchievementGrant>) {
        if let Some(grant) = grant {
            debug!(grant = %grant.id, "grant pushed, scheduling recheck");
        }
        self.schedule_check(PUSH_RECHECK_KEY, self.inner.push_delay, false);
    }

    pub fn teardown(&self) {
        self.inner.tasks.shutdown();
        if let Some(handle) = self.inner.subscription.lock().take() {
            handle.unsubscribe();
        }
        info!(user = %self.inner.me, "achievement watcher stopped");
    }

    fn schedule_check(&self, key: &str, delay: Duration, replace: bool) {
        let weak = Arc::downgrade(&self.inner);
        let check = async move {
            if let Some(inner) = weak.upgrade() {
                let _ = AchievementWatcher { inner }.check_for_new().await;
            }
        };
        if replace {
            self.inner.tasks.schedule(key, delay, check);
        } else {
            self.inner.tasks.schedule_if_idle(key, delay, check);
        }
    }
}

async fn pump(inner: Weak<WatcherInner>, mut rx: ChannelReceiver) {
    while let Some(message) = rx.recv().await {
        let Some(strong) = inner.upgrade() else {
            return;
        };
        let watcher = AchievementWatcher { inner: strong };

        match message {
            ChannelMessage::Change(event) if event.kind == ChangeKind::Insert => {
                let grant = event.decode::<AchievementGrant>();
                if let Err(e) = &grant {
                    warn!(error = %e, "undecodable grant payload");
                }
                watcher.on_push_event(grant.as_ref().ok());
            }
            ChannelMessage::Change(_) => {}
            ChannelMessage::Resubscribed => watcher.on_push_event(None),
        }
    }
}
