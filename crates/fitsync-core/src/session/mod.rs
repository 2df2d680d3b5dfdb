//! Per-user live components. Each one owns its state, its channel
//! subscription and a task scope; `teardown` (or dropping the last handle)
//! stops every further mutation.

pub mod achievements;
pub mod conversation;
pub mod unread;

use crate::backend::SharedBackend;
use crate::channel::EventChannel;
use crate::clock::SharedClock;
use crate::config::SyncConfig;
use crate::events::EventSender;
use crate::models::Identity;
use crate::notifications::NotificationDispatcher;

pub use achievements::AchievementWatcher;
pub use conversation::ConversationSession;
pub use unread::UnreadCounter;

/// Collaborators shared by every component built for one identity.
#[derive(Clone)]
pub struct SessionContext {
    pub identity: Identity,
    pub backend: SharedBackend,
    pub channel: EventChannel,
    pub clock: SharedClock,
    pub config: SyncConfig,
    pub notifier: NotificationDispatcher,
    pub events: EventSender,
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::{DateTime, TimeZone, Utc};
    use tokio::sync::mpsc;

    use super::SessionContext;
    use crate::backend::MemoryBackend;
    use crate::channel::EventChannel;
    use crate::clock::ManualClock;
    use crate::config::SyncConfig;
    use crate::events::EventReceiver;
    use crate::models::{Conversation, Identity, UserId};
    use crate::notifications::NotificationDispatcher;

    pub fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    /// Let every ready task run; paused time only advances once all are idle.
    pub async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    /// A client and their trainer sharing conversation C123 on a memory backend.
    pub struct Fixture {
        pub backend: Arc<MemoryBackend>,
        pub clock: ManualClock,
        pub client: UserId,
        pub trainer: UserId,
        pub config: SyncConfig,
        pub notifier: NotificationDispatcher,
        pub events_tx: mpsc::UnboundedSender<crate::events::CoreEvent>,
        pub events_rx: EventReceiver,
    }

    impl Fixture {
        pub fn new() -> Self {
            let clock = ManualClock::new(t0());
            let backend = Arc::new(MemoryBackend::with_clock(Arc::new(clock.clone())));
            let client = UserId::new("client-1");
            let trainer = UserId::new("trainer-1");
            backend.add_profile(&trainer, "Coach Ana");
            backend.add_profile(&client, "Bia");
            backend.add_conversation(Conversation::new("C123", trainer.clone(), client.clone()));

            let config = SyncConfig::default();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            Self {
                notifier: NotificationDispatcher::new(&config),
                backend,
                clock,
                client,
                trainer,
                config,
                events_tx,
                events_rx,
            }
        }

        pub fn conversation(&self) -> Conversation {
            Conversation::new("C123", self.trainer.clone(), self.client.clone())
        }

        pub fn context(&self) -> SessionContext {
            SessionContext {
                identity: Identity::new(self.client.as_str()).with_display_name("Bia"),
                backend: self.backend.clone(),
                channel: EventChannel::new(self.backend.clone(), &self.config),
                clock: Arc::new(self.clock.clone()),
                config: self.config.clone(),
                notifier: self.notifier.clone(),
                events: self.events_tx.clone(),
            }
        }
    }
}
