//! Per-kind notification lifecycle.
//!
//! Each kind moves `Hidden -> Appearing -> Visible -> Dismissing -> Hidden`
//! on cancellable timers. A `show` that arrives while the kind is already
//! appearing or visible is dropped and counted, so at most one notification
//! per kind is ever showing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::config::SyncConfig;
use crate::models::{Notification, NotificationKind, NotificationPayload, NotificationPhase};
use crate::tasks::TaskScope;

/// What the presentation layer renders: the current notification per kind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NotificationView {
    pub message: Option<Notification>,
    pub achievement: Option<Notification>,
}

impl NotificationView {
    pub fn get(&self, kind: NotificationKind) -> Option<&Notification> {
        match kind {
            NotificationKind::Message => self.message.as_ref(),
            NotificationKind::Achievement => self.achievement.as_ref(),
        }
    }

    pub fn phase(&self, kind: NotificationKind) -> NotificationPhase {
        self.get(kind).map(|n| n.phase).unwrap_or(NotificationPhase::Hidden)
    }

    fn slot_mut(&mut self, kind: NotificationKind) -> &mut Option<Notification> {
        match kind {
            NotificationKind::Message => &mut self.message,
            NotificationKind::Achievement => &mut self.achievement,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Timings {
    appear: Duration,
    visible: Duration,
    dismiss: Duration,
}

#[derive(Debug, Default)]
struct DispatcherState {
    view: NotificationView,
    /// Bumped on every accepted show; stale timers compare against it
    generations: HashMap<NotificationKind, u64>,
    coalesced: u64,
}

#[derive(Clone)]
pub struct NotificationDispatcher {
    state: Arc<Mutex<DispatcherState>>,
    tx: Arc<watch::Sender<NotificationView>>,
    tasks: TaskScope,
    timings: Timings,
}

impl std::fmt::Debug for NotificationDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationDispatcher")
            .field("view", &self.state.lock().view)
            .finish()
    }
}

impl NotificationDispatcher {
    pub fn new(config: &SyncConfig) -> Self {
        let (tx, _) = watch::channel(NotificationView::default());
        Self {
            state: Arc::new(Mutex::new(DispatcherState::default())),
            tx: Arc::new(tx),
            tasks: TaskScope::new("notifications"),
            timings: Timings {
                appear: config.appear_duration(),
                visible: config.auto_dismiss(),
                dismiss: config.dismiss_duration(),
            },
        }
    }

    /// Present `payload`. Returns false when it was coalesced into a
    /// notification of the same kind that is already showing.
    pub fn show(&self, payload: NotificationPayload) -> bool {
        let kind = payload.kind();
        let generation = {
            let mut state = self.state.lock();
            if state.view.phase(kind).is_showing() {
                state.coalesced += 1;
                debug!(kind = kind.as_str(), "notification coalesced");
                return false;
            }
            if self.tasks.is_closed() {
                return false;
            }

            let generation = state.generations.entry(kind).or_default();
            *generation += 1;
            let generation = *generation;

            *state.view.slot_mut(kind) = Some(Notification {
                payload,
                phase: NotificationPhase::Appearing,
                created_at: Instant::now(),
            });
            self.publish(&state);
            generation
        };

        // Replaces a pending hide when coming from Dismissing
        let this = self.clone();
        self.tasks.schedule(kind.as_str(), self.timings.appear, async move {
            this.finish_appearing(kind, generation);
        });
        debug!(kind = kind.as_str(), generation, "notification appearing");
        true
    }

    /// Start hiding the notification of `kind`. No-op unless it is showing.
    pub fn dismiss(&self, kind: NotificationKind) {
        let mut state = self.state.lock();
        if !state.view.phase(kind).is_showing() {
            return;
        }
        let generation = state.generations.get(&kind).copied().unwrap_or_default();
        self.begin_dismissing(&mut state, kind, generation);
    }

    pub fn snapshot(&self) -> NotificationView {
        self.state.lock().view.clone()
    }

    pub fn current(&self, kind: NotificationKind) -> Option<Notification> {
        self.state.lock().view.get(kind).cloned()
    }

    pub fn subscribe(&self) -> watch::Receiver<NotificationView> {
        self.tx.subscribe()
    }

    /// Shows dropped because a notification of the same kind was showing.
    pub fn coalesced_count(&self) -> u64 {
        self.state.lock().coalesced
    }

    /// Cancel every timer and hide everything.
    pub fn teardown(&self) {
        self.tasks.shutdown();
        let mut state = self.state.lock();
        state.view = NotificationView::default();
        self.publish(&state);
    }

    fn finish_appearing(&self, kind: NotificationKind, generation: u64) {
        let mut state = self.state.lock();
        if !self.is_current(&state, kind, generation, NotificationPhase::Appearing) {
            return;
        }
        if let Some(notification) = state.view.slot_mut(kind) {
            notification.phase = NotificationPhase::Visible;
        }
        self.publish(&state);

        let this = self.clone();
        self.tasks.schedule(kind.as_str(), self.timings.visible, async move {
            let mut state = this.state.lock();
            if this.is_current(&state, kind, generation, NotificationPhase::Visible) {
                debug!(kind = kind.as_str(), "notification auto-dismissed");
                this.begin_dismissing(&mut state, kind, generation);
            }
        });
    }

    fn begin_dismissing(&self, state: &mut DispatcherState, kind: NotificationKind, generation: u64) {
        if let Some(notification) = state.view.slot_mut(kind) {
            notification.phase = NotificationPhase::Dismissing;
        }
        self.publish(state);

        let this = self.clone();
        self.tasks.schedule(kind.as_str(), self.timings.dismiss, async move {
            let mut state = this.state.lock();
            if this.is_current(&state, kind, generation, NotificationPhase::Dismissing) {
                *state.view.slot_mut(kind) = None;
                this.publish(&state);
            }
        });
    }

    fn is_current(
        &self,
        state: &DispatcherState,
        kind: NotificationKind,
        generation: u64,
        phase: NotificationPhase,
    ) -> bool {
        state.generations.get(&kind) == Some(&generation) && state.view.phase(kind) == phase
    }

    fn publish(&self, state: &DispatcherState) {
        self.tx.send_replace(state.view.clone());
    }
}
