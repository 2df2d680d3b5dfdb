use std::time::Instant;

use super::achievement::AchievementGrant;
use super::identity::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    Message,
    Achievement,
}

impl NotificationKind {
    pub const ALL: [NotificationKind; 2] = [NotificationKind::Message, NotificationKind::Achievement];

    pub fn as_str(self) -> &'static str {
        match self {
            NotificationKind::Message => "message",
            NotificationKind::Achievement => "achievement",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotificationPayload {
    MessageArrival {
        conversation_id: String,
        message_id: String,
        sender_id: UserId,
        sender_label: Option<String>,
        preview: String,
    },
    Achievement(AchievementGrant),
}

impl NotificationPayload {
    pub fn kind(&self) -> NotificationKind {
        match self {
            NotificationPayload::MessageArrival { .. } => NotificationKind::Message,
            NotificationPayload::Achievement(_) => NotificationKind::Achievement,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationPhase {
    Hidden,
    Appearing,
    Visible,
    Dismissing,
}

impl NotificationPhase {
    /// Counts toward the at-most-one-visible rule.
    pub fn is_showing(self) -> bool {
        matches!(self, NotificationPhase::Appearing | NotificationPhase::Visible)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub payload: NotificationPayload,
    pub phase: NotificationPhase,
    pub created_at: Instant,
}

impl Notification {
    pub fn kind(&self) -> NotificationKind {
        self.payload.kind()
    }

    pub fn is_visible(&self) -> bool {
        self.phase.is_showing()
    }
}
