pub mod achievement;
pub mod conversation;
pub mod identity;
pub mod message;
pub mod notification;

pub use achievement::{AchievementDefinition, AchievementGrant};
pub use conversation::Conversation;
pub use identity::{Identity, UserId};
pub use message::{Message, MessageId, MessageRecord, MessageStatus, NewMessage};
pub use notification::{Notification, NotificationKind, NotificationPayload, NotificationPhase};
