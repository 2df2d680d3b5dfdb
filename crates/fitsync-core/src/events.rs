use tokio::sync::mpsc;

use crate::models::AchievementGrant;
use crate::store::RemoteInsertOutcome;

/// Presentation-facing change notices. They carry just enough to know what to
/// re-read; the state itself is read back through the owning component.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreEvent {
    /// The live sequence of a conversation changed
    MessagesChanged { conversation_id: String },
    /// A pushed insert was merged into an open conversation
    RemoteMessage {
        conversation_id: String,
        message_id: String,
        outcome: RemoteInsertOutcome,
    },
    UnreadChanged(u64),
    AchievementSurfaced(AchievementGrant),
}

pub type EventSender = mpsc::UnboundedSender<CoreEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<CoreEvent>;

/// Best-effort publish; a presentation layer that went away is not an error.
pub(crate) fn emit(tx: &EventSender, event: CoreEvent) {
    let _ = tx.send(event);
}
