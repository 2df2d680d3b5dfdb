use fitsync_core::constants::UNKNOWN_SENDER_LABEL;
use fitsync_core::models::{AchievementGrant, Message, MessageStatus, Notification, NotificationPayload};
use serde_json::{json, Value};

fn status_marker(status: MessageStatus) -> &'static str {
    match status {
        MessageStatus::Sending => "…",
        MessageStatus::Sent => "✓",
        MessageStatus::Delivered => "✓✓",
        MessageStatus::Read => "✓✓ read",
        MessageStatus::Error => "! failed",
    }
}

/// One chat line: `[HH:MM] Sender: body (status)`.
pub fn format_message(message: &Message) -> String {
    let sender = message.sender_label.as_deref().unwrap_or(UNKNOWN_SENDER_LABEL);
    format!(
        "[{}] {}: {} ({})",
        message.created_at.format("%H:%M"),
        sender,
        message.body,
        status_marker(message.status)
    )
}

pub fn format_notification(notification: &Notification) -> String {
    match &notification.payload {
        NotificationPayload::MessageArrival {
            sender_label, preview, ..
        } => format!(
            "🔔 {}: {}",
            sender_label.as_deref().unwrap_or(UNKNOWN_SENDER_LABEL),
            preview
        ),
        NotificationPayload::Achievement(grant) => format!("🏆 {}", grant.title()),
    }
}

pub fn grant_json(grant: &AchievementGrant) -> Value {
    json!({
        "id": grant.id,
        "achievementId": grant.achievement_id,
        "title": grant.title(),
        "grantedAt": grant.granted_at.to_rfc3339(),
    })
}

pub fn print_json(value: &Value, pretty: bool) -> anyhow::Result<()> {
    let out = if pretty {
        serde_json::to_string_pretty(value)?
    } else {
        serde_json::to_string(value)?
    };
    println!("{}", out);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use fitsync_core::models::{MessageRecord, UserId};

    fn message(read: bool) -> Message {
        let record = MessageRecord {
            id: "m-9001".into(),
            conversation_id: "C123".into(),
            sender_id: UserId::new("trainer-1"),
            recipient_id: UserId::new("client-1"),
            body: "Bora treinar".into(),
            created_at: Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap(),
            read,
            client_ref: None,
        };
        Message::from_record(record, &UserId::new("client-1"))
    }

    #[test]
    fn test_format_message_falls_back_to_unknown_sender() {
        assert_eq!(format_message(&message(false)), "[07:30] Unknown: Bora treinar (✓✓)");
    }

    #[test]
    fn test_format_message_with_label_and_read() {
        let mut m = message(true);
        m.sender_label = Some("Coach Ana".into());
        assert_eq!(format_message(&m), "[07:30] Coach Ana: Bora treinar (✓✓ read)");
    }

    #[test]
    fn test_grant_json_uses_title() {
        let grant = AchievementGrant {
            id: "g-1".into(),
            achievement_id: "first-workout".into(),
            user_id: UserId::new("client-1"),
            granted_at: Utc.with_ymd_and_hms(2024, 5, 1, 7, 30, 0).unwrap(),
            achievement: None,
        };
        let value = grant_json(&grant);
        assert_eq!(value["title"], "first-workout");
        assert_eq!(value["achievementId"], "first-workout");
    }
}
