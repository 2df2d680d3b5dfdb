use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::UserId;

/// Two-party conversation between a trainer and a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(alias = "trainer_id")]
    pub participant_a: UserId,
    #[serde(alias = "client_id")]
    pub participant_b: UserId,
    #[serde(default)]
    pub last_message_at: Option<DateTime<Utc>>,
    /// Denormalized preview of the latest message
    #[serde(default, alias = "last_message")]
    pub preview: Option<String>,
    /// Derived value owned by the unread counter; never authoritative
    #[serde(default, skip_serializing)]
    pub unread_count: u64,
}

impl Conversation {
    pub fn new(id: impl Into<String>, a: UserId, b: UserId) -> Self {
        Self {
            id: id.into(),
            participant_a: a,
            participant_b: b,
            last_message_at: None,
            preview: None,
            unread_count: 0,
        }
    }

    pub fn includes(&self, user: &UserId) -> bool {
        &self.participant_a == user || &self.participant_b == user
    }

    /// The participant that is not `me`, or None if `me` is not a participant.
    pub fn counterpart(&self, me: &UserId) -> Option<&UserId> {
        if &self.participant_a == me {
            Some(&self.participant_b)
        } else if &self.participant_b == me {
            Some(&self.participant_a)
        } else {
            None
        }
    }

    pub fn touch(&mut self, at: DateTime<Utc>, preview: &str) {
        if self.last_message_at.map_or(true, |last| at >= last) {
            self.last_message_at = Some(at);
            self.preview = Some(preview.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_counterpart() {
        let conv = Conversation::new("C123", UserId::new("trainer"), UserId::new("client"));
        assert_eq!(conv.counterpart(&UserId::new("client")), Some(&UserId::new("trainer")));
        assert_eq!(conv.counterpart(&UserId::new("trainer")), Some(&UserId::new("client")));
        assert_eq!(conv.counterpart(&UserId::new("stranger")), None);
    }

    #[test]
    fn test_touch_ignores_older_messages() {
        let mut conv = Conversation::new("C123", UserId::new("a"), UserId::new("b"));
        let t1 = Utc.timestamp_opt(1_000, 0).unwrap();
        let t0 = Utc.timestamp_opt(500, 0).unwrap();

        conv.touch(t1, "newer");
        conv.touch(t0, "older");
        assert_eq!(conv.preview.as_deref(), Some("newer"));
        assert_eq!(conv.last_message_at, Some(t1));
    }
}
