use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::identity::UserId;
use crate::constants::PROVISIONAL_ID_PREFIX;

/// Message identity: either generated locally before the write is confirmed,
/// or assigned by the backing store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Provisional(String),
    Confirmed(String),
}

impl MessageId {
    /// Fresh provisional id, unique for this client session.
    pub fn provisional() -> Self {
        MessageId::Provisional(format!("{}{}", PROVISIONAL_ID_PREFIX, uuid::Uuid::new_v4()))
    }

    /// Classify a raw id by the reserved prefix.
    pub fn parse(raw: &str) -> Self {
        if raw.starts_with(PROVISIONAL_ID_PREFIX) {
            MessageId::Provisional(raw.to_string())
        } else {
            MessageId::Confirmed(raw.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Provisional(id) | MessageId::Confirmed(id) => id,
        }
    }

    pub fn is_provisional(&self) -> bool {
        matches!(self, MessageId::Provisional(_))
    }

    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageId::Confirmed(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Delivered,
    Read,
    Error,
}

impl MessageStatus {
    fn rank(self) -> Option<u8> {
        match self {
            MessageStatus::Sending => Some(0),
            MessageStatus::Sent => Some(1),
            MessageStatus::Delivered => Some(2),
            MessageStatus::Read => Some(3),
            MessageStatus::Error => None,
        }
    }

    /// Whether `self -> next` is a legal transition. Statuses only move
    /// forward; `Error` is entered from `Sending` and left only by a retry.
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        match (self, next) {
            (MessageStatus::Error, MessageStatus::Sending) => true,
            (MessageStatus::Error, _) => false,
            (MessageStatus::Sending, MessageStatus::Error) => true,
            (_, MessageStatus::Error) => false,
            (current, next) => next.rank() > current.rank(),
        }
    }

    /// Still waiting on, or failed, its write.
    pub fn is_pending(self) -> bool {
        matches!(self, MessageStatus::Sending | MessageStatus::Error)
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageStatus::Sending => "sending",
            MessageStatus::Sent => "sent",
            MessageStatus::Delivered => "delivered",
            MessageStatus::Read => "read",
            MessageStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// Row shape of the `messages` table as the backing store returns it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub id: String,
    pub conversation_id: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    #[serde(alias = "content")]
    pub body: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub read: bool,
    /// Provisional id the row was submitted under, echoed back by the store
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_ref: Option<String>,
}

/// Write request for a new message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub conversation_id: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    pub client_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub read: bool,
    pub status: MessageStatus,
    /// Human-readable sender name, filled in on load
    pub sender_label: Option<String>,
    pub client_ref: Option<String>,
}

impl Message {
    /// Build the live entry for a confirmed row as seen by `me`.
    pub fn from_record(record: MessageRecord, me: &UserId) -> Self {
        let status = if record.read {
            MessageStatus::Read
        } else if &record.sender_id == me {
            MessageStatus::Sent
        } else {
            MessageStatus::Delivered
        };

        Message {
            id: MessageId::Confirmed(record.id),
            conversation_id: record.conversation_id,
            sender_id: record.sender_id,
            recipient_id: record.recipient_id,
            body: record.body,
            created_at: record.created_at,
            read: record.read,
            status,
            sender_label: None,
            client_ref: record.client_ref,
        }
    }

    pub fn provisional(
        id: MessageId,
        conversation_id: &str,
        sender_id: UserId,
        recipient_id: UserId,
        body: String,
        created_at: DateTime<Utc>,
    ) -> Self {
        let client_ref = Some(id.as_str().to_string());
        Message {
            id,
            conversation_id: conversation_id.to_string(),
            sender_id,
            recipient_id,
            body,
            created_at,
            read: false,
            status: MessageStatus::Sending,
            sender_label: None,
            client_ref,
        }
    }

    pub fn to_new_message(&self) -> NewMessage {
        NewMessage {
            conversation_id: self.conversation_id.clone(),
            sender_id: self.sender_id.clone(),
            recipient_id: self.recipient_id.clone(),
            body: self.body.clone(),
            client_ref: self.id.as_str().to_string(),
        }
    }

    /// Addressed to `me` by someone else.
    pub fn is_incoming(&self, me: &UserId) -> bool {
        &self.recipient_id == me && &self.sender_id != me
    }

    /// Move to `next` if the transition is legal; returns whether it moved.
    pub fn advance(&mut self, next: MessageStatus) -> bool {
        if self.status.can_advance_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }

    /// Merge order: creation time, then id string.
    pub fn sort_cmp(&self, other: &Message) -> Ordering {
        self.created_at
            .cmp(&other.created_at)
            .then_with(|| self.id.as_str().cmp(other.id.as_str()))
    }
}
