use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::error::{Result, SyncError};
use crate::models::{Message, MessageId, MessageRecord, MessageStatus, NewMessage, UserId};

/// What happened to a provisional entry once its write resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Provisional entry was substituted by the confirmed record
    Replaced,
    /// The confirmed record had already arrived (echo or reload); the
    /// provisional entry was discarded
    AlreadyConfirmed,
    /// The write failed and the entry is now in `Error`
    Failed,
    /// The provisional entry was no longer in the sequence
    Missing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteInsertOutcome {
    Appended,
    /// Matched a provisional entry through its client ref and replaced it
    Reconciled,
    /// Already present under its confirmed id
    Duplicate,
    /// Belongs to another conversation
    Ignored,
}

/// Merged, de-duplicated, time-ordered message sequence of one conversation.
///
/// Provisional and confirmed entries share one sequence; a confirmed record
/// only ever takes the place of its provisional entry through a single
/// replace path guarded by an existence check.
#[derive(Debug)]
pub struct MessageStore {
    conversation_id: String,
    me: UserId,
    messages: Vec<Message>,
    capacity: usize,
    labels: HashMap<UserId, String>,
    /// Confirmed ids marked read locally; survives reloads that raced the
    /// mark-read write
    locally_read: HashSet<String>,
    /// Bumped by every `begin_load`
    epoch: u64,
    /// Confirmed ids merged from acks or pushes, with the epoch they landed in
    arrivals: HashMap<String, u64>,
}

impl MessageStore {
    pub fn new(conversation_id: impl Into<String>, me: UserId, capacity: usize) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            me,
            messages: Vec::new(),
            capacity: capacity.max(1),
            labels: HashMap::new(),
            locally_read: HashSet::new(),
            epoch: 0,
            arrivals: HashMap::new(),
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.locally_read.clear();
        self.arrivals.clear();
    }

    // ===== Getters =====

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| &m.id == id)
    }

    pub fn contains_confirmed(&self, id: &str) -> bool {
        self.position_confirmed(id).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.messages.iter().filter(|m| m.id.is_provisional()).count()
    }

    fn position_confirmed(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| matches!(&m.id, MessageId::Confirmed(c) if c == id))
    }

    fn position_provisional(&self, id: &str) -> Option<usize> {
        self.messages
            .iter()
            .position(|m| matches!(&m.id, MessageId::Provisional(p) if p == id))
    }

    // ===== Mutations =====

    /// Optimistic insert of a locally created entry.
    pub fn insert_provisional(&mut self, mut message: Message) -> MessageId {
        debug_assert!(message.id.is_provisional());
        message.status = MessageStatus::Sending;
        self.apply_label(&mut message);
        let id = message.id.clone();
        self.insert_sorted(message);
        id
    }

    /// Apply the outcome of the write issued for `provisional`. Whichever of
    /// ack, echo or reload lands first wins; the others become no-ops.
    pub fn resolve_send(
        &mut self,
        provisional: &MessageId,
        result: std::result::Result<MessageRecord, SyncError>,
    ) -> ResolveOutcome {
        let provisional_pos = self.position_provisional(provisional.as_str());

        match result {
            Ok(record) => {
                if self.contains_confirmed(&record.id) {
                    if let Some(pos) = provisional_pos {
                        self.messages.remove(pos);
                    }
                    debug!(id = %record.id, "write ack after confirmed entry, dropping provisional");
                    return ResolveOutcome::AlreadyConfirmed;
                }

                self.arrivals.insert(record.id.clone(), self.epoch);
                let confirmed = self.confirmed_entry(record);
                match provisional_pos {
                    Some(pos) => {
                        self.messages[pos] = confirmed;
                        self.resort();
                        ResolveOutcome::Replaced
                    }
                    None => {
                        self.insert_sorted(confirmed);
                        ResolveOutcome::Missing
                    }
                }
            }
            Err(err) => match provisional_pos {
                Some(pos) => {
                    let entry = &mut self.messages[pos];
                    if entry.advance(MessageStatus::Error) {
                        debug!(id = %entry.id, error = %err, "write failed, entry marked error");
                    }
                    ResolveOutcome::Failed
                }
                None => ResolveOutcome::Missing,
            },
        }
    }

    /// Move a failed entry back to `Sending` and return the write to re-issue.
    pub fn begin_retry(&mut self, id: &MessageId) -> Result<NewMessage> {
        let entry = self
            .messages
            .iter_mut()
            .find(|m| &m.id == id && m.status == MessageStatus::Error)
            .ok_or_else(|| SyncError::UnknownMessage(id.to_string()))?;
        entry.advance(MessageStatus::Sending);
        Ok(entry.to_new_message())
    }

    /// Merge a pushed insert. Re-deliveries are detected by confirmed id, own
    /// echoes by client ref.
    pub fn apply_remote_insert(&mut self, record: MessageRecord) -> RemoteInsertOutcome {
        if record.conversation_id != self.conversation_id {
            return RemoteInsertOutcome::Ignored;
        }

        if let Some(pos) = self.position_confirmed(&record.id) {
            if record.read {
                self.mark_entry_read(pos);
            }
            return RemoteInsertOutcome::Duplicate;
        }

        let provisional_pos = record
            .client_ref
            .as_deref()
            .and_then(|r| self.position_provisional(r));

        self.arrivals.insert(record.id.clone(), self.epoch);
        let confirmed = self.confirmed_entry(record);
        match provisional_pos {
            Some(pos) => {
                self.messages[pos] = confirmed;
                self.resort();
                RemoteInsertOutcome::Reconciled
            }
            None => {
                self.insert_sorted(confirmed);
                RemoteInsertOutcome::Appended
            }
        }
    }

    /// Merge a pushed update (read receipts). Returns whether anything changed.
    pub fn apply_remote_update(&mut self, record: &MessageRecord) -> bool {
        match self.position_confirmed(&record.id) {
            Some(pos) if record.read => self.mark_entry_read(pos),
            _ => false,
        }
    }

    /// Optimistically mark every incoming message read. Returns how many changed.
    pub fn mark_incoming_read(&mut self) -> usize {
        let me = self.me.clone();
        let positions: Vec<usize> = self
            .messages
            .iter()
            .enumerate()
            .filter(|(_, m)| m.is_incoming(&me) && !m.read)
            .map(|(i, _)| i)
            .collect();

        positions
            .into_iter()
            .filter(|&pos| self.mark_entry_read(pos))
            .count()
    }

    pub fn unread_incoming(&self) -> usize {
        self.messages
            .iter()
            .filter(|m| m.is_incoming(&self.me) && !m.read)
            .count()
    }

    /// Mark the start of a history query. Pass the returned mark to
    /// [`replace_history`](Self::replace_history) once the query returns.
    pub fn begin_load(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Replace the sequence with an authoritative history taken at `since`
    /// (from [`begin_load`](Self::begin_load)). Live provisional entries the
    /// history does not account for are kept, and so are confirmed entries
    /// that arrived after the query started but are missing from it.
    pub fn replace_history(&mut self, records: Vec<MessageRecord>, since: u64) {
        let fetched_refs: HashSet<String> = records
            .iter()
            .filter_map(|r| r.client_ref.clone())
            .collect();

        let previous = std::mem::take(&mut self.messages);
        let previous_status: HashMap<String, (bool, MessageStatus)> = previous
            .iter()
            .filter(|m| m.id.is_confirmed())
            .map(|m| (m.id.as_str().to_string(), (m.read, m.status)))
            .collect();

        let mut merged: Vec<Message> = Vec::with_capacity(records.len());
        let mut seen: HashSet<String> = HashSet::new();
        for record in records {
            if record.conversation_id != self.conversation_id || !seen.insert(record.id.clone()) {
                continue;
            }
            let mut message = self.confirmed_entry(record);
            let locally_read = self.locally_read.contains(message.id.as_str());
            if let Some(&(read, status)) = previous_status.get(message.id.as_str()) {
                if read || locally_read {
                    message.read = true;
                }
                message.advance(status);
            } else if locally_read {
                message.read = true;
            }
            if message.read {
                message.advance(MessageStatus::Read);
            }
            merged.push(message);
        }

        let arrivals = std::mem::take(&mut self.arrivals);
        let landed_after = |id: &str| arrivals.get(id).is_some_and(|&epoch| epoch >= since);
        let kept: Vec<Message> = previous
            .into_iter()
            .filter(|m| match &m.id {
                MessageId::Provisional(p) => !fetched_refs.contains(p),
                MessageId::Confirmed(c) => !seen.contains(c) && landed_after(c.as_str()),
            })
            .collect();
        let kept_count = kept.len();
        for message in &kept {
            if let (MessageId::Confirmed(c), Some(&epoch)) = (&message.id, arrivals.get(message.id.as_str())) {
                self.arrivals.insert(c.clone(), epoch);
            }
        }
        merged.extend(kept);

        self.messages = merged;
        self.resort();
        self.evict();
        debug!(
            conversation = %self.conversation_id,
            total = self.messages.len(),
            kept = kept_count,
            "history replaced"
        );
    }

    /// Install sender labels and apply them to every entry.
    pub fn set_labels(&mut self, labels: HashMap<UserId, String>) {
        self.labels.extend(labels);
        let labels = &self.labels;
        for message in &mut self.messages {
            if let Some(label) = labels.get(&message.sender_id) {
                message.sender_label = Some(label.clone());
            }
        }
    }

    pub fn label_for(&self, user: &UserId) -> Option<&str> {
        self.labels.get(user).map(String::as_str)
    }

    // ===== Internals =====

    fn confirmed_entry(&self, record: MessageRecord) -> Message {
        let mut message = Message::from_record(record, &self.me);
        self.apply_label(&mut message);
        message
    }

    fn apply_label(&self, message: &mut Message) {
        if message.sender_label.is_none() {
            message.sender_label = self.labels.get(&message.sender_id).cloned();
        }
    }

    fn mark_entry_read(&mut self, pos: usize) -> bool {
        let entry = &mut self.messages[pos];
        if entry.read {
            return false;
        }
        entry.read = true;
        entry.advance(MessageStatus::Read);
        if entry.id.is_confirmed() {
            self.locally_read.insert(entry.id.as_str().to_string());
        }
        true
    }

    fn insert_sorted(&mut self, message: Message) {
        let pos = self
            .messages
            .partition_point(|m| m.sort_cmp(&message) != Ordering::Greater);
        self.messages.insert(pos, message);
        self.evict();
    }

    fn resort(&mut self) {
        self.messages.sort_by(|a, b| a.sort_cmp(b));
    }

    /// Drop the oldest confirmed entries beyond capacity. Provisional entries
    /// are never evicted.
    fn evict(&mut self) {
        while self.messages.len() > self.capacity {
            match self.messages.iter().position(|m| m.id.is_confirmed()) {
                Some(pos) => {
                    let evicted = self.messages.remove(pos);
                    self.locally_read.remove(evicted.id.as_str());
                    self.arrivals.remove(evicted.id.as_str());
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn me() -> UserId {
        UserId::new("client-1")
    }

    fn trainer() -> UserId {
        UserId::new("trainer-1")
    }

    fn store() -> MessageStore {
        MessageStore::new("C123", me(), 100)
    }

    fn provisional(body: &str, at: i64) -> Message {
        Message::provisional(
            MessageId::provisional(),
            "C123",
            me(),
            trainer(),
            body.to_string(),
            ts(at),
        )
    }

    fn ack(id: &str, provisional: &MessageId, body: &str, at: i64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            conversation_id: "C123".to_string(),
            sender_id: me(),
            recipient_id: trainer(),
            body: body.to_string(),
            created_at: ts(at),
            read: false,
            client_ref: Some(provisional.as_str().to_string()),
        }
    }

    fn incoming(id: &str, body: &str, at: i64) -> MessageRecord {
        MessageRecord {
            id: id.to_string(),
            conversation_id: "C123".to_string(),
            sender_id: trainer(),
            recipient_id: me(),
            body: body.to_string(),
            created_at: ts(at),
            read: false,
            client_ref: None,
        }
    }

    #[test]
    fn test_send_then_ack_replaces_in_place() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].status, MessageStatus::Sending);

        let outcome = store.resolve_send(&tmp, Ok(ack("m-9001", &tmp, "Oi", 11)));
        assert_eq!(outcome, ResolveOutcome::Replaced);
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].id, MessageId::Confirmed("m-9001".into()));
        assert_eq!(store.messages()[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_echo_before_ack_produces_single_entry() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));

        let echo = store.apply_remote_insert(ack("m-9001", &tmp, "Oi", 11));
        assert_eq!(echo, RemoteInsertOutcome::Reconciled);

        let outcome = store.resolve_send(&tmp, Ok(ack("m-9001", &tmp, "Oi", 11)));
        assert_eq!(outcome, ResolveOutcome::AlreadyConfirmed);
        assert_eq!(store.len(), 1);
        assert_eq!(store.pending_count(), 0);
    }

    #[test]
    fn test_ack_before_echo_produces_single_entry() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));
        store.resolve_send(&tmp, Ok(ack("m-9001", &tmp, "Oi", 11)));

        let echo = store.apply_remote_insert(ack("m-9001", &tmp, "Oi", 11));
        assert_eq!(echo, RemoteInsertOutcome::Duplicate);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_replayed_insert_is_duplicate() {
        let mut store = store();
        assert_eq!(
            store.apply_remote_insert(incoming("m-1", "Bom treino", 5)),
            RemoteInsertOutcome::Appended
        );
        assert_eq!(
            store.apply_remote_insert(incoming("m-1", "Bom treino", 5)),
            RemoteInsertOutcome::Duplicate
        );
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages()[0].status, MessageStatus::Delivered);
    }

    #[test]
    fn test_other_conversation_is_ignored() {
        let mut store = store();
        let mut record = incoming("m-1", "x", 1);
        record.conversation_id = "C999".into();
        assert_eq!(store.apply_remote_insert(record), RemoteInsertOutcome::Ignored);
        assert!(store.is_empty());
    }

    #[test]
    fn test_write_failure_marks_error_and_keeps_entry() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));

        let outcome = store.resolve_send(&tmp, Err(SyncError::Write("offline".into())));
        assert_eq!(outcome, ResolveOutcome::Failed);
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&tmp).unwrap().status, MessageStatus::Error);
    }

    #[test]
    fn test_retry_moves_error_back_to_sending() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));
        store.resolve_send(&tmp, Err(SyncError::Write("offline".into())));

        let write = store.begin_retry(&tmp).unwrap();
        assert_eq!(write.client_ref, tmp.as_str());
        assert_eq!(store.get(&tmp).unwrap().status, MessageStatus::Sending);

        // Not in error any more, so a second retry is refused
        assert!(store.begin_retry(&tmp).is_err());
    }

    #[test]
    fn test_late_failure_does_not_downgrade_confirmed() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("Oi", 10));
        store.apply_remote_insert(ack("m-9001", &tmp, "Oi", 11));

        let outcome = store.resolve_send(&tmp, Err(SyncError::Write("timeout".into())));
        assert_eq!(outcome, ResolveOutcome::Missing);
        assert_eq!(store.messages()[0].status, MessageStatus::Sent);
    }

    #[test]
    fn test_ordering_by_timestamp_then_id() {
        let mut store = store();
        store.apply_remote_insert(incoming("m-b", "second", 20));
        store.apply_remote_insert(incoming("m-c", "third", 20));
        store.apply_remote_insert(incoming("m-a", "first", 5));

        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-a", "m-b", "m-c"]);
    }

    #[test]
    fn test_replacement_resorts_by_server_timestamp() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("mine", 30));
        store.apply_remote_insert(incoming("m-1", "theirs", 20));

        // Server stamped the write earlier than the trainer's message
        store.resolve_send(&tmp, Ok(ack("m-0", &tmp, "mine", 15)));
        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-0", "m-1"]);
    }

    #[test]
    fn test_replace_history_keeps_unconfirmed_provisional() {
        let mut store = store();
        let pending = store.insert_provisional(provisional("pending", 50));
        let echoed = store.insert_provisional(provisional("echoed", 40));

        let mark = store.begin_load();
        store.replace_history(
            vec![incoming("m-1", "hello", 1), ack("m-2", &echoed, "echoed", 41)],
            mark,
        );

        assert_eq!(store.len(), 3);
        assert!(store.get(&pending).is_some());
        assert!(store.get(&echoed).is_none());
        assert!(store.contains_confirmed("m-2"));
    }

    #[test]
    fn test_replace_history_is_idempotent() {
        let mut store = store();
        store.insert_provisional(provisional("pending", 50));
        let history = vec![incoming("m-1", "a", 1), incoming("m-2", "b", 2)];

        let mark = store.begin_load();
        store.replace_history(history.clone(), mark);
        let first: Vec<Message> = store.messages().to_vec();
        let mark = store.begin_load();
        store.replace_history(history, mark);
        assert_eq!(store.messages(), first.as_slice());
    }

    #[test]
    fn test_replace_history_keeps_confirmed_entries_newer_than_snapshot() {
        let mut store = store();
        store.apply_remote_insert(incoming("m-1", "before load", 1));

        let mark = store.begin_load();
        // Landed while the query was in flight
        store.apply_remote_insert(incoming("m-2", "pushed during load", 2));
        let tmp = store.insert_provisional(provisional("Oi", 3));
        store.resolve_send(&tmp, Ok(ack("m-3", &tmp, "Oi", 3)));

        store.replace_history(vec![incoming("m-1", "before load", 1)], mark);
        let ids: Vec<&str> = store.messages().iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2", "m-3"]);
        assert_eq!(store.pending_count(), 0);

        // A later snapshot that includes them replaces them without duplicates
        let mark = store.begin_load();
        store.replace_history(
            vec![
                incoming("m-1", "before load", 1),
                incoming("m-2", "pushed during load", 2),
                ack("m-3", &tmp, "Oi", 3),
            ],
            mark,
        );
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_replace_history_drops_confirmed_entries_older_than_snapshot() {
        let mut store = store();
        store.apply_remote_insert(incoming("m-1", "gone upstream", 1));

        let mark = store.begin_load();
        store.replace_history(vec![incoming("m-2", "current", 2)], mark);
        assert!(!store.contains_confirmed("m-1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_mark_read_survives_stale_reload() {
        let mut store = store();
        let mark = store.begin_load();
        store.replace_history(vec![incoming("m-1", "a", 1), incoming("m-2", "b", 2)], mark);
        assert_eq!(store.unread_incoming(), 2);

        assert_eq!(store.mark_incoming_read(), 2);
        assert_eq!(store.unread_incoming(), 0);

        // A reload that was issued before the mark-read write landed
        let mark = store.begin_load();
        store.replace_history(vec![incoming("m-1", "a", 1), incoming("m-2", "b", 2)], mark);
        assert_eq!(store.unread_incoming(), 0);
        assert!(store.messages().iter().all(|m| m.status == MessageStatus::Read));
    }

    #[test]
    fn test_mark_read_leaves_own_messages() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("mine", 1));
        store.apply_remote_insert(incoming("m-1", "theirs", 2));

        assert_eq!(store.mark_incoming_read(), 1);
        assert_eq!(store.get(&tmp).unwrap().status, MessageStatus::Sending);
    }

    #[test]
    fn test_read_receipt_update() {
        let mut store = store();
        let tmp = store.insert_provisional(provisional("mine", 1));
        store.resolve_send(&tmp, Ok(ack("m-1", &tmp, "mine", 1)));

        let mut receipt = ack("m-1", &tmp, "mine", 1);
        receipt.read = true;
        assert!(store.apply_remote_update(&receipt));
        assert_eq!(store.messages()[0].status, MessageStatus::Read);
        assert!(!store.apply_remote_update(&receipt));
    }

    #[test]
    fn test_eviction_keeps_provisional_entries() {
        let mut store = MessageStore::new("C123", me(), 3);
        let tmp = store.insert_provisional(provisional("pending", 0));
        for i in 1..=5 {
            store.apply_remote_insert(incoming(&format!("m-{i}"), "x", i));
        }

        assert_eq!(store.len(), 3);
        assert!(store.get(&tmp).is_some());
        assert!(!store.contains_confirmed("m-1"));
        assert!(store.contains_confirmed("m-5"));
    }

    #[test]
    fn test_labels_apply_to_existing_and_new_entries() {
        let mut store = store();
        store.apply_remote_insert(incoming("m-1", "a", 1));

        let mut labels = HashMap::new();
        labels.insert(trainer(), "Coach Ana".to_string());
        store.set_labels(labels);
        assert_eq!(store.messages()[0].sender_label.as_deref(), Some("Coach Ana"));

        store.apply_remote_insert(incoming("m-2", "b", 2));
        assert_eq!(store.messages()[1].sender_label.as_deref(), Some("Coach Ana"));
    }
}
