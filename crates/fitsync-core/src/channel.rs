//! Filtered publish/subscribe channels over the backing store's change feed.
//!
//! A subscription is a background pump that connects through a
//! [`RealtimeTransport`], forwards change events into a queue in arrival
//! order, and reconnects with exponential backoff when the connection drops.
//! Events that happened while disconnected are not replayed; the pump
//! announces every reconnection with [`ChannelMessage::Resubscribed`] so the
//! owner can re-run its authoritative refresh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::stats::SharedSubscriptionStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One row change as delivered by the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub table: String,
    pub kind: ChangeKind,
    /// New row for inserts and updates, empty object for deletes
    pub record: serde_json::Value,
    /// Previous row when the feed provides it
    pub old_record: Option<serde_json::Value>,
}

impl ChangeEvent {
    pub fn new(table: &str, kind: ChangeKind, record: serde_json::Value) -> Self {
        Self {
            table: table.to_string(),
            kind,
            record,
            old_record: None,
        }
    }

    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.record.clone()).map_err(|e| SyncError::decode("change record", e))
    }
}

/// Single equality predicate on an indexed column, evaluated server-side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelFilter {
    column: String,
    value: String,
}

impl ChannelFilter {
    pub fn new(column: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        let column = column.into();
        let value = value.into();
        if column.trim().is_empty() || column.contains(|c: char| c.is_whitespace() || c == '=') {
            return Err(SyncError::InvalidFilter(format!("bad column {:?}", column)));
        }
        if value.is_empty() {
            return Err(SyncError::InvalidFilter(format!("empty value for {}", column)));
        }
        Ok(Self { column, value })
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    /// `column=eq.value`, the form the change feed expects.
    pub fn to_expression(&self) -> String {
        format!("{}=eq.{}", self.column, self.value)
    }

    /// Client-side evaluation against a row.
    pub fn matches(&self, record: &serde_json::Value) -> bool {
        match record.get(&self.column) {
            Some(serde_json::Value::String(s)) => s == &self.value,
            Some(other) => other.to_string() == self.value,
            None => false,
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent>>;

/// Connection primitive of the change feed. The returned stream ending (or
/// yielding an error) means the connection dropped.
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    async fn connect(&self, table: &str, filter: &ChannelFilter) -> Result<ChangeStream>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelMessage {
    Change(ChangeEvent),
    /// The connection came back after a drop; events in the gap were lost
    Resubscribed,
}

pub type ChannelReceiver = mpsc::UnboundedReceiver<ChannelMessage>;

/// Live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct SubscriptionHandle {
    table: String,
    filter: ChannelFilter,
    task: Option<JoinHandle<()>>,
    stats: SharedSubscriptionStats,
}

impl SubscriptionHandle {
    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn filter(&self) -> &ChannelFilter {
        &self.filter
    }

    pub fn is_active(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            self.stats.closed(&self.table);
            debug!(table = %self.table, filter = %self.filter.to_expression(), "unsubscribed");
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    initial: Duration,
    max: Duration,
}

/// Factory for subscriptions over one transport.
#[derive(Clone)]
pub struct EventChannel {
    transport: Arc<dyn RealtimeTransport>,
    stats: SharedSubscriptionStats,
    backoff: Backoff,
}

impl EventChannel {
    pub fn new(transport: Arc<dyn RealtimeTransport>, config: &SyncConfig) -> Self {
        Self {
            transport,
            stats: SharedSubscriptionStats::new(),
            backoff: Backoff {
                initial: config.reconnect_initial(),
                max: config.reconnect_max(),
            },
        }
    }

    pub fn stats(&self) -> SharedSubscriptionStats {
        self.stats.clone()
    }

    /// Open a subscription. Must be called from within a tokio runtime.
    pub fn subscribe(&self, table: &str, filter: ChannelFilter) -> (SubscriptionHandle, ChannelReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.stats.opened(table);

        let task = tokio::spawn(pump(
            Arc::clone(&self.transport),
            table.to_string(),
            filter.clone(),
            tx,
            self.backoff,
            self.stats.clone(),
        ));
        info!(table, filter = %filter.to_expression(), "subscribed");

        let handle = SubscriptionHandle {
            table: table.to_string(),
            filter,
            task: Some(task),
            stats: self.stats.clone(),
        };
        (handle, rx)
    }
}

async fn pump(
    transport: Arc<dyn RealtimeTransport>,
    table: String,
    filter: ChannelFilter,
    tx: mpsc::UnboundedSender<ChannelMessage>,
    backoff: Backoff,
    stats: SharedSubscriptionStats,
) {
    let mut connected_before = false;
    // A refused attempt means the owner's initial refresh ran against a
    // channel that was not live yet
    let mut missed_events = false;
    let mut delay = backoff.initial;

    loop {
        match transport.connect(&table, &filter).await {
            Ok(mut stream) => {
                if connected_before || missed_events {
                    stats.record_reconnect(&table);
                    info!(table = %table, "channel resubscribed");
                    if tx.send(ChannelMessage::Resubscribed).is_err() {
                        return;
                    }
                }
                connected_before = true;
                missed_events = false;
                delay = backoff.initial;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) => {
                            stats.record_event(&table);
                            if tx.send(ChannelMessage::Change(event)).is_err() {
                                return;
                            }
                        }
                        Err(e) => {
                            warn!(table = %table, error = %e, "channel stream error");
                            break;
                        }
                    }
                }
                debug!(table = %table, "channel connection dropped");
            }
            Err(e) => {
                missed_events = true;
                warn!(table = %table, error = %e, retry_in_ms = delay.as_millis() as u64, "channel connect failed");
            }
        }

        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(backoff.max);
    }
}
