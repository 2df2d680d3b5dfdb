use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

/// Counters for realtime subscriptions, keyed by table
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Subscriptions currently open, by table
    pub active_by_table: HashMap<String, u64>,
    /// Events delivered, by table
    pub events_by_table: HashMap<String, u64>,
    /// Reconnections after a dropped connection, by table
    pub reconnects_by_table: HashMap<String, u64>,
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&mut self, table: &str) {
        *self.active_by_table.entry(table.to_string()).or_insert(0) += 1;
    }

    pub fn closed(&mut self, table: &str) {
        if let Some(count) = self.active_by_table.get_mut(table) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.active_by_table.remove(table);
            }
        }
    }

    pub fn record_event(&mut self, table: &str) {
        *self.events_by_table.entry(table.to_string()).or_insert(0) += 1;
    }

    pub fn record_reconnect(&mut self, table: &str) {
        *self.reconnects_by_table.entry(table.to_string()).or_insert(0) += 1;
    }

    pub fn total_active(&self) -> u64 {
        self.active_by_table.values().sum()
    }

    pub fn active(&self, table: &str) -> u64 {
        self.active_by_table.get(table).copied().unwrap_or(0)
    }
}

/// Thread-safe wrapper for subscription stats
#[derive(Debug, Clone, Default)]
pub struct SharedSubscriptionStats {
    inner: Arc<RwLock<SubscriptionStats>>,
}

impl SharedSubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn opened(&self, table: &str) {
        self.inner.write().opened(table);
    }

    pub fn closed(&self, table: &str) {
        self.inner.write().closed(table);
    }

    pub fn record_event(&self, table: &str) {
        self.inner.write().record_event(table);
    }

    pub fn record_reconnect(&self, table: &str) {
        self.inner.write().record_reconnect(table);
    }

    pub fn snapshot(&self) -> SubscriptionStats {
        self.inner.read().clone()
    }
}
