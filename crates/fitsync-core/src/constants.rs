//! Application-wide constants
//!
//! Centralized location for table names, column names and default timings
//! that are used across multiple modules.

/// Prefix reserved for locally generated message ids. Store-assigned ids never
/// start with it.
pub const PROVISIONAL_ID_PREFIX: &str = "tmp-";

/// Label used when the sender's display name cannot be resolved
pub const UNKNOWN_SENDER_LABEL: &str = "Unknown";

/// Remote procedure that may create achievement grants as a side effect
pub const EVALUATE_ACHIEVEMENTS_RPC: &str = "evaluate_achievements";

// Backing store tables
pub mod tables {
    pub const MESSAGES: &str = "messages";
    pub const CONVERSATIONS: &str = "conversations";
    pub const USER_ACHIEVEMENTS: &str = "user_achievements";
    pub const PROFILES: &str = "profiles";
}

// Indexed columns usable as channel filters
pub mod columns {
    pub const CONVERSATION_ID: &str = "conversation_id";
    pub const RECIPIENT_ID: &str = "recipient_id";
    pub const SENDER_ID: &str = "sender_id";
    pub const USER_ID: &str = "user_id";
    pub const GRANTED_AT: &str = "granted_at";
}

// Default timings, in milliseconds
pub mod defaults {
    /// How long a visible notification stays before auto-dismissing
    pub const AUTO_DISMISS_MS: u64 = 8_000;
    /// Enter transition of a notification
    pub const APPEAR_MS: u64 = 300;
    /// Exit transition of a notification
    pub const DISMISS_MS: u64 = 300;
    /// Delay between the evaluation RPC and the follow-up grant query
    pub const EVALUATION_RECHECK_MS: u64 = 1_500;
    /// Delay between a grant push event and the follow-up grant query
    pub const PUSH_RECHECK_MS: u64 = 500;
    /// Coalescing window for unread refreshes triggered by channel events
    pub const UNREAD_DEBOUNCE_MS: u64 = 250;
    pub const RECONNECT_INITIAL_MS: u64 = 1_000;
    pub const RECONNECT_MAX_MS: u64 = 30_000;
    /// Messages kept in memory per conversation
    pub const WINDOW_CAPACITY: usize = 500;
    /// Realtime socket heartbeat interval
    pub const HEARTBEAT_MS: u64 = 25_000;
}
