/// Which unread records a counter tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum UnreadScope {
    /// Everything addressed to the current user
    All,
    Conversation(String),
}

/// Unread count state. The count is only ever replaced by an authoritative
/// query result, never incremented or decremented from push payloads.
#[derive(Debug, Default)]
pub struct UnreadState {
    count: u64,
    issued: u64,
    applied: u64,
    refreshed_once: bool,
}

impl UnreadState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Whether at least one authoritative count has been applied.
    pub fn is_known(&self) -> bool {
        self.refreshed_once
    }

    /// Ticket for a refresh about to be issued.
    pub fn begin_refresh(&mut self) -> u64 {
        self.issued += 1;
        self.issued
    }

    /// Apply a count returned for `ticket`. Results older than one already
    /// applied are dropped, so overlapping refreshes settle on the newest.
    pub fn apply(&mut self, ticket: u64, count: u64) -> bool {
        if ticket <= self.applied {
            return false;
        }
        self.applied = ticket;
        self.refreshed_once = true;
        let changed = self.count != count;
        self.count = count;
        changed
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_ticket_wins() {
        let mut state = UnreadState::new();
        let seed = state.begin_refresh();
        state.apply(seed, 5);

        // Results return out of order: the newer one lands first
        let older = state.begin_refresh();
        let newer = state.begin_refresh();
        assert!(state.apply(newer, 0));
        assert!(!state.apply(older, 3));
        assert_eq!(state.count(), 0);
        assert!(state.is_known());
    }

    #[test]
    fn test_apply_reports_change() {
        let mut state = UnreadState::new();
        assert!(!state.is_known());
        let t = state.begin_refresh();
        assert!(state.apply(t, 3));
        assert!(state.is_known());

        let t = state.begin_refresh();
        assert!(!state.apply(t, 3));
        assert_eq!(state.count(), 3);
    }
}
