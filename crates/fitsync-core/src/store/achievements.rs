use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::models::AchievementGrant;

/// Watermark bookkeeping for achievement detection.
#[derive(Debug)]
pub struct WatermarkState {
    watermark: DateTime<Utc>,
    current: Option<AchievementGrant>,
    /// Surfaced grants still above the watermark (server time ahead of the
    /// local clock), by id. Everything else is already excluded by the
    /// watermark and gets pruned.
    surfaced: HashMap<String, DateTime<Utc>>,
}

impl WatermarkState {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            watermark: start,
            current: None,
            surfaced: HashMap::new(),
        }
    }

    pub fn watermark(&self) -> DateTime<Utc> {
        self.watermark
    }

    pub fn current(&self) -> Option<&AchievementGrant> {
        self.current.as_ref()
    }

    pub fn take_current(&mut self) -> Option<AchievementGrant> {
        self.current.take()
    }

    /// Pick the grant to surface from a query issued with `issued_with` as
    /// its lower bound. Grants at or below either that bound or the current
    /// watermark (which may have advanced while the query was in flight) are
    /// rejected, as are grants already surfaced. On success the watermark
    /// moves to `now`, never backwards.
    pub fn accept(
        &mut self,
        issued_with: DateTime<Utc>,
        candidates: Vec<AchievementGrant>,
        now: DateTime<Utc>,
    ) -> Option<AchievementGrant> {
        let floor = issued_with.max(self.watermark);
        let grant = candidates
            .into_iter()
            .filter(|g| g.granted_at > floor && !self.surfaced.contains_key(&g.id))
            .max_by(|a, b| a.granted_at.cmp(&b.granted_at))?;

        self.surfaced.insert(grant.id.clone(), grant.granted_at);
        self.watermark = self.watermark.max(now);
        let watermark = self.watermark;
        self.surfaced.retain(|_, granted_at| *granted_at > watermark);
        self.current = Some(grant.clone());
        Some(grant)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserId;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn grant(id: &str, at: DateTime<Utc>) -> AchievementGrant {
        AchievementGrant {
            id: id.to_string(),
            achievement_id: "streak-7".to_string(),
            user_id: UserId::new("client-1"),
            granted_at: at,
            achievement: None,
        }
    }

    #[test]
    fn test_accept_advances_watermark_to_now() {
        let mut state = WatermarkState::new(t0());
        let now = t0() + Duration::seconds(10);

        let surfaced = state.accept(t0(), vec![grant("g-1", t0() + Duration::seconds(1))], now);
        assert_eq!(surfaced.unwrap().id, "g-1");
        assert_eq!(state.watermark(), now);
        assert_eq!(state.current().unwrap().id, "g-1");
    }

    #[test]
    fn test_rejects_grants_at_or_below_watermark() {
        let mut state = WatermarkState::new(t0());
        assert!(state.accept(t0(), vec![grant("g-1", t0())], t0()).is_none());
        assert_eq!(state.watermark(), t0());
    }

    #[test]
    fn test_interleaved_checks_surface_once() {
        let mut state = WatermarkState::new(t0());
        let g = grant("g-1", t0() + Duration::seconds(1));

        // Two checks were issued with the same watermark and both found g-1
        let now = t0() + Duration::seconds(5);
        assert!(state.accept(t0(), vec![g.clone()], now).is_some());
        assert!(state.accept(t0(), vec![g], now).is_none());
    }

    #[test]
    fn test_watermark_never_decreases() {
        let mut state = WatermarkState::new(t0() + Duration::seconds(100));
        let g = grant("g-1", t0() + Duration::seconds(200));

        // Clock went backwards relative to the start watermark
        state.accept(t0() + Duration::seconds(100), vec![g], t0());
        assert_eq!(state.watermark(), t0() + Duration::seconds(100));
    }

    #[test]
    fn test_surfaced_ids_pruned_once_below_watermark() {
        let mut state = WatermarkState::new(t0());
        for i in 1..=50 {
            let at = t0() + Duration::seconds(i);
            let surfaced = state.accept(state.watermark(), vec![grant(&format!("g-{i}"), at)], at);
            assert!(surfaced.is_some());
        }
        assert!(state.surfaced.is_empty());
    }

    #[test]
    fn test_grant_ahead_of_local_clock_surfaces_once() {
        let mut state = WatermarkState::new(t0());
        // Server stamped the grant later than the local clock reads
        let g = grant("g-1", t0() + Duration::seconds(30));
        let now = t0() + Duration::seconds(5);

        assert!(state.accept(t0(), vec![g.clone()], now).is_some());
        assert_eq!(state.watermark(), now);
        assert!(state.accept(now, vec![g.clone()], now).is_none());
        assert_eq!(state.surfaced.len(), 1);

        // Once the clock passes the grant it is pruned and still never resurfaces
        let later = t0() + Duration::seconds(60);
        let other = grant("g-2", t0() + Duration::seconds(61));
        assert!(state.accept(now, vec![other], later).is_some());
        assert!(!state.surfaced.contains_key("g-1"));
        assert_eq!(state.surfaced.len(), 1);
        assert!(state.accept(later, vec![g], later).is_none());
    }

    #[test]
    fn test_take_current_clears_candidate() {
        let mut state = WatermarkState::new(t0());
        state.accept(t0(), vec![grant("g-1", t0() + Duration::seconds(1))], t0() + Duration::seconds(2));
        assert!(state.take_current().is_some());
        assert!(state.current().is_none());
    }
}
