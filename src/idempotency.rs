// src/idempotency.rs

//! Processed payment references.
//!
//! Eviction policy: a reference is forgotten once it is older than `horizon`.
//! When more than `max_entries` are held, the oldest are forgotten early. No
//! reference is ever forgotten while a callback carrying it could still pass
//! the timestamp check: a callback stamped `T` is accepted until
//! `T + acceptance_window`, and `T` may lie up to one window in the future, so
//! an entry whose timestamp is unknown is kept for twice the window.

use crate::config::{IdempotencyConfig, WebhookConfig};
use crate::pixel::ActivityRecord;
use chrono::{DateTime, Duration, Utc};
use log::*;
use std::collections::{HashMap, VecDeque};

#[derive(Debug)]
pub struct IdempotencyStore {
    /// Reference to the instant before which it must not be evicted.
    seen: HashMap<String, DateTime<Utc>>,
    order: VecDeque<(DateTime<Utc>, String)>,
    horizon: Duration,
    acceptance_window: Duration,
    max_entries: usize,
}

impl IdempotencyStore {
    pub fn new(horizon: Duration, acceptance_window: Duration, max_entries: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            horizon,
            acceptance_window,
            max_entries,
        }
    }

    pub fn from_config(idempotency: &IdempotencyConfig, webhook: &WebhookConfig) -> Self {
        Self::new(
            Duration::seconds(idempotency.horizon_secs as i64),
            Duration::seconds(webhook.acceptance_window_secs as i64),
            idempotency.max_entries,
        )
    }

    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    pub fn contains(&self, reference: &str) -> bool {
        self.seen.contains_key(reference)
    }

    /// Records a reference processed at `now` from a callback stamped
    /// `callback_at`. Returns `false` if it was already present.
    pub fn insert(
        &mut self,
        reference: &str,
        now: DateTime<Utc>,
        callback_at: Option<DateTime<Utc>>,
    ) -> bool {
        if self.seen.contains_key(reference) {
            return false;
        }
        let protected_until = self.protected_until(now, callback_at);
        self.seen.insert(reference.to_string(), protected_until);
        self.order.push_back((now, reference.to_string()));
        self.evict(now);
        true
    }

    fn protected_until(
        &self,
        processed_at: DateTime<Utc>,
        callback_at: Option<DateTime<Utc>>,
    ) -> DateTime<Utc> {
        match callback_at {
            Some(at) => (at + self.acceptance_window).max(processed_at + self.acceptance_window),
            None => processed_at + self.acceptance_window * 2,
        }
    }

    /// Re-seeds the store from applied purchases, e.g. after a restart.
    pub fn seed_from<'a, I>(&mut self, records: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = &'a ActivityRecord>,
    {
        let cutoff = now - self.horizon;
        let mut seeded = 0;
        for record in records {
            if record.created_at < cutoff || self.seen.contains_key(&record.payment_reference) {
                continue;
            }
            let protected_until = self.protected_until(record.created_at, None);
            self.seen
                .insert(record.payment_reference.clone(), protected_until);
            self.order
                .push_back((record.created_at, record.payment_reference.clone()));
            seeded += 1;
        }
        self.order.make_contiguous().sort();
        self.evict(now);
        seeded
    }

    /// Applies the eviction policy. Returns how many references were forgotten.
    pub fn evict(&mut self, now: DateTime<Utc>) -> usize {
        let expired_before = now - self.horizon;
        let mut evicted = 0;

        while let Some((inserted, reference)) = self.order.front() {
            let protected = self
                .seen
                .get(reference)
                .is_some_and(|until| *until >= now);
            let expired = *inserted < expired_before;
            let over_cap = self.order.len() > self.max_entries;
            if protected || !(expired || over_cap) {
                break;
            }
            if let Some((_, reference)) = self.order.pop_front() {
                self.seen.remove(&reference);
                evicted += 1;
            }
        }

        if evicted > 0 {
            debug!(
                "IdempotencyStore: evicted {} references, {} retained",
                evicted,
                self.seen.len()
            );
        }
        evicted
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pixel::{ActivityKind, Coord};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(reference: &str, at: DateTime<Utc>) -> ActivityRecord {
        ActivityRecord {
            id: 1,
            kind: ActivityKind::Single,
            cells: vec![Coord::new(0, 0)],
            color: None,
            letter: None,
            letters: None,
            amount_paid: 1,
            created_at: at,
            payment_reference: reference.to_string(),
            event_reference: None,
        }
    }

    #[test]
    fn second_insert_of_the_same_reference_is_refused() {
        let mut store = IdempotencyStore::new(Duration::hours(1), Duration::minutes(5), 10);
        assert!(store.insert("pay-1", t(0), Some(t(0))));
        assert!(!store.insert("pay-1", t(1), Some(t(1))));
        assert!(store.contains("pay-1"));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn references_expire_after_the_horizon() {
        let mut store = IdempotencyStore::new(Duration::hours(1), Duration::minutes(5), 10);
        store.insert("old", t(0), Some(t(0)));
        store.insert("fresh", t(3_000), Some(t(3_000)));
        assert_eq!(store.evict(t(3_601)), 1);
        assert!(!store.contains("old"));
        assert!(store.contains("fresh"));
    }

    #[test]
    fn size_cap_never_evicts_inside_the_acceptance_window() {
        let mut store = IdempotencyStore::new(Duration::hours(1), Duration::minutes(5), 2);
        store.insert("a", t(0), Some(t(0)));
        store.insert("b", t(10), Some(t(10)));
        store.insert("c", t(20), Some(t(20)));
        // All three callbacks are still acceptable: the cap yields.
        assert_eq!(store.len(), 3);

        store.insert("d", t(400), Some(t(400)));
        // a, b, c can no longer pass the timestamp check and the store is over its cap.
        assert!(!store.contains("a"));
        assert!(!store.contains("b"));
        assert!(store.contains("c"));
        assert!(store.contains("d"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn future_dated_callbacks_stay_protected_until_they_expire() {
        let mut store = IdempotencyStore::new(Duration::hours(24), Duration::minutes(5), 1);
        // Stamped 299s ahead, so a replay is accepted until t(599).
        store.insert("ahead", t(0), Some(t(299)));
        store.insert("later", t(400), Some(t(400)));
        assert!(store.contains("ahead"));

        store.evict(t(599));
        assert!(store.contains("ahead"));
        store.evict(t(600));
        assert!(!store.contains("ahead"));
    }

    #[test]
    fn unknown_timestamps_are_kept_for_twice_the_window() {
        let mut store = IdempotencyStore::new(Duration::hours(24), Duration::minutes(5), 1);
        store.insert("blind", t(0), None);
        store.insert("next", t(1), None);
        store.evict(t(600));
        assert!(store.contains("blind"));
        store.evict(t(601));
        assert!(!store.contains("blind"));
    }

    #[test]
    fn horizon_never_cuts_into_protection() {
        let mut store = IdempotencyStore::new(Duration::seconds(60), Duration::minutes(5), 10);
        store.insert("pay-1", t(0), Some(t(0)));
        assert_eq!(store.evict(t(120)), 0);
        assert_eq!(store.evict(t(301)), 1);
    }

    #[test]
    fn seeding_skips_records_older_than_the_horizon() {
        let mut store = IdempotencyStore::new(Duration::hours(1), Duration::minutes(5), 100);
        let records = vec![record("ancient", t(0)), record("recent", t(7_000))];
        let seeded = store.seed_from(&records, t(7_200));
        assert_eq!(seeded, 1);
        assert!(store.contains("recent"));
        assert!(!store.contains("ancient"));
    }
}
