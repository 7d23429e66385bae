//! Concurrent in-memory store for published entries and missing dates
//!
//! The store holds no fetch logic. Entries are published as whole `Arc`s under
//! a write lock held only for the swap, so readers always see either the old
//! entry or the new one.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::entry::{CacheEntry, CacheKey, MissingDateRecord};

#[derive(Debug, Default)]
struct StoreState {
    /// Historical entries by date
    entries: HashMap<NaiveDate, Arc<CacheEntry>>,
    /// Pointer to the current latest entry
    latest: Option<Arc<CacheEntry>>,
    /// Dates known to have no data; disjoint from `entries`
    missing: HashMap<NaiveDate, MissingDateRecord>,
}

/// Holds per-date entries, the latest entry, and the missing-date set
#[derive(Debug, Default)]
pub struct CacheStore {
    state: RwLock<StoreState>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the published entry for `key`
    pub fn get(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let state = self.state.read();
        match key {
            CacheKey::Latest => state.latest.clone(),
            CacheKey::Date(date) => state.entries.get(date).cloned(),
        }
    }

    /// Publishes `entry` under its key, replacing any previous entry
    ///
    /// Publishing a dated entry clears that date's missing record.
    pub fn put(&self, entry: CacheEntry) -> Arc<CacheEntry> {
        let entry = Arc::new(entry);
        let mut state = self.state.write();
        match entry.key {
            CacheKey::Latest => {
                state.latest = Some(Arc::clone(&entry));
            }
            CacheKey::Date(date) => {
                state.missing.remove(&date);
                state.entries.insert(date, Arc::clone(&entry));
            }
        }
        entry
    }

    /// Publishes a dated entry learned as a by-product of another fetch
    ///
    /// An existing entry fetched at or after `fetch_started` is newer than the
    /// seed and is kept. Returns whether the seed was stored.
    pub fn seed(&self, entry: CacheEntry, fetch_started: DateTime<Utc>) -> bool {
        let CacheKey::Date(date) = entry.key else {
            return false;
        };

        let mut state = self.state.write();
        if state
            .entries
            .get(&date)
            .is_some_and(|existing| existing.fetched_at >= fetch_started)
        {
            return false;
        }
        state.missing.remove(&date);
        state.entries.insert(date, Arc::new(entry));
        true
    }

    /// Records `date` as missing until `now + backoff`
    ///
    /// A renewed record keeps its first check time and counts the attempt.
    /// Returns `None` without recording anything if the date has an entry.
    pub fn mark_missing(
        &self,
        date: NaiveDate,
        now: DateTime<Utc>,
        backoff: Duration,
    ) -> Option<MissingDateRecord> {
        let mut state = self.state.write();
        if state.entries.contains_key(&date) {
            return None;
        }

        let record = match state.missing.get(&date) {
            Some(previous) => MissingDateRecord {
                date,
                first_checked_at: previous.first_checked_at,
                next_recheck_at: now + backoff,
                backoff,
                attempts: previous.attempts.saturating_add(1),
            },
            None => MissingDateRecord {
                date,
                first_checked_at: now,
                next_recheck_at: now + backoff,
                backoff,
                attempts: 1,
            },
        };
        state.missing.insert(date, record);
        debug!(%date, next_recheck_at = %record.next_recheck_at, "Marked date missing");
        Some(record)
    }

    /// Whether `date` is missing with a backoff that has not yet expired
    pub fn is_missing(&self, date: NaiveDate, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .missing
            .get(&date)
            .is_some_and(|record| record.is_active(now))
    }

    /// Returns the missing record for `date`, expired or not
    pub fn missing_record(&self, date: NaiveDate) -> Option<MissingDateRecord> {
        self.state.read().missing.get(&date).copied()
    }

    /// Drops the entry and any missing record for `key`
    ///
    /// Returns whether anything was removed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        let mut state = self.state.write();
        match key {
            CacheKey::Latest => state.latest.take().is_some(),
            CacheKey::Date(date) => {
                let had_entry = state.entries.remove(date).is_some();
                let had_missing = state.missing.remove(date).is_some();
                had_entry || had_missing
            }
        }
    }

    /// Keys with a published entry, latest first, then dates newest first
    pub fn snapshot_keys(&self) -> Vec<CacheKey> {
        let state = self.state.read();
        let mut dates: Vec<NaiveDate> = state.entries.keys().copied().collect();
        dates.sort_unstable_by(|a, b| b.cmp(a));

        state
            .latest
            .iter()
            .map(|_| CacheKey::Latest)
            .chain(dates.into_iter().map(CacheKey::Date))
            .collect()
    }

    /// All published entries
    pub fn entries(&self) -> Vec<Arc<CacheEntry>> {
        let state = self.state.read();
        state
            .latest
            .iter()
            .chain(state.entries.values())
            .cloned()
            .collect()
    }

    /// Number of records in the missing set
    pub fn missing_count(&self) -> usize {
        self.state.read().missing.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::RegionSummary;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2020, 4, 1, 9, 0, 0).unwrap()
    }

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 3, day).unwrap()
    }

    fn entry(key: CacheKey, cases: u64) -> CacheEntry {
        let data_date = key.date().unwrap_or_else(|| date(31));
        let region = RegionSummary {
            region_name: "Lombardia".to_string(),
            total_cases: cases,
            province_count: 12,
            last_updated: data_date.and_hms_opt(17, 0, 0).unwrap(),
        };
        CacheEntry::new(key, Arc::new(vec![region]), data_date, now())
    }

    #[test]
    fn test_get_returns_none_for_unseen_key() {
        let store = CacheStore::new();
        assert!(store.get(&CacheKey::Latest).is_none());
        assert!(store.get(&CacheKey::Date(date(1))).is_none());
    }

    #[test]
    fn test_put_then_get() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(1)), 100));

        let found = store.get(&CacheKey::Date(date(1))).unwrap();
        assert_eq!(found.payload[0].total_cases, 100);
        assert!(store.get(&CacheKey::Latest).is_none());
    }

    #[test]
    fn test_put_replaces_whole_entry() {
        let store = CacheStore::new();
        let first = store.put(entry(CacheKey::Latest, 100));
        store.put(entry(CacheKey::Latest, 150));

        let current = store.get(&CacheKey::Latest).unwrap();
        assert_eq!(current.payload[0].total_cases, 150);
        // Readers holding the old entry keep seeing it unchanged
        assert_eq!(first.payload[0].total_cases, 100);
    }

    #[test]
    fn test_mark_missing_and_expiry() {
        let store = CacheStore::new();
        let record = store
            .mark_missing(date(5), now(), Duration::minutes(5))
            .unwrap();

        assert_eq!(record.attempts, 1);
        assert!(store.is_missing(date(5), now() + Duration::minutes(4)));
        assert!(!store.is_missing(date(5), now() + Duration::minutes(5)));
        assert!(store.missing_record(date(5)).is_some());
    }

    #[test]
    fn test_renewed_missing_keeps_first_check() {
        let store = CacheStore::new();
        store.mark_missing(date(5), now(), Duration::minutes(5));

        let later = now() + Duration::minutes(6);
        let renewed = store
            .mark_missing(date(5), later, Duration::minutes(10))
            .unwrap();

        assert_eq!(renewed.first_checked_at, now());
        assert_eq!(renewed.next_recheck_at, later + Duration::minutes(10));
        assert_eq!(renewed.attempts, 2);
    }

    #[test]
    fn test_put_clears_missing_record() {
        let store = CacheStore::new();
        store.mark_missing(date(5), now(), Duration::minutes(5));

        store.put(entry(CacheKey::Date(date(5)), 7));

        assert!(store.missing_record(date(5)).is_none());
        assert_eq!(store.missing_count(), 0);
    }

    #[test]
    fn test_seed_fills_absent_date_and_clears_missing() {
        let store = CacheStore::new();
        store.mark_missing(date(6), now(), Duration::minutes(5));

        assert!(store.seed(entry(CacheKey::Date(date(6)), 9), now()));

        assert_eq!(store.get(&CacheKey::Date(date(6))).unwrap().payload[0].total_cases, 9);
        assert!(store.missing_record(date(6)).is_none());
    }

    #[test]
    fn test_seed_keeps_entry_published_after_fetch_started() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(6)), 1));

        let started_earlier = now() - Duration::minutes(1);
        assert!(!store.seed(entry(CacheKey::Date(date(6)), 2), started_earlier));
        assert_eq!(store.get(&CacheKey::Date(date(6))).unwrap().payload[0].total_cases, 1);
    }

    #[test]
    fn test_seed_replaces_older_entry() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(6)), 1));

        let started_later = now() + Duration::minutes(1);
        assert!(store.seed(entry(CacheKey::Date(date(6)), 2), started_later));
        assert_eq!(store.get(&CacheKey::Date(date(6))).unwrap().payload[0].total_cases, 2);
    }

    #[test]
    fn test_seed_ignores_latest_key() {
        let store = CacheStore::new();
        assert!(!store.seed(entry(CacheKey::Latest, 1), now()));
        assert!(store.get(&CacheKey::Latest).is_none());
    }

    #[test]
    fn test_mark_missing_refused_when_entry_present() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(5)), 7));

        assert!(store.mark_missing(date(5), now(), Duration::minutes(5)).is_none());
        assert!(!store.is_missing(date(5), now()));
    }

    #[test]
    fn test_invalidate_removes_entry_and_missing() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(1)), 1));
        store.put(entry(CacheKey::Latest, 2));
        store.mark_missing(date(2), now(), Duration::minutes(5));

        assert!(store.invalidate(&CacheKey::Date(date(1))));
        assert!(store.invalidate(&CacheKey::Date(date(2))));
        assert!(store.invalidate(&CacheKey::Latest));
        assert!(!store.invalidate(&CacheKey::Latest));

        assert!(store.entries().is_empty());
        assert_eq!(store.missing_count(), 0);
    }

    #[test]
    fn test_snapshot_keys_order() {
        let store = CacheStore::new();
        store.put(entry(CacheKey::Date(date(1)), 1));
        store.put(entry(CacheKey::Date(date(3)), 3));
        store.put(entry(CacheKey::Latest, 4));

        assert_eq!(
            store.snapshot_keys(),
            vec![
                CacheKey::Latest,
                CacheKey::Date(date(3)),
                CacheKey::Date(date(1))
            ]
        );
    }

    #[test]
    fn test_concurrent_readers_see_complete_entries() {
        let store = Arc::new(CacheStore::new());
        store.put(entry(CacheKey::Latest, 0));

        let writer = {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for cases in 1..500 {
                    store.put(entry(CacheKey::Latest, cases));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                std::thread::spawn(move || {
                    for _ in 0..500 {
                        let current = store.get(&CacheKey::Latest).unwrap();
                        assert_eq!(current.payload.len(), 1);
                        assert_eq!(current.payload[0].province_count, 12);
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
        assert_eq!(store.get(&CacheKey::Latest).unwrap().payload[0].total_cases, 499);
    }
}
