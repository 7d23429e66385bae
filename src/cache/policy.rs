//! Freshness and backoff rules
//!
//! `FreshnessPolicy` is a pure function of an entry and the current time:
//! - `Latest` entries are fresh for a short TTL, then stale.
//! - `Historical` entries are fresh for a long TTL, then stale, until their
//!   date falls outside the grace window; from then on they are frozen and
//!   never re-fetched.
//!
//! `MissingBackoff` computes how long a not-yet-published date is left alone
//! before the upstream is asked again.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use super::entry::{CacheEntry, EntryClass};
use crate::config::{bounded_duration, CacheConfig};

/// Derived state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    /// Serve without contacting upstream
    Fresh,
    /// Serve only after (or while) re-validating
    Stale,
    /// Settled historical data, never re-fetched
    Frozen,
}

/// Maps entry age and class to a `Freshness`
#[derive(Debug, Clone, Copy)]
pub struct FreshnessPolicy {
    latest_ttl: Duration,
    historical_ttl: Duration,
    freeze_after_days: i64,
}

impl Default for FreshnessPolicy {
    fn default() -> Self {
        Self::new(Duration::minutes(60), Duration::hours(24), 7)
    }
}

impl FreshnessPolicy {
    pub fn new(latest_ttl: Duration, historical_ttl: Duration, freeze_after_days: i64) -> Self {
        Self {
            latest_ttl,
            historical_ttl,
            freeze_after_days,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            bounded_duration(config.latest_ttl_minutes, 60),
            bounded_duration(config.historical_ttl_hours, 3_600),
            config.freeze_after_days,
        )
    }

    /// Classifies `entry` at `now`
    pub fn evaluate(&self, entry: &CacheEntry, now: DateTime<Utc>) -> Freshness {
        let age = now - entry.fetched_at;

        match entry.class {
            EntryClass::Latest => {
                if age < self.latest_ttl {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                }
            }
            EntryClass::Historical => {
                if (now.date_naive() - entry.data_date).num_days() > self.freeze_after_days {
                    Freshness::Frozen
                } else if age < self.historical_ttl {
                    Freshness::Fresh
                } else {
                    Freshness::Stale
                }
            }
        }
    }
}

/// Bounded exponential backoff for missing dates
#[derive(Debug, Clone, Copy)]
pub struct MissingBackoff {
    initial: Duration,
    max: Duration,
}

impl Default for MissingBackoff {
    fn default() -> Self {
        Self::new(Duration::minutes(5), Duration::hours(24))
    }
}

impl MissingBackoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(
            bounded_duration(config.missing_backoff_initial_secs, 1),
            bounded_duration(config.missing_backoff_max_secs, 1),
        )
    }

    /// Backoff to apply after a not-found answer
    ///
    /// `previous` is the backoff of the record being renewed, if any.
    pub fn next(&self, previous: Option<Duration>) -> Duration {
        match previous {
            None => self.initial,
            Some(previous) => previous
                .checked_add(&previous)
                .map_or(self.max, |doubled| doubled.min(self.max)),
        }
    }
}
