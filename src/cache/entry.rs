//! Cache keys, entries and missing-date records

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

use crate::data::RegionSummary;

/// Slot a cache entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheKey {
    /// The most recent day the feed has published
    Latest,
    /// One specific calendar date
    Date(NaiveDate),
}

impl CacheKey {
    /// Refresh class implied by the key
    pub fn class(&self) -> EntryClass {
        match self {
            CacheKey::Latest => EntryClass::Latest,
            CacheKey::Date(_) => EntryClass::Historical,
        }
    }

    /// The calendar date, for dated keys
    pub fn date(&self) -> Option<NaiveDate> {
        match self {
            CacheKey::Latest => None,
            CacheKey::Date(date) => Some(*date),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Latest => write!(f, "latest"),
            CacheKey::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
        }
    }
}

/// Refresh class of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryClass {
    /// Short TTL, refreshed in the background
    Latest,
    /// Long TTL, eventually frozen
    Historical,
}

/// An immutable published cache entry
///
/// Entries are never mutated after publication; a refresh builds a new entry
/// and swaps it in.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub class: EntryClass,
    /// Region summaries, shared between readers without copying
    pub payload: Arc<Vec<RegionSummary>>,
    /// Calendar date the payload describes
    pub data_date: NaiveDate,
    /// When the payload was fetched from upstream
    pub fetched_at: DateTime<Utc>,
}

impl CacheEntry {
    /// Builds an entry, deriving its class from the key
    pub fn new(
        key: CacheKey,
        payload: Arc<Vec<RegionSummary>>,
        data_date: NaiveDate,
        fetched_at: DateTime<Utc>,
    ) -> Self {
        Self {
            key,
            class: key.class(),
            payload,
            data_date,
            fetched_at,
        }
    }
}

/// A date the upstream has confirmed it does not have yet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MissingDateRecord {
    pub date: NaiveDate,
    /// First time the date was found missing
    pub first_checked_at: DateTime<Utc>,
    /// No upstream call for this date before this instant
    pub next_recheck_at: DateTime<Utc>,
    /// Backoff that produced `next_recheck_at`
    #[serde(skip)]
    pub backoff: Duration,
    /// Number of not-found answers so far
    pub attempts: u32,
}

impl MissingDateRecord {
    /// Whether the backoff still holds at `now`
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        now < self.next_recheck_at
    }
}
