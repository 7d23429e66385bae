//! Cache module for regional data
//!
//! This module provides the in-memory store of published entries and
//! missing dates, together with the pure freshness and backoff rules that
//! decide when an entry may be served and when upstream must be asked again.

mod entry;
mod policy;
mod store;

pub use entry::{CacheEntry, CacheKey, EntryClass, MissingDateRecord};
pub use policy::{Freshness, FreshnessPolicy, MissingBackoff};
pub use store::CacheStore;
