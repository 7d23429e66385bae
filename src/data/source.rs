//! Upstream data source boundary

use async_trait::async_trait;
use chrono::NaiveDate;
use thiserror::Error;

use super::RegionSummary;
use crate::cache::CacheKey;

/// Errors an upstream fetch can end with
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The feed has no data for the requested key yet
    #[error("No data published yet")]
    NotYetPublished,

    /// Network, timeout, or parse failure worth retrying later
    #[error("Transient upstream failure: {0}")]
    Transient(String),
}

/// Result of a successful upstream fetch
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamBatch {
    /// Calendar date the regions describe
    pub data_date: NaiveDate,
    /// Region summaries, already aggregated and ordered
    pub regions: Vec<RegionSummary>,
    /// Other days parsed from the same download, oldest first
    pub other_days: Vec<(NaiveDate, Vec<RegionSummary>)>,
}

impl UpstreamBatch {
    /// A batch covering a single day
    pub fn single_day(data_date: NaiveDate, regions: Vec<RegionSummary>) -> Self {
        Self {
            data_date,
            regions,
            other_days: Vec::new(),
        }
    }
}

/// Fetches and parses regional data for one cache key
#[async_trait]
pub trait UpstreamSource: Send + Sync {
    /// Fetches the regions for `key`
    async fn fetch(&self, key: CacheKey) -> Result<UpstreamBatch, FetchError>;
}
