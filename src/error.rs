//! Outcomes the request layer can receive instead of data

use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

use crate::cache::CacheKey;

/// Why a query produced no data
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
    /// Upstream has not published this key yet
    #[error("No data published for {key} yet")]
    NotYetAvailable {
        key: CacheKey,
        /// Earliest time upstream will be asked again, for dated keys
        retry_at: Option<DateTime<Utc>>,
    },

    /// Network or parse failure with nothing cached to fall back on
    #[error("Upstream temporarily unavailable: {0}")]
    TransientUpstream(String),

    /// Date outside the supported historical span
    #[error("{date} is before the first published day ({start})")]
    OutOfRange { date: NaiveDate, start: NaiveDate },
}

impl QueryError {
    /// Whether retrying the same query soon may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::TransientUpstream(_))
    }
}
