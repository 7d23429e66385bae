//! Core data models for regional case data
//!
//! This module contains the province-level records parsed from the upstream
//! feed and the per-region summaries the cache holds and serves.

pub mod dpc;
pub mod source;

pub use dpc::DpcClient;
pub use source::{FetchError, UpstreamBatch, UpstreamSource};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// One province row from the upstream feed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvinceRecord {
    /// Timestamp the row was published for
    pub timestamp: NaiveDateTime,
    /// Country code (always "ITA" upstream)
    pub country: String,
    /// Numeric region code
    pub region_code: i64,
    /// Region name
    pub region_name: String,
    /// Numeric province code
    pub province_code: i64,
    /// Province name
    pub province_name: String,
    /// Two-letter province abbreviation
    pub province_abbreviation: String,
    /// Latitude of the province seat
    pub latitude: f64,
    /// Longitude of the province seat
    pub longitude: f64,
    /// Cumulative case count, never negative
    pub total_cases: u64,
    /// Free-form upstream note
    pub note: String,
}

/// Aggregated case totals for one region on one day
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionSummary {
    /// Region name
    pub region_name: String,
    /// Sum of province case totals
    pub total_cases: u64,
    /// Number of provinces contributing to the total
    pub province_count: u32,
    /// Timestamp of the underlying data
    pub last_updated: NaiveDateTime,
}

/// Aggregates province records into region summaries
///
/// Rows sharing (timestamp, region code, province code) are counted once.
/// The result is ordered by total cases descending, then region name ascending.
pub fn summarize_regions(records: &[ProvinceRecord]) -> Vec<RegionSummary> {
    let mut seen = HashSet::new();
    let mut regions: HashMap<&str, RegionSummary> = HashMap::new();

    for record in records {
        if !seen.insert((record.timestamp, record.region_code, record.province_code)) {
            continue;
        }

        let summary = regions
            .entry(record.region_name.as_str())
            .or_insert_with(|| RegionSummary {
                region_name: record.region_name.clone(),
                total_cases: 0,
                province_count: 0,
                last_updated: record.timestamp,
            });
        summary.total_cases += record.total_cases;
        summary.province_count += 1;
        summary.last_updated = summary.last_updated.max(record.timestamp);
    }

    let mut summaries: Vec<RegionSummary> = regions.into_values().collect();
    summaries.sort_by(|a, b| {
        b.total_cases
            .cmp(&a.total_cases)
            .then_with(|| a.region_name.cmp(&b.region_name))
    });
    summaries
}

/// Finds a region by name, ignoring case
pub fn find_region<'a>(summaries: &'a [RegionSummary], name: &str) -> Option<&'a RegionSummary> {
    summaries
        .iter()
        .find(|summary| summary.region_name.eq_ignore_ascii_case(name.trim()))
}

/// Region name paired with its case total
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RegionCases {
    pub name: String,
    pub cases: u64,
}

/// Country-wide statistics derived from a set of region summaries
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionStatistics {
    pub total_cases: u64,
    pub total_regions: usize,
    /// Rounded to two decimals
    pub average_cases_per_region: f64,
    pub max_cases_region: RegionCases,
    pub min_cases_region: RegionCases,
}

impl RegionStatistics {
    /// Computes statistics, or `None` when there are no regions
    pub fn from_summaries(summaries: &[RegionSummary]) -> Option<Self> {
        let max = summaries.iter().max_by_key(|s| s.total_cases)?;
        let min = summaries.iter().min_by_key(|s| s.total_cases)?;

        let total_cases: u64 = summaries.iter().map(|s| s.total_cases).sum();
        let total_regions = summaries.len();
        let average = total_cases as f64 / total_regions as f64;

        Some(Self {
            total_cases,
            total_regions,
            average_cases_per_region: (average * 100.0).round() / 100.0,
            max_cases_region: RegionCases {
                name: max.region_name.clone(),
                cases: max.total_cases,
            },
            min_cases_region: RegionCases {
                name: min.region_name.clone(),
                cases: min.total_cases,
            },
        })
    }
}
