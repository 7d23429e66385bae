//! Province-level feed client for the national civil protection dataset
//!
//! Fetches the "latest" and "full history" JSON files, parses them record by
//! record and aggregates the rows for the requested day into region summaries.

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{summarize_regions, FetchError, ProvinceRecord, UpstreamBatch, UpstreamSource};
use crate::cache::CacheKey;
use crate::config::UpstreamConfig;

/// Province names the feed uses for rows that are not real provinces
const PLACEHOLDER_MARKERS: [&str; 2] = ["fase di definizione", "aggiornamento"];

/// A single row as published upstream
///
/// Every field is optional so that one malformed row never fails the batch.
#[derive(Debug, Deserialize)]
struct RawProvinceRecord {
    data: Option<String>,
    stato: Option<String>,
    codice_regione: Option<i64>,
    denominazione_regione: Option<String>,
    codice_provincia: Option<i64>,
    denominazione_provincia: Option<String>,
    sigla_provincia: Option<String>,
    lat: Option<f64>,
    long: Option<f64>,
    totale_casi: Option<i64>,
    note: Option<String>,
}

/// HTTP client for the province-level JSON feed
#[derive(Debug, Clone)]
pub struct DpcClient {
    /// HTTP client for making requests
    http_client: Client,
    /// URL of the file holding only the most recent day
    latest_url: String,
    /// URL of the file holding every published day
    history_url: String,
}

impl DpcClient {
    /// Creates a client with the configured URLs and request timeout
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let http_client = Client::builder()
            .user_agent(concat!("regiocache/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;

        Ok(Self::with_client(
            http_client,
            config.latest_url.clone(),
            config.history_url.clone(),
        ))
    }

    /// Creates a client around an existing HTTP client
    pub fn with_client(http_client: Client, latest_url: String, history_url: String) -> Self {
        Self {
            http_client,
            latest_url,
            history_url,
        }
    }

    /// Downloads and parses one feed file
    async fn download(&self, url: &str) -> Result<Vec<ProvinceRecord>, FetchError> {
        info!(url, "Fetching province feed");

        let response = self
            .http_client
            .get(url)
            .send()
            .await
            .map_err(|e| FetchError::Transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(FetchError::NotYetPublished);
        }
        if !status.is_success() {
            return Err(FetchError::Transient(format!(
                "Upstream returned status {}",
                status
            )));
        }

        let raw: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| FetchError::Transient(format!("Failed to parse feed: {}", e)))?;

        debug!(rows = raw.len(), "Downloaded province rows");
        Ok(parse_feed(raw))
    }
}

#[async_trait]
impl UpstreamSource for DpcClient {
    async fn fetch(&self, key: CacheKey) -> Result<UpstreamBatch, FetchError> {
        match key {
            CacheKey::Latest => {
                let records = self.download(&self.latest_url).await?;
                latest_batch(&records)
            }
            CacheKey::Date(date) => {
                let records = self.download(&self.history_url).await?;
                batch_for_date(&records, date)
            }
        }
    }
}

/// Parses every usable row, skipping the rest
fn parse_feed(raw: Vec<serde_json::Value>) -> Vec<ProvinceRecord> {
    let total = raw.len();
    let records: Vec<ProvinceRecord> = raw.into_iter().filter_map(parse_record).collect();

    if records.len() < total {
        debug!(skipped = total - records.len(), "Skipped unusable province rows");
    }
    records
}

/// Converts a raw row into a `ProvinceRecord`
fn parse_record(value: serde_json::Value) -> Option<ProvinceRecord> {
    let raw: RawProvinceRecord = match serde_json::from_value(value) {
        Ok(raw) => raw,
        Err(e) => {
            debug!(error = %e, "Skipping malformed row");
            return None;
        }
    };

    let timestamp = raw.data.as_deref().and_then(parse_timestamp)?;
    let province_name = raw.denominazione_provincia?.trim().to_string();
    let lowered = province_name.to_lowercase();
    if province_name.is_empty() || PLACEHOLDER_MARKERS.iter().any(|m| lowered.contains(m)) {
        return None;
    }

    Some(ProvinceRecord {
        timestamp,
        country: raw.stato?,
        region_code: raw.codice_regione?,
        region_name: raw.denominazione_regione?.trim().to_string(),
        province_code: raw.codice_provincia?,
        province_name,
        province_abbreviation: raw.sigla_provincia.unwrap_or_default().trim().to_string(),
        latitude: raw.lat.unwrap_or(0.0),
        longitude: raw.long.unwrap_or(0.0),
        total_cases: raw.totale_casi?.max(0) as u64,
        note: raw.note.unwrap_or_default().trim().to_string(),
    })
}

/// Parses the feed's timestamp format, with or without a trailing `Z`
fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    let trimmed = value.trim().trim_end_matches('Z');
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S"))
        .ok()
}

/// Builds the batch for the most recent day present in `records`
fn latest_batch(records: &[ProvinceRecord]) -> Result<UpstreamBatch, FetchError> {
    let newest = records
        .iter()
        .map(|r| r.timestamp)
        .max()
        .ok_or(FetchError::NotYetPublished)?;

    batch_for_date(records, newest.date())
}

/// Builds the batch for `date`, or reports it as not yet published
///
/// Every other day present in `records` is summarized into `other_days` so a
/// single history download can fill the cache for all of them.
fn batch_for_date(records: &[ProvinceRecord], date: NaiveDate) -> Result<UpstreamBatch, FetchError> {
    let mut days: BTreeMap<NaiveDate, Vec<ProvinceRecord>> = BTreeMap::new();
    for record in records {
        days.entry(record.timestamp.date()).or_default().push(record.clone());
    }

    let Some(requested) = days.remove(&date) else {
        warn!(%date, "Feed has no rows for date");
        return Err(FetchError::NotYetPublished);
    };

    Ok(UpstreamBatch {
        data_date: date,
        regions: summarize_regions(&requested),
        other_days: days
            .into_iter()
            .map(|(day, rows)| (day, summarize_regions(&rows)))
            .collect(),
    })
}
