//! Command-line interface parsing for regiocache
//!
//! This module handles parsing of CLI arguments using clap, including the
//! date argument accepted by `query` and by the interactive `watch` session.

use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use thiserror::Error;

use crate::cache::CacheKey;

/// Date formats accepted on input, tried in order
const DATE_FORMATS: [&str; 5] = ["%Y-%m-%d", "%d/%m/%Y", "%d-%m-%Y", "%Y/%m/%d", "%d.%m.%Y"];

/// Error types for CLI argument parsing
#[derive(Debug, Error)]
pub enum CliError {
    /// The date string matches none of the accepted formats
    #[error("Invalid date: '{0}'. Expected 'latest' or a date like YYYY-MM-DD")]
    InvalidDate(String),
}

/// regiocache - Regional case totals with a freshness-aware cache
#[derive(Parser, Debug)]
#[command(name = "regiocache")]
#[command(about = "Regional case totals served through a freshness-aware cache")]
#[command(version)]
pub struct Cli {
    /// Path to a config.toml (defaults to the XDG config directory)
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print regional totals for one day
    ///
    /// Examples:
    ///   regiocache query                 # latest day
    ///   regiocache query 2020-03-15
    ///   regiocache query 15/03/2020 --limit 5
    Query {
        /// Day to show, or "latest"
        #[arg(default_value = "latest", value_parser = parse_date_arg)]
        date: CacheKey,

        /// Show only the first N regions
        #[arg(long, value_name = "N")]
        limit: Option<usize>,

        /// Show a single region (case-insensitive)
        #[arg(long, value_name = "NAME")]
        region: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Keep the cache warm and answer queries read from stdin
    ///
    /// Commands: latest | <date> | status | invalidate <date> | quit
    Watch,
}

/// Parses a date argument into a cache key.
///
/// # Arguments
/// * `s` - "latest", an empty string, or a date in one of the accepted formats
///
/// # Returns
/// * `Ok(CacheKey)` for a recognised value
/// * `Err(CliError::InvalidDate)` otherwise
pub fn parse_date_arg(s: &str) -> Result<CacheKey, CliError> {
    let trimmed = s.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("latest") {
        return Ok(CacheKey::Latest);
    }

    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(trimmed, format).ok())
        .map(CacheKey::Date)
        .ok_or_else(|| CliError::InvalidDate(s.to_string()))
}
