//! Configuration loader: defaults, optional config.toml, environment overrides.

use chrono::{Duration as ChronoDuration, NaiveDate};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::refresh::RefreshConfig;

const DEFAULT_LATEST_URL: &str = "https://raw.githubusercontent.com/pcm-dpc/COVID-19/master/dati-json/dpc-covid19-ita-province-latest.json";
const DEFAULT_HISTORY_URL: &str =
    "https://raw.githubusercontent.com/pcm-dpc/COVID-19/master/dati-json/dpc-covid19-ita-province.json";

/// Latest TTL used by the development profile
const DEVELOPMENT_LATEST_TTL_MINUTES: i64 = 5;

/// Longest span any duration setting may express (ten years)
const MAX_SETTING_SECS: i64 = 10 * 365 * 86_400;

/// Errors raised while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid config:\n - {0}")]
    Invalid(String),
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub refresh: RefreshSettings,
}

/// Upstream feed location and fetch limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Feed holding only the most recent day
    #[serde(default = "default_latest_url")]
    pub latest_url: String,
    /// Feed holding every published day
    #[serde(default = "default_history_url")]
    pub history_url: String,
    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Cap on simultaneous upstream fetches across all keys
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_fetches: usize,
}

/// Freshness and backoff tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_latest_ttl")]
    pub latest_ttl_minutes: i64,
    #[serde(default = "default_historical_ttl")]
    pub historical_ttl_hours: i64,
    /// Days after which a historical date is frozen
    #[serde(default = "default_freeze_after")]
    pub freeze_after_days: i64,
    #[serde(default = "default_backoff_initial")]
    pub missing_backoff_initial_secs: i64,
    #[serde(default = "default_backoff_max")]
    pub missing_backoff_max_secs: i64,
    /// First day the feed has data for (quoted `"YYYY-MM-DD"` in TOML)
    #[serde(default = "default_historical_start")]
    pub historical_start: NaiveDate,
}

/// Background scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_refresh_interval")]
    pub interval_secs: u64,
    /// Background refresh pauses when nobody was seen for this long
    #[serde(default = "default_inactivity_window")]
    pub inactivity_window_secs: i64,
}

fn default_latest_url() -> String {
    DEFAULT_LATEST_URL.to_string()
}
fn default_history_url() -> String {
    DEFAULT_HISTORY_URL.to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_max_concurrent() -> usize {
    4
}
fn default_latest_ttl() -> i64 {
    60
}
fn default_historical_ttl() -> i64 {
    24
}
fn default_freeze_after() -> i64 {
    7
}
fn default_backoff_initial() -> i64 {
    300
}
fn default_backoff_max() -> i64 {
    86_400
}
fn default_historical_start() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 2, 24).unwrap_or_default()
}
fn default_true() -> bool {
    true
}
fn default_refresh_interval() -> u64 {
    300
}
fn default_inactivity_window() -> i64 {
    1_800
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            latest_url: default_latest_url(),
            history_url: default_history_url(),
            request_timeout_secs: default_request_timeout(),
            max_concurrent_fetches: default_max_concurrent(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            latest_ttl_minutes: default_latest_ttl(),
            historical_ttl_hours: default_historical_ttl(),
            freeze_after_days: default_freeze_after(),
            missing_backoff_initial_secs: default_backoff_initial(),
            missing_backoff_max_secs: default_backoff_max(),
            historical_start: default_historical_start(),
        }
    }
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            interval_secs: default_refresh_interval(),
            inactivity_window_secs: default_inactivity_window(),
        }
    }
}

/// Converts `value` units of `unit_secs` seconds into a duration, clamped to
/// the range `validate` accepts
pub fn bounded_duration(value: i64, unit_secs: i64) -> ChronoDuration {
    ChronoDuration::seconds(value.saturating_mul(unit_secs).clamp(0, MAX_SETTING_SECS))
}

fn within_limit(value: i64, unit_secs: i64) -> bool {
    value
        .checked_mul(unit_secs)
        .is_some_and(|secs| secs <= MAX_SETTING_SECS)
}

impl UpstreamConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Config {
    /// Scheduler settings in the form the refresh loop takes
    pub fn refresh_config(&self) -> RefreshConfig {
        RefreshConfig {
            latest_interval: Duration::from_secs(self.refresh.interval_secs),
            enabled: self.refresh.enabled,
        }
    }

    /// Checks every field and reports all problems at once
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut issues: Vec<String> = Vec::new();

        if self.upstream.latest_url.trim().is_empty() {
            issues.push("upstream.latest_url must not be empty".into());
        }
        if self.upstream.history_url.trim().is_empty() {
            issues.push("upstream.history_url must not be empty".into());
        }
        if self.upstream.request_timeout_secs == 0 {
            issues.push("upstream.request_timeout_secs must be > 0".into());
        }
        if self.upstream.max_concurrent_fetches == 0 {
            issues.push("upstream.max_concurrent_fetches must be > 0".into());
        }

        if self.cache.latest_ttl_minutes <= 0 {
            issues.push("cache.latest_ttl_minutes must be > 0".into());
        }
        if self.cache.historical_ttl_hours <= 0 {
            issues.push("cache.historical_ttl_hours must be > 0".into());
        }
        if self.cache.freeze_after_days < 0 {
            issues.push("cache.freeze_after_days must be >= 0".into());
        }
        if self.cache.missing_backoff_initial_secs <= 0 {
            issues.push("cache.missing_backoff_initial_secs must be > 0".into());
        }
        if self.cache.missing_backoff_max_secs < self.cache.missing_backoff_initial_secs {
            issues.push(
                "cache.missing_backoff_max_secs must be >= cache.missing_backoff_initial_secs"
                    .into(),
            );
        }

        let durations = [
            ("cache.latest_ttl_minutes", self.cache.latest_ttl_minutes, 60),
            ("cache.historical_ttl_hours", self.cache.historical_ttl_hours, 3_600),
            ("cache.freeze_after_days", self.cache.freeze_after_days, 86_400),
            ("cache.missing_backoff_initial_secs", self.cache.missing_backoff_initial_secs, 1),
            ("cache.missing_backoff_max_secs", self.cache.missing_backoff_max_secs, 1),
            ("refresh.inactivity_window_secs", self.refresh.inactivity_window_secs, 1),
        ];
        for (name, value, unit_secs) in durations {
            if !within_limit(value, unit_secs) {
                issues.push(format!("{name} must not exceed ten years"));
            }
        }

        if self.refresh.interval_secs == 0 {
            issues.push("refresh.interval_secs must be > 0".into());
        }
        if self.refresh.inactivity_window_secs <= 0 {
            issues.push("refresh.inactivity_window_secs must be > 0".into());
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(issues.join("\n - ")))
        }
    }
}

/// Default config file location (`~/.config/regiocache/config.toml` on Linux)
pub fn default_config_path() -> Option<PathBuf> {
    let project_dirs = ProjectDirs::from("", "", "regiocache")?;
    Some(project_dirs.config_dir().join("config.toml"))
}

/// Parses a config file
pub fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(toml::from_str(&contents)?)
}

fn parse_positive_i64(raw: &str, env_name: &str) -> Result<i64, ConfigError> {
    match raw.trim().parse::<i64>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(ConfigError::Invalid(format!(
            "{env_name} must be an integer > 0"
        ))),
    }
}

/// Applies environment overrides, given a variable lookup
fn apply_env<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let cache_minutes = lookup("DATA_CACHE_MINUTES");

    if let Some(profile) = lookup("REGIOCACHE_ENV") {
        match profile.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => {
                if cache_minutes.is_none() {
                    config.cache.latest_ttl_minutes = DEVELOPMENT_LATEST_TTL_MINUTES;
                }
            }
            "production" | "prod" => {}
            _ => {
                return Err(ConfigError::Invalid(
                    "REGIOCACHE_ENV must be one of: development, production".into(),
                ))
            }
        }
    }

    if let Some(raw) = cache_minutes {
        config.cache.latest_ttl_minutes = parse_positive_i64(&raw, "DATA_CACHE_MINUTES")?;
    }
    if let Some(raw) = lookup("REQUEST_TIMEOUT") {
        config.upstream.request_timeout_secs = parse_positive_i64(&raw, "REQUEST_TIMEOUT")? as u64;
    }

    Ok(())
}

/// Loads configuration from an explicit path, `$REGIOCACHE_CONFIG`, or the
/// default location, then applies environment overrides and validates.
pub fn load_config(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let path = explicit
        .map(Path::to_path_buf)
        .or_else(|| std::env::var_os("REGIOCACHE_CONFIG").map(PathBuf::from));

    let mut config = match path {
        Some(path) => load_file(&path)?,
        None => match default_config_path() {
            Some(path) if path.exists() => load_file(&path)?,
            _ => {
                tracing::debug!("No config file found, using defaults");
                Config::default()
            }
        },
    };

    apply_env(&mut config, |name| std::env::var(name).ok())?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::TempDir;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.latest_ttl_minutes, 60);
        assert_eq!(config.cache.historical_ttl_hours, 24);
        assert_eq!(config.cache.missing_backoff_initial_secs, 300);
        assert_eq!(
            config.cache.historical_start,
            NaiveDate::from_ymd_opt(2020, 2, 24).unwrap()
        );
    }

    #[test]
    fn test_load_partial_file_keeps_defaults() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[cache]\nlatest_ttl_minutes = 15\nhistorical_start = \"2020-03-01\"\n\n[refresh]\nenabled = false\n",
        )
        .unwrap();

        let config = load_file(&path).expect("Config should parse");

        assert_eq!(config.cache.latest_ttl_minutes, 15);
        assert_eq!(config.cache.historical_ttl_hours, 24);
        assert_eq!(
            config.cache.historical_start,
            NaiveDate::from_ymd_opt(2020, 3, 1).unwrap()
        );
        assert!(!config.refresh.enabled);
        assert_eq!(config.upstream.request_timeout_secs, 30);
    }

    #[test]
    fn test_load_missing_file_is_read_error() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let result = load_file(&dir.path().join("absent.toml"));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_load_malformed_file_is_parse_error() {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let path = dir.path().join("config.toml");
        fs::write(&path, "[cache\nlatest_ttl_minutes = ").unwrap();

        assert!(matches!(load_file(&path), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_validate_collects_all_issues() {
        let mut config = Config::default();
        config.cache.latest_ttl_minutes = 0;
        config.upstream.max_concurrent_fetches = 0;
        config.cache.missing_backoff_max_secs = 10;

        let message = config.validate().unwrap_err().to_string();

        assert!(message.contains("cache.latest_ttl_minutes"));
        assert!(message.contains("upstream.max_concurrent_fetches"));
        assert!(message.contains("cache.missing_backoff_max_secs"));
    }

    #[test]
    fn test_validate_rejects_overflowing_durations() {
        let mut config = Config::default();
        config.cache.latest_ttl_minutes = 9_000_000_000_000_000;
        config.cache.missing_backoff_max_secs = i64::MAX;
        config.refresh.inactivity_window_secs = i64::MAX;

        let message = config.validate().unwrap_err().to_string();

        assert!(message.contains("cache.latest_ttl_minutes must not exceed ten years"));
        assert!(message.contains("cache.missing_backoff_max_secs must not exceed ten years"));
        assert!(message.contains("refresh.inactivity_window_secs must not exceed ten years"));
    }

    #[test]
    fn test_bounded_duration_clamps_instead_of_panicking() {
        assert_eq!(bounded_duration(90, 60), ChronoDuration::minutes(90));
        assert_eq!(
            bounded_duration(9_000_000_000_000_000, 60),
            ChronoDuration::seconds(MAX_SETTING_SECS)
        );
        assert_eq!(bounded_duration(-5, 1), ChronoDuration::zero());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        apply_env(
            &mut config,
            env(&[("DATA_CACHE_MINUTES", "15"), ("REQUEST_TIMEOUT", "5")]),
        )
        .unwrap();

        assert_eq!(config.cache.latest_ttl_minutes, 15);
        assert_eq!(config.upstream.request_timeout_secs, 5);
    }

    #[test]
    fn test_development_profile_shortens_latest_ttl() {
        let mut config = Config::default();
        apply_env(&mut config, env(&[("REGIOCACHE_ENV", "development")])).unwrap();
        assert_eq!(config.cache.latest_ttl_minutes, 5);

        let mut config = Config::default();
        apply_env(
            &mut config,
            env(&[("REGIOCACHE_ENV", "development"), ("DATA_CACHE_MINUTES", "20")]),
        )
        .unwrap();
        assert_eq!(config.cache.latest_ttl_minutes, 20);
    }

    #[test]
    fn test_env_rejects_bad_values() {
        let mut config = Config::default();
        assert!(apply_env(&mut config, env(&[("DATA_CACHE_MINUTES", "soon")])).is_err());
        assert!(apply_env(&mut config, env(&[("REQUEST_TIMEOUT", "-1")])).is_err());
        assert!(apply_env(&mut config, env(&[("REGIOCACHE_ENV", "staging")])).is_err());
    }

    #[test]
    fn test_refresh_config_conversion() {
        let config = Config::default();
        let refresh = config.refresh_config();
        assert_eq!(refresh.latest_interval, Duration::from_secs(300));
        assert!(refresh.enabled);
    }
}
