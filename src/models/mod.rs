use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// One source's extracted values for one trading date.
///
/// The field set is fixed by the source's schema: a record either carries
/// every declared field or does not exist for that date at all. Values are
/// stored as `f64` even for order counts; display precision lives in the
/// field spec.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord(pub BTreeMap<String, f64>);

impl SourceRecord {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    pub fn set(&mut self, field: &str, value: f64) {
        self.0.insert(field.to_string(), value);
    }

    pub fn get(&self, field: &str) -> Option<f64> {
        self.0.get(field).copied()
    }

    /// True when the record carries exactly the given field set.
    pub fn matches_schema(&self, fields: &[FieldSpec]) -> bool {
        self.0.len() == fields.len() && fields.iter().all(|f| self.0.contains_key(f.name))
    }
}

/// One column of a source's fixed schema: field name plus the number of
/// decimal places used when the value is written to the output table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub decimals: usize,
}

impl FieldSpec {
    pub const fn new(name: &'static str, decimals: usize) -> Self {
        Self { name, decimals }
    }
}

/// Per-source outcome counters for one collection run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectStats {
    /// Trading dates considered for this source.
    pub considered: usize,
    /// Dates already present in the cache (no request made).
    pub cache_hits: usize,
    /// Fresh fetches that produced a cached record.
    pub fetched: usize,
    /// Dates the endpoint reported no data for (404 / empty payload).
    pub not_found: usize,
    /// Dates that failed after retries or failed to parse.
    pub failed: usize,
}

/// End-of-run summary across all sources.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    pub per_source: Vec<(String, CollectStats)>,
    pub rows_written: usize,
}

/// Configuration for the collection pipeline.
///
/// Every knob has a documented default; `from_env` lets the scheduler
/// override the common ones without a rebuild. Tests construct this
/// directly with synthetic holiday sets and tiny date ranges.
#[derive(Debug, Clone)]
pub struct Config {
    /// First candidate date (inclusive).
    pub start_date: NaiveDate,
    /// Last candidate date (inclusive); `None` means today.
    pub end_date: Option<NaiveDate>,
    /// Combined output table path.
    pub output_path: PathBuf,
    /// Directory holding the per-source cache files.
    pub cache_dir: PathBuf,
    /// Per-request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Maximum attempts per request (first try included).
    pub retry_attempts: u32,
    /// Base delay for exponential backoff between attempts, in ms.
    pub retry_base_delay_ms: u64,
    /// Re-seed session cookies every N downloads.
    pub session_refresh_every: u32,
    /// Concurrent in-flight fetches within one source.
    pub max_concurrent_fetches: usize,
    /// Persist the cache after every N fresh fetches.
    pub cache_flush_every: usize,
    /// NSE trading holidays.
    pub nse_holidays: HashSet<NaiveDate>,
    /// BSE trading holidays (differs from NSE by May Day).
    pub bse_holidays: HashSet<NaiveDate>,
}

/// Exchange holidays for 2025-26, DDMMYYYY as published in the exchange
/// trading calendars.
const NSE_HOLIDAYS: &[&str] = &[
    "26012025", "24022025", "10032025", "21032025", "08042025", "10042025",
    "14042025", "21042025", "08052025", "15082025", "29082025", "02102025",
    "24102025", "31102025", "01112025", "05112025", "25122025", "26012026",
    "17022026",
];

const BSE_HOLIDAYS: &[&str] = &[
    "26012025", "24022025", "10032025", "21032025", "08042025", "10042025",
    "14042025", "21042025", "01052025", "08052025", "15082025", "29082025",
    "02102025", "24102025", "31102025", "01112025", "05112025", "25122025",
    "26012026", "17022026",
];

fn holiday_set(keys: &[&str]) -> HashSet<NaiveDate> {
    keys.iter()
        .filter_map(|k| NaiveDate::parse_from_str(k, "%d%m%Y").ok())
        .collect()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start_date: NaiveDate::from_ymd_opt(2025, 2, 1).unwrap(),
            end_date: None,
            output_path: PathBuf::from("nse_fo_aggregated_data.csv"),
            cache_dir: PathBuf::from("."),
            request_timeout_secs: 30,
            retry_attempts: 4,
            retry_base_delay_ms: 500,
            session_refresh_every: 20,
            max_concurrent_fetches: 4,
            cache_flush_every: 20,
            nse_holidays: holiday_set(NSE_HOLIDAYS),
            bse_holidays: holiday_set(BSE_HOLIDAYS),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults above for anything unset.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if it exists

        let mut config = Config::default();

        if let Ok(v) = std::env::var("COLLECTOR_START_DATE") {
            config.start_date = NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                .map_err(|e| anyhow::anyhow!("Invalid COLLECTOR_START_DATE {:?}: {}", v, e))?;
        }
        if let Ok(v) = std::env::var("COLLECTOR_END_DATE") {
            config.end_date = Some(
                NaiveDate::parse_from_str(&v, "%Y-%m-%d")
                    .map_err(|e| anyhow::anyhow!("Invalid COLLECTOR_END_DATE {:?}: {}", v, e))?,
            );
        }
        if let Ok(v) = std::env::var("COLLECTOR_OUTPUT_PATH") {
            config.output_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COLLECTOR_CACHE_DIR") {
            config.cache_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("COLLECTOR_REQUEST_TIMEOUT_SECS") {
            config.request_timeout_secs = v.parse().unwrap_or(config.request_timeout_secs);
        }
        if let Ok(v) = std::env::var("COLLECTOR_RETRY_ATTEMPTS") {
            config.retry_attempts = v.parse().unwrap_or(config.retry_attempts);
        }
        if let Ok(v) = std::env::var("COLLECTOR_MAX_CONCURRENT_FETCHES") {
            config.max_concurrent_fetches = v.parse().unwrap_or(config.max_concurrent_fetches);
        }

        Ok(config)
    }

    /// Effective end of the candidate range.
    pub fn effective_end_date(&self) -> NaiveDate {
        self.end_date
            .unwrap_or_else(|| chrono::Utc::now().date_naive())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(
            config.start_date,
            NaiveDate::from_ymd_opt(2025, 2, 1).unwrap()
        );
        assert_eq!(config.retry_attempts, 4);
        assert_eq!(config.request_timeout_secs, 30);
        // BSE observes May Day, NSE does not
        let may_day = NaiveDate::from_ymd_opt(2025, 5, 1).unwrap();
        assert!(config.bse_holidays.contains(&may_day));
        assert!(!config.nse_holidays.contains(&may_day));
        assert_eq!(config.nse_holidays.len(), 19);
        assert_eq!(config.bse_holidays.len(), 20);
    }

    #[test]
    fn test_record_schema_check() {
        const FIELDS: &[FieldSpec] =
            &[FieldSpec::new("NO_OF_CONT", 2), FieldSpec::new("PR_VAL", 2)];

        let mut record = SourceRecord::new();
        record.set("NO_OF_CONT", 100.0);
        assert!(!record.matches_schema(FIELDS));

        record.set("PR_VAL", 42.5);
        assert!(record.matches_schema(FIELDS));

        record.set("EXTRA", 1.0);
        assert!(!record.matches_schema(FIELDS));
    }
}
