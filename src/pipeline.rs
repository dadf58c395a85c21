use std::path::PathBuf;

use anyhow::Result;
use chrono::NaiveDate;
use tracing::info;

use crate::cache::{CacheStore, JsonFileCache};
use crate::calendar::{display_date, parse_date_key, TradingCalendar};
use crate::collector::SourceCollector;
use crate::consolidate::{consolidate, OutputSchema};
use crate::http::{browser_headers, FetchClient};
use crate::models::{Config, RunReport};
use crate::output::TableWriter;
use crate::sources::{BseFo, NseCat, NseEqCat, NseFo, NseMfss, NseMrg, Source};

const NSE_HOME: &str = "https://www.nseindia.com";
const BSE_HOME: &str = "https://www.bseindia.com";

/// Cache file stems in output-column order. `clear-cache` and `status`
/// work from this list without building HTTP clients.
pub const SOURCE_IDS: &[&str] = &[
    "nse_fo",
    "bse_fo",
    "nse_cat",
    "nse_eq_cat",
    "nse_mrg",
    "nse_mfss",
];

/// The whole collection pipeline: one collector per source, a shared
/// candidate date range, and the consolidated output table.
///
/// Sources are collected sequentially (concurrency lives inside each
/// collector) so one exchange's session handling never interleaves with
/// another's.
pub struct Pipeline {
    config: Config,
    collectors: Vec<SourceCollector>,
}

/// One line of `status` output.
#[derive(Debug)]
pub struct SourceStatus {
    pub id: String,
    pub entries: usize,
    pub latest: Option<NaiveDate>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let nse = TradingCalendar::new(config.nse_holidays.clone());
        let bse = TradingCalendar::new(config.bse_holidays.clone());

        // Declaration order here fixes the output column order.
        let sources: Vec<(Box<dyn Source>, TradingCalendar, &str)> = vec![
            (Box::new(NseFo::new()), nse.clone(), NSE_HOME),
            (Box::new(BseFo::new()), bse, BSE_HOME),
            (Box::new(NseCat::new()), nse.clone(), NSE_HOME),
            (Box::new(NseEqCat::new()), nse.clone(), NSE_HOME),
            (Box::new(NseMrg::new()), nse.clone(), NSE_HOME),
            (Box::new(NseMfss::new()), nse, NSE_HOME),
        ];

        let mut collectors = Vec::with_capacity(sources.len());
        for (source, calendar, home) in sources {
            let client = FetchClient::new(
                source.tag(),
                browser_headers(home),
                Some(home.to_string()),
                &config,
            )?;
            let cache = JsonFileCache::load(cache_file(&config, source.id()), source.tag())?;
            collectors.push(SourceCollector::new(
                source,
                client,
                calendar,
                Box::new(cache),
                config.max_concurrent_fetches,
                config.cache_flush_every,
            ));
        }

        Ok(Self { config, collectors })
    }

    /// Assemble a pipeline from pre-built collectors. Used by tests to
    /// point sources at local servers; `new` is the production path.
    pub fn from_collectors(config: Config, collectors: Vec<SourceCollector>) -> Self {
        Self { config, collectors }
    }

    /// One full collection run: fetch every source over the candidate
    /// range, consolidate the caches, and rewrite the output table.
    pub async fn run(&mut self) -> Result<RunReport> {
        let start = self.config.start_date;
        let end = self.config.effective_end_date();
        info!(
            "🚀 Collection run: {} to {}",
            display_date(start),
            display_date(end)
        );

        let mut report = RunReport::default();
        for collector in &mut self.collectors {
            let dates = collector.trading_dates(start, end);
            let stats = collector.collect_range(&dates).await?;
            report
                .per_source
                .push((collector.source().id().to_string(), stats));
        }

        let sources: Vec<&dyn Source> = self.collectors.iter().map(|c| c.source()).collect();
        let parts: Vec<(&dyn Source, &dyn CacheStore)> = self
            .collectors
            .iter()
            .map(|c| (c.source(), c.cache()))
            .collect();

        let rows = consolidate(&parts)?;
        let writer = TableWriter::new(&self.config.output_path, OutputSchema::for_sources(&sources));
        report.rows_written = if writer.path().exists() {
            writer.append_incremental(&rows)?
        } else {
            writer.write_full(&rows)?
        };

        for (id, stats) in &report.per_source {
            info!(
                "  {}: new={} hits={} not-found={} failed={}",
                id, stats.fetched, stats.cache_hits, stats.not_found, stats.failed
            );
        }
        info!(
            "✅ Run complete: {} rows in {}",
            report.rows_written,
            self.config.output_path.display()
        );
        Ok(report)
    }

    /// Per-source cache summary for the `status` subcommand.
    pub fn status(&self) -> Vec<SourceStatus> {
        self.collectors
            .iter()
            .map(|collector| {
                let latest = collector
                    .cache()
                    .keys()
                    .iter()
                    .filter_map(|k| parse_date_key(k))
                    .max();
                SourceStatus {
                    id: collector.source().id().to_string(),
                    entries: collector.cache().len(),
                    latest,
                }
            })
            .collect()
    }
}

fn cache_file(config: &Config, source_id: &str) -> PathBuf {
    config.cache_dir.join(format!("{}_cache.json", source_id))
}

/// Delete cache files: one source's when `source_id` is given, otherwise
/// all of them. Returns how many were removed. The output table is left
/// alone.
pub fn clear_caches(config: &Config, source_id: Option<&str>) -> Result<usize> {
    let targets: Vec<&str> = match source_id {
        Some(id) => {
            if !SOURCE_IDS.contains(&id) {
                anyhow::bail!("Unknown source {:?}; known sources: {}", id, SOURCE_IDS.join(", "));
            }
            vec![id]
        }
        None => SOURCE_IDS.to_vec(),
    };

    let mut removed = 0;
    for id in targets {
        let path = cache_file(config, id);
        if path.exists() {
            std::fs::remove_file(&path)?;
            info!("🗑️  Removed {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceRecord;
    use tempfile::tempdir;

    #[test]
    fn test_clear_caches_removes_only_known_files() {
        let dir = tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        std::fs::write(cache_file(&config, "nse_fo"), "{}").unwrap();
        std::fs::write(cache_file(&config, "nse_mfss"), "{}").unwrap();
        std::fs::write(dir.path().join("unrelated.json"), "{}").unwrap();

        let removed = clear_caches(&config, None).unwrap();
        assert_eq!(removed, 2);
        assert!(!cache_file(&config, "nse_fo").exists());
        assert!(dir.path().join("unrelated.json").exists());
    }

    #[test]
    fn test_clear_single_cache() {
        let dir = tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        std::fs::write(cache_file(&config, "nse_fo"), "{}").unwrap();
        std::fs::write(cache_file(&config, "bse_fo"), "{}").unwrap();

        let removed = clear_caches(&config, Some("nse_fo")).unwrap();
        assert_eq!(removed, 1);
        assert!(!cache_file(&config, "nse_fo").exists());
        assert!(cache_file(&config, "bse_fo").exists());

        assert!(clear_caches(&config, Some("nope")).is_err());
    }

    #[test]
    fn test_status_reports_latest_cached_date() {
        let dir = tempdir().unwrap();
        let config = Config {
            cache_dir: dir.path().to_path_buf(),
            ..Config::default()
        };

        let mut record = SourceRecord::new();
        for name in ["NO_OF_CONT", "NO_OF_TRADE", "NOTION_VAL", "PR_VAL"] {
            record.set(name, 1.0);
        }
        let mut cache = JsonFileCache::load(cache_file(&config, "nse_fo"), "NSE").unwrap();
        cache.insert("03022025".to_string(), record.clone());
        cache.insert("28022025".to_string(), record);
        cache.persist().unwrap();

        let pipeline = Pipeline::new(config).unwrap();
        let status = pipeline.status();
        assert_eq!(status.len(), SOURCE_IDS.len());

        let fo = status.iter().find(|s| s.id == "nse_fo").unwrap();
        assert_eq!(fo.entries, 2);
        assert_eq!(fo.latest, NaiveDate::from_ymd_opt(2025, 2, 28));

        let mfss = status.iter().find(|s| s.id == "nse_mfss").unwrap();
        assert_eq!(mfss.entries, 0);
        assert_eq!(mfss.latest, None);
    }
}
