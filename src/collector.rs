use anyhow::Result;
use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use tracing::{debug, error, info};

use crate::cache::CacheStore;
use crate::calendar::{date_key, TradingCalendar};
use crate::http::FetchClient;
use crate::models::{CollectStats, SourceRecord};
use crate::sources::{FetchOutcome, Source};

/// Per-source collection scaffold: owns the source's cache, its trading
/// calendar, and a fetch client, and turns a date range into cached
/// records. Retry lives in the client, parsing in the source; this layer
/// only decides what to fetch and when to persist.
pub struct SourceCollector {
    source: Box<dyn Source>,
    client: FetchClient,
    calendar: TradingCalendar,
    cache: Box<dyn CacheStore>,
    concurrency: usize,
    flush_every: usize,
}

impl SourceCollector {
    pub fn new(
        source: Box<dyn Source>,
        client: FetchClient,
        calendar: TradingCalendar,
        cache: Box<dyn CacheStore>,
        concurrency: usize,
        flush_every: usize,
    ) -> Self {
        Self {
            source,
            client,
            calendar,
            cache,
            concurrency: concurrency.max(1),
            flush_every: flush_every.max(1),
        }
    }

    pub fn source(&self) -> &dyn Source {
        &*self.source
    }

    pub fn cache(&self) -> &dyn CacheStore {
        &*self.cache
    }

    /// Candidate dates for this source between `start` and `end`, per its
    /// own exchange calendar.
    pub fn trading_dates(&self, start: NaiveDate, end: NaiveDate) -> Vec<NaiveDate> {
        self.calendar.trading_days(start, end).collect()
    }

    /// Cache-first single-date lookup. A miss triggers one fetch; every
    /// failure mode degrades to `None` rather than erroring the caller.
    /// Only a failed cache persist (fatal) propagates.
    pub async fn cached_or_fetch(&mut self, date: NaiveDate) -> Result<Option<SourceRecord>> {
        let key = date_key(date);
        if let Some(record) = self.cache.get(&key) {
            debug!("[{}]  {} cached", self.source.tag(), key);
            return Ok(Some(record.clone()));
        }

        match self.source.fetch(&self.client, date).await {
            FetchOutcome::Fetched(record) => {
                self.cache.insert(key, record.clone());
                self.cache.persist()?;
                Ok(Some(record))
            }
            FetchOutcome::NoData | FetchOutcome::Failed => Ok(None),
        }
    }

    /// Collect every date in the input, fetching cache misses with bounded
    /// concurrency and persisting the cache once per flush chunk, so a
    /// crash costs at most one chunk of progress.
    pub async fn collect_range(&mut self, dates: &[NaiveDate]) -> Result<CollectStats> {
        let mut stats = CollectStats {
            considered: dates.len(),
            ..CollectStats::default()
        };

        let misses: Vec<NaiveDate> = dates
            .iter()
            .copied()
            .filter(|date| {
                let hit = self.cache.get(&date_key(*date)).is_some();
                if hit {
                    stats.cache_hits += 1;
                }
                !hit
            })
            .collect();

        if misses.is_empty() {
            info!(
                "[{}] All {} dates already cached",
                self.source.tag(),
                stats.cache_hits
            );
            return Ok(stats);
        }

        info!(
            "[{}] Fetching {} dates ({} cache hits)",
            self.source.tag(),
            misses.len(),
            stats.cache_hits
        );

        for chunk in misses.chunks(self.flush_every) {
            let source = &*self.source;
            let client = &self.client;

            let mut outcomes: Vec<(NaiveDate, FetchOutcome)> = stream::iter(chunk.iter().copied())
                .map(|date| async move { (date, source.fetch(client, date).await) })
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            // Completion order is arbitrary; keep the cache insertion and
            // log order deterministic.
            outcomes.sort_by_key(|(date, _)| *date);

            let mut fresh = 0usize;
            for (date, outcome) in outcomes {
                let key = date_key(date);
                match outcome {
                    FetchOutcome::Fetched(record) => {
                        self.cache.insert(key.clone(), record);
                        stats.fetched += 1;
                        fresh += 1;
                        info!("[{}]  [OK] {}", self.source.tag(), key);
                    }
                    FetchOutcome::NoData => {
                        stats.not_found += 1;
                        debug!("[{}]  {} — no data published", self.source.tag(), key);
                    }
                    FetchOutcome::Failed => {
                        stats.failed += 1;
                        error!("[{}]  [FAIL] {}", self.source.tag(), key);
                    }
                }
            }

            if fresh > 0 {
                self.cache.persist()?;
            }
        }

        info!(
            "[{}] Done — new={} hits={} not-found={} failed={} cached={}",
            self.source.tag(),
            stats.fetched,
            stats.cache_hits,
            stats.not_found,
            stats.failed,
            self.cache.len()
        );
        Ok(stats)
    }
}
