use std::io::{Cursor, Read};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use tracing::warn;
use zip::ZipArchive;

use crate::http::{FetchClient, FetchError};
use crate::models::{FieldSpec, SourceRecord};

pub mod bse_fo;
pub mod nse_cat;
pub mod nse_eq_cat;
pub mod nse_fo;
pub mod nse_mfss;
pub mod nse_mrg;

pub use bse_fo::BseFo;
pub use nse_cat::NseCat;
pub use nse_eq_cat::NseEqCat;
pub use nse_fo::NseFo;
pub use nse_mfss::NseMfss;
pub use nse_mrg::NseMrg;

/// Everything needed to issue one request for one date. The label is the
/// archive filename (or endpoint name) used in log lines.
#[derive(Debug, Clone)]
pub struct SourceRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub label: String,
}

impl SourceRequest {
    pub fn plain(url: String, label: String) -> Self {
        Self {
            url,
            query: Vec::new(),
            label,
        }
    }
}

/// Outcome of fetching one (source, date) cell. Failures never propagate;
/// they degrade the cell to absent and get counted.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// Usable data, ready to cache.
    Fetched(SourceRecord),
    /// The source legitimately has nothing for this date (404, empty data
    /// array). Expected for holidays the enumerator under-predicts.
    NoData,
    /// Exhausted retries, bad magic bytes, or an unparseable payload.
    Failed,
}

/// One external data provider: URL shape, fixed field schema, and the
/// payload-parsing rule. Retry, caching, and batching live in the shared
/// collector scaffold, not here.
#[async_trait]
pub trait Source: Send + Sync {
    /// Stable identifier; also the cache file stem (`<id>_cache.json`).
    fn id(&self) -> &'static str;

    /// Short log prefix, e.g. `NSE`, `BSE`, `MRG`.
    fn tag(&self) -> &'static str;

    /// Namespace prefixed onto every field in the output table.
    fn column_prefix(&self) -> &'static str;

    /// The fixed schema: a record carries all of these fields or none.
    fn fields(&self) -> &'static [FieldSpec];

    /// Build the request for one date, including the source's date-format
    /// quirks (2-digit vs 4-digit years, dashed API dates).
    fn request(&self, date: NaiveDate) -> SourceRequest;

    /// Expected leading bytes, for a cheap content check before parsing.
    fn magic(&self) -> Option<&'static [u8]> {
        None
    }

    /// Parse a transport-successful payload. `Ok(None)` signals expected
    /// absence (e.g. an empty data array); `Err` is a malformed payload.
    fn parse(&self, date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>>;

    /// Fetch and parse one date, classifying every failure mode.
    async fn fetch(&self, client: &FetchClient, date: NaiveDate) -> FetchOutcome {
        let request = self.request(date);

        let raw = match client.fetch(&request.url, &request.query, &request.label).await {
            Ok(raw) => raw,
            Err(FetchError::NotFound) => return FetchOutcome::NoData,
            Err(e) => {
                warn!("[{}]  {}: giving up — {}", self.tag(), request.label, e);
                return FetchOutcome::Failed;
            }
        };

        if let Some(magic) = self.magic() {
            if !raw.starts_with(magic) {
                warn!(
                    "[{}]  {}: unexpected content (missing {:?} header)",
                    self.tag(),
                    request.label,
                    magic
                );
                return FetchOutcome::Failed;
            }
        }

        match self.parse(date, &raw) {
            Ok(Some(record)) => {
                if record.matches_schema(self.fields()) {
                    FetchOutcome::Fetched(record)
                } else {
                    warn!(
                        "[{}]  {}: record does not match the source schema",
                        self.tag(),
                        request.label
                    );
                    FetchOutcome::Failed
                }
            }
            Ok(None) => FetchOutcome::NoData,
            Err(e) => {
                warn!("[{}]  {}: parse error — {}", self.tag(), request.label, e);
                FetchOutcome::Failed
            }
        }
    }
}

/// Parse a numeric cell, tolerating thousands separators and surrounding
/// whitespace. Empty cells are `None`, not zero.
pub(crate) fn parse_number(raw: &str) -> Option<f64> {
    let cleaned = raw.trim().replace(',', "");
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse::<f64>().ok()
}

/// Extract the first archive member whose name satisfies `pick`, decoded
/// leniently (exchange files occasionally carry stray non-UTF8 bytes).
pub(crate) fn read_zip_member(raw: &[u8], pick: impl Fn(&str) -> bool) -> Result<String> {
    let mut archive = ZipArchive::new(Cursor::new(raw))?;

    let name = archive
        .file_names()
        .find(|n| pick(n))
        .map(String::from)
        .ok_or_else(|| anyhow!("no matching member in archive"))?;

    let mut member = archive.by_name(&name)?;
    let mut bytes = Vec::new();
    member.read_to_end(&mut bytes)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Shared extraction for the two category-turnover sources: find the
/// `Retail` row, take its buy/sell values, derive the average.
pub(crate) fn parse_retail_turnover(raw: &[u8]) -> Result<Option<(f64, f64, f64)>> {
    let text = String::from_utf8_lossy(raw);
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());

    for row in reader.records() {
        let row = row?;
        let category = row.get(1).unwrap_or("").trim();
        if category.eq_ignore_ascii_case("retail") {
            let buy = row
                .get(2)
                .and_then(parse_number_ref)
                .ok_or_else(|| anyhow!("Retail row has no buy value"))?;
            let sell = row
                .get(3)
                .and_then(parse_number_ref)
                .ok_or_else(|| anyhow!("Retail row has no sell value"))?;
            return Ok(Some((buy, sell, (buy + sell) / 2.0)));
        }
    }

    Err(anyhow!("'Retail' row not found in category turnover table"))
}

fn parse_number_ref(raw: &str) -> Option<f64> {
    parse_number(raw)
}
