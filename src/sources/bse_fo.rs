use anyhow::{anyhow, Result};
use chrono::NaiveDate;

use crate::models::{FieldSpec, SourceRecord};

use super::{parse_number, Source, SourceRequest};

const BASE_URL: &str = "https://www.bseindia.com/download/Bhavcopy/Derivative/";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("TTL_TRADED_QTY", 2),
    FieldSpec::new("TTL_TRADED_VAL", 2),
    FieldSpec::new("AVG_TRADED_PRICE", 4),
    FieldSpec::new("NO_OF_TRADES", 2),
];

/// Positional fallbacks for when BSE renames its headers (it has), 0-based
/// in `MS_<date>-01.csv`.
const COL_TTL_QTY: usize = 15;
const COL_TTL_VAL: usize = 16;
const COL_AVG_PRICE: usize = 17;
const COL_NO_TRADES: usize = 18;
const COL_PRODUCT_TYPE: usize = 4;

/// BSE derivatives market summary: `MS_<YYYYMMDD>-01.csv`, summed over
/// index option/future rows (product types `IO` and `IF`) only.
pub struct BseFo {
    base_url: String,
}

impl BseFo {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Default for BseFo {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for BseFo {
    fn id(&self) -> &'static str {
        "bse_fo"
    }

    fn tag(&self) -> &'static str {
        "BSE"
    }

    fn column_prefix(&self) -> &'static str {
        "BSE"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn request(&self, date: NaiveDate) -> SourceRequest {
        let name = format!("MS_{}-01.csv", date.format("%Y%m%d"));
        SourceRequest::plain(format!("{}{}", self.base_url, name), name)
    }

    fn parse(&self, _date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>> {
        // BSE serves HTML error pages with HTTP 200; the real bhavcopy
        // always opens with a Market Summary banner.
        let head = String::from_utf8_lossy(&raw[..raw.len().min(200)]);
        if !head.contains("Market Summary") {
            return Err(anyhow!("response does not look like a bhavcopy CSV"));
        }

        let text = String::from_utf8_lossy(raw);
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(text.as_bytes());

        let headers = reader.headers()?.clone();
        let position = |name: &str, fallback: usize| {
            headers
                .iter()
                .position(|h| h.trim() == name)
                .unwrap_or(fallback)
        };

        let columns = [
            ("TTL_TRADED_QTY", position("Total Traded Quantity", COL_TTL_QTY)),
            (
                "TTL_TRADED_VAL",
                position(
                    "Total Traded Value (in Thousands)(absolute)",
                    COL_TTL_VAL,
                ),
            ),
            (
                "AVG_TRADED_PRICE",
                position("Average Traded Price", COL_AVG_PRICE),
            ),
            ("NO_OF_TRADES", position("No. of Trades", COL_NO_TRADES)),
        ];
        let product_idx = position("Product Type", COL_PRODUCT_TYPE);

        let mut record = SourceRecord::new();
        for field in FIELDS {
            record.set(field.name, 0.0);
        }

        let mut matched = 0usize;
        for row in reader.records() {
            let row = row?;
            let product = row.get(product_idx).unwrap_or("").trim();
            if product != "IO" && product != "IF" {
                continue;
            }
            for (name, idx) in &columns {
                if let Some(value) = row.get(*idx).and_then(parse_number) {
                    record.set(name, record.get(name).unwrap_or(0.0) + value);
                }
            }
            matched += 1;
        }

        if matched == 0 {
            return Err(anyhow!("no IO/IF rows in bhavcopy"));
        }
        Ok(Some(record))
    }
}
