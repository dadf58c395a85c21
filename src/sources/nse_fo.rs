use anyhow::{anyhow, Result};
use chrono::NaiveDate;

use crate::models::{FieldSpec, SourceRecord};

use super::{parse_number, read_zip_member, Source, SourceRequest};

const BASE_URL: &str = "https://nsearchives.nseindia.com/archives/fo/mkt/";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("NO_OF_CONT", 2),
    FieldSpec::new("NO_OF_TRADE", 2),
    FieldSpec::new("NOTION_VAL", 2),
    FieldSpec::new("PR_VAL", 2),
];

/// NSE FO daily bhavcopy: `fo<DDMMYYYY>.zip` containing an `op*.csv`
/// table; the four metrics are column sums across every instrument row.
pub struct NseFo {
    base_url: String,
}

impl NseFo {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Default for NseFo {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for NseFo {
    fn id(&self) -> &'static str {
        "nse_fo"
    }

    fn tag(&self) -> &'static str {
        "NSE"
    }

    fn column_prefix(&self) -> &'static str {
        "NSE"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn request(&self, date: NaiveDate) -> SourceRequest {
        let name = format!("fo{}.zip", date.format("%d%m%Y"));
        SourceRequest::plain(format!("{}{}", self.base_url, name), name)
    }

    fn magic(&self) -> Option<&'static [u8]> {
        Some(b"PK")
    }

    fn parse(&self, _date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>> {
        let content = read_zip_member(raw, |n| {
            n.to_ascii_lowercase().starts_with("op") && n.ends_with(".csv")
        })
        .map_err(|_| anyhow!("no op*.csv member in FO archive"))?;

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(content.as_bytes());

        let headers = reader.headers()?.clone();
        let mut indices = Vec::with_capacity(FIELDS.len());
        for field in FIELDS {
            let idx = headers
                .iter()
                .position(|h| h.trim() == field.name)
                .ok_or_else(|| anyhow!("column {} not found in op*.csv", field.name))?;
            indices.push((field.name, idx));
        }

        let mut record = SourceRecord::new();
        for field in FIELDS {
            record.set(field.name, 0.0);
        }

        let mut rows = 0usize;
        for row in reader.records() {
            let row = row?;
            for (name, idx) in &indices {
                if let Some(value) = row.get(*idx).and_then(parse_number) {
                    record.set(name, record.get(name).unwrap_or(0.0) + value);
                }
            }
            rows += 1;
        }

        if rows == 0 {
            return Ok(None);
        }
        Ok(Some(record))
    }
}
