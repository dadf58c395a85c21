use anyhow::Result;
use chrono::NaiveDate;

use crate::models::{FieldSpec, SourceRecord};

use super::{parse_retail_turnover, Source, SourceRequest};

const BASE_URL: &str = "https://nsearchives.nseindia.com/archives/equities/cat/";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("RETAIL_BUY_CR", 2),
    FieldSpec::new("RETAIL_SELL_CR", 2),
    FieldSpec::new("RETAIL_AVG_CR", 2),
];

/// NSE equity category turnover: `cat_turnover_<DDMMYY>.csv`, same table
/// shape as the FO variant but for the cash market.
pub struct NseEqCat {
    base_url: String,
}

impl NseEqCat {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Default for NseEqCat {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for NseEqCat {
    fn id(&self) -> &'static str {
        "nse_eq_cat"
    }

    fn tag(&self) -> &'static str {
        "EQCAT"
    }

    fn column_prefix(&self) -> &'static str {
        "NSE_EQ"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn request(&self, date: NaiveDate) -> SourceRequest {
        let name = format!("cat_turnover_{}.csv", date.format("%d%m%y"));
        SourceRequest::plain(format!("{}{}", self.base_url, name), name)
    }

    fn parse(&self, _date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>> {
        let Some((buy, sell, avg)) = parse_retail_turnover(raw)? else {
            return Ok(None);
        };
        let mut record = SourceRecord::new();
        record.set("RETAIL_BUY_CR", buy);
        record.set("RETAIL_SELL_CR", sell);
        record.set("RETAIL_AVG_CR", avg);
        Ok(Some(record))
    }
}
