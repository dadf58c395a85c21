use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use serde_json::Value;

use crate::models::{FieldSpec, SourceRecord};

use super::{Source, SourceRequest};

const BASE_URL: &str = "https://www.nseindia.com";
const ENDPOINT: &str = "/api/historicalOR/mfssTradeStatisticsData";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("NOS_OF_SUB_ORDER", 0),
    FieldSpec::new("TOT_SUB_AMT", 2),
    FieldSpec::new("NOS_OF_RED_ORDER", 0),
    FieldSpec::new("TOT_RED_AMT", 2),
    FieldSpec::new("TOT_ORDER", 0),
];

/// JSON key for each field in the MFSS API response.
const JSON_KEYS: &[(&str, &str)] = &[
    ("NOS_OF_SUB_ORDER", "MF_NOS_OF_SUB_ORDER"),
    ("TOT_SUB_AMT", "MF_TOT_SUB_AMT"),
    ("NOS_OF_RED_ORDER", "MF_NOS_OF_RED_ORDER"),
    ("TOT_RED_AMT", "MF_TOT_RED_AMT"),
    ("TOT_ORDER", "MF_TOT_ORDER"),
];

/// NSE MFSS trade statistics JSON API: mutual-fund subscription and
/// redemption order stats. Queried one day at a time (`from == to`); an
/// empty `data` array is the no-trading signal, not an error.
pub struct NseMfss {
    base_url: String,
}

impl NseMfss {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Default for NseMfss {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for NseMfss {
    fn id(&self) -> &'static str {
        "nse_mfss"
    }

    fn tag(&self) -> &'static str {
        "MFSS"
    }

    fn column_prefix(&self) -> &'static str {
        "MF"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn request(&self, date: NaiveDate) -> SourceRequest {
        let api_date = date.format("%d-%m-%Y").to_string();
        SourceRequest {
            url: format!("{}{}", self.base_url, ENDPOINT),
            query: vec![
                ("from".to_string(), api_date.clone()),
                ("to".to_string(), api_date.clone()),
            ],
            label: format!("mfssTradeStatisticsData?{}", api_date),
        }
    }

    fn parse(&self, date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>> {
        let body: Value = serde_json::from_slice(raw)?;
        let data = body
            .get("data")
            .and_then(|v| v.as_array())
            .ok_or_else(|| anyhow!("response has no data array"))?;

        if data.is_empty() {
            return Ok(None);
        }

        // The API echoes the requested day back as DD-Mon-YYYY; match it
        // rather than trusting array position.
        let wanted = date.format("%d-%b-%Y").to_string();
        let entry = data.iter().find(|item| {
            item.get("MF_DATE")
                .and_then(|v| v.as_str())
                .map(|s| s.eq_ignore_ascii_case(&wanted))
                .unwrap_or(false)
        });

        let Some(entry) = entry else {
            return Ok(None);
        };

        let mut record = SourceRecord::new();
        for (field, json_key) in JSON_KEYS {
            let value = entry
                .get(*json_key)
                .and_then(json_number)
                .ok_or_else(|| anyhow!("field {} missing or non-numeric", json_key))?;
            record.set(field, value);
        }
        Ok(Some(record))
    }
}

/// The API is inconsistent about numbers-as-strings; accept both.
fn json_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }
}
