use anyhow::{anyhow, Result};
use chrono::NaiveDate;

use crate::models::{FieldSpec, SourceRecord};

use super::{parse_number, read_zip_member, Source, SourceRequest};

const BASE_URL: &str = "https://nsearchives.nseindia.com/content/equities/";

const FIELDS: &[FieldSpec] = &[
    FieldSpec::new("OUTSTANDING_BOD_LAKHS", 2),
    FieldSpec::new("FRESH_EXP_LAKHS", 2),
    FieldSpec::new("EXP_LIQ_LAKHS", 2),
    FieldSpec::new("NET_EOD_LAKHS", 2),
];

/// Serial number in the margin-trading CSV mapped to our field name.
const SR_TO_FIELD: &[(&str, &str)] = &[
    ("1", "OUTSTANDING_BOD_LAKHS"),
    ("2", "FRESH_EXP_LAKHS"),
    ("3", "EXP_LIQ_LAKHS"),
    ("4", "NET_EOD_LAKHS"),
];

/// NSE margin trading: `mrg_trading_<DDMMYY>.zip` containing a CSV of four
/// serial-numbered aggregate rows (Rs.Lakh). Older files carry an extra
/// leading blank column, so both layouts are probed.
pub struct NseMrg {
    base_url: String,
}

impl NseMrg {
    pub fn new() -> Self {
        Self::with_base_url(BASE_URL.to_string())
    }

    pub fn with_base_url(base_url: String) -> Self {
        Self { base_url }
    }
}

impl Default for NseMrg {
    fn default() -> Self {
        Self::new()
    }
}

impl Source for NseMrg {
    fn id(&self) -> &'static str {
        "nse_mrg"
    }

    fn tag(&self) -> &'static str {
        "MRG"
    }

    fn column_prefix(&self) -> &'static str {
        "MRG"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        FIELDS
    }

    fn request(&self, date: NaiveDate) -> SourceRequest {
        let name = format!("mrg_trading_{}.zip", date.format("%d%m%y"));
        SourceRequest::plain(format!("{}{}", self.base_url, name), name)
    }

    fn magic(&self) -> Option<&'static [u8]> {
        Some(b"PK")
    }

    fn parse(&self, _date: NaiveDate, raw: &[u8]) -> Result<Option<SourceRecord>> {
        let content = read_zip_member(raw, |n| n.to_ascii_lowercase().ends_with(".csv"))
            .map_err(|_| anyhow!("no CSV member in margin archive"))?;

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .from_reader(content.as_bytes());

        let mut record = SourceRecord::new();
        for row in reader.records() {
            let row = row?;
            // New layout: serial at col 0, value at col 2.
            // Old layout: leading blank column, so serial at 1 and value at 3.
            for (sr_col, val_col) in [(0usize, 2usize), (1, 3)] {
                let serial = row.get(sr_col).unwrap_or("").trim();
                let Some((_, field)) = SR_TO_FIELD.iter().find(|(sr, _)| *sr == serial) else {
                    continue;
                };
                if record.get(field).is_none() {
                    if let Some(value) = row.get(val_col).and_then(parse_number) {
                        record.set(field, value);
                    }
                }
                break;
            }
        }

        // Partial records are not modeled: all four metrics or nothing.
        if !record.matches_schema(FIELDS) {
            return Err(anyhow!(
                "only {}/4 margin metrics parsed",
                record.0.len()
            ));
        }
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::test_support::zip_with_member;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, 3).unwrap()
    }

    #[test]
    fn test_request_uses_two_digit_year() {
        let source = NseMrg::new();
        let request = source.request(date());
        assert!(request.url.ends_with("mrg_trading_030225.zip"));
    }

    #[test]
    fn test_parse_new_layout() {
        let csv = "\
1,Scripwise Total Outstanding on beginning of day,\"1,000.25\"
2,Fresh Exposure taken during the day,200.50
3,Exposure liquidated during the day,50.75
4,Net scripwise outstanding at end of day,\"1,150.00\"
";
        let raw = zip_with_member("mrg_trading.csv", csv);
        let record = NseMrg::new().parse(date(), &raw).unwrap().unwrap();
        assert_eq!(record.get("OUTSTANDING_BOD_LAKHS"), Some(1000.25));
        assert_eq!(record.get("FRESH_EXP_LAKHS"), Some(200.5));
        assert_eq!(record.get("EXP_LIQ_LAKHS"), Some(50.75));
        assert_eq!(record.get("NET_EOD_LAKHS"), Some(1150.0));
    }

    #[test]
    fn test_parse_old_layout_with_leading_blank_column() {
        let csv = "\
,1,Scripwise Total Outstanding on beginning of day,900.00
,2,Fresh Exposure taken during the day,100.00
,3,Exposure liquidated during the day,25.00
,4,Net scripwise outstanding at end of day,975.00
";
        let raw = zip_with_member("mrg_trading.csv", csv);
        let record = NseMrg::new().parse(date(), &raw).unwrap().unwrap();
        assert_eq!(record.get("OUTSTANDING_BOD_LAKHS"), Some(900.0));
        assert_eq!(record.get("NET_EOD_LAKHS"), Some(975.0));
    }

    #[test]
    fn test_partial_metrics_are_rejected() {
        let csv = "1,Scripwise Total Outstanding on beginning of day,900.00\n";
        let raw = zip_with_member("mrg_trading.csv", csv);
        let result = NseMrg::new().parse(date(), &raw);
        assert!(result.is_err());
    }
}
