use std::collections::HashSet;

use chrono::{Datelike, Duration, NaiveDate, Weekday};

/// Trading calendar for one exchange: weekdays minus a holiday set.
///
/// Pure date arithmetic, no I/O. NSE and BSE publish slightly different
/// holiday lists, so each source gets its own calendar.
#[derive(Debug, Clone)]
pub struct TradingCalendar {
    holidays: HashSet<NaiveDate>,
}

impl TradingCalendar {
    pub fn new(holidays: HashSet<NaiveDate>) -> Self {
        Self { holidays }
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        !matches!(date.weekday(), Weekday::Sat | Weekday::Sun) && !self.holidays.contains(&date)
    }

    /// Ascending trading dates in `[start, end]`. A start after the end
    /// yields an empty sequence rather than an error.
    pub fn trading_days(
        &self,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Iterator<Item = NaiveDate> + '_ {
        start
            .iter_days()
            .take_while(move |d| *d <= end)
            .filter(move |d| self.is_trading_day(*d))
    }
}

/// Cache key encoding for a trading date (`DDMMYYYY`).
pub fn date_key(date: NaiveDate) -> String {
    date.format("%d%m%Y").to_string()
}

/// Inverse of [`date_key`].
pub fn parse_date_key(key: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(key, "%d%m%Y").ok()
}

/// Display form used in the output table's Date column (`DD-MM-YYYY`).
pub fn display_date(date: NaiveDate) -> String {
    date.format("%d-%m-%Y").to_string()
}

/// Inverse of [`display_date`].
pub fn parse_display_date(text: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(text, "%d-%m-%Y").ok()
}

/// The most recent weekday on or before `date`. Used by `status` to judge
/// how far behind a cache is.
pub fn last_weekday_on_or_before(date: NaiveDate) -> NaiveDate {
    let mut current = date;
    while matches!(current.weekday(), Weekday::Sat | Weekday::Sun) {
        current -= Duration::days(1);
    }
    current
}
