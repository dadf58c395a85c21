use anyhow::{Context, Result};
use chrono::NaiveDate;
use tracing::info;

use crate::cache::CacheStore;
use crate::calendar::{date_key, display_date, parse_date_key};
use crate::sources::Source;

/// One output column: namespaced name plus the decimal precision its
/// source declares for the field.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    pub decimals: usize,
}

/// The fixed wide-table schema: `Date` first, then every source's fields
/// in declared order, each namespaced with the source's column prefix.
/// The schema depends only on the source list, never on the data, so the
/// output header is identical across runs.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    columns: Vec<ColumnSpec>,
}

impl OutputSchema {
    pub fn for_sources(sources: &[&dyn Source]) -> Self {
        let mut columns = Vec::new();
        for source in sources {
            for field in source.fields() {
                columns.push(ColumnSpec {
                    name: format!("{}_{}", source.column_prefix(), field.name),
                    decimals: field.decimals,
                });
            }
        }
        Self { columns }
    }

    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Full CSV header row, including the leading `Date` column.
    pub fn header(&self) -> Vec<String> {
        let mut header = Vec::with_capacity(self.columns.len() + 1);
        header.push("Date".to_string());
        header.extend(self.columns.iter().map(|c| c.name.clone()));
        header
    }
}

/// One consolidated trading date. `cells` aligns with
/// `OutputSchema::columns`; `None` is an explicit missing marker, never
/// conflated with zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsolidatedRow {
    pub date: NaiveDate,
    pub cells: Vec<Option<f64>>,
}

impl ConsolidatedRow {
    /// Human-readable date used in the output table (`DD-MM-YYYY`).
    pub fn display_date(&self) -> String {
        display_date(self.date)
    }
}

/// Outer-join every source's cache into one row per date.
///
/// The row set is the union of cached dates: a date appears as soon as any
/// source reported it (even one outside another exchange's calendar), and
/// never appears for dates no source has data for. Cells for sources with
/// no record stay `None`.
pub fn consolidate(parts: &[(&dyn Source, &dyn CacheStore)]) -> Result<Vec<ConsolidatedRow>> {
    let mut dates: Vec<NaiveDate> = Vec::new();
    for (source, cache) in parts {
        for key in cache.keys() {
            let date = parse_date_key(&key)
                .with_context(|| format!("Bad date key {:?} in {} cache", key, source.id()))?;
            if !dates.contains(&date) {
                dates.push(date);
            }
        }
    }
    dates.sort();

    let mut rows = Vec::with_capacity(dates.len());
    for date in dates {
        let key = date_key(date);
        let mut cells = Vec::new();
        for (source, cache) in parts {
            match cache.get(&key) {
                Some(record) => {
                    for field in source.fields() {
                        cells.push(record.get(field.name));
                    }
                }
                None => cells.extend(std::iter::repeat(None).take(source.fields().len())),
            }
        }
        rows.push(ConsolidatedRow { date, cells });
    }

    info!("Consolidated {} dates across {} sources", rows.len(), parts.len());
    Ok(rows)
}
