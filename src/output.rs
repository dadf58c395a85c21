use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use thiserror::Error;
use tracing::info;

use crate::calendar::{display_date, parse_display_date};
use crate::consolidate::{ConsolidatedRow, OutputSchema};

/// Schema-fixity violations. These are the one place silent drift between
/// the configured sources and the file on disk must be caught, so they get
/// their own error type rather than a bare message.
#[derive(Debug, Error)]
pub enum TableError {
    #[error("row for {date} has {found} cells, schema has {expected} columns")]
    RowWidth {
        date: String,
        found: usize,
        expected: usize,
    },

    #[error("header of {path} does not match the configured sources; move the file aside to regenerate it")]
    HeaderMismatch { path: String },

    #[error("bad date {date:?} in {path}")]
    BadDate { date: String, path: String },
}

/// Writer for the combined wide CSV table.
///
/// Both write paths end in the same atomic rewrite (temp file + rename)
/// and keep at most one row per date, so re-running with the same caches
/// produces a byte-identical file.
pub struct TableWriter {
    path: PathBuf,
    schema: OutputSchema,
}

impl TableWriter {
    pub fn new(path: impl Into<PathBuf>, schema: OutputSchema) -> Self {
        Self {
            path: path.into(),
            schema,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the table from scratch: dedup by date (last wins), sort
    /// ascending, replace whatever file was there. Returns the row count.
    pub fn write_full(&self, rows: &[ConsolidatedRow]) -> Result<usize> {
        let merged = self.format_rows(rows)?;
        self.replace_file(&merged)?;
        Ok(merged.len())
    }

    /// Merge `rows` into the existing table: rows sharing a date replace
    /// the old ones, the rest are inserted in date order. A missing file
    /// degenerates to a full write.
    pub fn append_incremental(&self, rows: &[ConsolidatedRow]) -> Result<usize> {
        let mut merged = self.read_existing()?;
        // Freshly consolidated data wins over whatever the file held
        merged.append(&mut self.format_rows(rows)?);
        self.replace_file(&merged)?;
        Ok(merged.len())
    }

    fn format_rows(&self, rows: &[ConsolidatedRow]) -> Result<BTreeMap<NaiveDate, Vec<String>>> {
        let width = self.schema.columns().len();
        let mut formatted = BTreeMap::new();
        for row in rows {
            if row.cells.len() != width {
                return Err(TableError::RowWidth {
                    date: row.display_date(),
                    found: row.cells.len(),
                    expected: width,
                }
                .into());
            }
            let cells: Vec<String> = row
                .cells
                .iter()
                .zip(self.schema.columns())
                .map(|(value, column)| format_cell(*value, column.decimals))
                .collect();
            formatted.insert(row.date, cells);
        }
        Ok(formatted)
    }

    fn replace_file(&self, merged: &BTreeMap<NaiveDate, Vec<String>>) -> Result<()> {
        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp)
                .with_context(|| format!("Failed to create {}", tmp.display()))?;
            writer.write_record(self.schema.header())?;
            for (date, cells) in merged {
                let mut record = Vec::with_capacity(cells.len() + 1);
                record.push(display_date(*date));
                record.extend(cells.iter().cloned());
                writer.write_record(&record)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;

        info!(
            "📊 Output table {} now has {} rows",
            self.path.display(),
            merged.len()
        );
        Ok(())
    }

    /// Read the current table back, keyed by date. A missing file is an
    /// empty table; a header that disagrees with the schema is fatal (the
    /// source set changed against an old file).
    fn read_existing(&self) -> Result<BTreeMap<NaiveDate, Vec<String>>> {
        let mut rows = BTreeMap::new();
        if !self.path.exists() {
            return Ok(rows);
        }

        let mut reader = csv::Reader::from_path(&self.path)
            .with_context(|| format!("Failed to read {}", self.path.display()))?;

        let header: Vec<String> = reader.headers()?.iter().map(|s| s.to_string()).collect();
        if header != self.schema.header() {
            return Err(TableError::HeaderMismatch {
                path: self.path.display().to_string(),
            }
            .into());
        }

        for record in reader.records() {
            let record = record?;
            let raw_date = record.get(0).unwrap_or("").to_string();
            let date = parse_display_date(&raw_date).ok_or_else(|| TableError::BadDate {
                date: raw_date.clone(),
                path: self.path.display().to_string(),
            })?;
            let cells: Vec<String> = record.iter().skip(1).map(|s| s.to_string()).collect();
            if cells.len() != self.schema.columns().len() {
                return Err(TableError::RowWidth {
                    date: raw_date,
                    found: cells.len(),
                    expected: self.schema.columns().len(),
                }
                .into());
            }
            rows.insert(date, cells);
        }
        Ok(rows)
    }
}

/// An absent value renders as an empty cell, never as zero.
fn format_cell(value: Option<f64>, decimals: usize) -> String {
    match value {
        Some(v) => format!("{:.*}", decimals, v),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consolidate::OutputSchema;
    use crate::sources::{NseFo, NseMfss, Source};
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    fn schema() -> OutputSchema {
        let fo = NseFo::new();
        let mf = NseMfss::new();
        OutputSchema::for_sources(&[&fo as &dyn Source, &mf])
    }

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 2, d).unwrap()
    }

    fn row(d: u32, cells: Vec<Option<f64>>) -> ConsolidatedRow {
        ConsolidatedRow {
            date: date(d),
            cells,
        }
    }

    fn full_row(d: u32, base: f64) -> ConsolidatedRow {
        row(d, (0..9).map(|i| Some(base + i as f64)).collect())
    }

    #[test]
    fn test_decimals_and_missing_markers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let writer = TableWriter::new(&path, schema());

        // FO cells present (2 decimals), MFSS absent
        let mut cells = vec![Some(1234.5), Some(10.0), Some(99.999), Some(3.0)];
        cells.extend(std::iter::repeat(None).take(5));
        writer.write_full(&[row(3, cells)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("Date,NSE_NO_OF_CONT"));
        assert_eq!(lines[1], "03-02-2025,1234.50,10.00,100.00,3.00,,,,,");
    }

    #[test]
    fn test_count_fields_have_no_decimals() {
        // MFSS order counts are declared with 0 decimals
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let writer = TableWriter::new(&path, schema());

        let mut cells: Vec<Option<f64>> = std::iter::repeat(None).take(4).collect();
        cells.extend([
            Some(1200.0),
            Some(4500.75),
            Some(300.0),
            Some(900.25),
            Some(1500.0),
        ]);
        writer.write_full(&[row(3, cells)]).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert!(content
            .lines()
            .nth(1)
            .unwrap()
            .ends_with(",1200,4500.75,300,900.25,1500"));
    }

    #[test]
    fn test_write_full_dedups_last_wins() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let writer = TableWriter::new(&path, schema());

        let total = writer
            .write_full(&[full_row(3, 1.0), full_row(3, 100.0)])
            .unwrap();
        assert_eq!(total, 1);
        let content = fs::read_to_string(&path).unwrap();
        assert!(content.lines().nth(1).unwrap().starts_with("03-02-2025,100.00"));
    }

    #[test]
    fn test_rerun_is_byte_identical() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let writer = TableWriter::new(&path, schema());

        writer
            .write_full(&[full_row(3, 100.0), full_row(4, 200.0)])
            .unwrap();
        let first = fs::read(&path).unwrap();

        writer
            .append_incremental(&[full_row(3, 100.0), full_row(4, 200.0)])
            .unwrap();
        let second = fs::read(&path).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_incremental_replaces_by_date_and_sorts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let writer = TableWriter::new(&path, schema());

        writer
            .write_full(&[full_row(3, 100.0), full_row(5, 300.0)])
            .unwrap();
        // Second run: revised 05-02 plus a back-filled 04-02
        let total = writer
            .append_incremental(&[full_row(4, 200.0), full_row(5, 999.0)])
            .unwrap();
        assert_eq!(total, 3);

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert!(lines[1].starts_with("03-02-2025,100.00"));
        assert!(lines[2].starts_with("04-02-2025,200.00"));
        assert!(lines[3].starts_with("05-02-2025,999.00"));
    }

    #[test]
    fn test_incremental_without_existing_file() {
        let dir = tempdir().unwrap();
        let writer = TableWriter::new(dir.path().join("out.csv"), schema());
        let total = writer.append_incremental(&[full_row(3, 1.0)]).unwrap();
        assert_eq!(total, 1);
    }

    #[test]
    fn test_header_mismatch_is_fatal() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.csv");
        fs::write(&path, "Date,SOMETHING_ELSE\n03-02-2025,1\n").unwrap();

        let writer = TableWriter::new(&path, schema());
        let err = writer.append_incremental(&[full_row(4, 1.0)]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::HeaderMismatch { .. })
        ));
        // Existing file untouched
        assert!(fs::read_to_string(&path).unwrap().contains("SOMETHING_ELSE"));
    }

    #[test]
    fn test_wrong_row_width_is_fatal() {
        let dir = tempdir().unwrap();
        let writer = TableWriter::new(dir.path().join("out.csv"), schema());
        let err = writer.write_full(&[row(3, vec![Some(1.0)])]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TableError>(),
            Some(TableError::RowWidth { .. })
        ));
    }
}
