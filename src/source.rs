use std::path::{Path, PathBuf};

use tracing::info;

use crate::error::{NormalizeError, Result};
use crate::raw::{RawRow, RowProvenance};

/// Filename suffix of the per-year converted annual summaries.
/// The earliest years were published only as documents and were
/// converted to CSV upstream; the rest were exported from spreadsheets.
pub const FILE_SUFFIX: &str = "_Annual_Summary_Converted";

/// Abstraction over format-specific readers: anything that can yield a
/// year's worth of raw rows.
pub trait RawRowSource {
    fn read_year(&self, year: i32) -> Result<Vec<RawRow>>;
}

/// CSV-backed row source reading `{year}_Annual_Summary_Converted.csv`
/// from a data directory.
pub struct CsvRowSource {
    data_dir: PathBuf,
}

impl CsvRowSource {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
        }
    }

    pub fn year_path(&self, year: i32) -> PathBuf {
        self.data_dir.join(format!("{}{}.csv", year, FILE_SUFFIX))
    }

    /// Reads every year in the inclusive range. A missing year file is a
    /// batch-level input error surfaced before any row is processed.
    pub fn read_years(&self, first: i32, last: i32) -> Result<Vec<RawRow>> {
        let mut rows = Vec::new();
        for year in first..=last {
            rows.extend(self.read_year(year)?);
        }
        Ok(rows)
    }
}

impl RawRowSource for CsvRowSource {
    fn read_year(&self, year: i32) -> Result<Vec<RawRow>> {
        let path = self.year_path(year);
        if !path.exists() {
            return Err(NormalizeError::Config(format!(
                "no data file found for {}: {}",
                year,
                path.display()
            )));
        }
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut reader = csv::Reader::from_path(&path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let mut rows = Vec::new();
        for (index, record) in reader.records().enumerate() {
            let record = record?;
            let fields = headers
                .iter()
                .cloned()
                .zip(record.iter().map(|v| v.to_string()))
                .collect();
            rows.push(RawRow::new(
                RowProvenance {
                    source_year: year,
                    source_file: file_name.clone(),
                    row_index: index,
                },
                fields,
            ));
        }
        info!(year, rows = rows.len(), "loaded source rows");
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn reads_rows_with_provenance() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(format!("2002{}.csv", FILE_SUFFIX));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Date,Time,Type of Disturbance").unwrap();
        writeln!(file, "1/30/02,5:55 p.m.,Severe Weather").unwrap();
        writeln!(file, "2/12/02,NA,Equipment Failure").unwrap();
        drop(file);

        let source = CsvRowSource::new(dir.path());
        let rows = source.read_year(2002).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].provenance.row_id(), "2002:0");
        assert_eq!(rows[0].get("Date"), Some("1/30/02"));
        assert_eq!(rows[1].get("Time"), Some("NA"));
    }

    #[test]
    fn missing_year_file_is_an_input_error() {
        let dir = tempfile::tempdir().unwrap();
        let source = CsvRowSource::new(dir.path());
        let err = source.read_year(2003).unwrap_err();
        assert!(err.to_string().contains("2003"));
    }
}
