use std::path::Path;

use tracing::info;

use crate::batch::{RowIssueKind, RunReport};
use crate::error::Result;
use crate::normalizer::NormalizedRecord;

/// Column order of the normalized dataset. Provenance first so every
/// record maps back to its source row.
const DATASET_HEADER: &[&str] = &[
    "source_year",
    "source_file",
    "row_index",
    "start_datetime",
    "restored_datetime",
    "duration_minutes",
    "cause",
    "region",
    "area_affected",
    "utility_name",
    "demand_loss_mw",
    "customers_affected",
];

/// Writes the flat normalized dataset. Output is a pure function of the
/// records, so warm-cache re-runs produce byte-identical files.
pub fn write_dataset(path: &Path, records: &[NormalizedRecord]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(DATASET_HEADER)?;
    for record in records {
        writer.write_record(&[
            record.provenance.source_year.to_string(),
            record.provenance.source_file.clone(),
            record.provenance.row_index.to_string(),
            record.start_datetime.render(),
            record.restored_datetime.render(),
            record
                .duration_minutes
                .map(|m| m.to_string())
                .unwrap_or_default(),
            record.cause.render(),
            record.region.render(),
            record.area_affected.render(),
            record.utility_name.render(),
            record.demand_loss_mw.render(),
            record.customers_affected.render(),
        ])?;
    }
    writer.flush()?;
    info!(records = records.len(), path = %path.display(), "normalized dataset written");
    Ok(())
}

pub fn write_report(path: &Path, report: &RunReport) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    info!(path = %path.display(), "run report written");
    Ok(())
}

/// Console summary in the same spirit as the dataset's logs: terse
/// counts first, then the rows worth a human look.
pub fn print_summary(report: &RunReport) {
    println!("\n📊 Normalization results:");
    println!("   Total rows:      {}", report.total_rows);
    println!("   Success:         {}", report.success);
    println!("   Partial success: {}", report.partial_success);
    println!("   Failure:         {}", report.failure);
    println!("   Service calls:   {}", report.interpreter_calls);
    println!(
        "   Cache:           {} hits / {} misses",
        report.cache_hits, report.cache_misses
    );

    if !report.unprocessed.is_empty() {
        println!(
            "\n⚠️  Run cancelled with {} rows unprocessed (first: {})",
            report.unprocessed.len(),
            report.unprocessed[0]
        );
    }

    let failed: Vec<_> = report
        .issues
        .iter()
        .filter(|i| i.kind == RowIssueKind::Failed)
        .collect();
    if !failed.is_empty() {
        println!("\n⚠️  Failed rows:");
        for issue in failed {
            println!("   - {}: {}", issue.row_id, issue.reasons.join("; "));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raw::RowProvenance;
    use crate::schema::FieldValue;
    use chrono::NaiveDate;

    fn record() -> NormalizedRecord {
        NormalizedRecord {
            provenance: RowProvenance {
                source_year: 2005,
                source_file: "2005_Annual_Summary_Converted.csv".into(),
                row_index: 7,
            },
            start_datetime: FieldValue::Timestamp(
                NaiveDate::from_ymd_opt(2005, 1, 3)
                    .unwrap()
                    .and_hms_opt(14, 0, 0)
                    .unwrap(),
            ),
            restored_datetime: FieldValue::Unknown,
            cause: FieldValue::Category("Weather".into()),
            region: FieldValue::Category("WECC".into()),
            area_affected: FieldValue::Text("Northern California".into()),
            utility_name: FieldValue::Text("Pacific Gas & Electric".into()),
            demand_loss_mw: FieldValue::Count(300),
            customers_affected: FieldValue::Count(1_500_000),
            duration_minutes: None,
        }
    }

    #[test]
    fn dataset_renders_unknown_as_empty_cell_and_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("normalized.csv");
        write_dataset(&path, &[record()]).unwrap();
        let first = std::fs::read(&path).unwrap();

        let text = String::from_utf8(first.clone()).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next().unwrap(), DATASET_HEADER.join(","));
        let row = lines.next().unwrap();
        assert!(row.starts_with("2005,2005_Annual_Summary_Converted.csv,7,2005-01-03T14:00:00,,"));
        assert!(row.contains("1500000"));

        // Identical input produces byte-identical output
        write_dataset(&path, &[record()]).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), first);
    }

    #[test]
    fn report_round_trips_as_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        let report = RunReport {
            total_rows: 3,
            success: 2,
            partial_success: 0,
            failure: 1,
            unprocessed: vec![],
            issues: vec![],
            interpreter_calls: 4,
            cache_hits: 1,
            cache_misses: 3,
        };
        write_report(&path, &report).unwrap();
        let loaded: RunReport =
            serde_json::from_reader(std::fs::File::open(&path).unwrap()).unwrap();
        assert_eq!(loaded.total_rows, 3);
        assert_eq!(loaded.interpreter_calls, 4);
    }
}
