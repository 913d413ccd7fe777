use serde::{Deserialize, Serialize};

/// Where a raw row came from. Carried through normalization untouched so
/// every output record maps back to its source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowProvenance {
    pub source_year: i32,
    pub source_file: String,
    pub row_index: usize,
}

impl RowProvenance {
    /// Stable row identifier used in reports, e.g. `2002:17`.
    pub fn row_id(&self) -> String {
        format!("{}:{}", self.source_year, self.row_index)
    }
}

/// One source record prior to normalization: an ordered mapping from
/// source-specific column labels to raw cell text, plus provenance.
/// Read-only once constructed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawRow {
    pub provenance: RowProvenance,
    labels: Vec<String>,
    values: Vec<String>,
}

impl RawRow {
    pub fn new(provenance: RowProvenance, fields: Vec<(String, String)>) -> Self {
        let (labels, values) = fields.into_iter().unzip();
        Self {
            provenance,
            labels,
            values,
        }
    }

    /// Looks up a cell by exact column label.
    pub fn get(&self, label: &str) -> Option<&str> {
        self.labels
            .iter()
            .position(|l| l == label)
            .map(|i| self.values[i].as_str())
    }

    /// First label from `candidates` present in this row, with its value.
    /// Column names drift across years, so callers pass alias lists.
    pub fn first_of<'a>(&'a self, candidates: &[&str]) -> Option<(&'a str, &'a str)> {
        for candidate in candidates {
            if let Some(i) = self.labels.iter().position(|l| l == candidate) {
                return Some((self.labels[i].as_str(), self.values[i].as_str()));
            }
        }
        None
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> RawRow {
        RawRow::new(
            RowProvenance {
                source_year: 2002,
                source_file: "2002_Annual_Summary_Converted.csv".into(),
                row_index: 4,
            },
            vec![
                ("Date".into(), "1/30/02".into()),
                ("Time".into(), "5:55 p.m.".into()),
            ],
        )
    }

    #[test]
    fn lookup_by_alias_list_prefers_earlier_candidates() {
        let row = row();
        assert_eq!(row.first_of(&["Date", "Time"]).unwrap().1, "1/30/02");
        assert_eq!(row.first_of(&["Missing", "Time"]).unwrap().1, "5:55 p.m.");
    }

    #[test]
    fn exact_lookup_misses_unknown_labels() {
        let row = row();
        assert_eq!(row.get("Time"), Some("5:55 p.m."));
        assert_eq!(row.get("Loss (megawatts)"), None);
    }
}
