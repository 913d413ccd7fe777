use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::cache::CacheStats;
use crate::error::Result;
use crate::normalizer::{NormalizedRecord, ResolutionState, RowNormalizer, RowOutcome};
use crate::raw::{RawRow, RowProvenance};

/// Cooperative stop signal. Once cancelled, no further rows are
/// dispatched; rows already in flight drain normally.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Accounting entry for a non-Success row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowIssue {
    pub row_id: String,
    pub kind: RowIssueKind,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowIssueKind {
    Partial,
    Failed,
}

/// Structured run report emitted alongside the normalized dataset.
/// A completed run always yields one, however many rows failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub total_rows: usize,
    pub success: usize,
    pub partial_success: usize,
    pub failure: usize,
    /// Rows never dispatched because the run was cancelled
    pub unprocessed: Vec<String>,
    pub issues: Vec<RowIssue>,
    pub interpreter_calls: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Everything a batch run produces.
pub struct BatchResult {
    /// Success and PartialSuccess records, ordered by provenance
    pub records: Vec<NormalizedRecord>,
    pub outcomes: Vec<(RowProvenance, RowOutcome)>,
    pub report: RunReport,
}

/// Drives normalization across a whole dataset. Rows are independent,
/// so they run as concurrent tasks bounded by a semaphore; the shared
/// cache is the only cross-row state. A row failure is an accounting
/// entry, never a batch abort.
pub struct BatchOrchestrator {
    normalizer: Arc<RowNormalizer>,
    concurrency: usize,
}

impl BatchOrchestrator {
    pub fn new(normalizer: Arc<RowNormalizer>, concurrency: usize) -> Self {
        Self {
            normalizer,
            concurrency: concurrency.max(1),
        }
    }

    pub async fn run(
        &self,
        rows: Vec<RawRow>,
        cancel: &CancelToken,
        cache_stats: impl Fn() -> CacheStats,
        interpreter_calls: impl Fn() -> u64,
    ) -> Result<BatchResult> {
        let total_rows = rows.len();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut handles = Vec::new();
        let mut unprocessed = Vec::new();

        for row in rows {
            if cancel.is_cancelled() {
                unprocessed.push(row.provenance.row_id());
                continue;
            }
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore never closed");
            let normalizer = self.normalizer.clone();
            let provenance = row.provenance.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                normalizer.normalize_row(&row).await
            });
            handles.push((provenance, handle));
        }

        if !unprocessed.is_empty() {
            warn!(
                remaining = unprocessed.len(),
                "run cancelled; draining in-flight rows"
            );
        }

        let mut outcomes: Vec<(RowProvenance, RowOutcome)> = Vec::new();
        let mut fatal: Option<crate::error::NormalizeError> = None;
        for (provenance, handle) in handles {
            match handle.await {
                Ok(Ok(outcome)) => outcomes.push((provenance, outcome)),
                // Fatal (cache store unwritable); finish draining so no
                // in-flight work is lost silently, then surface it
                Ok(Err(e)) if fatal.is_none() => fatal = Some(e),
                Ok(Err(_)) => {}
                // A panicked row task is a row failure, not a batch abort
                Err(join_err) => {
                    warn!(row = %provenance.row_id(), error = %join_err, "row task aborted");
                    outcomes.push((
                        provenance,
                        RowOutcome::Failure {
                            reasons: vec![format!("row task aborted: {}", join_err)],
                        },
                    ));
                }
            }
        }
        if let Some(e) = fatal {
            return Err(e);
        }

        // Stable mapping back to source provenance
        outcomes.sort_by_key(|(p, _)| (p.source_year, p.row_index));

        let mut records = Vec::new();
        let mut issues = Vec::new();
        let (mut success, mut partial, mut failure) = (0usize, 0usize, 0usize);
        for (provenance, outcome) in &outcomes {
            match outcome {
                RowOutcome::Success { record, .. } => {
                    success += 1;
                    records.push(record.clone());
                }
                RowOutcome::PartialSuccess {
                    record, resolutions, ..
                } => {
                    partial += 1;
                    records.push(record.clone());
                    // Carry the underlying reason for every unresolved
                    // field, not just its name
                    issues.push(RowIssue {
                        row_id: provenance.row_id(),
                        kind: RowIssueKind::Partial,
                        reasons: resolutions
                            .iter()
                            .filter_map(|r| match &r.state {
                                ResolutionState::Unresolved { reason } => {
                                    Some(format!("{}: {}", r.field.name(), reason))
                                }
                                _ => None,
                            })
                            .collect(),
                    });
                }
                RowOutcome::Failure { reasons } => {
                    failure += 1;
                    issues.push(RowIssue {
                        row_id: provenance.row_id(),
                        kind: RowIssueKind::Failed,
                        reasons: reasons.clone(),
                    });
                }
            }
        }

        let stats = cache_stats();
        let report = RunReport {
            total_rows,
            success,
            partial_success: partial,
            failure,
            unprocessed,
            issues,
            interpreter_calls: interpreter_calls(),
            cache_hits: stats.hits,
            cache_misses: stats.misses,
        };
        info!(
            total = report.total_rows,
            success = report.success,
            partial = report.partial_success,
            failure = report.failure,
            calls = report.interpreter_calls,
            "batch run complete"
        );

        Ok(BatchResult {
            records,
            outcomes,
            report,
        })
    }
}
