use std::sync::Arc;

use chrono::{NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::{fingerprint, InterpretationCache};
use crate::error::{NormalizeError, Result};
use crate::interpret::{GuardedInterpreter, InterpretOutcome, InterpretationContext};
use crate::parse::{self, ParseAttempt};
use crate::raw::{RawRow, RowProvenance};
use crate::schema::{self, FieldId, FieldValue, TypeDescriptor, SCHEMA};

/// Source-column labels for the clock-time component of the event start.
/// The start timestamp is assembled from separate date and time columns.
const TIME_LABELS: &[&str] = &["Time", "Time of Incident", "Time Event Began"];

/// How one field of one row was resolved. The original raw text rides
/// along for audit regardless of the path taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldResolution {
    pub field: FieldId,
    pub raw_text: Option<String>,
    pub state: ResolutionState,
}

/// Terminal states of the per-field state machine
/// (NotAttempted → DeterministicTried → Resolved | EscalatedToInterpreter
///  → Interpreted | Unresolved).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResolutionState {
    /// Deterministic parser recognized the input
    Deterministic(FieldValue),
    /// Fallback interpretation produced a conformant value
    Interpreted { value: FieldValue, confidence: f64 },
    /// Both paths failed; the record slot holds the Unknown marker
    Unresolved { reason: String },
}

impl ResolutionState {
    pub fn is_resolved(&self) -> bool {
        !matches!(self, ResolutionState::Unresolved { .. })
    }

    fn value(&self) -> FieldValue {
        match self {
            ResolutionState::Deterministic(v) => v.clone(),
            ResolutionState::Interpreted { value, .. } => value.clone(),
            ResolutionState::Unresolved { .. } => FieldValue::Unknown,
        }
    }
}

/// The target schema instance. Every slot is a conforming typed value or
/// the explicit Unknown marker; raw source text never lands here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub provenance: RowProvenance,
    pub start_datetime: FieldValue,
    pub restored_datetime: FieldValue,
    pub cause: FieldValue,
    pub region: FieldValue,
    pub area_affected: FieldValue,
    pub utility_name: FieldValue,
    pub demand_loss_mw: FieldValue,
    pub customers_affected: FieldValue,
    /// Derived from start and restored timestamps when both resolve
    pub duration_minutes: Option<i64>,
}

impl NormalizedRecord {
    pub fn field(&self, id: FieldId) -> &FieldValue {
        match id {
            FieldId::StartDatetime => &self.start_datetime,
            FieldId::RestoredDatetime => &self.restored_datetime,
            FieldId::Cause => &self.cause,
            FieldId::Region => &self.region,
            FieldId::AreaAffected => &self.area_affected,
            FieldId::UtilityName => &self.utility_name,
            FieldId::DemandLossMw => &self.demand_loss_mw,
            FieldId::CustomersAffected => &self.customers_affected,
        }
    }
}

/// Per-row result, owned in aggregate by the batch orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RowOutcome {
    Success {
        record: NormalizedRecord,
        resolutions: Vec<FieldResolution>,
    },
    PartialSuccess {
        record: NormalizedRecord,
        resolutions: Vec<FieldResolution>,
        unresolved: Vec<FieldId>,
    },
    Failure {
        reasons: Vec<String>,
    },
}

/// Orchestrates normalization of one row: deterministic parsers first,
/// cache-backed interpretation as fallback, then record assembly and
/// validation. Holds no cross-row state beyond the injected cache.
pub struct RowNormalizer {
    interpreter: Arc<GuardedInterpreter>,
    cache: Arc<InterpretationCache>,
    min_resolved_fields: usize,
}

impl RowNormalizer {
    pub fn new(
        interpreter: Arc<GuardedInterpreter>,
        cache: Arc<InterpretationCache>,
        min_resolved_fields: usize,
    ) -> Self {
        Self {
            interpreter,
            cache,
            min_resolved_fields,
        }
    }

    /// Errors here are fatal batch-level conditions only (cache store
    /// unwritable); every field- and row-level problem is folded into
    /// the returned outcome.
    pub async fn normalize_row(&self, row: &RawRow) -> Result<RowOutcome> {
        let mut context = InterpretationContext {
            source_year: Some(row.provenance.source_year),
            ..Default::default()
        };
        let mut resolutions: Vec<FieldResolution> = Vec::new();

        // Context-providing fields resolve first: the event date anchors
        // year-less phrases like "6:00 a.m. June 2" in later fields.
        let start = self.resolve_start(row, &mut context).await?;
        if let ResolutionState::Deterministic(FieldValue::Timestamp(ts))
        | ResolutionState::Interpreted {
            value: FieldValue::Timestamp(ts),
            ..
        } = &start.state
        {
            context.event_start = Some(*ts);
            context.event_date = Some(ts.date());
        }
        resolutions.push(start);

        resolutions.push(self.resolve_restored(row, &context).await?);

        // Region and utility share a source column in the older filings
        let (utility, region) = self.resolve_utility_and_region(row);
        resolutions.push(region);
        resolutions.push(utility);

        for (field, required_na_reason) in [
            (FieldId::Cause, "cause is not stated in the source"),
            (FieldId::AreaAffected, ""),
            (FieldId::DemandLossMw, ""),
            (FieldId::CustomersAffected, "count is marked unavailable in the source"),
        ] {
            resolutions.push(
                self.resolve_simple(row, field, required_na_reason, &context)
                    .await?,
            );
        }

        Ok(self.assemble(row, resolutions))
    }

    /// Escalation path shared by every field: fingerprint, consult the
    /// cache, interpret on a miss, validate whatever comes back.
    async fn escalate(
        &self,
        field: FieldId,
        raw: &str,
        descriptor: &TypeDescriptor,
        context: &InterpretationContext,
    ) -> Result<ResolutionState> {
        let fp = fingerprint(raw, descriptor);
        let outcome = self
            .cache
            .get_or_interpret(&fp, raw, descriptor, || {
                self.interpreter.interpret(raw, descriptor, context)
            })
            .await?;
        debug!(field = field.name(), raw, "escalated to interpreter");
        Ok(match outcome {
            InterpretOutcome::Resolved(interp) => {
                match schema::validate(descriptor, &interp.value) {
                    Ok(()) => ResolutionState::Interpreted {
                        value: interp.value,
                        confidence: interp.confidence,
                    },
                    Err(reason) => ResolutionState::Unresolved {
                        reason: NormalizeError::SchemaValidation {
                            field: field.name().to_string(),
                            reason,
                        }
                        .to_string(),
                    },
                }
            }
            InterpretOutcome::CannotResolve { reason } => ResolutionState::Unresolved { reason },
        })
    }

    /// The start timestamp is assembled from the date and time columns.
    /// Each component parses deterministically where possible and
    /// escalates on its own; the combined resolution is deterministic
    /// only if both components were.
    async fn resolve_start(
        &self,
        row: &RawRow,
        context: &mut InterpretationContext,
    ) -> Result<FieldResolution> {
        let spec = schema::field_spec(FieldId::StartDatetime);
        let date_raw = row.first_of(spec.source_labels).map(|(_, v)| v.to_string());
        let time_raw = row.first_of(TIME_LABELS).map(|(_, v)| v.to_string());
        let audit = [date_raw.as_deref(), time_raw.as_deref()]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(" ");

        let date_state = match date_raw.as_deref() {
            None => ResolutionState::Unresolved {
                reason: "no date column present".to_string(),
            },
            Some(raw) => match parse::parse_field(&TypeDescriptor::Date, raw) {
                ParseAttempt::Parsed(v) => ResolutionState::Deterministic(v),
                ParseAttempt::Na => ResolutionState::Unresolved {
                    reason: "date is marked unavailable in the source".to_string(),
                },
                // With no separate time column, the prose may carry the
                // whole moment ("Jan 3, 2005, around 2pm"): interpret it
                // as a full timestamp in one step.
                ParseAttempt::NotApplicable if time_raw.is_none() => {
                    let state = self
                        .escalate(
                            FieldId::StartDatetime,
                            raw,
                            &TypeDescriptor::Timestamp,
                            context,
                        )
                        .await?;
                    return Ok(FieldResolution {
                        field: FieldId::StartDatetime,
                        raw_text: Some(audit),
                        state,
                    });
                }
                ParseAttempt::NotApplicable => {
                    self.escalate(FieldId::StartDatetime, raw, &TypeDescriptor::Date, context)
                        .await?
                }
            },
        };

        let date = match &date_state {
            ResolutionState::Deterministic(FieldValue::Date(d))
            | ResolutionState::Interpreted {
                value: FieldValue::Date(d),
                ..
            } => *d,
            ResolutionState::Unresolved { reason } => {
                return Ok(FieldResolution {
                    field: FieldId::StartDatetime,
                    raw_text: Some(audit),
                    state: ResolutionState::Unresolved {
                        reason: reason.clone(),
                    },
                })
            }
            _ => unreachable!("date escalation is constrained to Date values"),
        };
        context.event_date = Some(date);

        // A missing time means the outage began at an unreported moment
        // of a known day; midnight is the dataset's convention.
        let time_state = match time_raw.as_deref() {
            None => ResolutionState::Deterministic(FieldValue::Time(midnight())),
            Some(raw) => match parse::parse_field(&TypeDescriptor::Time, raw) {
                ParseAttempt::Parsed(v) => ResolutionState::Deterministic(v),
                ParseAttempt::Na => ResolutionState::Deterministic(FieldValue::Time(midnight())),
                ParseAttempt::NotApplicable => {
                    self.escalate(FieldId::StartDatetime, raw, &TypeDescriptor::Time, context)
                        .await?
                }
            },
        };

        let state = match (&date_state, &time_state) {
            (_, ResolutionState::Unresolved { reason }) => ResolutionState::Unresolved {
                reason: reason.clone(),
            },
            (date_st, time_st) => {
                let time = match time_st.value() {
                    FieldValue::Time(t) => t,
                    _ => unreachable!("time escalation is constrained to Time values"),
                };
                let ts = FieldValue::Timestamp(NaiveDateTime::new(date, time));
                match (date_st, time_st) {
                    (ResolutionState::Deterministic(_), ResolutionState::Deterministic(_)) => {
                        ResolutionState::Deterministic(ts)
                    }
                    _ => ResolutionState::Interpreted {
                        value: ts,
                        confidence: component_confidence(date_st).min(component_confidence(time_st)),
                    },
                }
            }
        };

        Ok(FieldResolution {
            field: FieldId::StartDatetime,
            raw_text: Some(audit),
            state,
        })
    }

    /// Restoration time is the messiest source field; prose like
    /// "6:00 a.m. June 2" needs the event start as disambiguating
    /// context. It is optional: an explicit NA resolves to Unknown.
    async fn resolve_restored(
        &self,
        row: &RawRow,
        context: &InterpretationContext,
    ) -> Result<FieldResolution> {
        let spec = schema::field_spec(FieldId::RestoredDatetime);
        let raw = row.first_of(spec.source_labels).map(|(_, v)| v.to_string());
        let state = match raw.as_deref() {
            None => ResolutionState::Deterministic(FieldValue::Unknown),
            Some(text) => match parse::parse_field(&spec.descriptor, text) {
                ParseAttempt::Parsed(v) => match schema::validate(&spec.descriptor, &v) {
                    Ok(()) => ResolutionState::Deterministic(v),
                    Err(reason) => ResolutionState::Unresolved { reason },
                },
                ParseAttempt::Na => ResolutionState::Deterministic(FieldValue::Unknown),
                ParseAttempt::NotApplicable => {
                    self.escalate(FieldId::RestoredDatetime, text, &spec.descriptor, context)
                        .await?
                }
            },
        };
        Ok(FieldResolution {
            field: FieldId::RestoredDatetime,
            raw_text: raw,
            state,
        })
    }

    /// Older filings carry one "Utility/Power Pool (NERC Council)"
    /// column with the region parenthesized; newer ones a dedicated
    /// "NERC Region" column. Both paths are deterministic.
    fn resolve_utility_and_region(&self, row: &RawRow) -> (FieldResolution, FieldResolution) {
        if let Some((_, region_raw)) = row.first_of(&["NERC Region"]) {
            let region_state = match parse::parse_field(
                &schema::field_spec(FieldId::Region).descriptor,
                region_raw,
            ) {
                ParseAttempt::Parsed(v) => ResolutionState::Deterministic(v),
                ParseAttempt::Na => ResolutionState::Deterministic(FieldValue::Unknown),
                ParseAttempt::NotApplicable => ResolutionState::Unresolved {
                    reason: format!("'{}' is not a recognized NERC region", region_raw),
                },
            };
            let utility = row
                .first_of(&["Utility", "Entity"])
                .map(|(_, v)| v.to_string());
            let utility_state = match utility.as_deref() {
                Some(text) if !parse::is_na_value(text) => {
                    ResolutionState::Deterministic(FieldValue::Text(text.trim().to_string()))
                }
                _ => ResolutionState::Deterministic(FieldValue::Unknown),
            };
            return (
                FieldResolution {
                    field: FieldId::UtilityName,
                    raw_text: utility,
                    state: utility_state,
                },
                FieldResolution {
                    field: FieldId::Region,
                    raw_text: Some(region_raw.to_string()),
                    state: region_state,
                },
            );
        }

        let raw = row
            .first_of(&["Utility/Power Pool (NERC Council)", "Utility", "Entity"])
            .map(|(_, v)| v.to_string());
        let (utility_state, region_state) = match raw.as_deref() {
            None => (
                ResolutionState::Deterministic(FieldValue::Unknown),
                ResolutionState::Deterministic(FieldValue::Unknown),
            ),
            Some(text) if parse::is_na_value(text) => (
                ResolutionState::Deterministic(FieldValue::Unknown),
                ResolutionState::Deterministic(FieldValue::Unknown),
            ),
            Some(text) => {
                let (name, region) = parse::split_region_suffix(text);
                let region_state = match region {
                    Some(code) => match parse::parse_category(
                        crate::schema::CategorySet::NercRegion,
                        &code,
                    ) {
                        ParseAttempt::Parsed(v) => ResolutionState::Deterministic(v),
                        _ => ResolutionState::Deterministic(FieldValue::Unknown),
                    },
                    None => ResolutionState::Deterministic(FieldValue::Unknown),
                };
                (
                    ResolutionState::Deterministic(FieldValue::Text(name)),
                    region_state,
                )
            }
        };
        (
            FieldResolution {
                field: FieldId::UtilityName,
                raw_text: raw.clone(),
                state: utility_state,
            },
            FieldResolution {
                field: FieldId::Region,
                raw_text: raw,
                state: region_state,
            },
        )
    }

    /// Fields that map one source column to one target slot.
    async fn resolve_simple(
        &self,
        row: &RawRow,
        field: FieldId,
        required_na_reason: &str,
        context: &InterpretationContext,
    ) -> Result<FieldResolution> {
        let spec = schema::field_spec(field);
        let raw = row.first_of(spec.source_labels).map(|(_, v)| v.to_string());
        let state = match raw.as_deref() {
            None if spec.required => ResolutionState::Unresolved {
                reason: format!("row has no column for required field '{}'", field.name()),
            },
            None => ResolutionState::Deterministic(FieldValue::Unknown),
            Some(text) => match parse::parse_field(&spec.descriptor, text) {
                ParseAttempt::Parsed(v) => ResolutionState::Deterministic(v),
                // Explicit NA: required fields flag it, optional fields
                // take the Unknown marker. Never a silent default.
                ParseAttempt::Na if spec.required => ResolutionState::Unresolved {
                    reason: required_na_reason.to_string(),
                },
                ParseAttempt::Na => ResolutionState::Deterministic(FieldValue::Unknown),
                ParseAttempt::NotApplicable => {
                    self.escalate(field, text, &spec.descriptor, context).await?
                }
            },
        };
        Ok(FieldResolution {
            field,
            raw_text: raw,
            state,
        })
    }

    /// Assembles the candidate record, applies record-level validation,
    /// and classifies the outcome.
    fn assemble(&self, row: &RawRow, resolutions: Vec<FieldResolution>) -> RowOutcome {
        let value_of = |id: FieldId| -> FieldValue {
            resolutions
                .iter()
                .find(|r| r.field == id)
                .map(|r| r.state.value())
                .unwrap_or(FieldValue::Unknown)
        };

        let start_datetime = value_of(FieldId::StartDatetime);
        let restored_datetime = value_of(FieldId::RestoredDatetime);

        let mut reasons: Vec<String> = Vec::new();
        let duration_minutes = match (&start_datetime, &restored_datetime) {
            (FieldValue::Timestamp(start), FieldValue::Timestamp(restored)) => {
                let minutes = (*restored - *start).num_minutes();
                if minutes < 0 {
                    // Contradictory source data: surfaced, never corrected
                    reasons.push(format!(
                        "restored timestamp {} precedes start {}",
                        restored, start
                    ));
                    None
                } else {
                    Some(minutes)
                }
            }
            _ => None,
        };

        let record = NormalizedRecord {
            provenance: row.provenance.clone(),
            start_datetime,
            restored_datetime,
            cause: value_of(FieldId::Cause),
            region: value_of(FieldId::Region),
            area_affected: value_of(FieldId::AreaAffected),
            utility_name: value_of(FieldId::UtilityName),
            demand_loss_mw: value_of(FieldId::DemandLossMw),
            customers_affected: value_of(FieldId::CustomersAffected),
            duration_minutes,
        };

        // Field-level validation of the assembled record; resolution
        // already validated interpreted values, this catches the rest.
        for spec in SCHEMA {
            if let Err(reason) = schema::validate(&spec.descriptor, record.field(spec.id)) {
                reasons.push(format!("{}: {}", spec.id.name(), reason));
            }
        }

        if !reasons.is_empty() {
            for resolution in &resolutions {
                if let ResolutionState::Unresolved { reason } = &resolution.state {
                    reasons.push(format!("{}: {}", resolution.field.name(), reason));
                }
            }
            return RowOutcome::Failure { reasons };
        }

        let unresolved_required: Vec<&FieldResolution> = resolutions
            .iter()
            .filter(|r| schema::field_spec(r.field).required && !r.state.is_resolved())
            .collect();

        if unresolved_required.is_empty() {
            return RowOutcome::Success {
                record,
                resolutions,
            };
        }

        let resolved_required = SCHEMA
            .iter()
            .filter(|spec| spec.required)
            .filter(|spec| {
                resolutions
                    .iter()
                    .any(|r| r.field == spec.id && r.state.is_resolved())
            })
            .count();

        if resolved_required >= self.min_resolved_fields {
            let unresolved = unresolved_required.iter().map(|r| r.field).collect();
            RowOutcome::PartialSuccess {
                record,
                resolutions,
                unresolved,
            }
        } else {
            RowOutcome::Failure {
                reasons: resolutions
                    .iter()
                    .filter_map(|r| match &r.state {
                        ResolutionState::Unresolved { reason } => {
                            Some(format!("{}: {}", r.field.name(), reason))
                        }
                        _ => None,
                    })
                    .collect(),
            }
        }
    }
}

fn midnight() -> NaiveTime {
    NaiveTime::from_hms_opt(0, 0, 0).expect("midnight is a valid time")
}

fn component_confidence(state: &ResolutionState) -> f64 {
    match state {
        ResolutionState::Deterministic(_) => 1.0,
        ResolutionState::Interpreted { confidence, .. } => *confidence,
        ResolutionState::Unresolved { .. } => 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::{InterpretationContext, InterpreterPort, RawInterpretation};
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Interpreter double: answers from a lookup table keyed on raw
    /// text, counting every call.
    struct TableInterpreter {
        answers: Vec<(&'static str, serde_json::Value)>,
        calls: AtomicUsize,
    }

    impl TableInterpreter {
        fn new(answers: Vec<(&'static str, serde_json::Value)>) -> Self {
            Self {
                answers,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl InterpreterPort for TableInterpreter {
        async fn interpret(
            &self,
            raw_text: &str,
            _descriptor: &TypeDescriptor,
            _context: &InterpretationContext,
        ) -> crate::error::Result<RawInterpretation> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let value = self
                .answers
                .iter()
                .find(|(k, _)| *k == raw_text)
                .map(|(_, v)| v.clone())
                .unwrap_or(json!(null));
            Ok(RawInterpretation {
                value,
                confidence: Some(0.92),
            })
        }
    }

    fn normalizer(
        answers: Vec<(&'static str, serde_json::Value)>,
    ) -> (RowNormalizer, Arc<GuardedInterpreter>) {
        let port = Arc::new(TableInterpreter::new(answers));
        let guard = Arc::new(GuardedInterpreter::new(port, 1));
        let cache = Arc::new(InterpretationCache::in_memory());
        (
            RowNormalizer::new(guard.clone(), cache, 2),
            guard,
        )
    }

    fn row(fields: Vec<(&str, &str)>) -> RawRow {
        RawRow::new(
            RowProvenance {
                source_year: 2005,
                source_file: "2005_Annual_Summary_Converted.csv".into(),
                row_index: 0,
            },
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn clean_row() -> RawRow {
        row(vec![
            ("Date", "1/3/05"),
            ("Time", "2:00 p.m."),
            ("Restoration Time", "NA"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "Pacific Gas & Electric (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "1,500,000"),
        ])
    }

    #[tokio::test]
    async fn fully_deterministic_row_never_calls_the_interpreter() {
        let (normalizer, guard) = normalizer(vec![]);
        let outcome = normalizer.normalize_row(&clean_row()).await.unwrap();
        match outcome {
            RowOutcome::Success { record, resolutions } => {
                assert_eq!(
                    record.start_datetime,
                    FieldValue::Timestamp(
                        NaiveDate::from_ymd_opt(2005, 1, 3)
                            .unwrap()
                            .and_hms_opt(14, 0, 0)
                            .unwrap()
                    )
                );
                assert_eq!(record.cause, FieldValue::Category("Weather".into()));
                assert_eq!(record.region, FieldValue::Category("WECC".into()));
                assert_eq!(
                    record.utility_name,
                    FieldValue::Text("Pacific Gas & Electric".into())
                );
                assert_eq!(record.customers_affected, FieldValue::Count(1_500_000));
                assert_eq!(record.restored_datetime, FieldValue::Unknown);
                assert!(resolutions
                    .iter()
                    .all(|r| matches!(r.state, ResolutionState::Deterministic(_))));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(guard.calls(), 0);
    }

    #[tokio::test]
    async fn prose_time_escalates_once_and_lands_in_the_timestamp() {
        let (normalizer, guard) = normalizer(vec![("around 2pm", json!("14:00:00"))]);
        // Same row as the clean one, but with a prose time the
        // deterministic parser rejects
        let fields = row(vec![
            ("Date", "1/3/05"),
            ("Time", "around 2pm"),
            ("Restoration Time", "NA"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "Pacific Gas & Electric (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "1,500,000"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::Success { record, resolutions } => {
                assert_eq!(
                    record.start_datetime,
                    FieldValue::Timestamp(
                        NaiveDate::from_ymd_opt(2005, 1, 3)
                            .unwrap()
                            .and_hms_opt(14, 0, 0)
                            .unwrap()
                    )
                );
                let start = resolutions
                    .iter()
                    .find(|r| r.field == FieldId::StartDatetime)
                    .unwrap();
                assert!(matches!(
                    start.state,
                    ResolutionState::Interpreted { .. }
                ));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(guard.calls(), 1);
    }

    #[tokio::test]
    async fn unresolvable_required_count_yields_partial_success() {
        // "several thousand" defies both paths (table answers null)
        let (normalizer, guard) = normalizer(vec![]);
        let fields = row(vec![
            ("Date", "1/3/05"),
            ("Time", "2:00 p.m."),
            ("Restoration Time", "NA"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "PG&E (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "several thousand"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::PartialSuccess {
                record, unresolved, ..
            } => {
                assert_eq!(unresolved, vec![FieldId::CustomersAffected]);
                // Never a silent default value
                assert_eq!(record.customers_affected, FieldValue::Unknown);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(guard.calls(), 1);
    }

    #[tokio::test]
    async fn below_threshold_rows_fail_with_reasons() {
        let (normalizer, _) = normalizer(vec![]);
        let fields = row(vec![
            ("Date", "NA"),
            ("Time", "NA"),
            ("Type of Disturbance", "mystery"),
            ("Number of Customers Affected", "NA"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::Failure { reasons } => {
                assert!(!reasons.is_empty());
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn restored_before_start_is_a_record_level_failure() {
        let (normalizer, _) = normalizer(vec![(
            "11:00 p.m. January 2",
            json!("2005-01-02T23:00:00"),
        )]);
        let fields = row(vec![
            ("Date", "1/3/05"),
            ("Time", "2:00 p.m."),
            ("Restoration Time", "11:00 p.m. January 2"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "PG&E (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "1,500,000"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::Failure { reasons } => {
                assert!(reasons.iter().any(|r| r.contains("precedes start")));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn duration_is_derived_when_both_timestamps_resolve() {
        let (normalizer, _) = normalizer(vec![(
            "6:00 a.m. January 4",
            json!("2005-01-04T06:00:00"),
        )]);
        let fields = row(vec![
            ("Date", "1/3/05"),
            ("Time", "2:00 p.m."),
            ("Restoration Time", "6:00 a.m. January 4"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "PG&E (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "1,500,000"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::Success { record, .. } => {
                assert_eq!(record.duration_minutes, Some(16 * 60));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn repeated_raw_text_is_served_from_cache_within_a_run() {
        let (normalizer, guard) = normalizer(vec![("around 2pm", json!("14:00:00"))]);
        let fields = row(vec![
            ("Date", "1/3/05"),
            ("Time", "around 2pm"),
            ("Restoration Time", "NA"),
            ("Type of Disturbance", "Severe Weather"),
            ("Utility/Power Pool (NERC Council)", "PG&E (WECC)"),
            ("Area", "Northern California"),
            ("Loss (megawatts)", "300"),
            ("Number of Customers Affected", "1,500,000"),
        ]);
        for _ in 0..3 {
            normalizer.normalize_row(&fields).await.unwrap();
        }
        assert_eq!(guard.calls(), 1);
    }

    #[tokio::test]
    async fn newer_layout_with_dedicated_region_column() {
        let (normalizer, guard) = normalizer(vec![]);
        let fields = row(vec![
            ("Date", "2015-06-12"),
            ("Time", "08:30"),
            ("Restoration Time", "2015-06-12 11:00:00"),
            ("Event Type", "Vandalism"),
            ("NERC Region", "SERC"),
            ("Utility", "Duke Energy"),
            ("Area Affected", "Western North Carolina"),
            ("Demand Loss (MW)", "75"),
            ("Customers Affected", "41,000"),
        ]);
        let outcome = normalizer.normalize_row(&fields).await.unwrap();
        match outcome {
            RowOutcome::Success { record, .. } => {
                assert_eq!(record.region, FieldValue::Category("SERC".into()));
                assert_eq!(record.utility_name, FieldValue::Text("Duke Energy".into()));
                assert_eq!(record.duration_minutes, Some(150));
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(guard.calls(), 0);
    }
}
