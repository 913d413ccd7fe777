pub mod openai;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{NormalizeError, Result};
use crate::schema::{FieldValue, TypeDescriptor};

/// Already-resolved fields passed along to disambiguate prose, e.g. a
/// known event date to anchor "6:00 a.m. June 2".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterpretationContext {
    pub source_year: Option<i32>,
    pub event_date: Option<NaiveDate>,
    pub event_start: Option<NaiveDateTime>,
}

impl InterpretationContext {
    pub fn render(&self) -> String {
        let mut lines = Vec::new();
        if let Some(year) = self.source_year {
            lines.push(format!("Source year: {}", year));
        }
        if let Some(date) = self.event_date {
            lines.push(format!("Event date: {}", date.format("%Y-%m-%d")));
        }
        if let Some(start) = self.event_start {
            lines.push(format!(
                "Event start: {}",
                start.format("%Y-%m-%dT%H:%M:%S")
            ));
        }
        lines.join("\n")
    }
}

/// Wire-level response from the service, prior to conformance checking.
/// `value` is whatever JSON the service produced for the requested slot;
/// null signals the service could not resolve the text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawInterpretation {
    pub value: serde_json::Value,
    pub confidence: Option<f64>,
}

/// A conformant structured interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interpretation {
    pub value: FieldValue,
    pub confidence: f64,
}

/// Terminal outcome of one guarded interpretation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum InterpretOutcome {
    Resolved(Interpretation),
    CannotResolve { reason: String },
}

/// The abstract text-to-structured-data capability. Anything that can
/// honor the requested-structure contract can implement this.
#[async_trait]
pub trait InterpreterPort: Send + Sync {
    async fn interpret(
        &self,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        context: &InterpretationContext,
    ) -> Result<RawInterpretation>;
}

/// Interpreted results at or above this confidence skip human review.
pub const HIGH_CONFIDENCE: f64 = 0.9;

/// Cap applied to free-English date/time phrases that carry no explicit
/// clock or calendar cues, keeping them below [`HIGH_CONFIDENCE`].
const UNCUED_DATETIME_CAP: f64 = 0.85;

/// Pure backoff schedule: 500ms doubling per attempt, capped at 8s.
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 500u64.saturating_mul(1 << attempt.min(4));
    Duration::from_millis(millis.min(8_000))
}

/// Wraps an [`InterpreterPort`] with the response contract: conformance
/// validation with a single retry, bounded backoff on transient service
/// failures, and the confidence policy. Exhausting either bound yields
/// `CannotResolve`, never an error that could abort a row.
pub struct GuardedInterpreter {
    port: Arc<dyn InterpreterPort>,
    max_retries: u32,
    calls: AtomicU64,
}

impl GuardedInterpreter {
    pub fn new(port: Arc<dyn InterpreterPort>, max_retries: u32) -> Self {
        Self {
            port,
            max_retries,
            calls: AtomicU64::new(0),
        }
    }

    /// Total service requests issued, including conformance retries.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }

    pub async fn interpret(
        &self,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        context: &InterpretationContext,
    ) -> InterpretOutcome {
        // One conformance retry: a second non-conforming response is
        // terminal, bounding cost and latency.
        for conformance_attempt in 0..2 {
            let raw = match self.call_with_backoff(raw_text, descriptor, context).await {
                Ok(raw) => raw,
                Err(e) => {
                    warn!(error = %e, "interpretation service exhausted retries");
                    return InterpretOutcome::CannotResolve {
                        reason: format!("service failure: {}", e),
                    };
                }
            };

            if raw.value.is_null() {
                return InterpretOutcome::CannotResolve {
                    reason: "service reported the text as unresolvable".to_string(),
                };
            }

            match conform(descriptor, &raw.value) {
                Ok(value) => {
                    let confidence = self.assess_confidence(raw_text, descriptor, raw.confidence);
                    debug!(raw_text, confidence, "interpretation conformed");
                    return InterpretOutcome::Resolved(Interpretation { value, confidence });
                }
                Err(reason) if conformance_attempt == 0 => {
                    warn!(raw_text, %reason, "non-conformant response, retrying once");
                }
                Err(reason) => {
                    return InterpretOutcome::CannotResolve {
                        reason: format!("non-conformant after retry: {}", reason),
                    };
                }
            }
        }
        unreachable!("conformance loop always returns")
    }

    async fn call_with_backoff(
        &self,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        context: &InterpretationContext,
    ) -> Result<RawInterpretation> {
        let mut attempt = 0u32;
        loop {
            self.calls.fetch_add(1, Ordering::Relaxed);
            match self.port.interpret(raw_text, descriptor, context).await {
                Ok(raw) => return Ok(raw),
                Err(e) if attempt < self.max_retries => {
                    let delay = backoff_delay(attempt);
                    warn!(error = %e, attempt, ?delay, "transient interpretation failure");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn assess_confidence(
        &self,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        reported: Option<f64>,
    ) -> f64 {
        let reported = reported.unwrap_or(0.5).clamp(0.0, 1.0);
        let is_temporal = matches!(
            descriptor,
            TypeDescriptor::Timestamp | TypeDescriptor::Date | TypeDescriptor::Time
        );
        if is_temporal && !has_certainty_cues(raw_text) {
            reported.min(UNCUED_DATETIME_CAP)
        } else {
            reported
        }
    }
}

/// Does a date/time phrase carry explicit cues (a clock reading or a
/// numeric day), as opposed to pure prose like "early morning"?
fn has_certainty_cues(raw_text: &str) -> bool {
    let lower = raw_text.to_ascii_lowercase();
    let has_clock = lower.contains(':');
    let has_meridiem = lower.contains("a.m") || lower.contains("p.m");
    let has_digits = lower.chars().any(|c| c.is_ascii_digit());
    has_digits && (has_clock || has_meridiem)
}

fn non_conformant(msg: impl Into<String>) -> NormalizeError {
    NormalizeError::NonConformant(msg.into())
}

/// Validates a service payload against the requested type descriptor,
/// producing the typed value or the reason it does not conform.
pub fn conform(descriptor: &TypeDescriptor, value: &serde_json::Value) -> Result<FieldValue> {
    match descriptor {
        TypeDescriptor::Timestamp => {
            let s = value
                .as_str()
                .ok_or_else(|| non_conformant("expected an ISO 8601 datetime string"))?;
            let ts = NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S")
                .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
                .map_err(|e| non_conformant(format!("'{}' is not ISO 8601: {}", s, e)))?;
            Ok(FieldValue::Timestamp(ts))
        }
        TypeDescriptor::Date => {
            let s = value
                .as_str()
                .ok_or_else(|| non_conformant("expected an ISO 8601 date string"))?;
            let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|e| non_conformant(format!("'{}' is not an ISO date: {}", s, e)))?;
            Ok(FieldValue::Date(d))
        }
        TypeDescriptor::Time => {
            let s = value
                .as_str()
                .ok_or_else(|| non_conformant("expected a HH:MM:SS time string"))?;
            let t = chrono::NaiveTime::parse_from_str(s, "%H:%M:%S")
                .or_else(|_| chrono::NaiveTime::parse_from_str(s, "%H:%M"))
                .map_err(|e| non_conformant(format!("'{}' is not a time: {}", s, e)))?;
            Ok(FieldValue::Time(t))
        }
        TypeDescriptor::Count => {
            let n = value.as_i64().ok_or_else(|| non_conformant("expected an integer"))?;
            // The service signals "no value" for magnitudes as -1
            if n < 0 {
                return Err(non_conformant("negative count"));
            }
            Ok(FieldValue::Count(n as u64))
        }
        TypeDescriptor::Category(set) => {
            let s = value
                .as_str()
                .ok_or_else(|| non_conformant("expected a category string"))?;
            set.values()
                .iter()
                .find(|allowed| allowed.eq_ignore_ascii_case(s))
                .map(|allowed| FieldValue::Category((*allowed).to_string()))
                .ok_or_else(|| non_conformant(format!("'{}' is not in the requested set", s)))
        }
        TypeDescriptor::Text => {
            let s = value
                .as_str()
                .ok_or_else(|| non_conformant("expected a string"))?;
            Ok(FieldValue::Text(s.to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::CategorySet;
    use serde_json::json;
    use std::sync::Mutex;

    /// Port double that replays scripted responses and records calls.
    struct ScriptedPort {
        responses: Mutex<Vec<Result<RawInterpretation>>>,
    }

    impl ScriptedPort {
        fn new(responses: Vec<Result<RawInterpretation>>) -> Self {
            Self {
                responses: Mutex::new(responses),
            }
        }
    }

    #[async_trait]
    impl InterpreterPort for ScriptedPort {
        async fn interpret(
            &self,
            _raw_text: &str,
            _descriptor: &TypeDescriptor,
            _context: &InterpretationContext,
        ) -> Result<RawInterpretation> {
            self.responses
                .lock()
                .unwrap()
                .remove(0)
        }
    }

    fn resolved(value: serde_json::Value, confidence: f64) -> Result<RawInterpretation> {
        Ok(RawInterpretation {
            value,
            confidence: Some(confidence),
        })
    }

    #[tokio::test]
    async fn conformant_response_resolves_first_try() {
        let port = Arc::new(ScriptedPort::new(vec![resolved(json!(1500), 0.95)]));
        let guard = GuardedInterpreter::new(port, 3);
        let outcome = guard
            .interpret("1.5k", &TypeDescriptor::Count, &Default::default())
            .await;
        assert_eq!(
            outcome,
            InterpretOutcome::Resolved(Interpretation {
                value: FieldValue::Count(1500),
                confidence: 0.95,
            })
        );
        assert_eq!(guard.calls(), 1);
    }

    #[tokio::test]
    async fn non_conformant_response_is_retried_exactly_once() {
        let port = Arc::new(ScriptedPort::new(vec![
            resolved(json!("not a number"), 0.9),
            resolved(json!("still not"), 0.9),
        ]));
        let guard = GuardedInterpreter::new(port, 3);
        let outcome = guard
            .interpret("many", &TypeDescriptor::Count, &Default::default())
            .await;
        assert!(matches!(outcome, InterpretOutcome::CannotResolve { .. }));
        assert_eq!(guard.calls(), 2);
    }

    #[tokio::test]
    async fn persistent_service_failure_exhausts_retries_to_cannot_resolve() {
        let port = Arc::new(ScriptedPort::new(vec![
            Err(NormalizeError::Service("503".into())),
            Err(NormalizeError::Service("503".into())),
            Err(NormalizeError::Service("503".into())),
        ]));
        let guard = GuardedInterpreter::new(port, 2);
        let outcome = guard
            .interpret("x", &TypeDescriptor::Count, &Default::default())
            .await;
        assert!(matches!(outcome, InterpretOutcome::CannotResolve { .. }));
        assert_eq!(guard.calls(), 3);
    }

    #[tokio::test]
    async fn null_value_is_cannot_resolve_without_retry() {
        let port = Arc::new(ScriptedPort::new(vec![resolved(json!(null), 0.9)]));
        let guard = GuardedInterpreter::new(port, 3);
        let outcome = guard
            .interpret("unknown", &TypeDescriptor::Count, &Default::default())
            .await;
        assert!(matches!(outcome, InterpretOutcome::CannotResolve { .. }));
        assert_eq!(guard.calls(), 1);
    }

    #[tokio::test]
    async fn uncued_datetime_phrase_is_capped_below_high_confidence() {
        let port = Arc::new(ScriptedPort::new(vec![resolved(
            json!("2005-01-03T06:00:00"),
            0.97,
        )]));
        let guard = GuardedInterpreter::new(port, 3);
        let outcome = guard
            .interpret("early morning", &TypeDescriptor::Timestamp, &Default::default())
            .await;
        match outcome {
            InterpretOutcome::Resolved(interp) => assert!(interp.confidence < HIGH_CONFIDENCE),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn cued_datetime_phrase_keeps_reported_confidence() {
        let port = Arc::new(ScriptedPort::new(vec![resolved(
            json!("2005-01-03T14:00:00"),
            0.97,
        )]));
        let guard = GuardedInterpreter::new(port, 3);
        let outcome = guard
            .interpret(
                "Jan 3, 2005, around 2:00 p.m.",
                &TypeDescriptor::Timestamp,
                &Default::default(),
            )
            .await;
        match outcome {
            InterpretOutcome::Resolved(interp) => assert!((interp.confidence - 0.97).abs() < 1e-9),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(10), Duration::from_millis(8000));
    }

    #[test]
    fn category_conformance_canonicalizes_case() {
        let descriptor = TypeDescriptor::Category(CategorySet::NercRegion);
        assert_eq!(
            conform(&descriptor, &json!("wecc")).unwrap(),
            FieldValue::Category("WECC".into())
        );
        assert!(conform(&descriptor, &json!("NOWHERE")).is_err());
    }
}
