use std::collections::HashMap;
use std::future::Future;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, OnceCell};
use tracing::{info, warn};

use crate::error::Result;
use crate::interpret::InterpretOutcome;
use crate::schema::TypeDescriptor;

/// Stable content-derived key for a (raw text, type constraint) pair.
/// Identical inputs fingerprint identically across rows, years and runs.
pub fn fingerprint(raw_text: &str, descriptor: &TypeDescriptor) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_text.as_bytes());
    hasher.update([0x1f]);
    hasher.update(descriptor.fingerprint_label().as_bytes());
    hex::encode(hasher.finalize())
}

/// One persisted cache line. Terminal failures are cached too, so a
/// known-bad input is not re-sent within or across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    /// Original raw text, kept for audit
    pub raw_text: String,
    pub descriptor: String,
    pub outcome: InterpretOutcome,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct CacheStats {
    pub entries_loaded: usize,
    pub hits: u64,
    pub misses: u64,
}

/// Append-only memo of fallback interpretations, keyed by fingerprint.
/// Backed by a JSONL file so a warm cache survives across runs; lookups
/// never contact the service. Concurrent misses for one fingerprint
/// coalesce onto a single in-flight interpretation.
pub struct InterpretationCache {
    path: Option<PathBuf>,
    cells: Mutex<HashMap<String, Arc<OnceCell<InterpretOutcome>>>>,
    appender: Mutex<Option<std::fs::File>>,
    loaded: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl InterpretationCache {
    /// Purely in-memory cache with no backing file.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            cells: Mutex::new(HashMap::new()),
            appender: Mutex::new(None),
            loaded: 0,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Opens (or creates) the persistent cache at `path`, loading every
    /// well-formed line. Corrupt trailing lines from a torn write are
    /// skipped with a warning, not fatal.
    pub fn open(path: &Path) -> Result<Self> {
        let mut cells = HashMap::new();
        let mut loaded = 0usize;
        if path.exists() {
            let reader = BufReader::new(std::fs::File::open(path)?);
            for (line_no, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<CacheEntry>(&line) {
                    Ok(entry) => {
                        cells.insert(
                            entry.fingerprint,
                            Arc::new(OnceCell::new_with(Some(entry.outcome))),
                        );
                        loaded += 1;
                    }
                    Err(e) => {
                        warn!(line = line_no + 1, error = %e, "skipping corrupt cache line");
                    }
                }
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let appender = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        info!(entries = loaded, path = %path.display(), "interpretation cache opened");
        Ok(Self {
            path: Some(path.to_path_buf()),
            cells: Mutex::new(cells),
            appender: Mutex::new(Some(appender)),
            loaded,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    /// Lookup without side effects beyond hit/miss accounting.
    pub async fn get(&self, fingerprint: &str) -> Option<InterpretOutcome> {
        let cells = self.cells.lock().await;
        match cells.get(fingerprint).and_then(|cell| cell.get()) {
            Some(outcome) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(outcome.clone())
            }
            None => None,
        }
    }

    /// Returns the cached outcome for `fingerprint`, or runs `interpret`
    /// to produce, persist and return it. If several rows miss on the
    /// same fingerprint concurrently, exactly one `interpret` future
    /// runs; the rest await its result.
    pub async fn get_or_interpret<F, Fut>(
        &self,
        fingerprint: &str,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        interpret: F,
    ) -> Result<InterpretOutcome>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = InterpretOutcome>,
    {
        let cell = {
            let mut cells = self.cells.lock().await;
            cells
                .entry(fingerprint.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        if let Some(outcome) = cell.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(outcome.clone());
        }

        let mut ran_here = false;
        let outcome = cell
            .get_or_init(|| {
                ran_here = true;
                interpret()
            })
            .await
            .clone();

        if ran_here {
            self.misses.fetch_add(1, Ordering::Relaxed);
            self.persist(fingerprint, raw_text, descriptor, &outcome).await?;
        } else {
            // Coalesced onto another task's in-flight interpretation
            self.hits.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    async fn persist(
        &self,
        fingerprint: &str,
        raw_text: &str,
        descriptor: &TypeDescriptor,
        outcome: &InterpretOutcome,
    ) -> Result<()> {
        let mut appender = self.appender.lock().await;
        if let Some(file) = appender.as_mut() {
            let entry = CacheEntry {
                fingerprint: fingerprint.to_string(),
                raw_text: raw_text.to_string(),
                descriptor: descriptor.fingerprint_label(),
                outcome: outcome.clone(),
                cached_at: Utc::now(),
            };
            let mut line = serde_json::to_string(&entry)?;
            line.push('\n');
            // An unwritable cache store is the one fatal condition
            file.write_all(line.as_bytes())?;
        }
        Ok(())
    }

    /// Backing file location, if this cache is persistent.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries_loaded: self.loaded,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    /// Operator-forced invalidation: removes the backing file so every
    /// previously failed interpretation becomes eligible again.
    pub fn clear(path: &Path) -> Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let reader = BufReader::new(std::fs::File::open(path)?);
        let entries = reader.lines().filter_map(|l| l.ok()).filter(|l| !l.trim().is_empty()).count();
        std::fs::remove_file(path)?;
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interpret::Interpretation;
    use crate::schema::FieldValue;
    use std::sync::atomic::AtomicUsize;

    fn resolved(n: u64) -> InterpretOutcome {
        InterpretOutcome::Resolved(Interpretation {
            value: FieldValue::Count(n),
            confidence: 0.95,
        })
    }

    #[test]
    fn fingerprints_are_stable_and_constraint_sensitive() {
        let a = fingerprint("Approx. 3pm", &TypeDescriptor::Timestamp);
        let b = fingerprint("Approx. 3pm", &TypeDescriptor::Timestamp);
        let c = fingerprint("Approx. 3pm", &TypeDescriptor::Count);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_memory() {
        let cache = InterpretationCache::in_memory();
        let calls = AtomicUsize::new(0);
        let fp = fingerprint("1,500", &TypeDescriptor::Count);

        for _ in 0..2 {
            let outcome = cache
                .get_or_interpret(&fp, "1,500", &TypeDescriptor::Count, || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    resolved(1500)
                })
                .await
                .unwrap();
            assert_eq!(outcome, resolved(1500));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 1);
    }

    #[tokio::test]
    async fn terminal_failures_are_cached_too() {
        let cache = InterpretationCache::in_memory();
        let calls = AtomicUsize::new(0);
        let fp = fingerprint("???", &TypeDescriptor::Count);
        let failure = InterpretOutcome::CannotResolve {
            reason: "service reported the text as unresolvable".into(),
        };

        for _ in 0..2 {
            let outcome = cache
                .get_or_interpret(&fp, "???", &TypeDescriptor::Count, || {
                    let failure = failure.clone();
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { failure }
                })
                .await
                .unwrap();
            assert_eq!(outcome, failure);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_misses_coalesce_to_one_interpretation() {
        let cache = Arc::new(InterpretationCache::in_memory());
        let calls = Arc::new(AtomicUsize::new(0));
        let fp = fingerprint("30,000 customers", &TypeDescriptor::Count);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let calls = calls.clone();
            let fp = fp.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_interpret(&fp, "30,000 customers", &TypeDescriptor::Count, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        // Hold the in-flight slot long enough for others to pile up
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        resolved(30_000)
                    })
                    .await
                    .unwrap()
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), resolved(30_000));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cache_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");
        let fp = fingerprint("1,500", &TypeDescriptor::Count);

        {
            let cache = InterpretationCache::open(&path).unwrap();
            cache
                .get_or_interpret(&fp, "1,500", &TypeDescriptor::Count, || async {
                    resolved(1500)
                })
                .await
                .unwrap();
        }

        let warm = InterpretationCache::open(&path).unwrap();
        assert_eq!(warm.stats().entries_loaded, 1);
        assert_eq!(warm.get(&fp).await, Some(resolved(1500)));
        // A warm hit never runs the interpretation closure
        let outcome = warm
            .get_or_interpret(&fp, "1,500", &TypeDescriptor::Count, || async {
                panic!("warm cache must not interpret")
            })
            .await
            .unwrap();
        assert_eq!(outcome, resolved(1500));
    }

    #[tokio::test]
    async fn corrupt_trailing_line_is_skipped_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");
        {
            let cache = InterpretationCache::open(&path).unwrap();
            let fp = fingerprint("x", &TypeDescriptor::Count);
            cache
                .get_or_interpret(&fp, "x", &TypeDescriptor::Count, || async { resolved(1) })
                .await
                .unwrap();
        }
        // Simulate a torn write
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"fingerprint\": \"trunc").unwrap();
        drop(file);

        let cache = InterpretationCache::open(&path).unwrap();
        assert_eq!(cache.stats().entries_loaded, 1);
    }

    #[test]
    fn clear_removes_the_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.jsonl");
        std::fs::write(&path, "{}\n{}\n").unwrap();
        // Both lines are corrupt entries but still count for the operator
        let removed = InterpretationCache::clear(&path).unwrap();
        assert_eq!(removed, 2);
        assert!(!path.exists());
        assert_eq!(InterpretationCache::clear(&path).unwrap(), 0);
    }
}
