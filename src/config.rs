use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{NormalizeError, Result};

/// Environment variable holding the interpretation service credential.
pub const API_KEY_VAR: &str = "INTERPRETER_API_KEY";

/// Configuration for a complete normalization run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Directory containing `{year}_Annual_Summary_Converted.csv` files
    pub data_dir: PathBuf,
    /// Directory the normalized dataset and run report are written to
    pub output_dir: PathBuf,
    /// Location of the persistent interpretation cache (JSON lines)
    pub cache_path: PathBuf,
    /// Inclusive range of source years to process
    pub first_year: i32,
    pub last_year: i32,
    /// Base URL of the interpretation service (OpenAI-compatible)
    pub api_base_url: String,
    /// Model identifier sent with each interpretation request
    pub model: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
    /// Bounded retries for transient interpretation service failures
    pub max_retries: u32,
    /// Upper bound on concurrently processed rows (and thus in-flight calls)
    pub max_concurrent_interpretations: usize,
    /// Minimum resolved required fields for a row to count as PartialSuccess
    pub min_resolved_fields: usize,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/original"),
            output_dir: PathBuf::from("data/normalized"),
            cache_path: PathBuf::from("data/interpretation_cache.jsonl"),
            first_year: 2002,
            last_year: 2023,
            api_base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            request_timeout_secs: 30,
            max_retries: 3,
            max_concurrent_interpretations: 8,
            min_resolved_fields: 2,
        }
    }
}

impl RunConfig {
    pub fn validate(&self) -> Result<()> {
        if self.first_year > self.last_year {
            return Err(NormalizeError::Config(format!(
                "year range is inverted: {}..={}",
                self.first_year, self.last_year
            )));
        }
        if self.max_concurrent_interpretations == 0 {
            return Err(NormalizeError::Config(
                "max_concurrent_interpretations must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Reads the interpretation service credential from the environment.
    /// `.env` loading is the caller's responsibility.
    pub fn api_key(&self) -> Result<String> {
        Ok(std::env::var(API_KEY_VAR)?)
    }
}
