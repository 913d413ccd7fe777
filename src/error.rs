use thiserror::Error;

#[derive(Error, Debug)]
pub enum NormalizeError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON deserialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Environment variable error: {0}")]
    Env(#[from] std::env::VarError),

    #[error("Row format error: {0}")]
    Format(String),

    #[error("Field '{field}' failed validation: {reason}")]
    SchemaValidation { field: String, reason: String },

    #[error("Interpreter response did not match the requested structure: {0}")]
    NonConformant(String),

    #[error("Interpretation service error: {0}")]
    Service(String),
}

pub type Result<T> = std::result::Result<T, NormalizeError>;
