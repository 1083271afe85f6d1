//! Centralised error type for the patcher.
//!
//! Every variant is fatal: the pipeline stops at the first one and `main`
//! exits non-zero.

use std::path::PathBuf;

use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PatchError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Invalid remote URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("HTTP error calling {0}: {1}")]
    Http(String, #[source] reqwest::Error),

    #[error("Unexpected status from {endpoint}: expected {expected}, got {actual}: {body}")]
    Status {
        endpoint: String,
        expected: String,
        actual: StatusCode,
        body: String,
    },

    #[error("I/O error on {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Malformed record #{0}: {1}")]
    Decode(usize, #[source] serde_json::Error),

    #[error("Failed to write record #{0}: {1}")]
    Encode(usize, #[source] serde_json::Error),

    #[error("Record #{record} has {values} values but {timestamps} timestamps")]
    LengthMismatch {
        record: usize,
        values: usize,
        timestamps: usize,
    },

    #[error("Pipeline already failed; start a new run")]
    AlreadyFailed,
}

impl PatchError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |e| PatchError::Io(path, e)
    }
}
