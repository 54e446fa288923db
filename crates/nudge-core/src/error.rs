//! Error taxonomy for the notification pipeline.
//!
//! Race losses (another worker claimed the notification first), expiry,
//! and transport rejections are normal pipeline outcomes, not errors.
//! They are modeled as ordinary return values in the queue and push
//! crates and never appear here.

use thiserror::Error;

/// All errors the pipeline can surface.
#[derive(Error, Debug)]
pub enum NudgeError {
    /// Configuration could not be read or parsed.
    #[error("Config error: {0}")]
    Config(String),

    /// SQLite-backed store failure.
    #[error("Store error: {0}")]
    Store(String),

    /// Caller passed something the pipeline cannot act on.
    #[error("Invalid input: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for NudgeError {
    fn from(e: rusqlite::Error) -> Self {
        NudgeError::Store(e.to_string())
    }
}

/// Convenience alias used across all nudge crates.
pub type Result<T> = std::result::Result<T, NudgeError>;
