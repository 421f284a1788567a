use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserError;

/// How the orchestrator reacts to an error raised inside a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried with backoff up to the stage's attempt budget.
    Transient,
    /// Fails the instruction immediately.
    Configuration,
    /// One retry (the page may render differently), then terminal.
    Malformed,
    /// Stops the whole run.
    Abort,
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("browser error: {0}")]
    Browser(String),

    #[error("exchange rate fetch failed: {0}")]
    RateFetch(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid filter regex {pattern:?}: {source}")]
    InvalidRegex {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("unknown currency code: {0}")]
    UnknownCurrency(String),

    #[error("unsupported locator strategy: {0}")]
    UnsupportedStrategy(String),

    #[error("invalid category name {0:?} (expected letters, digits or '_')")]
    InvalidCategory(String),

    #[error("malformed listing: {0}")]
    MalformedListing(String),

    #[error("could not create table {table}: {source}")]
    Schema {
        table: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("run cancelled")]
    Cancelled,
}

impl PipelineError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PipelineError::ElementNotFound(_)
            | PipelineError::Browser(_)
            | PipelineError::RateFetch(_)
            | PipelineError::Database(_)
            | PipelineError::Io(_)
            | PipelineError::Timeout(_) => ErrorClass::Transient,
            PipelineError::InvalidRegex { .. }
            | PipelineError::UnknownCurrency(_)
            | PipelineError::UnsupportedStrategy(_)
            | PipelineError::InvalidCategory(_) => ErrorClass::Configuration,
            PipelineError::MalformedListing(_) => ErrorClass::Malformed,
            PipelineError::Schema { .. } | PipelineError::Cancelled => ErrorClass::Abort,
        }
    }
}

impl From<BrowserError> for PipelineError {
    fn from(e: BrowserError) -> Self {
        match e {
            BrowserError::Timeout { .. } => PipelineError::ElementNotFound(e.to_string()),
            BrowserError::Unsupported(s) => PipelineError::UnsupportedStrategy(s),
            other => PipelineError::Browser(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
