//! Error types for the submission engine.

use thiserror::Error;

/// Result type alias using the broadside error type.
pub type Result<T> = std::result::Result<T, BroadsideError>;

/// Main error type for the submission engine.
///
/// Only the setup variants ever reject a whole submission. Everything else is
/// folded into the aggregated result as per-record or per-batch failures.
#[derive(Error, Debug)]
pub enum BroadsideError {
    /// Nothing to submit
    #[error("No records to submit")]
    NoRecords,

    /// Fixed-size grouping requested with a size of zero
    #[error("Invalid batch size: {0} (must be at least 1)")]
    InvalidBatchSize(usize),

    /// Engine configuration is unusable (e.g., missing service root)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A submission is already running on this coordinator
    #[error("A submission is already in progress")]
    AlreadyRunning,

    /// Backend answered with something the codec cannot make sense of
    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    /// Backend rejected the request with a non-success status
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// HTTP client error
    #[error("HTTP request failed: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BroadsideError {
    /// True for errors raised before any network activity.
    pub fn is_setup_error(&self) -> bool {
        matches!(
            self,
            BroadsideError::NoRecords
                | BroadsideError::InvalidBatchSize(_)
                | BroadsideError::InvalidConfig(_)
                | BroadsideError::AlreadyRunning
        )
    }

    /// Short machine-readable code used when the error becomes a message.
    pub fn code(&self) -> &'static str {
        match self {
            BroadsideError::NoRecords => "NO_RECORDS",
            BroadsideError::InvalidBatchSize(_) => "INVALID_BATCH_SIZE",
            BroadsideError::InvalidConfig(_) => "INVALID_CONFIG",
            BroadsideError::AlreadyRunning => "ALREADY_RUNNING",
            BroadsideError::MalformedResponse(_) => "MALFORMED_RESPONSE",
            BroadsideError::HttpStatus { .. } => "HTTP_ERROR",
            BroadsideError::HttpClient(e) if e.is_timeout() => "TIMEOUT",
            BroadsideError::HttpClient(_) => "NETWORK_ERROR",
            BroadsideError::Serialization(_) => "SERIALIZATION_ERROR",
            BroadsideError::Other(_) => "TRANSPORT_ERROR",
        }
    }
}
