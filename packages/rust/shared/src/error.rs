//! Error types for CaseBrief.
//!
//! Library crates use [`CaseBriefError`] for infrastructure failures and
//! [`StageError`] for the outcome of a single stage run, both via `thiserror`.
//! The CLI wraps these with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// User-facing guidance shown when the analysis service throttles us.
pub const RATE_LIMIT_MESSAGE: &str =
    "the analysis service is rate limiting requests (429); wait a minute and run the stage again";

/// Fallback shown when the analysis service fails without a message.
pub const GENERIC_SERVICE_MESSAGE: &str = "the analysis service returned an error";

/// Infrastructure error type for configuration, storage, and I/O.
#[derive(Debug, thiserror::Error)]
pub enum CaseBriefError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Key-value store or database error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (bad identifier, malformed input, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// JSON encoding or decoding of a stored value failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, CaseBriefError>;

impl CaseBriefError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<serde_json::Error> for CaseBriefError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Why a single stage run did not produce (or did not durably record) a result.
///
/// Every variant is terminal for the run that produced it; none is retried
/// automatically. The rendered message is what the user sees next to the stage.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StageError {
    /// No API key was supplied.
    #[error("an API key is required to run an analysis")]
    MissingApiKey,

    /// A regular stage was triggered with blank input text.
    #[error("enter the case text before running this stage")]
    EmptyInput,

    /// The terminal synthesis was triggered before any stage produced output.
    #[error("complete at least one analysis stage before the final synthesis")]
    NoPriorStagesCompleted,

    /// The request never reached the service, or the connection dropped.
    #[error("could not reach the analysis service: {0}")]
    ConnectionFailure(String),

    /// The service signalled throttling.
    #[error("{}", RATE_LIMIT_MESSAGE)]
    RateLimited,

    /// Any other non-success response from the service.
    #[error("{0}")]
    ServiceError(String),

    /// The analysis succeeded but the case store could not record it.
    #[error("the result is shown but was not saved: {0}")]
    PersistenceFailure(String),

    /// The analysis call exceeded its deadline.
    #[error("the analysis service did not respond in time")]
    Timeout,

    /// The run was cancelled by the caller or by a session reset.
    #[error("the analysis was cancelled")]
    Cancelled,

    /// The stage index is outside the catalog.
    #[error("stage {0} does not exist")]
    UnknownStage(usize),

    /// The same stage is already in flight.
    #[error("stage {0} is already running")]
    AlreadyRunning(usize),
}

impl StageError {
    /// Build a service error, substituting the generic message for a blank one.
    pub fn service(message: Option<&str>) -> Self {
        match message {
            Some(m) if !m.trim().is_empty() => Self::ServiceError(m.to_string()),
            _ => Self::ServiceError(GENERIC_SERVICE_MESSAGE.to_string()),
        }
    }

    /// Whether this error was raised before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::MissingApiKey | Self::EmptyInput | Self::NoPriorStagesCompleted
        )
    }
}
