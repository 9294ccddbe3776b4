use std::{path::PathBuf, sync::Arc};

/// Result type for fallible decider operations.
///
/// Only construction and the initial load can fail from the caller's point of view; decision calls
/// resolve every error to "no variant".
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced while loading the experiment definitions.
#[derive(thiserror::Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The definitions file did not appear before the configured timeout elapsed.
    #[error("experiment config unavailable at {path:?}")]
    ConfigUnavailable {
        /// Path the decider was waiting for.
        path: PathBuf,
    },

    /// The definitions file exists but is not a JSON document of experiment definitions.
    #[error("failed to parse experiment config")]
    ConfigParse(#[source] Arc<serde_json::Error>),

    /// Decider settings in the application config are invalid.
    #[error("invalid decider settings: {0}")]
    InvalidSettings(String),

    /// Waiting for the definitions file was interrupted by a shutdown request.
    #[error("initial load cancelled by shutdown")]
    Cancelled,

    /// Indicates that the refresh thread panicked. This should normally never happen.
    #[error("refresh thread panicked")]
    RefreshThreadPanicked,

    /// An I/O error.
    #[error(transparent)]
    // std::io::Error is not clonable, so we're wrapping it in an Arc.
    Io(Arc<std::io::Error>),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(Arc::new(value))
    }
}

impl From<serde_json::Error> for Error {
    fn from(value: serde_json::Error) -> Self {
        Self::ConfigParse(Arc::new(value))
    }
}
