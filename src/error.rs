//! Error types for the request execution engine.

use std::time::Duration;

use thiserror::Error;

/// Top-level error type for synchronous engine operations.
///
/// Everything that can go wrong after a session has started is reported through
/// [`SessionError`] in the terminal callback instead.
#[derive(Error, Debug)]
pub enum Error {
    /// The worker could not be started.
    #[error("failed to start worker: {0}")]
    Spawn(String),

    /// IO error outside of a running session.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Engine configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Terminal failure of a session, delivered through the completion callback.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// The provider answered with a non-success HTTP status.
    #[error("{message}")]
    Transport {
        /// Status detail that followed the sentinel, if any.
        status: Option<String>,
        /// Human-readable message extracted from the error body.
        message: String,
    },

    /// The session completed without producing any content.
    #[error("No response received from AI provider{}", format_leftover(.leftover))]
    EmptyResponse {
        /// Raw bytes left over at the end of the stream, truncated.
        leftover: String,
    },

    /// The caller cancelled the request.
    #[error("Request cancelled by user.")]
    Cancelled,

    /// The deadline elapsed before the session finished.
    #[error("Request timed out after {} seconds.", .0.as_secs())]
    TimedOut(Duration),

    /// Reading from the worker pipe failed.
    #[error("failed to read response: {0}")]
    Read(String),

    /// A complete response body could not be parsed.
    #[error("failed to parse response: {0}")]
    Parse(String),

    /// The response parser rejected the provider's answer.
    #[error("{0}")]
    Provider(String),
}

fn format_leftover(leftover: &str) -> String {
    if leftover.is_empty() {
        ".".to_string()
    } else {
        format!(". Raw response: {}", leftover)
    }
}
