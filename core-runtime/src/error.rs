//! Errors raised while setting up runtime infrastructure.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A global tracing subscriber is already installed.
    #[error("Logging already initialized: {0}")]
    LoggingAlreadyInitialized(String),

    #[error("Invalid log filter '{filter}': {reason}")]
    InvalidFilter { filter: String, reason: String },

    /// A [`LoggerSink`](crate::logging::LoggerSink) failed to record an entry.
    #[error("Logger sink error: {0}")]
    Sink(String),
}

pub type Result<T> = std::result::Result<T, Error>;
