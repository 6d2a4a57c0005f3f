//! Error types for trialkit

use std::time::Duration;
use thiserror::Error;

use crate::record::AttemptOutcome;

/// Result type alias using the trialkit Error
pub type Result<T> = std::result::Result<T, Error>;

/// Harness-level errors: configuration, IO and report sinks.
///
/// These never describe a test outcome; attempt failures are carried by
/// [`AttemptError`] and end up in the session records instead.
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("Report sink error: {0}")]
    Report(String),
}

/// A resource could not be obtained for an attempt
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to acquire {resource}: {reason}")]
pub struct AcquisitionError {
    pub resource: String,
    pub reason: String,
}

impl AcquisitionError {
    pub fn new(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

/// Teardown of a resource failed.
///
/// Recorded as a warning on the attempt; it never changes the outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("failed to release {resource}: {reason}")]
pub struct ReleaseError {
    pub resource: String,
    pub reason: String,
}

impl ReleaseError {
    pub fn new(resource: impl Into<String>, reason: impl ToString) -> Self {
        Self {
            resource: resource.into(),
            reason: reason.to_string(),
        }
    }
}

/// Failure reported by a test body
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BodyError {
    /// The system under test misbehaved (an assertion did not hold)
    #[error("assertion failed: {0}")]
    Assertion(String),

    /// The body itself could not run to completion
    #[error("{0}")]
    Error(String),
}

impl BodyError {
    pub fn assertion(message: impl Into<String>) -> Self {
        BodyError::Assertion(message.into())
    }

    pub fn error(message: impl ToString) -> Self {
        BodyError::Error(message.to_string())
    }
}

/// Why a single attempt did not pass
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error(transparent)]
    Acquisition(#[from] AcquisitionError),

    #[error(transparent)]
    Body(#[from] BodyError),

    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("session deadline of {0:?} exceeded")]
    Deadline(Duration),

    #[error("session cancelled")]
    Cancelled,
}

impl AttemptError {
    /// Outcome recorded for an attempt that ended with this error
    pub fn outcome(&self) -> AttemptOutcome {
        match self {
            AttemptError::Acquisition(_) => AttemptOutcome::Errored,
            AttemptError::Body(BodyError::Assertion(_)) => AttemptOutcome::Failed,
            AttemptError::Body(BodyError::Error(_)) => AttemptOutcome::Errored,
            AttemptError::Timeout(_) | AttemptError::Deadline(_) => AttemptOutcome::TimedOut,
            AttemptError::Cancelled => AttemptOutcome::Cancelled,
        }
    }

    /// Cancellation and session deadlines end the session without consulting
    /// the retry policy.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, AttemptError::Deadline(_) | AttemptError::Cancelled)
    }
}
