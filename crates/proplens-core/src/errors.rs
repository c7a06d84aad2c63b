//! Error codes and the finalized job error.
//!
//! Crates keep their own `thiserror` enums (`TransportError`, `ApiError`,
//! `SubmitError`, ...). What crosses into the job-state store and out to
//! observers is always a [`JobError`]: a stable code, a message, and the
//! reconnect-attempt counter at the time the error was recorded.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Machine-readable error codes.
pub mod codes {
    /// No credential was supplied.
    pub const AUTH_REQUIRED: &str = "AUTH_REQUIRED";
    /// The job input failed validation before any network call.
    pub const INVALID_INPUT: &str = "INVALID_INPUT";
    /// The server answered, but the payload is not a usable job.
    pub const INVALID_RESPONSE: &str = "INVALID_RESPONSE";
    /// Submission retries were exhausted.
    pub const SUBMISSION_FAILED: &str = "SUBMISSION_FAILED";
    /// Anything not covered above.
    pub const UNKNOWN_ERROR: &str = "UNKNOWN_ERROR";
    /// The job subscription reported an error.
    pub const SUBSCRIPTION_ERROR: &str = "SUBSCRIPTION_ERROR";
    /// No update arrived for the job within the subscription timeout.
    pub const SUBSCRIPTION_TIMEOUT: &str = "SUBSCRIPTION_TIMEOUT";
    /// Resubscription attempts were exhausted.
    pub const SUBSCRIPTION_FAILED: &str = "SUBSCRIPTION_FAILED";
    /// The job itself finished with a failure status.
    pub const JOB_FAILED: &str = "JOB_FAILED";
}

/// A finalized, user-facing job error.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Error)]
#[serde(rename_all = "camelCase")]
#[error("[{code}] {message}")]
pub struct JobError {
    /// One of [`codes`].
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Reconnect attempts made when the error was recorded.
    pub attempts: u32,
}

impl JobError {
    /// Create an error with zero attempts.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            attempts: 0,
        }
    }

    /// Set the attempt counter.
    #[must_use]
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}
