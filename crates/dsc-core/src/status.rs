//! # Status Results
//!
//! Outcome type for operations delegated to pluggable components
//! (provisioners, data-flow controllers, status checkers). The caller needs
//! to know not only that something failed but whether trying again could
//! help, so failures carry a [`ResponseStatus`].

use serde::{Deserialize, Serialize};

/// Classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Not retryable. The entity should move to its error state.
    FatalError,
    /// Transient. The step may be re-attempted subject to the retry policy.
    ErrorRetry,
}

impl std::fmt::Display for ResponseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::FatalError => "FATAL_ERROR",
            Self::ErrorRetry => "ERROR_RETRY",
        };
        f.write_str(s)
    }
}

/// A failed operation: its classification plus one or more messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFailure {
    /// Whether the failure is fatal or retryable.
    pub status: ResponseStatus,
    /// Human-readable failure messages.
    pub messages: Vec<String>,
}

impl StatusFailure {
    /// A non-retryable failure.
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::FatalError,
            messages: vec![message.into()],
        }
    }

    /// A retryable failure.
    pub fn retry(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::ErrorRetry,
            messages: vec![message.into()],
        }
    }

    /// Whether the failure is fatal.
    pub fn is_fatal(&self) -> bool {
        self.status == ResponseStatus::FatalError
    }

    /// All messages joined into a single detail string.
    pub fn detail(&self) -> String {
        self.messages.join(", ")
    }
}

impl std::fmt::Display for StatusFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.detail())
    }
}

impl std::error::Error for StatusFailure {}

/// Result of a delegated operation.
pub type StatusResult<T> = Result<T, StatusFailure>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_and_retry_constructors() {
        let fatal = StatusFailure::fatal("no provisioner");
        assert!(fatal.is_fatal());
        let retry = StatusFailure::retry("timeout");
        assert!(!retry.is_fatal());
        assert_eq!(retry.status, ResponseStatus::ErrorRetry);
    }

    #[test]
    fn display_includes_status_and_messages() {
        let mut failure = StatusFailure::fatal("first");
        failure.messages.push("second".into());
        assert_eq!(failure.to_string(), "FATAL_ERROR: first, second");
        assert_eq!(failure.detail(), "first, second");
    }

    #[test]
    fn serde_round_trip_keeps_status() {
        let failure = StatusFailure::retry("busy");
        let json = serde_json::to_string(&failure).unwrap();
        let back: StatusFailure = serde_json::from_str(&json).unwrap();
        assert_eq!(back, failure);
    }
}
