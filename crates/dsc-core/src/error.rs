//! # Error Types: Structured Error Hierarchy
//!
//! Foundational error types shared by every crate in the connector. All
//! errors derive `Display` and `Error` through `thiserror`.
//!
//! ## Design
//!
//! - State machine errors carry the current state, the attempted target,
//!   and the rejection reason so the message is usable as an entity's
//!   `error_detail` without further formatting.
//! - Query errors name the offending field or parameter.

use thiserror::Error;

use crate::query::QueryError;

/// Top-level error type for the connector core.
#[derive(Error, Debug)]
pub enum ConnectorError {
    /// State machine transition rejected.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Query specification rejected.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Input rejected before any state mutation.
    #[error("validation error: {0}")]
    Validation(String),
}

/// Error in state machine transitions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// Attempted an invalid state transition.
    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        /// Current state name.
        from: String,
        /// Attempted target state name.
        to: String,
        /// Reason the transition was rejected.
        reason: String,
    },

    /// A stored integer code does not name a state of the entity type.
    #[error("unknown state code {code} for {entity_type}")]
    UnknownStateCode {
        /// Entity type the code was decoded for.
        entity_type: &'static str,
        /// The offending code.
        code: i32,
    },
}

impl StateError {
    /// Convenience constructor for a rejected transition.
    pub fn invalid(
        from: impl std::fmt::Display,
        to: impl std::fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_transition_message_names_both_states() {
        let err = StateError::invalid("INITIAL", "ENDED", "not reachable");
        assert_eq!(
            err.to_string(),
            "invalid transition from INITIAL to ENDED: not reachable"
        );
    }

    #[test]
    fn state_error_converts_into_connector_error() {
        let err: ConnectorError = StateError::UnknownStateCode {
            entity_type: "TransferProcess",
            code: 42,
        }
        .into();
        assert!(err.to_string().contains("unknown state code 42"));
    }

    #[test]
    fn serde_error_converts() {
        let bad = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: ConnectorError = bad.into();
        assert!(matches!(err, ConnectorError::Serialization(_)));
    }
}
