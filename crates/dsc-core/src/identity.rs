//! # Identity
//!
//! Entity identifiers are opaque strings: counterparties choose their own
//! identifiers for negotiations and data requests, so the connector cannot
//! impose a format. Locally created entities get a random UUID.
//!
//! `WorkerId` is a newtype so a lease holder can never be confused with an
//! entity id at a call site.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a fresh identifier for a locally created entity.
pub fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

/// Identity of a worker (manager replica) that may hold entity leases.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(String);

impl WorkerId {
    /// Create a worker id from a configured name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Generate a random worker id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Access the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "worker:{}", self.0)
    }
}
