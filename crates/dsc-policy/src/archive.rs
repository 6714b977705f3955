//! # Policy Archive
//!
//! Resolves the policy that governs an agreed contract. Transfer processes
//! carry only a contract id; the archive turns it back into the agreed
//! policy when a data flow is initiated.

use crate::model::Policy;

/// Lookup of contract policies.
pub trait PolicyArchive: Send + Sync {
    /// The policy of the agreement `contract_id`, if one exists.
    fn find_policy_for_contract(&self, contract_id: &str) -> Option<Policy>;
}
