//! Contract policies backed by the negotiation store.

use std::sync::Arc;

use dsc_core::{Criterion, QuerySpec};
use dsc_policy::{Policy, PolicyArchive};
use dsc_state::{EntityStore, StatefulEntity};

use crate::negotiation::ContractNegotiation;
use crate::state::ContractNegotiationState;

/// [`PolicyArchive`] resolving agreement ids through the negotiations that
/// produced them. Agreements of failed or declined negotiations are not
/// honored.
pub struct NegotiationPolicyArchive {
    store: Arc<dyn EntityStore<ContractNegotiation>>,
}

impl std::fmt::Debug for NegotiationPolicyArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationPolicyArchive").finish_non_exhaustive()
    }
}

impl NegotiationPolicyArchive {
    /// An archive over `store`.
    pub fn new(store: Arc<dyn EntityStore<ContractNegotiation>>) -> Self {
        Self { store }
    }
}

impl PolicyArchive for NegotiationPolicyArchive {
    fn find_policy_for_contract(&self, contract_id: &str) -> Option<Policy> {
        let spec = QuerySpec::max().with_criterion(Criterion::eq("contractAgreement.id", contract_id));
        let negotiations = match self.store.query(&spec) {
            Ok(negotiations) => negotiations,
            Err(e) => {
                tracing::error!(contract_id = %contract_id, error = %e, "contract policy lookup failed");
                return None;
            }
        };
        negotiations
            .into_iter()
            .filter(|n| {
                !matches!(
                    n.state(),
                    Ok(ContractNegotiationState::Error | ContractNegotiationState::Declined) | Err(_)
                )
            })
            .find_map(|n| n.contract_agreement().map(|a| a.policy().clone()))
    }
}
