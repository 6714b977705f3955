//! # Contract Validation
//!
//! Checks applied to offers and agreements crossing the connector boundary.
//! Policies are evaluated by the [`PolicyEngine`] in the
//! [`NEGOTIATION_SCOPE`].
//!
//! ## Sanitizing
//!
//! A provider never trusts the terms inside a consumer's request. With an
//! [`OfferCatalog`] configured, the offer is replaced by the provider's own
//! copy before it is checked, so a consumer cannot inject a weaker policy
//! or a different asset.

use std::sync::Arc;

use dsc_core::Clock;
use dsc_policy::{ParticipantAgent, PolicyEngine, PolicyError};
use thiserror::Error;

use crate::types::{ContractAgreement, ContractOffer};

/// Policy scope of negotiation checks.
pub const NEGOTIATION_SCOPE: &str = "contract.negotiation";

/// Claim naming the participant an agent speaks for.
pub const PARTICIPANT_IDENTITY_CLAIM: &str = "participant_id";

/// The provider's own offers, by id.
pub trait OfferCatalog: Send + Sync {
    /// The offer published under `offer_id`.
    fn find_offer(&self, offer_id: &str) -> Option<ContractOffer>;
}

impl<F> OfferCatalog for F
where
    F: Fn(&str) -> Option<ContractOffer> + Send + Sync,
{
    fn find_offer(&self, offer_id: &str) -> Option<ContractOffer> {
        self(offer_id)
    }
}

/// Why an offer or agreement was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The offer is not one the provider published.
    #[error("unknown contract offer {0}")]
    UnknownOffer(String),

    /// The offer or agreement names a different asset.
    #[error("asset mismatch: expected {expected}, got {actual}")]
    AssetMismatch {
        /// Asset of the reference terms.
        expected: String,
        /// Asset in the received terms.
        actual: String,
    },

    /// The terms are not valid at the time of the check.
    #[error("{id} is not valid at {now}")]
    OutsideValidity {
        /// Offer or agreement id.
        id: String,
        /// Time of the check, epoch millis.
        now: i64,
    },

    /// The agreement was made with another participant.
    #[error("agreement {agreement_id} belongs to {expected}, not {}", actual.as_deref().unwrap_or("an anonymous agent"))]
    CounterPartyMismatch {
        /// The agreement.
        agreement_id: String,
        /// Consumer named in the agreement.
        expected: String,
        /// Identity claimed by the agent.
        actual: Option<String>,
    },

    /// The agreement's policy differs from the last offer's.
    #[error("policy of agreement {0} differs from the last offer")]
    PolicyMismatch(String),

    /// The policy engine denied the terms.
    #[error(transparent)]
    Denied(#[from] PolicyError),
}

/// Validates offers and agreements.
pub struct ContractValidationService {
    engine: Arc<PolicyEngine>,
    clock: Arc<dyn Clock>,
    catalog: Option<Arc<dyn OfferCatalog>>,
}

impl std::fmt::Debug for ContractValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContractValidationService")
            .field("sanitizes_offers", &self.catalog.is_some())
            .finish_non_exhaustive()
    }
}

fn identity(agent: &ParticipantAgent) -> Option<&str> {
    agent.claim(PARTICIPANT_IDENTITY_CLAIM).and_then(|v| v.as_str())
}

impl ContractValidationService {
    /// A service evaluating policies with `engine` at the time `clock` reports.
    pub fn new(engine: Arc<PolicyEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            catalog: None,
        }
    }

    /// Replace received offers by the provider's published ones.
    pub fn with_catalog(mut self, catalog: Arc<dyn OfferCatalog>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Validate a consumer's initial offer and return the terms the
    /// provider will negotiate on, bound to the requesting consumer.
    pub fn validate_initial_offer(
        &self,
        agent: &ParticipantAgent,
        offer: &ContractOffer,
    ) -> Result<ContractOffer, ValidationError> {
        let reference = match &self.catalog {
            Some(catalog) => catalog
                .find_offer(&offer.id)
                .ok_or_else(|| ValidationError::UnknownOffer(offer.id.clone()))?,
            None => offer.clone(),
        };
        if reference.asset_id != offer.asset_id {
            return Err(ValidationError::AssetMismatch {
                expected: reference.asset_id,
                actual: offer.asset_id.clone(),
            });
        }
        let now = self.clock.now_millis();
        if !reference.is_valid_at(now) {
            return Err(ValidationError::OutsideValidity { id: reference.id, now });
        }
        self.engine.evaluate(NEGOTIATION_SCOPE, &reference.policy, agent)?;

        let mut sanitized = reference;
        sanitized.consumer_id = identity(agent).map(str::to_string).or_else(|| offer.consumer_id.clone());
        Ok(sanitized)
    }

    /// Validate an agreement presented by `agent`, for instance when it
    /// requests a transfer under it.
    pub fn validate_agreement(
        &self,
        agent: &ParticipantAgent,
        agreement: &ContractAgreement,
    ) -> Result<(), ValidationError> {
        let claimed = identity(agent);
        if claimed != Some(agreement.consumer_id()) {
            return Err(ValidationError::CounterPartyMismatch {
                agreement_id: agreement.id().to_string(),
                expected: agreement.consumer_id().to_string(),
                actual: claimed.map(str::to_string),
            });
        }
        let now = self.clock.now_millis();
        if !agreement.is_valid_at(now) {
            return Err(ValidationError::OutsideValidity {
                id: agreement.id().to_string(),
                now,
            });
        }
        self.engine.evaluate(NEGOTIATION_SCOPE, agreement.policy(), agent)?;
        Ok(())
    }

    /// Check a provider's counter-offer against the offer it answers.
    pub fn validate_counter_offer(
        &self,
        counter_offer: &ContractOffer,
        previous: &ContractOffer,
    ) -> Result<(), ValidationError> {
        if counter_offer.asset_id != previous.asset_id {
            return Err(ValidationError::AssetMismatch {
                expected: previous.asset_id.clone(),
                actual: counter_offer.asset_id.clone(),
            });
        }
        let now = self.clock.now_millis();
        if !counter_offer.is_valid_at(now) {
            return Err(ValidationError::OutsideValidity {
                id: counter_offer.id.clone(),
                now,
            });
        }
        Ok(())
    }

    /// Check that the agreement a provider confirmed matches the last offer
    /// the consumer saw.
    pub fn validate_confirmed(
        &self,
        agreement: &ContractAgreement,
        latest_offer: &ContractOffer,
    ) -> Result<(), ValidationError> {
        if agreement.asset_id() != latest_offer.asset_id {
            return Err(ValidationError::AssetMismatch {
                expected: latest_offer.asset_id.clone(),
                actual: agreement.asset_id().to_string(),
            });
        }
        if agreement.policy() != &latest_offer.policy {
            return Err(ValidationError::PolicyMismatch(agreement.id().to_string()));
        }
        let now = self.clock.now_millis();
        if !agreement.is_valid_at(now) {
            return Err(ValidationError::OutsideValidity {
                id: agreement.id().to_string(),
                now,
            });
        }
        Ok(())
    }
}
