//! # Contract Negotiation
//!
//! The persistent entity tracking one negotiation between a consumer and a
//! provider. Offers accumulate in order; the agreement, once attached,
//! never changes.

use dsc_core::StateError;
use dsc_state::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::{ContractNegotiationState, NegotiationType};
use crate::types::{ContractAgreement, ContractOffer};

/// What happened to a negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NegotiationEventKind {
    Initiated,
    Requested,
    Offered,
    Approved,
    Agreed,
    Confirmed,
    Declined,
    Failed,
}

/// Lifecycle event published after a negotiation was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractNegotiationEvent {
    /// What happened.
    pub kind: NegotiationEventKind,
    /// Negotiation id.
    pub negotiation_id: String,
    /// Epoch millis of the persisted change.
    pub at: i64,
}

/// An agreement was attached to a negotiation that already has one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("negotiation {negotiation_id} already holds agreement {agreement_id}")]
pub struct AgreementImmutable {
    /// The negotiation.
    pub negotiation_id: String,
    /// The agreement it holds.
    pub agreement_id: String,
}

/// One negotiation, consumer or provider side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractNegotiation {
    #[serde(flatten)]
    meta: EntityMeta,
    #[serde(rename = "type")]
    negotiation_type: NegotiationType,
    correlation_id: String,
    counter_party_id: String,
    counter_party_address: String,
    protocol: String,
    #[serde(default)]
    contract_offers: Vec<ContractOffer>,
    contract_agreement: Option<ContractAgreement>,
}

impl StatefulEntity for ContractNegotiation {
    type State = ContractNegotiationState;
    type Event = ContractNegotiationEvent;
    const TYPE_NAME: &'static str = "ContractNegotiation";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn error_state() -> ContractNegotiationState {
        ContractNegotiationState::Error
    }

    fn failure_event(&self) -> ContractNegotiationEvent {
        self.event(NegotiationEventKind::Failed)
    }
}

impl ContractNegotiation {
    /// A new, unsaved negotiation with `counter_party_id` at
    /// `counter_party_address`, reached over `protocol`.
    pub fn new(
        id: impl Into<String>,
        negotiation_type: NegotiationType,
        correlation_id: impl Into<String>,
        counter_party_id: impl Into<String>,
        counter_party_address: impl Into<String>,
        protocol: impl Into<String>,
        now: i64,
    ) -> Self {
        Self {
            meta: EntityMeta::new(id, ContractNegotiationState::Unsaved.code(), now),
            negotiation_type,
            correlation_id: correlation_id.into(),
            counter_party_id: counter_party_id.into(),
            counter_party_address: counter_party_address.into(),
            protocol: protocol.into(),
            contract_offers: Vec::new(),
            contract_agreement: None,
        }
    }

    /// Consumer or provider.
    pub fn negotiation_type(&self) -> NegotiationType {
        self.negotiation_type
    }

    /// Id shared by both sides' negotiations.
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// The other participant.
    pub fn counter_party_id(&self) -> &str {
        &self.counter_party_id
    }

    /// Where the other participant receives messages.
    pub fn counter_party_address(&self) -> &str {
        &self.counter_party_address
    }

    /// Protocol binding used with the counterparty.
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    /// Every offer exchanged so far, oldest first.
    pub fn contract_offers(&self) -> &[ContractOffer] {
        &self.contract_offers
    }

    /// The most recent offer.
    pub fn last_offer(&self) -> Option<&ContractOffer> {
        self.contract_offers.last()
    }

    /// Append an offer.
    pub fn add_offer(&mut self, offer: ContractOffer, now: i64) {
        self.contract_offers.push(offer);
        self.meta.updated_at = now;
    }

    /// The agreement, once reached.
    pub fn contract_agreement(&self) -> Option<&ContractAgreement> {
        self.contract_agreement.as_ref()
    }

    /// Attach the agreement. Refused if one is already attached.
    pub fn attach_agreement(&mut self, agreement: ContractAgreement, now: i64) -> Result<(), AgreementImmutable> {
        if let Some(existing) = &self.contract_agreement {
            return Err(AgreementImmutable {
                negotiation_id: self.meta.id.clone(),
                agreement_id: existing.id().to_string(),
            });
        }
        self.contract_agreement = Some(agreement);
        self.meta.updated_at = now;
        Ok(())
    }

    /// An event of `kind` stamped with the last modification time.
    pub fn event(&self, kind: NegotiationEventKind) -> ContractNegotiationEvent {
        ContractNegotiationEvent {
            kind,
            negotiation_id: self.meta.id.clone(),
            at: self.meta.updated_at,
        }
    }

    /// Move to `target`, or re-enter the current state, if the transition
    /// table permits it.
    pub fn transition(mut self, target: ContractNegotiationState, now: i64) -> Result<Self, StateError> {
        let current = self.state()?;
        let next = current.advance(target, self.negotiation_type)?;
        self.meta.transition_to(next.code(), now);
        Ok(self)
    }
}
