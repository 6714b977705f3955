//! # dsc-contract: Contract Negotiation
//!
//! Negotiates usage contracts between a consumer and a provider. The
//! consumer requests an offer from the provider's catalog; the provider
//! validates the request against its policy engine and either agrees,
//! counter-offers or declines. The agreement that results is immutable and
//! is what transfer processes later reference as their contract.
//!
//! ## Modules
//!
//! - [`state`]: negotiation states and the transition table.
//! - [`types`]: contract offers and agreements.
//! - [`negotiation`]: the [`ContractNegotiation`] entity.
//! - [`validation`]: offer and agreement checks.
//! - [`message`]: messages exchanged with the counterparty.
//! - [`command`]: operator and protocol commands and their handler.
//! - [`manager`]: the consumer and provider negotiation managers.
//! - [`archive`]: contract policies resolved from agreements.

pub mod archive;
pub mod command;
pub mod manager;
pub mod message;
pub mod negotiation;
pub mod state;
pub mod types;
pub mod validation;

pub use archive::NegotiationPolicyArchive;
pub use command::{NegotiationCommand, NegotiationCommandHandler, CANCELLED_DETAIL};
pub use manager::{
    ConsumerNegotiationManager, ContractOfferRequest, ContractRequest, NegotiationDispatcherRegistry,
    NegotiationError, NegotiationManager, NegotiationManagerBuilder, ProviderNegotiationManager,
    DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS, DEFAULT_SEND_RETRY_LIMIT,
};
pub use message::{NegotiationMessage, NegotiationMessageBody};
pub use negotiation::{AgreementImmutable, ContractNegotiation, ContractNegotiationEvent, NegotiationEventKind};
pub use state::{ContractNegotiationState, NegotiationType};
pub use types::{ContractAgreement, ContractOffer};
pub use validation::{
    ContractValidationService, OfferCatalog, ValidationError, NEGOTIATION_SCOPE, PARTICIPANT_IDENTITY_CLAIM,
};
