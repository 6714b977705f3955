//! # Negotiation Commands
//!
//! Out-of-band instructions for contract negotiations: operator requests
//! (cancel, decline, counter-offer), protocol inputs received from the
//! counterparty, and the managers' own dispatch continuations.
//!
//! A protocol input that arrives in a state where it makes no sense is
//! ignored, not rejected, because counterparties resend messages.

use std::sync::Arc;

use dsc_core::{generate_id, Clock, StateError};
use dsc_state::{
    CommandError, CommandHandler, CommandOutcome, DispatchError, EntityCommand, EntityState,
    StatefulEntity,
};

use crate::negotiation::{ContractNegotiation, NegotiationEventKind};
use crate::state::{ContractNegotiationState, NegotiationType};
use crate::types::{ContractAgreement, ContractOffer};
use crate::validation::ContractValidationService;

/// Detail recorded on negotiations stopped by [`NegotiationCommand::Cancel`].
pub const CANCELLED_DETAIL: &str = "Cancelled";

/// A command targeting one negotiation.
#[derive(Debug, Clone)]
pub enum NegotiationCommand {
    /// Stop the negotiation; it ends in `ERROR`.
    Cancel {
        /// Target negotiation.
        negotiation_id: String,
    },
    /// Decline the counterparty's terms.
    Decline {
        /// Target negotiation.
        negotiation_id: String,
    },
    /// Provider: answer the consumer's request with different terms.
    CounterOffer {
        /// Target negotiation.
        negotiation_id: String,
        /// The counter-offer.
        offer: ContractOffer,
    },
    /// Consumer: the provider sent a counter-offer.
    OfferReceived {
        /// Target negotiation.
        negotiation_id: String,
        /// The counter-offer.
        offer: ContractOffer,
    },
    /// Consumer: the provider sent the agreement.
    AgreementReceived {
        /// Target negotiation.
        negotiation_id: String,
        /// The agreement.
        agreement: ContractAgreement,
    },
    /// Provider: the consumer approved the last counter-offer.
    ApprovalReceived {
        /// Target negotiation.
        negotiation_id: String,
    },
    /// The counterparty ended the negotiation.
    RejectionReceived {
        /// Target negotiation.
        negotiation_id: String,
        /// The counterparty's reason.
        reason: String,
    },
    /// Outcome of sending the message of state `step`.
    DispatchResult {
        /// Target negotiation.
        negotiation_id: String,
        /// State whose message was sent.
        step: ContractNegotiationState,
        /// Delivery outcome.
        result: Result<(), DispatchError>,
    },
}

impl EntityCommand for NegotiationCommand {
    fn entity_id(&self) -> &str {
        match self {
            Self::Cancel { negotiation_id }
            | Self::Decline { negotiation_id }
            | Self::CounterOffer { negotiation_id, .. }
            | Self::OfferReceived { negotiation_id, .. }
            | Self::AgreementReceived { negotiation_id, .. }
            | Self::ApprovalReceived { negotiation_id }
            | Self::RejectionReceived { negotiation_id, .. }
            | Self::DispatchResult { negotiation_id, .. } => negotiation_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Cancel { .. } => "CancelNegotiation",
            Self::Decline { .. } => "DeclineNegotiation",
            Self::CounterOffer { .. } => "CounterOffer",
            Self::OfferReceived { .. } => "OfferReceived",
            Self::AgreementReceived { .. } => "AgreementReceived",
            Self::ApprovalReceived { .. } => "ApprovalReceived",
            Self::RejectionReceived { .. } => "RejectionReceived",
            Self::DispatchResult { .. } => "NegotiationDispatchResult",
        }
    }
}

type Outcome = Result<CommandOutcome<ContractNegotiation>, CommandError>;

fn modified(negotiation: ContractNegotiation, kind: NegotiationEventKind) -> Outcome {
    let event = negotiation.event(kind);
    Ok(CommandOutcome::Modified {
        entity: negotiation,
        events: vec![event],
    })
}

/// Event announcing arrival in `state`, if it has one.
pub(crate) fn arrival_event(state: ContractNegotiationState) -> Option<NegotiationEventKind> {
    match state {
        ContractNegotiationState::Requested => Some(NegotiationEventKind::Requested),
        ContractNegotiationState::Offered => Some(NegotiationEventKind::Offered),
        ContractNegotiationState::Approved => Some(NegotiationEventKind::Approved),
        ContractNegotiationState::Agreed => Some(NegotiationEventKind::Agreed),
        ContractNegotiationState::Confirmed => Some(NegotiationEventKind::Confirmed),
        ContractNegotiationState::Declined => Some(NegotiationEventKind::Declined),
        _ => None,
    }
}

/// Provider: create the agreement from the last offer and move to
/// `CONFIRMING`.
pub(crate) fn confirm(mut negotiation: ContractNegotiation, now: i64) -> Result<ContractNegotiation, String> {
    if negotiation.contract_agreement().is_none() {
        let offer = negotiation
            .last_offer()
            .ok_or_else(|| format!("negotiation {} has no offer to agree on", negotiation.id()))?;
        let agreement = ContractAgreement::from_offer(generate_id(), offer, negotiation.counter_party_id(), now);
        negotiation
            .attach_agreement(agreement, now)
            .map_err(|e| e.to_string())?;
    }
    negotiation
        .transition(ContractNegotiationState::Confirming, now)
        .map_err(|e| e.to_string())
}

fn ignored(
    negotiation: &ContractNegotiation,
    command: &NegotiationCommand,
    reason: &str,
) -> CommandOutcome<ContractNegotiation> {
    tracing::debug!(
        negotiation_id = %negotiation.id(),
        state = negotiation.meta().state,
        command = command.name(),
        "{reason}"
    );
    CommandOutcome::Unchanged
}

/// Applies [`NegotiationCommand`]s.
pub struct NegotiationCommandHandler {
    clock: Arc<dyn Clock>,
    validation: Arc<ContractValidationService>,
}

impl std::fmt::Debug for NegotiationCommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationCommandHandler")
            .field("validation", &self.validation)
            .finish_non_exhaustive()
    }
}

impl CommandHandler<ContractNegotiation, NegotiationCommand> for NegotiationCommandHandler {
    fn handle(&self, command: &NegotiationCommand, negotiation: ContractNegotiation) -> Outcome {
        let now = self.clock.now_millis();
        let reject = |reason: String| CommandError::Rejected {
            command: command.name(),
            reason,
        };
        let invalid = |e: StateError| reject(e.to_string());
        let state = negotiation.state().map_err(invalid)?;
        if state.is_terminal() {
            tracing::debug!(
                negotiation_id = %negotiation.id(),
                state = %state,
                command = command.name(),
                "negotiation already finished"
            );
            return Ok(CommandOutcome::Unchanged);
        }
        let side = negotiation.negotiation_type();

        match command {
            NegotiationCommand::Cancel { .. } => {
                modified(negotiation.into_error(CANCELLED_DETAIL, now), NegotiationEventKind::Failed)
            }
            NegotiationCommand::Decline { .. } => {
                let negotiation = negotiation
                    .transition(ContractNegotiationState::Declining, now)
                    .map_err(invalid)?;
                Ok(CommandOutcome::modified(negotiation))
            }
            NegotiationCommand::CounterOffer { offer, .. } => {
                if side != NegotiationType::Provider || state != ContractNegotiationState::Requested {
                    return Err(reject(format!(
                        "counter-offers are only made by providers in REQUESTED, negotiation is {side} in {state}"
                    )));
                }
                let mut negotiation = negotiation;
                negotiation.add_offer(offer.clone(), now);
                let negotiation = negotiation
                    .transition(ContractNegotiationState::Offering, now)
                    .map_err(invalid)?;
                Ok(CommandOutcome::modified(negotiation))
            }
            NegotiationCommand::OfferReceived { offer, .. } => {
                if side != NegotiationType::Consumer || state != ContractNegotiationState::Requested {
                    return Ok(ignored(&negotiation, command, "ignoring counter-offer"));
                }
                let verdict = match negotiation.last_offer() {
                    Some(previous) => self
                        .validation
                        .validate_counter_offer(offer, previous)
                        .map_err(|e| e.to_string()),
                    None => Err("no previous offer".to_string()),
                };
                let mut negotiation = negotiation;
                negotiation.add_offer(offer.clone(), now);
                match verdict {
                    Ok(()) => modified(
                        negotiation
                            .transition(ContractNegotiationState::Offered, now)
                            .map_err(invalid)?,
                        NegotiationEventKind::Offered,
                    ),
                    Err(reason) => {
                        tracing::warn!(negotiation_id = %negotiation.id(), reason = %reason, "declining counter-offer");
                        let negotiation = negotiation
                            .transition(ContractNegotiationState::Declining, now)
                            .map_err(invalid)?;
                        Ok(CommandOutcome::modified(negotiation))
                    }
                }
            }
            NegotiationCommand::AgreementReceived { agreement, .. } => {
                let expecting = matches!(
                    state,
                    ContractNegotiationState::Requesting
                        | ContractNegotiationState::Requested
                        | ContractNegotiationState::Offered
                        | ContractNegotiationState::Approving
                        | ContractNegotiationState::Approved
                );
                if side != NegotiationType::Consumer || !expecting {
                    return Ok(ignored(&negotiation, command, "ignoring agreement"));
                }
                let verdict = match negotiation.last_offer() {
                    Some(offer) => self
                        .validation
                        .validate_confirmed(agreement, offer)
                        .map_err(|e| e.to_string()),
                    None => Err("no offer to compare with".to_string()),
                };
                match verdict {
                    Ok(()) => {
                        let mut negotiation = negotiation;
                        negotiation
                            .attach_agreement(agreement.clone(), now)
                            .map_err(|e| reject(e.to_string()))?;
                        modified(
                            negotiation
                                .transition(ContractNegotiationState::Agreed, now)
                                .map_err(invalid)?,
                            NegotiationEventKind::Agreed,
                        )
                    }
                    Err(reason) => {
                        tracing::warn!(
                            negotiation_id = %negotiation.id(),
                            agreement_id = %agreement.id(),
                            reason = %reason,
                            "declining invalid agreement"
                        );
                        let negotiation = negotiation
                            .transition(ContractNegotiationState::Declining, now)
                            .map_err(invalid)?;
                        Ok(CommandOutcome::modified(negotiation))
                    }
                }
            }
            NegotiationCommand::ApprovalReceived { .. } => {
                if side != NegotiationType::Provider || state != ContractNegotiationState::Offered {
                    return Ok(ignored(&negotiation, command, "ignoring approval"));
                }
                let negotiation = confirm(negotiation, now).map_err(reject)?;
                Ok(CommandOutcome::modified(negotiation))
            }
            NegotiationCommand::RejectionReceived { reason, .. } => {
                tracing::info!(negotiation_id = %negotiation.id(), reason = %reason, "counterparty declined");
                modified(
                    negotiation
                        .transition(ContractNegotiationState::Declined, now)
                        .map_err(invalid)?,
                    NegotiationEventKind::Declined,
                )
            }
            NegotiationCommand::DispatchResult { step, result, .. } => {
                if state != *step {
                    return Ok(ignored(&negotiation, command, "ignoring stale dispatch result"));
                }
                match result {
                    Ok(()) => {
                        let Some(next) = step.on_delivery() else {
                            return Err(reject(format!("{step} sends no message")));
                        };
                        let negotiation = negotiation.transition(next, now).map_err(invalid)?;
                        match arrival_event(next) {
                            Some(kind) => modified(negotiation, kind),
                            None => Ok(CommandOutcome::modified(negotiation)),
                        }
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            negotiation_id = %negotiation.id(),
                            state = %state,
                            state_count = negotiation.meta().state_count,
                            error = %e,
                            "negotiation message not delivered, will retry"
                        );
                        let negotiation = negotiation.transition(*step, now).map_err(invalid)?;
                        Ok(CommandOutcome::modified(negotiation))
                    }
                    Err(e) => modified(negotiation.into_error(e.to_string(), now), NegotiationEventKind::Failed),
                }
            }
        }
    }
}

impl NegotiationCommandHandler {
    /// A handler stamping transitions with `clock` and checking received
    /// terms with `validation`.
    pub fn new(clock: Arc<dyn Clock>, validation: Arc<ContractValidationService>) -> Self {
        Self { clock, validation }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::negotiation::fixtures::{consumer, offer, provider};
    use dsc_core::ManualClock;
    use dsc_policy::PolicyEngine;

    fn handler() -> NegotiationCommandHandler {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(10));
        let validation = ContractValidationService::new(Arc::new(PolicyEngine::new()), Arc::clone(&clock));
        NegotiationCommandHandler::new(clock, Arc::new(validation))
    }

    fn apply(command: NegotiationCommand, negotiation: ContractNegotiation) -> ContractNegotiation {
        match handler().handle(&command, negotiation).unwrap() {
            CommandOutcome::Modified { entity, .. } => entity,
            CommandOutcome::Unchanged => panic!("{} left the negotiation unchanged", command.name()),
        }
    }

    fn requested_consumer() -> ContractNegotiation {
        consumer()
            .transition(ContractNegotiationState::Requesting, 1)
            .unwrap()
            .transition(ContractNegotiationState::Requested, 2)
            .unwrap()
    }

    fn dispatched(step: ContractNegotiationState, result: Result<(), DispatchError>) -> NegotiationCommand {
        NegotiationCommand::DispatchResult {
            negotiation_id: "cn-1".into(),
            step,
            result,
        }
    }

    // ── Cancel and decline ──────────────────────────────────────────

    #[test]
    fn cancel_fails_with_a_fixed_detail() {
        let cancelled = apply(
            NegotiationCommand::Cancel {
                negotiation_id: "cn-1".into(),
            },
            consumer(),
        );
        assert_eq!(cancelled.state().unwrap(), ContractNegotiationState::Error);
        assert_eq!(cancelled.meta().error_detail.as_deref(), Some(CANCELLED_DETAIL));
    }

    #[test]
    fn commands_on_finished_negotiations_are_no_ops() {
        let failed = consumer().into_error("boom", 1);
        let outcome = handler()
            .handle(
                &NegotiationCommand::Cancel {
                    negotiation_id: "cn-1".into(),
                },
                failed,
            )
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Unchanged));
    }

    #[test]
    fn decline_before_requesting_is_rejected() {
        let err = handler()
            .handle(
                &NegotiationCommand::Decline {
                    negotiation_id: "cn-1".into(),
                },
                consumer(),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::Rejected { .. }));
    }

    // ── Dispatch results ────────────────────────────────────────────

    #[test]
    fn delivered_request_moves_to_requested() {
        let requesting = consumer().transition(ContractNegotiationState::Requesting, 1).unwrap();
        let outcome = handler()
            .handle(&dispatched(ContractNegotiationState::Requesting, Ok(())), requesting)
            .unwrap();
        let CommandOutcome::Modified { entity, events } = outcome else {
            panic!("expected a modification");
        };
        assert_eq!(entity.state().unwrap(), ContractNegotiationState::Requested);
        assert_eq!(events[0].kind, NegotiationEventKind::Requested);
    }

    #[test]
    fn transient_failure_reenters_the_step() {
        let requesting = consumer().transition(ContractNegotiationState::Requesting, 1).unwrap();
        let retried = apply(
            dispatched(
                ContractNegotiationState::Requesting,
                Err(DispatchError::Transient("timeout".into())),
            ),
            requesting,
        );
        assert_eq!(retried.state().unwrap(), ContractNegotiationState::Requesting);
        assert_eq!(retried.meta().state_count, 2);
    }

    #[test]
    fn rejected_dispatch_is_fatal() {
        let requesting = consumer().transition(ContractNegotiationState::Requesting, 1).unwrap();
        let failed = apply(
            dispatched(
                ContractNegotiationState::Requesting,
                Err(DispatchError::Rejected("unknown protocol".into())),
            ),
            requesting,
        );
        assert_eq!(failed.state().unwrap(), ContractNegotiationState::Error);
        assert_eq!(
            failed.meta().error_detail.as_deref(),
            Some("dispatch rejected: unknown protocol")
        );
    }

    #[test]
    fn stale_dispatch_result_is_ignored() {
        let outcome = handler()
            .handle(&dispatched(ContractNegotiationState::Requesting, Ok(())), requested_consumer())
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Unchanged));
    }

    // ── Protocol inputs ─────────────────────────────────────────────

    #[test]
    fn counter_offer_for_the_same_asset_is_offered() {
        let offered = apply(
            NegotiationCommand::OfferReceived {
                negotiation_id: "cn-1".into(),
                offer: offer("offer-2"),
            },
            requested_consumer(),
        );
        assert_eq!(offered.state().unwrap(), ContractNegotiationState::Offered);
        assert_eq!(offered.contract_offers().len(), 2);
    }

    #[test]
    fn counter_offer_for_another_asset_is_declined() {
        let mut other = offer("offer-2");
        other.asset_id = "asset-9".into();
        let declining = apply(
            NegotiationCommand::OfferReceived {
                negotiation_id: "cn-1".into(),
                offer: other,
            },
            requested_consumer(),
        );
        assert_eq!(declining.state().unwrap(), ContractNegotiationState::Declining);
    }

    #[test]
    fn matching_agreement_is_attached() {
        let agreement = ContractAgreement::from_offer("agreement-1", &offer("offer-1"), "consumer", 5);
        let agreed = apply(
            NegotiationCommand::AgreementReceived {
                negotiation_id: "cn-1".into(),
                agreement: agreement.clone(),
            },
            requested_consumer(),
        );
        assert_eq!(agreed.state().unwrap(), ContractNegotiationState::Agreed);
        assert_eq!(agreed.contract_agreement(), Some(&agreement));
    }

    #[test]
    fn agreement_overtaking_the_request_acknowledgement_is_kept() {
        let requesting = consumer().transition(ContractNegotiationState::Requesting, 1).unwrap();
        let agreement = ContractAgreement::from_offer("agreement-1", &offer("offer-1"), "consumer", 5);
        let agreed = apply(
            NegotiationCommand::AgreementReceived {
                negotiation_id: "cn-1".into(),
                agreement: agreement.clone(),
            },
            requesting,
        );
        assert_eq!(agreed.state().unwrap(), ContractNegotiationState::Agreed);
        assert_eq!(agreed.contract_agreement(), Some(&agreement));

        let outcome = handler()
            .handle(&dispatched(ContractNegotiationState::Requesting, Ok(())), agreed)
            .unwrap();
        assert!(matches!(outcome, CommandOutcome::Unchanged));
    }

    #[test]
    fn approval_creates_the_agreement_once() {
        let offered = provider()
            .transition(ContractNegotiationState::Offering, 1)
            .unwrap()
            .transition(ContractNegotiationState::Offered, 2)
            .unwrap();
        let confirming = apply(
            NegotiationCommand::ApprovalReceived {
                negotiation_id: "pn-1".into(),
            },
            offered,
        );
        assert_eq!(confirming.state().unwrap(), ContractNegotiationState::Confirming);
        let agreement = confirming.contract_agreement().unwrap();
        assert_eq!(agreement.consumer_id(), "consumer");
        assert_eq!(agreement.asset_id(), "asset-1");
    }

    #[test]
    fn consumers_cannot_counter_offer() {
        let err = handler()
            .handle(
                &NegotiationCommand::CounterOffer {
                    negotiation_id: "cn-1".into(),
                    offer: offer("offer-2"),
                },
                requested_consumer(),
            )
            .unwrap_err();
        assert!(err.to_string().contains("only made by providers"));
    }

    #[test]
    fn rejection_declines() {
        let declined = apply(
            NegotiationCommand::RejectionReceived {
                negotiation_id: "pn-1".into(),
                reason: "not interested".into(),
            },
            provider(),
        );
        assert_eq!(declined.state().unwrap(), ContractNegotiationState::Declined);
    }
}
