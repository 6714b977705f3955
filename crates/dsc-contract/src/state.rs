//! # Contract Negotiation States
//!
//! The state set of a contract negotiation and its transition table,
//! expressed as a pure function over `(current, target, type)`.
//!
//! ## Happy paths
//!
//! Consumer: `INITIAL → REQUESTING → REQUESTED → AGREED → CONFIRMED`, or
//! with a counter-offer `REQUESTED → OFFERED → APPROVING → APPROVED →
//! AGREED → CONFIRMED`.
//!
//! Provider: `REQUESTED → CONFIRMING → CONFIRMED`, or with a counter-offer
//! `REQUESTED → OFFERING → OFFERED → CONFIRMING → CONFIRMED`.
//!
//! Either side may leave through `DECLINING → DECLINED`, and any live
//! negotiation may fail to `ERROR`. Every other move goes forward in code
//! order.

use dsc_core::StateError;
use dsc_state::EntityState;
use serde::{Deserialize, Serialize};

/// Which side of the negotiation this entity represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NegotiationType {
    /// The side asking for the contract.
    Consumer,
    /// The side offering the asset.
    Provider,
}

impl std::fmt::Display for NegotiationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => f.write_str("CONSUMER"),
            Self::Provider => f.write_str("PROVIDER"),
        }
    }
}

/// Lifecycle state of a contract negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ContractNegotiationState {
    Unsaved,
    Initial,
    Requesting,
    Requested,
    Offering,
    Offered,
    Approving,
    Approved,
    Agreed,
    Confirming,
    Confirmed,
    Declining,
    Declined,
    Error,
}

impl ContractNegotiationState {
    /// Every state, in code order with `ERROR` last.
    pub const ALL: [Self; 14] = [
        Self::Unsaved,
        Self::Initial,
        Self::Requesting,
        Self::Requested,
        Self::Offering,
        Self::Offered,
        Self::Approving,
        Self::Approved,
        Self::Agreed,
        Self::Confirming,
        Self::Confirmed,
        Self::Declining,
        Self::Declined,
        Self::Error,
    ];

    /// The side that can be in this state, if only one can.
    pub fn owner(self) -> Option<NegotiationType> {
        match self {
            Self::Requesting | Self::Approving | Self::Approved | Self::Agreed => {
                Some(NegotiationType::Consumer)
            }
            Self::Offering | Self::Confirming => Some(NegotiationType::Provider),
            _ => None,
        }
    }

    /// The state entered once the message sent from this state was
    /// delivered. `None` for states that send nothing.
    pub fn on_delivery(self) -> Option<Self> {
        match self {
            Self::Requesting => Some(Self::Requested),
            Self::Offering => Some(Self::Offered),
            Self::Approving => Some(Self::Approved),
            Self::Declining => Some(Self::Declined),
            Self::Confirming => Some(Self::Confirmed),
            _ => None,
        }
    }

    fn sources(target: Self, negotiation_type: NegotiationType) -> &'static [Self] {
        use ContractNegotiationState::*;
        use NegotiationType::{Consumer, Provider};
        match (target, negotiation_type) {
            (Unsaved, _) => &[],
            (Initial, _) => &[Unsaved],
            (Requesting, _) => &[Initial, Requesting],
            (Requested, Consumer) => &[Requesting, Requested],
            (Requested, Provider) => &[Unsaved, Requested],
            (Offering, _) => &[Requested, Offering],
            (Offered, Consumer) => &[Requested, Offered],
            (Offered, Provider) => &[Offering, Offered],
            (Approving, _) => &[Offered, Approving],
            (Approved, _) => &[Approving, Approved],
            (Agreed, _) => &[Requesting, Requested, Offered, Approving, Approved],
            (Declining, Consumer) => &[Requesting, Requested, Offered, Approved, Declining],
            (Declining, Provider) => &[Requested, Offered, Declining],
            (Declined, _) => &[
                Initial, Requesting, Requested, Offering, Offered, Approving, Approved, Agreed,
                Declining, Confirming,
            ],
            (Confirming, _) => &[Requested, Offered, Confirming],
            (Confirmed, Consumer) => &[Agreed],
            (Confirmed, Provider) => &[Confirming],
            (Error, _) => &[
                Unsaved, Initial, Requesting, Requested, Offering, Offered, Approving, Approved,
                Agreed, Declining, Confirming,
            ],
        }
    }

    /// Compute the state after moving from `self` to `target`.
    pub fn advance(self, target: Self, negotiation_type: NegotiationType) -> Result<Self, StateError> {
        if let Some(owner) = target.owner() {
            if owner != negotiation_type {
                let side = match negotiation_type {
                    NegotiationType::Consumer => "consumer",
                    NegotiationType::Provider => "provider",
                };
                return Err(StateError::invalid(
                    self,
                    target,
                    format!("{side} negotiations have no {target} state"),
                ));
            }
        }
        if Self::sources(target, negotiation_type).contains(&self) {
            Ok(target)
        } else {
            Err(StateError::invalid(self, target, "transition not permitted"))
        }
    }
}

impl std::fmt::Display for ContractNegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unsaved => "UNSAVED",
            Self::Initial => "INITIAL",
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::Offering => "OFFERING",
            Self::Offered => "OFFERED",
            Self::Approving => "APPROVING",
            Self::Approved => "APPROVED",
            Self::Agreed => "AGREED",
            Self::Declining => "DECLINING",
            Self::Declined => "DECLINED",
            Self::Confirming => "CONFIRMING",
            Self::Confirmed => "CONFIRMED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl EntityState for ContractNegotiationState {
    fn code(self) -> i32 {
        match self {
            Self::Unsaved => 0,
            Self::Initial => 50,
            Self::Requesting => 100,
            Self::Requested => 200,
            Self::Offering => 300,
            Self::Offered => 400,
            Self::Approving => 500,
            Self::Approved => 600,
            Self::Agreed => 650,
            Self::Confirming => 700,
            Self::Confirmed => 800,
            Self::Declining => 900,
            Self::Declined => 1000,
            Self::Error => -1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Declined | Self::Confirmed | Self::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ContractNegotiationState::*;
    use NegotiationType::{Consumer, Provider};

    fn walk(path: &[ContractNegotiationState], negotiation_type: NegotiationType) {
        for pair in path.windows(2) {
            assert_eq!(
                pair[0].advance(pair[1], negotiation_type),
                Ok(pair[1]),
                "{} -> {} ({negotiation_type})",
                pair[0],
                pair[1]
            );
        }
    }

    // ── Happy paths ─────────────────────────────────────────────────

    #[test]
    fn consumer_paths() {
        walk(&[Unsaved, Initial, Requesting, Requested, Agreed, Confirmed], Consumer);
        walk(
            &[Requested, Offered, Approving, Approved, Agreed, Confirmed],
            Consumer,
        );
        walk(&[Offered, Declining, Declined], Consumer);
        // Agreement delivered before the request's send was acknowledged.
        walk(&[Requesting, Agreed, Confirmed], Consumer);
    }

    #[test]
    fn provider_paths() {
        walk(&[Unsaved, Requested, Confirming, Confirmed], Provider);
        walk(&[Requested, Offering, Offered, Confirming, Confirmed], Provider);
        walk(&[Requested, Declining, Declined], Provider);
    }

    // ── Side restrictions ───────────────────────────────────────────

    #[test]
    fn sides_cannot_enter_each_others_states() {
        let err = Requested.advance(Confirming, Consumer).unwrap_err();
        assert!(err.to_string().contains("consumer negotiations have no CONFIRMING state"));
        let err = Offered.advance(Approving, Provider).unwrap_err();
        assert!(err.to_string().contains("provider negotiations have no APPROVING state"));
    }

    #[test]
    fn delivery_targets() {
        assert_eq!(Requesting.on_delivery(), Some(Requested));
        assert_eq!(Confirming.on_delivery(), Some(Confirmed));
        assert_eq!(Requested.on_delivery(), None);
        for state in ContractNegotiationState::ALL {
            if let Some(next) = state.on_delivery() {
                let side = state.owner().unwrap_or(Consumer);
                assert_eq!(state.advance(next, side), Ok(next), "{state}");
            }
        }
    }

    #[test]
    fn terminal_states_cannot_be_left() {
        for from in [Declined, Confirmed, Error] {
            assert!(from.is_terminal());
            for to in ContractNegotiationState::ALL {
                assert!(from.advance(to, Consumer).is_err(), "{from} -> {to}");
                assert!(from.advance(to, Provider).is_err(), "{from} -> {to}");
            }
        }
    }

    #[test]
    fn codes_round_trip() {
        for state in ContractNegotiationState::ALL {
            assert_eq!(ContractNegotiationState::from_code(state.code()), Some(state));
        }
        assert_eq!(ContractNegotiationState::from_code(42), None);
    }
}
