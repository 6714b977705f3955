//! Protocol messages exchanged during a negotiation.

use dsc_state::RemoteMessage;
use serde::{Deserialize, Serialize};

use crate::types::{ContractAgreement, ContractOffer};

/// What a negotiation message carries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum NegotiationMessageBody {
    /// Consumer asks for a contract on `offer`.
    #[serde(rename_all = "camelCase")]
    Request {
        /// The proposed terms.
        offer: ContractOffer,
        /// Consuming participant.
        consumer_id: String,
        /// Where the provider sends its replies.
        callback_address: String,
    },
    /// Provider proposes different terms.
    CounterOffer {
        /// The counter-offer.
        offer: ContractOffer,
    },
    /// Consumer accepts the provider's last offer.
    Approval {
        /// The accepted offer.
        offer: ContractOffer,
    },
    /// Provider concludes the negotiation with an agreement.
    Agreement {
        /// The agreement.
        agreement: ContractAgreement,
    },
    /// Either side ends the negotiation.
    Rejection {
        /// Why.
        reason: String,
    },
}

impl NegotiationMessageBody {
    /// Short name for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request { .. } => "request",
            Self::CounterOffer { .. } => "counter-offer",
            Self::Approval { .. } => "approval",
            Self::Agreement { .. } => "agreement",
            Self::Rejection { .. } => "rejection",
        }
    }
}

/// A message to the counterparty of a negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NegotiationMessage {
    /// Protocol binding.
    pub protocol: String,
    /// Counterparty endpoint.
    pub counter_party_address: String,
    /// Id shared by both sides' negotiations, the consumer's negotiation id.
    pub correlation_id: String,
    /// Payload.
    pub body: NegotiationMessageBody,
}

impl RemoteMessage for NegotiationMessage {
    fn protocol(&self) -> &str {
        &self.protocol
    }

    fn counter_party_address(&self) -> &str {
        &self.counter_party_address
    }
}
