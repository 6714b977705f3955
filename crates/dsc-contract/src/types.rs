//! Contract offers and agreements.

use dsc_policy::Policy;
use serde::{Deserialize, Serialize};

/// Terms proposed for one asset, by either side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractOffer {
    /// Offer id.
    pub id: String,
    /// The offered asset.
    pub asset_id: String,
    /// Usage policy of the asset under this offer.
    pub policy: Policy,
    /// Providing participant.
    pub provider_id: String,
    /// Consuming participant, once known.
    #[serde(default)]
    pub consumer_id: Option<String>,
    /// Start of the validity window, epoch millis.
    pub contract_start: i64,
    /// End of the validity window, epoch millis. Exclusive.
    pub contract_end: i64,
}

impl ContractOffer {
    /// An offer valid for all time.
    pub fn new(
        id: impl Into<String>,
        asset_id: impl Into<String>,
        provider_id: impl Into<String>,
        policy: Policy,
    ) -> Self {
        Self {
            id: id.into(),
            asset_id: asset_id.into(),
            policy,
            provider_id: provider_id.into(),
            consumer_id: None,
            contract_start: 0,
            contract_end: i64::MAX,
        }
    }

    /// Restrict the validity window to `[start, end)`.
    pub fn with_validity(mut self, start: i64, end: i64) -> Self {
        self.contract_start = start;
        self.contract_end = end;
        self
    }

    /// Name the consuming participant.
    pub fn with_consumer(mut self, consumer_id: impl Into<String>) -> Self {
        self.consumer_id = Some(consumer_id.into());
        self
    }

    /// Whether `now` falls inside the validity window.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.contract_start <= now && now < self.contract_end
    }
}

/// The terms both sides agreed to. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContractAgreement {
    id: String,
    provider_id: String,
    consumer_id: String,
    asset_id: String,
    policy: Policy,
    contract_signing_date: i64,
    contract_start_date: i64,
    contract_end_date: i64,
}

impl ContractAgreement {
    /// Agree on `offer` between its provider and `consumer_id`, signed at
    /// `signed_at`.
    pub fn from_offer(
        id: impl Into<String>,
        offer: &ContractOffer,
        consumer_id: impl Into<String>,
        signed_at: i64,
    ) -> Self {
        Self {
            id: id.into(),
            provider_id: offer.provider_id.clone(),
            consumer_id: consumer_id.into(),
            asset_id: offer.asset_id.clone(),
            policy: offer.policy.clone(),
            contract_signing_date: signed_at,
            contract_start_date: offer.contract_start,
            contract_end_date: offer.contract_end,
        }
    }

    /// Agreement id. Transfers reference it as their contract id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Providing participant.
    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    /// Consuming participant.
    pub fn consumer_id(&self) -> &str {
        &self.consumer_id
    }

    /// The agreed asset.
    pub fn asset_id(&self) -> &str {
        &self.asset_id
    }

    /// The agreed usage policy.
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    /// When the agreement was signed, epoch millis.
    pub fn contract_signing_date(&self) -> i64 {
        self.contract_signing_date
    }

    /// Start of the agreement's validity, epoch millis.
    pub fn contract_start_date(&self) -> i64 {
        self.contract_start_date
    }

    /// End of the agreement's validity, epoch millis. Exclusive.
    pub fn contract_end_date(&self) -> i64 {
        self.contract_end_date
    }

    /// Whether `now` falls inside the validity window.
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.contract_start_date <= now && now < self.contract_end_date
    }
}
