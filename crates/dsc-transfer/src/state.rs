//! # Transfer Process States
//!
//! The state set of a transfer process and the transition table between
//! states, expressed as a pure function over `(current, target, type)`.
//!
//! ## Happy paths
//!
//! Consumer: `INITIAL → PROVISIONING → PROVISIONED → REQUESTING → REQUESTED
//! → REQUESTED_ACK → IN_PROGRESS | STREAMING → COMPLETED → DEPROVISIONING →
//! DEPROVISIONED → ENDED`.
//!
//! Provider: `INITIAL → PROVISIONING → PROVISIONED → IN_PROGRESS |
//! STREAMING → COMPLETED → …`. Providers have no request states.
//!
//! ## Direction
//!
//! Every permitted transition moves forward in code order or re-enters the
//! same state, with three exits: `ERROR` and `CANCELLED` are reachable from
//! any live state, and a cancelled or failed process may still be sent to
//! `DEPROVISIONING` to release what it provisioned.

use dsc_core::StateError;
use dsc_state::EntityState;
use serde::{Deserialize, Serialize};

/// Which side of the transfer this process represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessType {
    /// The side receiving data.
    Consumer,
    /// The side serving data.
    Provider,
}

impl std::fmt::Display for ProcessType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Consumer => f.write_str("CONSUMER"),
            Self::Provider => f.write_str("PROVIDER"),
        }
    }
}

/// Lifecycle state of a transfer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransferProcessState {
    Unsaved,
    Initial,
    Provisioning,
    ProvisioningRequested,
    Provisioned,
    Requesting,
    Requested,
    RequestedAck,
    InProgress,
    Streaming,
    Completed,
    Deprovisioning,
    DeprovisioningRequested,
    Deprovisioned,
    Ended,
    Cancelled,
    Error,
}

impl TransferProcessState {
    /// Every state, in code order with `ERROR` last.
    pub const ALL: [Self; 17] = [
        Self::Unsaved,
        Self::Initial,
        Self::Provisioning,
        Self::ProvisioningRequested,
        Self::Provisioned,
        Self::Requesting,
        Self::Requested,
        Self::RequestedAck,
        Self::InProgress,
        Self::Streaming,
        Self::Completed,
        Self::Deprovisioning,
        Self::DeprovisioningRequested,
        Self::Deprovisioned,
        Self::Ended,
        Self::Cancelled,
        Self::Error,
    ];

    /// Whether this state is only meaningful for consumers.
    pub fn is_consumer_only(self) -> bool {
        matches!(self, Self::Requesting | Self::Requested | Self::RequestedAck)
    }

    /// Where the transition table allows `target` to be entered from.
    fn sources(target: Self, process_type: ProcessType) -> &'static [Self] {
        use TransferProcessState::*;
        match (target, process_type) {
            (Unsaved, _) => &[],
            (Initial, _) => &[Unsaved],
            (Provisioning, _) => &[Initial, Provisioning],
            (ProvisioningRequested, _) => &[Provisioning, ProvisioningRequested],
            (Provisioned, _) => &[Provisioning, ProvisioningRequested, Provisioned],
            (Requesting, _) => &[Provisioned, Requesting],
            (Requested, _) => &[Provisioned, Requesting, Requested],
            (RequestedAck, _) => &[Requested, RequestedAck],
            (InProgress, ProcessType::Consumer) => &[Requested, RequestedAck, InProgress],
            (InProgress, ProcessType::Provider) => &[Provisioned, InProgress],
            (Streaming, ProcessType::Consumer) => &[Requested, RequestedAck, Streaming],
            (Streaming, ProcessType::Provider) => &[Provisioned, Streaming],
            (Completed, _) => &[Requested, RequestedAck, InProgress, Streaming, Completed],
            (Deprovisioning, _) => &[Completed, Deprovisioning, Cancelled, Error],
            (DeprovisioningRequested, _) => &[Deprovisioning, DeprovisioningRequested],
            (Deprovisioned, _) => &[Deprovisioning, DeprovisioningRequested, Deprovisioned],
            (Ended, _) => &[Completed, Deprovisioned],
            (Cancelled, _) => &[
                Unsaved,
                Initial,
                Provisioning,
                ProvisioningRequested,
                Provisioned,
                Requesting,
                Requested,
                RequestedAck,
                InProgress,
                Streaming,
                Cancelled,
            ],
            (Error, _) => &[
                Unsaved,
                Initial,
                Provisioning,
                ProvisioningRequested,
                Provisioned,
                Requesting,
                Requested,
                RequestedAck,
                InProgress,
                Streaming,
                Completed,
                Deprovisioning,
                DeprovisioningRequested,
                Deprovisioned,
            ],
        }
    }

    /// Compute the state after moving from `self` to `target`.
    ///
    /// Returns `target` when the table permits it, otherwise an
    /// [`StateError::InvalidTransition`] naming both states.
    pub fn advance(self, target: Self, process_type: ProcessType) -> Result<Self, StateError> {
        if process_type == ProcessType::Provider && target.is_consumer_only() {
            return Err(StateError::invalid(
                self,
                target,
                format!("provider processes have no {target} state"),
            ));
        }
        if Self::sources(target, process_type).contains(&self) {
            Ok(target)
        } else {
            Err(StateError::invalid(self, target, "transition not permitted"))
        }
    }

    /// `IN_PROGRESS` for finite transfers, `STREAMING` otherwise.
    pub fn active(finite: bool) -> Self {
        if finite {
            Self::InProgress
        } else {
            Self::Streaming
        }
    }
}

impl std::fmt::Display for TransferProcessState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unsaved => "UNSAVED",
            Self::Initial => "INITIAL",
            Self::Provisioning => "PROVISIONING",
            Self::ProvisioningRequested => "PROVISIONING_REQUESTED",
            Self::Provisioned => "PROVISIONED",
            Self::Requesting => "REQUESTING",
            Self::Requested => "REQUESTED",
            Self::RequestedAck => "REQUESTED_ACK",
            Self::InProgress => "IN_PROGRESS",
            Self::Streaming => "STREAMING",
            Self::Completed => "COMPLETED",
            Self::Deprovisioning => "DEPROVISIONING",
            Self::DeprovisioningRequested => "DEPROVISIONING_REQUESTED",
            Self::Deprovisioned => "DEPROVISIONED",
            Self::Ended => "ENDED",
            Self::Cancelled => "CANCELLED",
            Self::Error => "ERROR",
        };
        f.write_str(s)
    }
}

impl EntityState for TransferProcessState {
    fn code(self) -> i32 {
        match self {
            Self::Unsaved => 0,
            Self::Initial => 100,
            Self::Provisioning => 200,
            Self::ProvisioningRequested => 250,
            Self::Provisioned => 300,
            Self::Requesting => 400,
            Self::Requested => 500,
            Self::RequestedAck => 550,
            Self::InProgress => 600,
            Self::Streaming => 700,
            Self::Completed => 800,
            Self::Deprovisioning => 900,
            Self::DeprovisioningRequested => 950,
            Self::Deprovisioned => 1000,
            Self::Ended => 1100,
            Self::Cancelled => 1200,
            Self::Error => -1,
        }
    }

    fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.code() == code)
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Ended | Self::Cancelled | Self::Error)
    }
}
