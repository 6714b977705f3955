//! # Transfer Commands
//!
//! Out-of-band instructions for transfer processes. Some come from API
//! callers (cancel, fail, complete, deprovision), some from counterparties
//! or asynchronous provisioners (acknowledge, resources provisioned or
//! released), and some are the manager's own continuations reporting the
//! outcome of a provision, deprovision or dispatch call it started.
//!
//! ## Idempotence
//!
//! A command aimed at a process that has already moved on is a no-op
//! rather than an error: cancelling a failed process keeps its original
//! `error_detail`, and a late provisioning result for a cancelled process
//! is still recorded so the resource can be released, but does not move
//! the process.

use std::sync::Arc;

use dsc_core::{Clock, StatusResult};
use dsc_state::{CommandError, CommandHandler, CommandOutcome, DispatchError, EntityCommand, EntityState, StatefulEntity};

use crate::process::{TransferEventKind, TransferProcess};
use crate::provision::Vault;
use crate::state::TransferProcessState;
use crate::types::{DeprovisionedResource, ProvisionResponse, KEY_NAME_PROPERTY};

/// A command targeting one transfer process.
#[derive(Debug, Clone)]
pub enum TransferCommand {
    /// Stop the process; it ends `CANCELLED`.
    Cancel {
        /// Target process.
        process_id: String,
    },
    /// Move the process to `ERROR` with `reason` as detail.
    Fail {
        /// Target process.
        process_id: String,
        /// Failure detail.
        reason: String,
    },
    /// The data plane reports the transfer finished.
    Complete {
        /// Target process.
        process_id: String,
    },
    /// The provider acknowledged a consumer's request.
    Acknowledge {
        /// Target process.
        process_id: String,
    },
    /// Release the process's resources.
    Deprovision {
        /// Target process.
        process_id: String,
    },
    /// An asynchronous provisioner finished creating a resource.
    AddProvisionedResource {
        /// Target process.
        process_id: String,
        /// The provisioner's final response.
        response: ProvisionResponse,
    },
    /// An asynchronous provisioner finished releasing a resource.
    DeprovisionComplete {
        /// Target process.
        process_id: String,
        /// The released resource.
        resource: DeprovisionedResource,
    },
    /// Outcome of a provision call, one entry per definition.
    ProvisionResults {
        /// Target process.
        process_id: String,
        /// Per-definition results.
        results: Vec<StatusResult<ProvisionResponse>>,
    },
    /// Outcome of a deprovision call, one entry per resource.
    DeprovisionResults {
        /// Target process.
        process_id: String,
        /// Per-resource results.
        results: Vec<StatusResult<DeprovisionedResource>>,
    },
    /// Outcome of sending the transfer request to the provider.
    DispatchResult {
        /// Target process.
        process_id: String,
        /// Delivery outcome.
        result: Result<(), DispatchError>,
    },
}

impl EntityCommand for TransferCommand {
    fn entity_id(&self) -> &str {
        match self {
            Self::Cancel { process_id }
            | Self::Fail { process_id, .. }
            | Self::Complete { process_id }
            | Self::Acknowledge { process_id }
            | Self::Deprovision { process_id }
            | Self::AddProvisionedResource { process_id, .. }
            | Self::DeprovisionComplete { process_id, .. }
            | Self::ProvisionResults { process_id, .. }
            | Self::DeprovisionResults { process_id, .. }
            | Self::DispatchResult { process_id, .. } => process_id,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Cancel { .. } => "CancelTransfer",
            Self::Fail { .. } => "FailTransfer",
            Self::Complete { .. } => "CompleteTransfer",
            Self::Acknowledge { .. } => "AcknowledgeTransfer",
            Self::Deprovision { .. } => "DeprovisionRequest",
            Self::AddProvisionedResource { .. } => "AddProvisionedResource",
            Self::DeprovisionComplete { .. } => "DeprovisionComplete",
            Self::ProvisionResults { .. } => "ProvisionResults",
            Self::DeprovisionResults { .. } => "DeprovisionResults",
            Self::DispatchResult { .. } => "TransferDispatchResult",
        }
    }
}

type Outcome = Result<CommandOutcome<TransferProcess>, CommandError>;

fn modified(process: TransferProcess, kind: TransferEventKind) -> Outcome {
    let event = process.event(kind);
    Ok(CommandOutcome::Modified {
        entity: process,
        events: vec![event],
    })
}

/// Applies [`TransferCommand`]s.
pub struct TransferCommandHandler {
    clock: Arc<dyn Clock>,
    vault: Arc<dyn Vault>,
}

impl std::fmt::Debug for TransferCommandHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferCommandHandler").finish_non_exhaustive()
    }
}

impl CommandHandler<TransferProcess, TransferCommand> for TransferCommandHandler {
    fn handle(&self, command: &TransferCommand, process: TransferProcess) -> Outcome {
        let now = self.clock.now_millis();
        let reject = |reason: String| CommandError::Rejected {
            command: command.name(),
            reason,
        };
        let state = process.state().map_err(|e| reject(e.to_string()))?;

        match command {
            TransferCommand::Cancel { .. } => {
                if state.is_terminal() {
                    return Ok(CommandOutcome::Unchanged);
                }
                let process = process
                    .transition(TransferProcessState::Cancelled, now)
                    .map_err(|e| reject(e.to_string()))?;
                modified(process, TransferEventKind::Cancelled)
            }
            TransferCommand::Fail { reason, .. } => {
                if state.is_terminal() {
                    return Ok(CommandOutcome::Unchanged);
                }
                modified(process.into_error(reason.clone(), now), TransferEventKind::Failed)
            }
            TransferCommand::Complete { .. } => {
                if state.is_terminal() || state == TransferProcessState::Completed {
                    return Ok(CommandOutcome::Unchanged);
                }
                let process = process
                    .transition(TransferProcessState::Completed, now)
                    .map_err(|e| reject(e.to_string()))?;
                modified(process, TransferEventKind::Completed)
            }
            TransferCommand::Acknowledge { .. } => {
                if state != TransferProcessState::Requested {
                    tracing::debug!(process_id = %process.id(), state = %state, "ignoring late acknowledgement");
                    return Ok(CommandOutcome::Unchanged);
                }
                let process = process
                    .transition(TransferProcessState::RequestedAck, now)
                    .map_err(|e| reject(e.to_string()))?;
                Ok(CommandOutcome::modified(process))
            }
            TransferCommand::Deprovision { .. } => {
                if process.deprovision_complete() || state == TransferProcessState::Ended {
                    return Ok(CommandOutcome::Unchanged);
                }
                let process = process
                    .transition(TransferProcessState::Deprovisioning, now)
                    .map_err(|e| reject(e.to_string()))?;
                Ok(CommandOutcome::modified(process))
            }
            TransferCommand::AddProvisionedResource { response, .. } => {
                self.apply_provision_results(process, state, vec![Ok(response.clone())], now)
                    .map_err(|e| reject(e.to_string()))
            }
            TransferCommand::ProvisionResults { results, .. } => self
                .apply_provision_results(process, state, results.clone(), now)
                .map_err(|e| reject(e.to_string())),
            TransferCommand::DeprovisionComplete { resource, .. } => self
                .apply_deprovision_results(process, state, vec![Ok(resource.clone())], now)
                .map_err(|e| reject(e.to_string())),
            TransferCommand::DeprovisionResults { results, .. } => self
                .apply_deprovision_results(process, state, results.clone(), now)
                .map_err(|e| reject(e.to_string())),
            TransferCommand::DispatchResult { result, .. } => {
                if state != TransferProcessState::Requesting {
                    return Ok(CommandOutcome::Unchanged);
                }
                match result {
                    Ok(()) => {
                        let process = process
                            .transition(TransferProcessState::Requested, now)
                            .map_err(|e| reject(e.to_string()))?;
                        modified(process, TransferEventKind::Requested)
                    }
                    Err(e) if e.is_transient() => {
                        tracing::warn!(
                            process_id = %process.id(),
                            state_count = process.meta().state_count,
                            error = %e,
                            "transfer request not delivered, will retry"
                        );
                        let process = process
                            .transition(TransferProcessState::Requesting, now)
                            .map_err(|e| reject(e.to_string()))?;
                        Ok(CommandOutcome::modified(process))
                    }
                    Err(e) => modified(process.into_error(e.to_string(), now), TransferEventKind::Failed),
                }
            }
        }
    }
}

impl TransferCommandHandler {
    /// A handler stamping transitions with `clock` and storing provisioned
    /// secrets in `vault`.
    pub fn new(clock: Arc<dyn Clock>, vault: Arc<dyn Vault>) -> Self {
        Self { clock, vault }
    }

    fn apply_provision_results(
        &self,
        mut process: TransferProcess,
        state: TransferProcessState,
        results: Vec<StatusResult<ProvisionResponse>>,
        now: i64,
    ) -> Result<CommandOutcome<TransferProcess>, dsc_core::StateError> {
        let mut fatal: Option<String> = None;
        let mut retry = false;
        let mut in_process = false;

        for result in results {
            match result {
                Ok(response) if response.in_process => in_process = true,
                Ok(response) => {
                    if let Err(detail) = self.record_provisioned(&mut process, response, now) {
                        fatal.get_or_insert(detail);
                    }
                }
                Err(failure) if failure.is_fatal() => {
                    fatal.get_or_insert(failure.detail());
                }
                Err(failure) => {
                    tracing::warn!(process_id = %process.id(), error = %failure, "provisioning will be retried");
                    retry = true;
                }
            }
        }

        if !matches!(
            state,
            TransferProcessState::Provisioning | TransferProcessState::ProvisioningRequested
        ) {
            return Ok(CommandOutcome::modified(process));
        }
        if let Some(detail) = fatal {
            let failed = process.into_error(detail, now);
            let event = failed.failure_event();
            return Ok(CommandOutcome::Modified {
                entity: failed,
                events: vec![event],
            });
        }
        if process.provisioning_complete() {
            let process = process.transition_provisioned(now)?;
            let event = process.event(TransferEventKind::Provisioned);
            return Ok(CommandOutcome::Modified {
                entity: process,
                events: vec![event],
            });
        }
        if in_process {
            let process = process.transition(TransferProcessState::ProvisioningRequested, now)?;
            let event = process.event(TransferEventKind::ProvisioningRequested);
            return Ok(CommandOutcome::Modified {
                entity: process,
                events: vec![event],
            });
        }
        if retry || state == TransferProcessState::Provisioning {
            let process = process.transition(TransferProcessState::Provisioning, now)?;
            return Ok(CommandOutcome::modified(process));
        }
        Ok(CommandOutcome::modified(process))
    }

    fn record_provisioned(
        &self,
        process: &mut TransferProcess,
        response: ProvisionResponse,
        now: i64,
    ) -> Result<(), String> {
        let mut resource = response.resource;
        if let Some(token) = &response.secret_token {
            let key = resource
                .data_address
                .as_ref()
                .and_then(|a| a.key_name())
                .map(str::to_string)
                .unwrap_or_else(|| resource.resource_name.clone());
            self.vault
                .store_secret(&key, token)
                .map_err(|e| format!("failed to store secret of resource {}: {e}", resource.id))?;
            if let Some(address) = resource.data_address.take() {
                resource.data_address = Some(address.with_property(KEY_NAME_PROPERTY, key));
            }
        }
        process.add_provisioned_resource(resource, now);
        Ok(())
    }

    fn apply_deprovision_results(
        &self,
        mut process: TransferProcess,
        state: TransferProcessState,
        results: Vec<StatusResult<DeprovisionedResource>>,
        now: i64,
    ) -> Result<CommandOutcome<TransferProcess>, dsc_core::StateError> {
        let mut fatal: Option<String> = None;
        let mut retry = false;
        let mut in_process = false;

        for result in results {
            match result {
                Ok(resource) => {
                    in_process |= resource.in_process;
                    if !resource.in_process {
                        self.release_secret(&process, &resource.provisioned_resource_id);
                    }
                    process.add_deprovisioned_resource(resource, now);
                }
                Err(failure) if failure.is_fatal() => {
                    fatal.get_or_insert(failure.detail());
                }
                Err(failure) => {
                    tracing::warn!(process_id = %process.id(), error = %failure, "deprovisioning will be retried");
                    retry = true;
                }
            }
        }

        if !matches!(
            state,
            TransferProcessState::Deprovisioning | TransferProcessState::DeprovisioningRequested
        ) {
            return Ok(CommandOutcome::modified(process));
        }
        if let Some(detail) = fatal {
            let failed = process.into_error(detail, now);
            let event = failed.failure_event();
            return Ok(CommandOutcome::Modified {
                entity: failed,
                events: vec![event],
            });
        }
        if process.deprovision_complete() {
            let process = process.transition(TransferProcessState::Deprovisioned, now)?;
            let event = process.event(TransferEventKind::Deprovisioned);
            return Ok(CommandOutcome::Modified {
                entity: process,
                events: vec![event],
            });
        }
        if in_process {
            let process = process.transition(TransferProcessState::DeprovisioningRequested, now)?;
            let event = process.event(TransferEventKind::DeprovisioningRequested);
            return Ok(CommandOutcome::Modified {
                entity: process,
                events: vec![event],
            });
        }
        if retry || state == TransferProcessState::Deprovisioning {
            let process = process.transition(TransferProcessState::Deprovisioning, now)?;
            return Ok(CommandOutcome::modified(process));
        }
        Ok(CommandOutcome::modified(process))
    }

    fn release_secret(&self, process: &TransferProcess, resource_id: &str) {
        let key = process
            .provisioned_resource(resource_id)
            .and_then(|r| r.data_address.as_ref())
            .and_then(|a| a.key_name());
        if let Some(key) = key {
            if let Err(e) = self.vault.delete_secret(key) {
                tracing::warn!(process_id = %process.id(), resource_id, error = %e, "failed to delete secret");
            }
        }
    }
}
