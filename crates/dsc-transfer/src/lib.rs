//! # dsc-transfer: Transfer Process Management
//!
//! Moves data between two connectors once a contract is in place. A
//! consumer process provisions its destination, asks the provider to
//! start, and waits for completion; a provider process provisions what
//! it needs and hands the request to a data flow controller.
//!
//! ## Modules
//!
//! - [`state`]: transfer states and the transition table.
//! - [`types`]: data addresses, data requests and resource records.
//! - [`process`]: the [`TransferProcess`] entity.
//! - [`manifest`]: resource manifest generation.
//! - [`provision`]: provisioners, the provision manager and the vault.
//! - [`flow`]: data flow controllers and their dispatch.
//! - [`status`]: completion checks for running transfers.
//! - [`message`]: the transfer request sent to a provider.
//! - [`command`]: out-of-band commands and their handler.
//! - [`manager`]: the [`TransferProcessManager`].
//!
//! ## Lifecycle
//!
//! ```text
//! INITIAL → PROVISIONING → PROVISIONED → REQUESTING → REQUESTED → REQUESTED_ACK
//!         → IN_PROGRESS | STREAMING → COMPLETED → DEPROVISIONING → DEPROVISIONED → ENDED
//! ```
//!
//! Providers go from PROVISIONED straight to IN_PROGRESS or STREAMING.
//! Any non-terminal process can be cancelled or failed through a command.

pub mod command;
pub mod flow;
pub mod manager;
pub mod manifest;
pub mod message;
pub mod process;
pub mod provision;
pub mod state;
pub mod status;
pub mod types;

pub use command::{TransferCommand, TransferCommandHandler};
pub use flow::{DataAddressResolver, DataFlowController, DataFlowManager};
pub use manager::{
    TransferDispatcherRegistry, TransferError, TransferProcessManager, TransferProcessManagerBuilder,
    DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS, DEFAULT_SEND_RETRY_LIMIT,
};
pub use manifest::{
    ManifestError, ResourceDefinitionGenerator, ResourceManifestGenerator, MANIFEST_VERIFICATION_SCOPE,
};
pub use message::TransferRequestMessage;
pub use process::{TransferEventKind, TransferProcess, TransferProcessEvent};
pub use provision::{InMemoryVault, ProvisionManager, Provisioner, Vault, VaultError};
pub use state::{ProcessType, TransferProcessState};
pub use status::{StatusChecker, StatusCheckerRegistry};
pub use types::{
    DataAddress, DataRequest, DeprovisionedResource, ProvisionResponse, ProvisionedResource,
    ResourceDefinition, ResourceManifest, TransferType, KEY_NAME_PROPERTY, TYPE_PROPERTY,
};
