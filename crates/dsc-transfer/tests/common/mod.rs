//! Shared wiring for the transfer manager integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dsc_core::{Clock, ManualClock, StatusResult, WorkerId};
use dsc_policy::{Policy, PolicyArchive};
use dsc_state::{DispatchError, EntityState, InMemoryEntityStore, RemoteMessageDispatcher, StatefulEntity};
use dsc_transfer::{
    DataAddress, DataRequest, DeprovisionedResource, InMemoryVault, ProvisionManager,
    ProvisionResponse, ProvisionedResource, Provisioner, ResourceDefinition,
    ResourceManifestGenerator, TransferDispatcherRegistry, TransferProcess,
    TransferProcessManager, TransferProcessManagerBuilder, TransferProcessState,
    TransferRequestMessage,
};
use parking_lot::Mutex;

pub const PROTOCOL: &str = "loopback";
pub const DESTINATION: &str = "bucket-store";

pub struct Contracts;

impl PolicyArchive for Contracts {
    fn find_policy_for_contract(&self, contract_id: &str) -> Option<Policy> {
        contract_id.starts_with("contract-").then(Policy::new)
    }
}

/// How the bucket provisioner answers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Completed,
    Deferred,
}

/// Creates one bucket per definition and hands out an access token.
pub struct Buckets {
    pub mode: Mutex<Mode>,
    pub provisioned: AtomicUsize,
    pub deprovisioned: AtomicUsize,
}

impl Buckets {
    pub fn new(mode: Mode) -> Arc<Self> {
        Arc::new(Self {
            mode: Mutex::new(mode),
            provisioned: AtomicUsize::new(0),
            deprovisioned: AtomicUsize::new(0),
        })
    }

    pub fn resource_for(definition: &ResourceDefinition) -> ProvisionedResource {
        ProvisionedResource::new(
            format!("res-{}", definition.transfer_process_id),
            definition,
            format!("bucket-{}", definition.transfer_process_id),
        )
        .with_data_address(DataAddress::new(DESTINATION))
    }
}

#[async_trait]
impl Provisioner for Buckets {
    fn can_provision(&self, definition: &ResourceDefinition) -> bool {
        definition.resource_type == "bucket"
    }

    fn can_deprovision(&self, resource: &ProvisionedResource) -> bool {
        resource.resource_type == "bucket"
    }

    async fn provision(
        &self,
        definition: ResourceDefinition,
        _policy: &Policy,
    ) -> StatusResult<ProvisionResponse> {
        self.provisioned.fetch_add(1, Ordering::SeqCst);
        let resource = Self::resource_for(&definition);
        match *self.mode.lock() {
            Mode::Completed => Ok(ProvisionResponse::completed(resource).with_secret("s3cr3t")),
            Mode::Deferred => Ok(ProvisionResponse::in_process(resource)),
        }
    }

    async fn deprovision(
        &self,
        resource: ProvisionedResource,
        _policy: &Policy,
    ) -> StatusResult<DeprovisionedResource> {
        self.deprovisioned.fetch_add(1, Ordering::SeqCst);
        Ok(DeprovisionedResource::completed(resource.id))
    }
}

/// Delivers transfer requests nowhere, optionally refusing them.
pub struct Loopback {
    pub refuse: AtomicBool,
    pub sent: AtomicUsize,
}

impl Loopback {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            refuse: AtomicBool::new(false),
            sent: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl RemoteMessageDispatcher<TransferRequestMessage> for Loopback {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, _message: TransferRequestMessage) -> Result<(), DispatchError> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        if self.refuse.load(Ordering::SeqCst) {
            return Err(DispatchError::Rejected("request refused by provider".into()));
        }
        Ok(())
    }
}

pub struct Connector {
    pub clock: Arc<ManualClock>,
    pub store: InMemoryEntityStore<TransferProcess>,
    pub buckets: Arc<Buckets>,
    pub dispatcher: Arc<Loopback>,
    pub vault: Arc<InMemoryVault>,
    pub manager: TransferProcessManager,
}

pub fn manifests() -> Arc<ResourceManifestGenerator> {
    let mut generator = ResourceManifestGenerator::new();
    generator.register_consumer_generator(|request: &DataRequest, _: &Policy| {
        Some(ResourceDefinition::new(format!("{}-bucket", request.id), "bucket"))
    });
    Arc::new(generator)
}

pub fn connector(
    mode: Mode,
    configure: impl FnOnce(TransferProcessManagerBuilder) -> TransferProcessManagerBuilder,
) -> Connector {
    let clock = Arc::new(ManualClock::new(1_000));
    let store = InMemoryEntityStore::new(WorkerId::new("worker-1"), clock.clone() as Arc<dyn Clock>);
    let buckets = Buckets::new(mode);
    let provisioning = Arc::new(ProvisionManager::new());
    provisioning.register(buckets.clone());
    let dispatcher = Loopback::new();
    let dispatchers = Arc::new(TransferDispatcherRegistry::new());
    dispatchers.register(dispatcher.clone());
    let vault = Arc::new(InMemoryVault::new());

    let builder = TransferProcessManager::builder("transfers")
        .store(Arc::new(store.clone()))
        .provision_manager(provisioning)
        .policy_archive(Arc::new(Contracts))
        .manifest_generator(manifests())
        .dispatcher_registry(dispatchers)
        .vault(vault.clone())
        .clock(clock.clone());
    let manager = configure(builder).build().expect("manager builds");

    Connector {
        clock,
        store,
        buckets,
        dispatcher,
        vault,
        manager,
    }
}

pub fn request(id: &str) -> DataRequest {
    DataRequest::new(id, "asset-1", "contract-1", DataAddress::new(DESTINATION))
        .with_counterparty("provider", "http://provider.test/api", PROTOCOL)
}

/// Let spawned provisioning and dispatch calls report back.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(20)).await;
}

pub fn state_of(connector: &Connector, id: &str) -> TransferProcessState {
    let process = connector
        .manager
        .find(id)
        .expect("store readable")
        .expect("process exists");
    let state = process.state().expect("known state");
    assert_eq!(state.code(), process.meta().state);
    state
}
