//! In-process demo connector.
//!
//! Runs a consumer and a provider side by side in one process. Messages
//! between them go through in-process dispatchers, destinations are
//! in-memory buckets provisioned by the consumer, and the provider's data
//! flow controller copies each asset's payload into the bucket it is
//! asked to fill.
//!
//! Every seeded transfer goes through contract negotiation first; the
//! agreement id becomes the transfer's contract id and the provider
//! resolves the transfer policy from its own negotiation store.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dsc_contract::{
    ConsumerNegotiationManager, ContractNegotiation, ContractNegotiationState, ContractOffer,
    ContractOfferRequest, ContractRequest, ContractValidationService, NegotiationCommand,
    NegotiationDispatcherRegistry, NegotiationError, NegotiationEventKind, NegotiationManagerBuilder,
    NegotiationMessage, NegotiationMessageBody, NegotiationPolicyArchive, OfferCatalog,
    ProviderNegotiationManager, NEGOTIATION_SCOPE, PARTICIPANT_IDENTITY_CLAIM,
};
use dsc_core::{Clock, Criterion, QuerySpec, StatusFailure, StatusResult, SystemClock, WorkerId};
use dsc_policy::{
    Action, Constraint, Operator, ParticipantAgent, Permission, Policy, PolicyArchive, PolicyEngine, RuleKind,
};
use dsc_state::{
    DispatchError, EntityState, EntityStore, ExponentialWaitStrategy, FixedWaitStrategy, InMemoryEntityStore,
    ManagerError, RemoteMessageDispatcher, StatefulEntity, WaitStrategy,
};
use dsc_transfer::{
    DataAddress, DataAddressResolver, DataFlowController, DataFlowManager, DataRequest, DeprovisionedResource,
    ProvisionManager, ProvisionResponse, ProvisionedResource, Provisioner, ResourceDefinition,
    ResourceManifestGenerator, StatusChecker, StatusCheckerRegistry, TransferCommand, TransferDispatcherRegistry,
    TransferError, TransferEventKind, TransferProcess, TransferProcessManager, TransferProcessManagerBuilder,
    TransferProcessState, TransferRequestMessage,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{ConnectorConfig, ManagerConfig};

/// Protocol name of the in-process dispatchers.
pub const PROTOCOL: &str = "in-process";
/// Participant id of the demo consumer.
pub const CONSUMER_ID: &str = "demo-consumer";
/// Destination type of in-memory buckets.
pub const MEMORY_DESTINATION: &str = "memory";
/// Content address type of demo assets.
pub const MEMORY_SOURCE: &str = "memory-source";

const CONSUMER_ADDRESS: &str = "inproc://consumer";
const PROVIDER_ADDRESS: &str = "inproc://provider";
const MEMORY_BUCKET: &str = "memory-bucket";
const BUCKET_PROPERTY: &str = "bucket";
const PAYLOAD_PROPERTY: &str = "payload";
const POLL_INTERVAL: Duration = Duration::from_millis(20);
const ACKNOWLEDGE_ATTEMPTS: usize = 250;

/// Demo failures.
#[derive(Debug, thiserror::Error)]
pub enum DemoError {
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
    #[error("not settled after {waited_millis} ms, {pending} of {total} transfers pending")]
    Timeout {
        waited_millis: u128,
        pending: usize,
        total: usize,
    },
}

// ---------------------------------------------------------------------------
// In-memory data plane
// ---------------------------------------------------------------------------

/// Named in-memory buckets. Deliveries are remembered after a bucket is
/// released.
#[derive(Debug, Default)]
pub struct MemoryBuckets {
    live: Mutex<HashMap<String, Option<String>>>,
    delivered: Mutex<HashMap<String, usize>>,
}

impl MemoryBuckets {
    /// No buckets.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty bucket. Creating an existing bucket keeps its content.
    pub fn create(&self, name: &str) {
        self.live.lock().entry(name.to_string()).or_insert(None);
    }

    /// Fill `name` with `payload`, returning the bytes written.
    pub fn write(&self, name: &str, payload: &str) -> Result<usize, String> {
        let mut live = self.live.lock();
        let bucket = live.get_mut(name).ok_or_else(|| format!("bucket {name} does not exist"))?;
        *bucket = Some(payload.to_string());
        self.delivered.lock().insert(name.to_string(), payload.len());
        Ok(payload.len())
    }

    /// Bytes delivered to `name`, if anything was.
    pub fn delivered(&self, name: &str) -> Option<usize> {
        self.delivered.lock().get(name).copied()
    }

    /// Release a bucket. Returns whether it existed.
    pub fn remove(&self, name: &str) -> bool {
        self.live.lock().remove(name).is_some()
    }

    /// Number of buckets not yet released.
    pub fn live_count(&self) -> usize {
        self.live.lock().len()
    }
}

fn bucket_of(request: &DataRequest) -> Option<&str> {
    request.data_destination.property(BUCKET_PROPERTY)
}

#[async_trait]
impl Provisioner for MemoryBuckets {
    fn can_provision(&self, definition: &ResourceDefinition) -> bool {
        definition.resource_type == MEMORY_BUCKET
    }

    fn can_deprovision(&self, resource: &ProvisionedResource) -> bool {
        resource.resource_type == MEMORY_BUCKET
    }

    async fn provision(&self, definition: ResourceDefinition, _policy: &Policy) -> StatusResult<ProvisionResponse> {
        let name = format!("bucket-{}", definition.transfer_process_id);
        self.create(&name);
        tracing::debug!(bucket = %name, "bucket created");
        let address = DataAddress::new(MEMORY_DESTINATION).with_property(BUCKET_PROPERTY, name.clone());
        let resource =
            ProvisionedResource::new(format!("res-{}", definition.id), &definition, name).with_data_address(address);
        Ok(ProvisionResponse::completed(resource))
    }

    async fn deprovision(&self, resource: ProvisionedResource, _policy: &Policy) -> StatusResult<DeprovisionedResource> {
        if !self.remove(&resource.resource_name) {
            tracing::debug!(bucket = %resource.resource_name, "bucket already released");
        }
        Ok(DeprovisionedResource::completed(resource.id))
    }
}

/// Copies an asset's payload into the destination bucket.
struct MemoryFlow {
    buckets: Arc<MemoryBuckets>,
}

impl DataFlowController for MemoryFlow {
    fn can_handle(&self, request: &DataRequest, content: &DataAddress) -> bool {
        request.destination_type() == MEMORY_DESTINATION && content.address_type() == MEMORY_SOURCE
    }

    fn initiate_flow(&self, request: &DataRequest, content: &DataAddress, _policy: &Policy) -> StatusResult<()> {
        let bucket = bucket_of(request)
            .ok_or_else(|| StatusFailure::fatal(format!("destination of {} names no bucket", request.id)))?;
        let payload = content.property(PAYLOAD_PROPERTY).unwrap_or_default();
        let written = self.buckets.write(bucket, payload).map_err(StatusFailure::retry)?;
        tracing::info!(request_id = %request.id, bucket = %bucket, bytes = written, "payload delivered");
        Ok(())
    }
}

/// A transfer into a bucket is complete once the bucket was filled.
struct DeliveryCheck {
    buckets: Arc<MemoryBuckets>,
}

impl StatusChecker for DeliveryCheck {
    fn is_complete(&self, process: &TransferProcess, _resources: &[ProvisionedResource]) -> bool {
        bucket_of(process.data_request()).is_some_and(|bucket| self.buckets.delivered(bucket).is_some())
    }
}

fn payload_for(asset_id: &str) -> String {
    format!("contents of {asset_id}")
}

// ---------------------------------------------------------------------------
// Catalog and policies
// ---------------------------------------------------------------------------

fn eu_only(asset_id: &str) -> Policy {
    Policy::new().with_target(asset_id).with_permission(
        Permission::new(Action::new("USE")).with_constraint(Constraint::atomic("region", Operator::Eq, "eu")),
    )
}

/// The provider's offer for the `index`-th demo asset.
pub fn catalog_offer(provider_id: &str, index: usize) -> ContractOffer {
    let asset_id = format!("asset-{index}");
    let policy = eu_only(&asset_id);
    ContractOffer::new(format!("offer-{index}"), asset_id, provider_id, policy)
}

fn provider_engine() -> PolicyEngine {
    let mut engine = PolicyEngine::new();
    engine.bind("USE", NEGOTIATION_SCOPE);
    engine.bind("region", NEGOTIATION_SCOPE);
    engine.register_constraint_function(
        NEGOTIATION_SCOPE,
        RuleKind::Permission,
        "region",
        |operator: Operator, right: &Value, _rule, context| {
            context
                .agent()
                .claim("region")
                .is_some_and(|claimed| operator.apply(claimed, right))
        },
    );
    engine
}

fn transfer_request_id(negotiation_id: &str) -> String {
    format!("transfer-{negotiation_id}")
}

// ---------------------------------------------------------------------------
// In-process dispatchers
// ---------------------------------------------------------------------------

/// Late-bound references between the two sides.
#[derive(Default)]
struct Peers {
    consumer_negotiations: OnceLock<Arc<ConsumerNegotiationManager>>,
    provider_negotiations: OnceLock<Arc<ProviderNegotiationManager>>,
    provider_transfers: OnceLock<Arc<TransferProcessManager>>,
}

fn peer<T>(slot: &OnceLock<Arc<T>>, side: &str) -> Result<Arc<T>, DispatchError> {
    slot.get()
        .cloned()
        .ok_or_else(|| DispatchError::Transient(format!("{side} is not running")))
}

fn refused(e: impl fmt::Display) -> DispatchError {
    DispatchError::Rejected(e.to_string())
}

struct NegotiationToProvider(Arc<Peers>);

#[async_trait]
impl RemoteMessageDispatcher<NegotiationMessage> for NegotiationToProvider {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, message: NegotiationMessage) -> Result<(), DispatchError> {
        let provider = peer(&self.0.provider_negotiations, "provider")?;
        match message.body {
            NegotiationMessageBody::Request {
                offer,
                consumer_id,
                callback_address,
            } => {
                // The in-process transport vouches for the consumer's identity
                // and region.
                let agent = ParticipantAgent::new()
                    .with_claim(PARTICIPANT_IDENTITY_CLAIM, consumer_id.clone())
                    .with_claim("region", "eu");
                let request = ContractRequest {
                    correlation_id: message.correlation_id,
                    counter_party_id: consumer_id,
                    counter_party_address: callback_address,
                    protocol: message.protocol,
                    offer,
                };
                provider.request_received(&agent, request).map(|_| ()).map_err(refused)
            }
            body => {
                let negotiation = provider
                    .find_by_correlation_id(&message.correlation_id)
                    .map_err(refused)?
                    .ok_or_else(|| refused(format!("unknown negotiation {}", message.correlation_id)))?;
                let negotiation_id = negotiation.id().to_string();
                let command = match body {
                    NegotiationMessageBody::Approval { .. } => NegotiationCommand::ApprovalReceived { negotiation_id },
                    NegotiationMessageBody::Rejection { reason } => {
                        NegotiationCommand::RejectionReceived { negotiation_id, reason }
                    }
                    other => return Err(refused(format!("providers do not accept {}", other.kind()))),
                };
                provider.enqueue(command).map_err(refused)
            }
        }
    }
}

struct NegotiationToConsumer(Arc<Peers>);

#[async_trait]
impl RemoteMessageDispatcher<NegotiationMessage> for NegotiationToConsumer {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, message: NegotiationMessage) -> Result<(), DispatchError> {
        let consumer = peer(&self.0.consumer_negotiations, "consumer")?;
        let negotiation_id = message.correlation_id;
        let command = match message.body {
            NegotiationMessageBody::CounterOffer { offer } => NegotiationCommand::OfferReceived { negotiation_id, offer },
            NegotiationMessageBody::Agreement { agreement } => {
                NegotiationCommand::AgreementReceived { negotiation_id, agreement }
            }
            NegotiationMessageBody::Rejection { reason } => NegotiationCommand::RejectionReceived { negotiation_id, reason },
            other => return Err(refused(format!("consumers do not accept {}", other.kind()))),
        };
        consumer.enqueue(command).map_err(refused)
    }
}

struct TransferToProvider(Arc<Peers>);

#[async_trait]
impl RemoteMessageDispatcher<TransferRequestMessage> for TransferToProvider {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, message: TransferRequestMessage) -> Result<(), DispatchError> {
        let provider = peer(&self.0.provider_transfers, "provider")?;
        let request = message
            .data_request
            .with_counterparty(CONSUMER_ID, CONSUMER_ADDRESS, PROTOCOL);
        provider.initiate_provider_request(request).map(|_| ()).map_err(refused)
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

/// Where one seeded transfer ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSummary {
    /// Consumer-side negotiation id.
    pub negotiation_id: String,
    pub consumer_negotiation: ContractNegotiationState,
    pub provider_negotiation: Option<ContractNegotiationState>,
    pub agreement_id: Option<String>,
    pub consumer_transfer: Option<TransferProcessState>,
    pub provider_transfer: Option<TransferProcessState>,
    /// Bytes written to the consumer's bucket.
    pub bytes_delivered: Option<usize>,
}

fn settled<S: EntityState>(state: Option<S>) -> bool {
    state.is_some_and(EntityState::is_terminal)
}

impl TransferSummary {
    /// Whether nothing about this transfer will change any more.
    pub fn is_settled(&self) -> bool {
        if !self.consumer_negotiation.is_terminal() {
            return false;
        }
        if self.consumer_negotiation != ContractNegotiationState::Confirmed {
            return true;
        }
        settled(self.provider_negotiation) && settled(self.consumer_transfer) && settled(self.provider_transfer)
    }

    /// Whether data reached the consumer and both processes ended cleanly.
    pub fn is_delivered(&self) -> bool {
        self.bytes_delivered.is_some()
            && self.consumer_transfer == Some(TransferProcessState::Ended)
            && self.provider_transfer == Some(TransferProcessState::Ended)
    }
}

fn show<T: fmt::Display>(value: &Option<T>) -> String {
    value.as_ref().map_or_else(|| "-".to_string(), T::to_string)
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}  negotiation {}/{}  agreement {}  transfer {}/{}  bytes {}",
            self.negotiation_id,
            self.consumer_negotiation,
            show(&self.provider_negotiation),
            show(&self.agreement_id),
            show(&self.consumer_transfer),
            show(&self.provider_transfer),
            show(&self.bytes_delivered),
        )
    }
}

/// Outcome of a demo run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSummary {
    pub provider_id: String,
    pub consumer_id: String,
    pub transfers: Vec<TransferSummary>,
    /// Buckets still provisioned at the end of the run.
    pub live_buckets: usize,
    pub elapsed_millis: u128,
}

impl DemoSummary {
    /// Whether every transfer settled.
    pub fn is_settled(&self) -> bool {
        self.transfers.iter().all(TransferSummary::is_settled)
    }

    /// Transfers that have not settled.
    pub fn pending(&self) -> usize {
        self.transfers.iter().filter(|t| !t.is_settled()).count()
    }

    /// Transfers whose data was delivered.
    pub fn delivered(&self) -> usize {
        self.transfers.iter().filter(|t| t.is_delivered()).count()
    }
}

impl fmt::Display for DemoSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "consumer {} <-> provider {}: {}/{} transfers delivered in {} ms",
            self.consumer_id,
            self.provider_id,
            self.delivered(),
            self.transfers.len(),
            self.elapsed_millis
        )?;
        for transfer in &self.transfers {
            writeln!(f, "  {transfer}")?;
        }
        write!(f, "live buckets: {}", self.live_buckets)
    }
}

// ---------------------------------------------------------------------------
// DemoConnector
// ---------------------------------------------------------------------------

/// Both sides of the demo, wired together.
pub struct DemoConnector {
    provider_id: String,
    consumer_negotiations: Arc<ConsumerNegotiationManager>,
    provider_negotiations: Arc<ProviderNegotiationManager>,
    consumer_transfers: Arc<TransferProcessManager>,
    provider_transfers: Arc<TransferProcessManager>,
    buckets: Arc<MemoryBuckets>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for DemoConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DemoConnector")
            .field("provider_id", &self.provider_id)
            .finish_non_exhaustive()
    }
}

fn store<T: StatefulEntity>(
    config: &ConnectorConfig,
    settings: &ManagerConfig,
    clock: &Arc<dyn Clock>,
) -> Arc<InMemoryEntityStore<T>> {
    Arc::new(
        InMemoryEntityStore::new(WorkerId::new(config.worker_id.clone()), Arc::clone(clock))
            .with_lease_duration(settings.lease_duration_millis),
    )
}

fn send_retry_strategy(settings: &ManagerConfig) -> Arc<dyn WaitStrategy> {
    let base = settings.send_retry_base_delay_millis;
    Arc::new(ExponentialWaitStrategy::new(base, base.saturating_mul(64)))
}

fn tuned_negotiations(builder: NegotiationManagerBuilder, settings: &ManagerConfig) -> NegotiationManagerBuilder {
    builder
        .wait_strategy(Arc::new(FixedWaitStrategy::new(settings.iteration_wait_millis)))
        .send_retry_strategy(send_retry_strategy(settings))
        .send_retry_limit(settings.send_retry_limit)
        .batch_size(settings.batch_size)
        .command_retry_limit(settings.command_retry_limit)
}

fn tuned_transfers(builder: TransferProcessManagerBuilder, settings: &ManagerConfig) -> TransferProcessManagerBuilder {
    builder
        .wait_strategy(Arc::new(FixedWaitStrategy::new(settings.iteration_wait_millis)))
        .send_retry_strategy(send_retry_strategy(settings))
        .send_retry_limit(settings.send_retry_limit)
        .batch_size(settings.batch_size)
        .command_retry_limit(settings.command_retry_limit)
}

impl DemoConnector {
    /// Wire both sides. The provider offers `assets` assets. Must be
    /// called inside a Tokio runtime.
    pub fn build(config: &ConnectorConfig, assets: usize) -> Result<Self, DemoError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let provider_id = config.participant_id.clone();
        let peers = Arc::new(Peers::default());
        let buckets = Arc::new(MemoryBuckets::new());

        // Negotiations
        let consumer_negotiation_store: Arc<dyn EntityStore<ContractNegotiation>> =
            store::<ContractNegotiation>(config, &config.negotiation, &clock);
        let provider_negotiation_store: Arc<dyn EntityStore<ContractNegotiation>> =
            store::<ContractNegotiation>(config, &config.negotiation, &clock);

        let consumer_dispatchers = Arc::new(NegotiationDispatcherRegistry::new());
        consumer_dispatchers.register(Arc::new(NegotiationToProvider(Arc::clone(&peers))));
        let consumer_negotiations = tuned_negotiations(
            ConsumerNegotiationManager::builder("consumer-negotiations"),
            &config.negotiation,
        )
        .store(Arc::clone(&consumer_negotiation_store))
        .validation(Arc::new(ContractValidationService::new(
            Arc::new(PolicyEngine::new()),
            Arc::clone(&clock),
        )))
        .dispatcher_registry(consumer_dispatchers)
        .participant_id(CONSUMER_ID)
        .callback_address(CONSUMER_ADDRESS)
        .clock(Arc::clone(&clock))
        .build_consumer()?;

        let catalog_provider = provider_id.clone();
        let catalog: Arc<dyn OfferCatalog> = Arc::new(move |offer_id: &str| {
            offer_id
                .strip_prefix("offer-")
                .and_then(|index| index.parse::<usize>().ok())
                .filter(|index| (1..=assets).contains(index))
                .map(|index| catalog_offer(&catalog_provider, index))
        });
        let provider_dispatchers = Arc::new(NegotiationDispatcherRegistry::new());
        provider_dispatchers.register(Arc::new(NegotiationToConsumer(Arc::clone(&peers))));
        let provider_negotiations = tuned_negotiations(
            ProviderNegotiationManager::builder("provider-negotiations"),
            &config.negotiation,
        )
        .store(Arc::clone(&provider_negotiation_store))
        .validation(Arc::new(
            ContractValidationService::new(Arc::new(provider_engine()), Arc::clone(&clock)).with_catalog(catalog),
        ))
        .dispatcher_registry(provider_dispatchers)
        .participant_id(provider_id.clone())
        .clock(Arc::clone(&clock))
        .build_provider()?;

        // Transfers
        let consumer_provisioning = Arc::new(ProvisionManager::new());
        consumer_provisioning.register(Arc::clone(&buckets) as Arc<dyn Provisioner>);
        let mut manifests = ResourceManifestGenerator::new();
        manifests.register_consumer_generator(|request: &DataRequest, _: &Policy| {
            (request.destination_type() == MEMORY_DESTINATION)
                .then(|| ResourceDefinition::new(format!("{}-bucket", request.id), MEMORY_BUCKET))
        });
        let checkers = Arc::new(StatusCheckerRegistry::new());
        checkers.register(
            MEMORY_DESTINATION,
            Arc::new(DeliveryCheck {
                buckets: Arc::clone(&buckets),
            }),
        );
        let transfer_dispatchers = Arc::new(TransferDispatcherRegistry::new());
        transfer_dispatchers.register(Arc::new(TransferToProvider(Arc::clone(&peers))));
        let consumer_contracts: Arc<dyn PolicyArchive> =
            Arc::new(NegotiationPolicyArchive::new(consumer_negotiation_store));
        let consumer_transfers = tuned_transfers(TransferProcessManager::builder("consumer-transfers"), &config.transfer)
            .store(store::<TransferProcess>(config, &config.transfer, &clock))
            .provision_manager(consumer_provisioning)
            .policy_archive(consumer_contracts)
            .manifest_generator(Arc::new(manifests))
            .dispatcher_registry(transfer_dispatchers)
            .status_checkers(Arc::clone(&checkers))
            .clock(Arc::clone(&clock))
            .build()?;

        let flows = Arc::new(DataFlowManager::new());
        flows.register(Arc::new(MemoryFlow {
            buckets: Arc::clone(&buckets),
        }));
        let resolver: Arc<dyn DataAddressResolver> = Arc::new(|asset_id: &str| {
            Some(DataAddress::new(MEMORY_SOURCE).with_property(PAYLOAD_PROPERTY, payload_for(asset_id)))
        });
        let provider_contracts: Arc<dyn PolicyArchive> =
            Arc::new(NegotiationPolicyArchive::new(provider_negotiation_store));
        let provider_transfers = tuned_transfers(TransferProcessManager::builder("provider-transfers"), &config.transfer)
            .store(store::<TransferProcess>(config, &config.transfer, &clock))
            .provision_manager(Arc::new(ProvisionManager::new()))
            .policy_archive(provider_contracts)
            .data_flow_manager(flows)
            .address_resolver(resolver)
            .status_checkers(checkers)
            .clock(clock)
            .build()?;

        let consumer_negotiations = Arc::new(consumer_negotiations);
        let provider_negotiations = Arc::new(provider_negotiations);
        let provider_transfers = Arc::new(provider_transfers);
        // Each slot is filled exactly once, right after construction.
        let _ = peers.consumer_negotiations.set(Arc::clone(&consumer_negotiations));
        let _ = peers.provider_negotiations.set(Arc::clone(&provider_negotiations));
        let _ = peers.provider_transfers.set(Arc::clone(&provider_transfers));

        Ok(Self {
            provider_id,
            consumer_negotiations,
            provider_negotiations,
            consumer_transfers: Arc::new(consumer_transfers),
            provider_transfers,
            buckets,
            listeners: Mutex::new(Vec::new()),
        })
    }

    /// Start the event listeners and every manager.
    pub fn start(&self) -> Result<(), DemoError> {
        {
            let mut listeners = self.listeners.lock();
            if listeners.is_empty() {
                listeners.push(self.spawn_transfer_initiation());
                listeners.push(self.spawn_acknowledgements());
            }
        }
        self.provider_negotiations.start()?;
        self.consumer_negotiations.start()?;
        self.provider_transfers.start()?;
        self.consumer_transfers.start()?;
        tracing::info!(provider = %self.provider_id, consumer = CONSUMER_ID, "demo connector started");
        Ok(())
    }

    /// Stop every manager and listener.
    pub async fn shutdown(&self) -> Result<(), DemoError> {
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
        self.consumer_transfers.stop().await?;
        self.provider_transfers.stop().await?;
        self.consumer_negotiations.stop().await?;
        self.provider_negotiations.stop().await?;
        Ok(())
    }

    /// Start negotiating the `index`-th asset. Returns the consumer-side
    /// negotiation id.
    pub fn negotiate(&self, index: usize) -> Result<String, DemoError> {
        Ok(self.consumer_negotiations.initiate(ContractOfferRequest {
            protocol: PROTOCOL.to_string(),
            counter_party_id: self.provider_id.clone(),
            counter_party_address: PROVIDER_ADDRESS.to_string(),
            offer: catalog_offer(&self.provider_id, index),
        })?)
    }

    /// Poll until every negotiation in `negotiation_ids` and the transfer it
    /// leads to have settled, or `timeout` passes.
    pub async fn settle(&self, negotiation_ids: &[String], timeout: Duration) -> Result<DemoSummary, DemoError> {
        let started = Instant::now();
        loop {
            let summary = self.summary(negotiation_ids, started.elapsed().as_millis())?;
            if summary.is_settled() {
                return Ok(summary);
            }
            if started.elapsed() >= timeout {
                return Err(DemoError::Timeout {
                    waited_millis: started.elapsed().as_millis(),
                    pending: summary.pending(),
                    total: summary.transfers.len(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Current state of every transfer in `negotiation_ids`.
    pub fn summary(&self, negotiation_ids: &[String], elapsed_millis: u128) -> Result<DemoSummary, DemoError> {
        let transfers = negotiation_ids
            .iter()
            .map(|id| self.transfer_summary(id))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(DemoSummary {
            provider_id: self.provider_id.clone(),
            consumer_id: CONSUMER_ID.to_string(),
            transfers,
            live_buckets: self.buckets.live_count(),
            elapsed_millis,
        })
    }

    fn transfer_summary(&self, negotiation_id: &str) -> Result<TransferSummary, DemoError> {
        let negotiation = self
            .consumer_negotiations
            .find(negotiation_id)?
            .and_then(|n| n.state().ok().map(|state| (state, n)));
        let (consumer_negotiation, agreement_id) = match &negotiation {
            Some((state, n)) => (*state, n.contract_agreement().map(|a| a.id().to_string())),
            None => (ContractNegotiationState::Error, None),
        };
        let provider_negotiation = self
            .provider_negotiations
            .find_by_correlation_id(negotiation_id)?
            .and_then(|n| n.state().ok());

        let spec = QuerySpec::max().with_criterion(Criterion::eq("dataRequest.id", transfer_request_id(negotiation_id)));
        let consumer_process = self.consumer_transfers.query(&spec)?.into_iter().next();
        let provider_process = self.provider_transfers.query(&spec)?.into_iter().next();
        let bytes_delivered = consumer_process
            .as_ref()
            .and_then(|p| bucket_of(p.data_request()))
            .and_then(|bucket| self.buckets.delivered(bucket));

        Ok(TransferSummary {
            negotiation_id: negotiation_id.to_string(),
            consumer_negotiation,
            provider_negotiation,
            agreement_id,
            consumer_transfer: consumer_process.and_then(|p| p.state().ok()),
            provider_transfer: provider_process.and_then(|p| p.state().ok()),
            bytes_delivered,
        })
    }

    /// Request a transfer for every negotiation the consumer confirms.
    fn spawn_transfer_initiation(&self) -> JoinHandle<()> {
        let mut events = self.consumer_negotiations.subscribe();
        let negotiations = Arc::clone(&self.consumer_negotiations);
        let transfers = Arc::clone(&self.consumer_transfers);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == NegotiationEventKind::Confirmed => {
                        if let Err(e) = request_transfer(&negotiations, &transfers, &event.negotiation_id) {
                            tracing::error!(negotiation_id = %event.negotiation_id, error = %e, "transfer not requested");
                        }
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "negotiation events dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }

    /// Acknowledge the consumer's request once the provider starts serving.
    fn spawn_acknowledgements(&self) -> JoinHandle<()> {
        let mut events = self.provider_transfers.subscribe();
        let provider = Arc::clone(&self.provider_transfers);
        let consumer = Arc::clone(&self.consumer_transfers);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) if event.kind == TransferEventKind::Started => {
                        let provider = Arc::clone(&provider);
                        let consumer = Arc::clone(&consumer);
                        tokio::spawn(async move {
                            let process_id = event.transfer_process_id;
                            if let Err(e) = acknowledge(&provider, &consumer, &process_id).await {
                                tracing::error!(process_id = %process_id, error = %e, "acknowledgement failed");
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => tracing::warn!(skipped, "transfer events dropped"),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn request_transfer(
    negotiations: &ConsumerNegotiationManager,
    transfers: &TransferProcessManager,
    negotiation_id: &str,
) -> Result<(), DemoError> {
    let Some(negotiation) = negotiations.find(negotiation_id)? else {
        return Ok(());
    };
    let Some(agreement) = negotiation.contract_agreement() else {
        return Ok(());
    };
    let request = DataRequest::new(
        transfer_request_id(negotiation_id),
        agreement.asset_id(),
        agreement.id(),
        DataAddress::new(MEMORY_DESTINATION),
    )
    .with_counterparty(
        negotiation.counter_party_id(),
        negotiation.counter_party_address(),
        negotiation.protocol(),
    );
    transfers.initiate_consumer_request(request)?;
    Ok(())
}

async fn acknowledge(
    provider: &TransferProcessManager,
    consumer: &TransferProcessManager,
    provider_process_id: &str,
) -> Result<(), DemoError> {
    let Some(process) = provider.find(provider_process_id)? else {
        return Ok(());
    };
    let spec = QuerySpec::max().with_criterion(Criterion::eq("dataRequest.id", process.data_request().id.clone()));
    // The consumer may not have recorded the delivery of its request yet.
    for _ in 0..ACKNOWLEDGE_ATTEMPTS {
        let Some(requester) = consumer.query(&spec)?.into_iter().next() else {
            return Ok(());
        };
        match requester.state() {
            Ok(TransferProcessState::Requesting) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(TransferProcessState::Requested) => {
                return Ok(consumer.enqueue(TransferCommand::Acknowledge {
                    process_id: requester.id().to_string(),
                })?);
            }
            _ => return Ok(()),
        }
    }
    tracing::warn!(process_id = %provider_process_id, "consumer never reached REQUESTED");
    Ok(())
}

/// Run the demo: negotiate and transfer `transfers` assets, then shut down.
pub async fn run(config: &ConnectorConfig, transfers: usize, timeout: Duration) -> Result<DemoSummary, DemoError> {
    let connector = DemoConnector::build(config, transfers)?;
    connector.start()?;
    let mut negotiation_ids = Vec::with_capacity(transfers);
    let mut seeded = Ok(());
    for index in 1..=transfers {
        match connector.negotiate(index) {
            Ok(id) => negotiation_ids.push(id),
            Err(e) => {
                seeded = Err(e);
                break;
            }
        }
    }
    let outcome = match seeded {
        Ok(()) => connector.settle(&negotiation_ids, timeout).await,
        Err(e) => Err(e),
    };
    connector.shutdown().await?;
    outcome
}
