//! # Transfer Process Manager
//!
//! Drives transfer processes through their states on top of the generic
//! [`StateMachineManager`]. One processor is registered per actionable
//! state; states that wait on a counterparty or an asynchronous
//! provisioner have no processor and advance only through commands.
//!
//! ## Asynchronous steps
//!
//! Provisioning, deprovisioning and sending the transfer request are
//! asynchronous. The processor spawns the call on the Tokio runtime and
//! returns [`Processed::InFlight`], keeping the lease. When the call
//! finishes, its outcome is enqueued as a
//! [`TransferCommand::ProvisionResults`],
//! [`TransferCommand::DeprovisionResults`] or
//! [`TransferCommand::DispatchResult`], applied at the start of a later
//! tick. A panic inside the spawned call is reported the same way, as a
//! fatal failure.
//!
//! ## Retries
//!
//! Retryable failures re-enter the same state, which bumps its
//! `state_count`. The processor for that state waits out the backoff
//! computed from the count and gives up with an error once the send
//! retry limit is exceeded.

use std::future::Future;
use std::sync::Arc;

use dsc_core::{generate_id, Clock, Criterion, QuerySpec, StateError, StatusFailure, SystemClock};
use dsc_policy::{Policy, PolicyArchive};
use dsc_state::{
    CommandError, CommandQueue, DispatchError, EntitySendRetryManager, EntityStore, EventRouter,
    ExponentialWaitStrategy, FixedWaitStrategy, ManagerError, ManagerStatus, ProcessError,
    Processed, RemoteMessageDispatcherRegistry, StateMachineManager, StateProcessor,
    StatefulEntity, StoreError, WaitStrategy,
};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::broadcast;

use crate::command::{TransferCommand, TransferCommandHandler};
use crate::flow::{DataAddressResolver, DataFlowManager};
use crate::manifest::ResourceManifestGenerator;
use crate::message::TransferRequestMessage;
use crate::process::{TransferEventKind, TransferProcess, TransferProcessEvent};
use crate::provision::{InMemoryVault, ProvisionManager, Vault};
use crate::state::{ProcessType, TransferProcessState};
use crate::status::StatusCheckerRegistry;
use crate::types::DataRequest;

/// Default number of attempts per remote step.
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 7;

/// Default delay before the first retry of a remote step.
pub const DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS: u64 = 1_000;

/// Dispatcher registry for transfer requests.
pub type TransferDispatcherRegistry = RemoteMessageDispatcherRegistry<TransferRequestMessage>;

/// Failure to create or look up a transfer process.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// The store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The process could not be created in its initial state.
    #[error(transparent)]
    State(#[from] StateError),

    /// A command could not be enqueued.
    #[error(transparent)]
    Command(#[from] CommandError),
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

type Step = fn(&TransferSteps, TransferProcess) -> Result<Processed<TransferProcess>, ProcessError>;

/// Collaborators shared by every state processor.
struct TransferSteps {
    clock: Arc<dyn Clock>,
    retry: EntitySendRetryManager,
    manifests: Arc<ResourceManifestGenerator>,
    provisioning: Arc<ProvisionManager>,
    data_flows: Arc<DataFlowManager>,
    dispatchers: Arc<TransferDispatcherRegistry>,
    status_checkers: Arc<StatusCheckerRegistry>,
    policies: Arc<dyn PolicyArchive>,
    addresses: Option<Arc<dyn DataAddressResolver>>,
    commands: Arc<CommandQueue<TransferCommand>>,
    runtime: Handle,
}

fn step(steps: &Arc<TransferSteps>, f: Step) -> impl StateProcessor<TransferProcess> {
    let steps = Arc::clone(steps);
    move |process: TransferProcess| f(&steps, process)
}

fn transitioned(process: TransferProcess, kind: TransferEventKind) -> Processed<TransferProcess> {
    let event = process.event(kind);
    Processed::with_event(process, event)
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

impl TransferSteps {
    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn policy_for(&self, process: &TransferProcess) -> Result<Policy, ProcessError> {
        let contract_id = &process.data_request().contract_id;
        self.policies
            .find_policy_for_contract(contract_id)
            .ok_or_else(|| ProcessError::Fatal(format!("no policy found for contract {contract_id}")))
    }

    /// Gate for retryable steps: fails once attempts are used up, and
    /// returns `true` while the backoff has not elapsed.
    fn must_wait(&self, process: &TransferProcess, step: &str) -> Result<bool, ProcessError> {
        if self.retry.retries_exhausted(process) {
            return Err(ProcessError::Fatal(format!(
                "{step} failed after {} attempts",
                self.retry.send_retry_limit()
            )));
        }
        Ok(self.retry.should_delay(process))
    }

    /// Run `work` on the runtime and enqueue the command `report` builds
    /// from its outcome.
    fn continue_with<F, R>(
        &self,
        process_id: String,
        work: F,
        report: impl FnOnce(Result<R, String>) -> TransferCommand + Send + 'static,
    ) where
        F: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let commands = Arc::clone(&self.commands);
        let runtime = self.runtime.clone();
        self.runtime.spawn(async move {
            let outcome = runtime.spawn(work).await.map_err(|e| {
                if e.is_panic() {
                    panic_text(e.into_panic())
                } else {
                    e.to_string()
                }
            });
            if let Err(e) = commands.enqueue(report(outcome)) {
                tracing::error!(process_id = %process_id, error = %e, "failed to enqueue step result");
            }
        });
    }

    fn initial(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        let policy = self.policy_for(&process)?;
        let manifest = self
            .manifests
            .generate(process.process_type(), process.data_request(), &policy)
            .map_err(|e| ProcessError::Fatal(e.to_string()))?;
        tracing::debug!(
            process_id = %process.id(),
            definitions = manifest.definitions.len(),
            "resource manifest generated"
        );
        let now = self.now();
        Ok(Processed::transitioned(process.transition_provisioning(manifest, now)?))
    }

    fn provisioning(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        if self.must_wait(&process, "provisioning")? {
            return Ok(Processed::Unchanged(process));
        }
        let definitions = process.resources_to_provision();
        if definitions.is_empty() {
            let now = self.now();
            return Ok(transitioned(process.transition_provisioned(now)?, TransferEventKind::Provisioned));
        }
        let policy = self.policy_for(&process)?;
        let id = process.id().to_string();
        let provisioning = Arc::clone(&self.provisioning);
        let process_id = id.clone();
        self.continue_with(
            id,
            async move { provisioning.provision(definitions, &policy).await },
            move |outcome| TransferCommand::ProvisionResults {
                process_id,
                results: outcome.unwrap_or_else(|panic| {
                    vec![Err(StatusFailure::fatal(format!("provisioning panicked: {panic}")))]
                }),
            },
        );
        Ok(Processed::InFlight)
    }

    fn provisioned(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        let now = self.now();
        if process.process_type() == ProcessType::Consumer {
            return Ok(Processed::transitioned(
                process.transition(TransferProcessState::Requesting, now)?,
            ));
        }
        if self.must_wait(&process, "data flow initiation")? {
            return Ok(Processed::Unchanged(process));
        }
        let content = match process.content_data_address() {
            Some(address) => address.clone(),
            None => self
                .addresses
                .as_ref()
                .and_then(|r| r.resolve_for_asset(&process.data_request().asset_id))
                .ok_or_else(|| {
                    ProcessError::Fatal(format!(
                        "no content address for asset {}",
                        process.data_request().asset_id
                    ))
                })?,
        };
        let policy = self.policy_for(&process)?;
        match self.data_flows.initiate(process.data_request(), &content, &policy) {
            Ok(()) => {
                let mut process = process;
                process.set_content_data_address(content);
                Ok(transitioned(process.transition_active(now)?, TransferEventKind::Started))
            }
            Err(failure) if failure.is_fatal() => Err(ProcessError::Fatal(failure.detail())),
            Err(failure) => {
                tracing::warn!(
                    process_id = %process.id(),
                    state_count = process.meta().state_count,
                    error = %failure,
                    "data flow not started, will retry"
                );
                Ok(Processed::transitioned(
                    process.transition(TransferProcessState::Provisioned, now)?,
                ))
            }
        }
    }

    fn requesting(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        if self.must_wait(&process, "transfer request")? {
            return Ok(Processed::Unchanged(process));
        }
        let id = process.id().to_string();
        let message = TransferRequestMessage {
            process_id: id.clone(),
            data_request: process.data_request().clone(),
        };
        tracing::debug!(
            process_id = %id,
            protocol = %message.data_request.protocol,
            attempt = process.meta().state_count,
            "sending transfer request"
        );
        let dispatchers = Arc::clone(&self.dispatchers);
        let process_id = id.clone();
        self.continue_with(
            id,
            async move { dispatchers.send(message).await },
            move |outcome| TransferCommand::DispatchResult {
                process_id,
                result: outcome.unwrap_or_else(|panic| Err(DispatchError::Rejected(panic))),
            },
        );
        Ok(Processed::InFlight)
    }

    fn requested_ack(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        let now = self.now();
        Ok(transitioned(process.transition_active(now)?, TransferEventKind::Started))
    }

    fn active(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        if !process.data_request().managed_resources {
            return Ok(Processed::Requeued(process));
        }
        let Some(checker) = self
            .status_checkers
            .resolve(process.data_request().destination_type())
        else {
            return Ok(Processed::Requeued(process));
        };
        if !checker.is_complete(&process, process.provisioned_resources()) {
            return Ok(Processed::Requeued(process));
        }
        let now = self.now();
        Ok(transitioned(
            process.transition(TransferProcessState::Completed, now)?,
            TransferEventKind::Completed,
        ))
    }

    fn completed(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        let now = self.now();
        if process.deprovision_complete() {
            return Ok(transitioned(
                process.transition(TransferProcessState::Ended, now)?,
                TransferEventKind::Ended,
            ));
        }
        Ok(Processed::transitioned(
            process.transition(TransferProcessState::Deprovisioning, now)?,
        ))
    }

    fn deprovisioning(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        if self.must_wait(&process, "deprovisioning")? {
            return Ok(Processed::Unchanged(process));
        }
        let resources = process.resources_to_deprovision();
        if resources.is_empty() {
            let now = self.now();
            return Ok(transitioned(
                process.transition(TransferProcessState::Deprovisioned, now)?,
                TransferEventKind::Deprovisioned,
            ));
        }
        let policy = self.policy_for(&process)?;
        let id = process.id().to_string();
        let provisioning = Arc::clone(&self.provisioning);
        let process_id = id.clone();
        self.continue_with(
            id,
            async move { provisioning.deprovision(resources, &policy).await },
            move |outcome| TransferCommand::DeprovisionResults {
                process_id,
                results: outcome.unwrap_or_else(|panic| {
                    vec![Err(StatusFailure::fatal(format!("deprovisioning panicked: {panic}")))]
                }),
            },
        );
        Ok(Processed::InFlight)
    }

    fn deprovisioned(&self, process: TransferProcess) -> Result<Processed<TransferProcess>, ProcessError> {
        let now = self.now();
        Ok(transitioned(
            process.transition(TransferProcessState::Ended, now)?,
            TransferEventKind::Ended,
        ))
    }
}

// ---------------------------------------------------------------------------
// TransferProcessManager
// ---------------------------------------------------------------------------

/// Runs consumer and provider transfer processes.
pub struct TransferProcessManager {
    machine: Arc<StateMachineManager<TransferProcess, TransferCommand>>,
    steps: Arc<TransferSteps>,
    initiation: Mutex<()>,
}

impl std::fmt::Debug for TransferProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProcessManager")
            .field("machine", &self.machine)
            .field("send_retry_limit", &self.steps.retry.send_retry_limit())
            .finish_non_exhaustive()
    }
}

impl TransferProcessManager {
    /// Start building a manager called `name`.
    pub fn builder(name: impl Into<String>) -> TransferProcessManagerBuilder {
        TransferProcessManagerBuilder::new(name)
    }

    /// Start the polling loop.
    pub fn start(&self) -> Result<(), ManagerError> {
        self.machine.start()
    }

    /// Stop the polling loop and wait for it to exit.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.machine.stop().await
    }

    /// Run one polling iteration. See [`StateMachineManager::tick`].
    pub fn tick(&self) -> usize {
        self.machine.tick()
    }

    /// Lifecycle status.
    pub fn status(&self) -> ManagerStatus {
        self.machine.status()
    }

    /// Event router transfer events are published on.
    pub fn events(&self) -> &EventRouter<TransferProcessEvent> {
        self.machine.events()
    }

    /// Subscribe to transfer events.
    pub fn subscribe(&self) -> broadcast::Receiver<TransferProcessEvent> {
        self.machine.events().subscribe()
    }

    /// The command queue drained at the start of every tick.
    pub fn commands(&self) -> &Arc<CommandQueue<TransferCommand>> {
        self.machine.commands()
    }

    /// Queue `command` for the next tick.
    pub fn enqueue(&self, command: TransferCommand) -> Result<(), TransferError> {
        Ok(self.machine.commands().enqueue(command)?)
    }

    /// Load a process by id.
    pub fn find(&self, id: &str) -> Result<Option<TransferProcess>, TransferError> {
        Ok(self.machine.store().find(id)?)
    }

    /// Processes matching `spec`.
    pub fn query(&self, spec: &QuerySpec) -> Result<Vec<TransferProcess>, TransferError> {
        Ok(self.machine.store().query(spec)?)
    }

    /// Registered data flow controllers.
    pub fn data_flow_manager(&self) -> &Arc<DataFlowManager> {
        &self.steps.data_flows
    }

    /// Registered provisioners.
    pub fn provision_manager(&self) -> &Arc<ProvisionManager> {
        &self.steps.provisioning
    }

    /// Registered transfer request dispatchers.
    pub fn dispatcher_registry(&self) -> &Arc<TransferDispatcherRegistry> {
        &self.steps.dispatchers
    }

    /// Registered status checkers.
    pub fn status_checkers(&self) -> &Arc<StatusCheckerRegistry> {
        &self.steps.status_checkers
    }

    /// Create a consumer process for `request`, or return the id of the
    /// consumer process already created for it.
    pub fn initiate_consumer_request(&self, request: DataRequest) -> Result<String, TransferError> {
        self.initiate(ProcessType::Consumer, request)
    }

    /// Create a provider process for `request`, or return the id of the
    /// provider process already created for it.
    pub fn initiate_provider_request(&self, request: DataRequest) -> Result<String, TransferError> {
        self.initiate(ProcessType::Provider, request)
    }

    fn initiate(&self, process_type: ProcessType, request: DataRequest) -> Result<String, TransferError> {
        // Serializes the lookup and the insert within this process.
        let _guard = self.initiation.lock();
        let spec = QuerySpec::max()
            .with_criterion(Criterion::eq("dataRequest.id", request.id.clone()))
            .with_criterion(Criterion::eq("type", process_type.to_string()));
        if let Some(existing) = self.machine.store().query(&spec)?.into_iter().next() {
            tracing::debug!(
                process_id = %existing.id(),
                data_request_id = %request.id,
                "transfer already initiated"
            );
            return Ok(existing.id().to_string());
        }

        let now = self.steps.now();
        let data_request_id = request.id.clone();
        let process = TransferProcess::new(generate_id(), process_type, request, now)
            .transition(TransferProcessState::Initial, now)?;
        let id = process.id().to_string();
        let event = process.event(TransferEventKind::Initiated);
        self.machine.store().save(process)?;
        self.machine.events().publish(event);
        tracing::info!(
            process_id = %id,
            data_request_id = %data_request_id,
            process_type = %process_type,
            "transfer process initiated"
        );
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`TransferProcessManager`].
pub struct TransferProcessManagerBuilder {
    name: String,
    store: Option<Arc<dyn EntityStore<TransferProcess>>>,
    provisioning: Option<Arc<ProvisionManager>>,
    policies: Option<Arc<dyn PolicyArchive>>,
    manifests: Option<Arc<ResourceManifestGenerator>>,
    data_flows: Option<Arc<DataFlowManager>>,
    dispatchers: Option<Arc<TransferDispatcherRegistry>>,
    status_checkers: Option<Arc<StatusCheckerRegistry>>,
    addresses: Option<Arc<dyn DataAddressResolver>>,
    vault: Option<Arc<dyn Vault>>,
    clock: Option<Arc<dyn Clock>>,
    wait_strategy: Option<Arc<dyn WaitStrategy>>,
    send_retry_strategy: Option<Arc<dyn WaitStrategy>>,
    send_retry_limit: u32,
    batch_size: Option<usize>,
    command_retry_limit: Option<u32>,
}

impl std::fmt::Debug for TransferProcessManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferProcessManagerBuilder")
            .field("name", &self.name)
            .field("send_retry_limit", &self.send_retry_limit)
            .field("batch_size", &self.batch_size)
            .finish_non_exhaustive()
    }
}

impl TransferProcessManagerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: None,
            provisioning: None,
            policies: None,
            manifests: None,
            data_flows: None,
            dispatchers: None,
            status_checkers: None,
            addresses: None,
            vault: None,
            clock: None,
            wait_strategy: None,
            send_retry_strategy: None,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            batch_size: None,
            command_retry_limit: None,
        }
    }

    /// The transfer process store. Required.
    pub fn store(mut self, store: Arc<dyn EntityStore<TransferProcess>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Provisioners for resource definitions. Required.
    pub fn provision_manager(mut self, manager: Arc<ProvisionManager>) -> Self {
        self.provisioning = Some(manager);
        self
    }

    /// Source of contract policies. Required.
    pub fn policy_archive(mut self, archive: Arc<dyn PolicyArchive>) -> Self {
        self.policies = Some(archive);
        self
    }

    /// Manifest generation. Defaults to a generator without definition
    /// generators, which produces empty manifests.
    pub fn manifest_generator(mut self, generator: Arc<ResourceManifestGenerator>) -> Self {
        self.manifests = Some(generator);
        self
    }

    /// Data flow controllers for provider processes.
    pub fn data_flow_manager(mut self, manager: Arc<DataFlowManager>) -> Self {
        self.data_flows = Some(manager);
        self
    }

    /// Dispatchers for consumer transfer requests.
    pub fn dispatcher_registry(mut self, registry: Arc<TransferDispatcherRegistry>) -> Self {
        self.dispatchers = Some(registry);
        self
    }

    /// Completion checks for running transfers.
    pub fn status_checkers(mut self, registry: Arc<StatusCheckerRegistry>) -> Self {
        self.status_checkers = Some(registry);
        self
    }

    /// Content addresses for provider processes created without one.
    pub fn address_resolver(mut self, resolver: Arc<dyn DataAddressResolver>) -> Self {
        self.addresses = Some(resolver);
        self
    }

    /// Secret storage for provisioned tokens. Defaults to an in-memory vault.
    pub fn vault(mut self, vault: Arc<dyn Vault>) -> Self {
        self.vault = Some(vault);
        self
    }

    /// Time source. Defaults to the system clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Poll backoff of the loop.
    pub fn wait_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.wait_strategy = Some(strategy);
        self
    }

    /// Backoff between attempts of a remote step. Defaults to doubling
    /// delays from [`DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS`].
    pub fn send_retry_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.send_retry_strategy = Some(strategy);
        self
    }

    /// Attempts per remote step before the process fails.
    pub fn send_retry_limit(mut self, limit: u32) -> Self {
        self.send_retry_limit = limit;
        self
    }

    /// Processes leased per state per tick.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// How often a command failing on a store error is re-queued.
    pub fn command_retry_limit(mut self, limit: u32) -> Self {
        self.command_retry_limit = Some(limit);
        self
    }

    /// Validate and build. Must be called inside a Tokio runtime, which
    /// runs the asynchronous steps.
    pub fn build(self) -> Result<TransferProcessManager, ManagerError> {
        let missing = |component| ManagerError::MissingComponent {
            manager: self.name.clone(),
            component,
        };
        let store = self.store.clone().ok_or_else(|| missing("store"))?;
        let provisioning = self.provisioning.clone().ok_or_else(|| missing("provision manager"))?;
        let policies = self.policies.clone().ok_or_else(|| missing("policy archive"))?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime(self.name.clone()))?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let send_retry_strategy = self.send_retry_strategy.unwrap_or_else(|| {
            Arc::new(ExponentialWaitStrategy::new(
                DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS,
                DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS * 64,
            ))
        });
        let vault: Arc<dyn Vault> = self.vault.unwrap_or_else(|| Arc::new(InMemoryVault::new()));
        let commands = Arc::new(CommandQueue::new());

        let steps = Arc::new(TransferSteps {
            clock: Arc::clone(&clock),
            retry: EntitySendRetryManager::new(send_retry_strategy, Arc::clone(&clock), self.send_retry_limit),
            manifests: self.manifests.unwrap_or_default(),
            provisioning,
            data_flows: self.data_flows.unwrap_or_default(),
            dispatchers: self.dispatchers.unwrap_or_default(),
            status_checkers: self.status_checkers.unwrap_or_default(),
            policies,
            addresses: self.addresses,
            commands: Arc::clone(&commands),
            runtime,
        });

        use TransferProcessState::*;
        let mut machine = StateMachineManager::builder(self.name)
            .store(store)
            .command_queue(commands)
            .command_handler(Arc::new(TransferCommandHandler::new(Arc::clone(&clock), vault)))
            .clock(clock)
            .wait_strategy(
                self.wait_strategy
                    .unwrap_or_else(|| Arc::new(FixedWaitStrategy::new(1_000))),
            )
            .processor(Initial, step(&steps, TransferSteps::initial))
            .processor(Provisioning, step(&steps, TransferSteps::provisioning))
            .processor(Provisioned, step(&steps, TransferSteps::provisioned))
            .processor(Requesting, step(&steps, TransferSteps::requesting))
            .processor(RequestedAck, step(&steps, TransferSteps::requested_ack))
            .processor(InProgress, step(&steps, TransferSteps::active))
            .processor(Streaming, step(&steps, TransferSteps::active))
            .processor(Completed, step(&steps, TransferSteps::completed))
            .processor(Deprovisioning, step(&steps, TransferSteps::deprovisioning))
            .processor(Deprovisioned, step(&steps, TransferSteps::deprovisioned));
        if let Some(batch_size) = self.batch_size {
            machine = machine.batch_size(batch_size);
        }
        if let Some(limit) = self.command_retry_limit {
            machine = machine.command_retry_limit(limit);
        }

        Ok(TransferProcessManager {
            machine: Arc::new(machine.build()?),
            steps,
            initiation: Mutex::new(()),
        })
    }
}
