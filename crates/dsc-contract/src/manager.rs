//! # Negotiation Managers
//!
//! Consumer and provider negotiation managers on top of the generic
//! [`StateMachineManager`]. Both share the loop, the command handler and
//! the sending steps; they differ in the processors they register.
//!
//! ## Consumer
//!
//! | State | Action |
//! |---|---|
//! | `INITIAL` | move to `REQUESTING` |
//! | `REQUESTING` | send the request, `REQUESTED` on delivery |
//! | `OFFERED` | accept the counter-offer, move to `APPROVING` |
//! | `APPROVING` | send the approval, `APPROVED` on delivery |
//! | `AGREED` | move to `CONFIRMED` |
//! | `DECLINING` | send the rejection, `DECLINED` on delivery |
//!
//! ## Provider
//!
//! | State | Action |
//! |---|---|
//! | `REQUESTED` | create the agreement, move to `CONFIRMING` |
//! | `OFFERING` | send the counter-offer, `OFFERED` on delivery |
//! | `CONFIRMING` | send the agreement, `CONFIRMED` on delivery |
//! | `DECLINING` | send the rejection, `DECLINED` on delivery |
//!
//! Sending is asynchronous and retried like transfer requests: a transient
//! failure re-enters the sending state and the next attempt waits out the
//! send retry backoff.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;

use dsc_core::{generate_id, Clock, Criterion, QuerySpec, StateError, SystemClock};
use dsc_policy::ParticipantAgent;
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

use crate::command::{confirm, NegotiationCommand, NegotiationCommandHandler};
use crate::message::{NegotiationMessage, NegotiationMessageBody};
use crate::negotiation::{ContractNegotiation, ContractNegotiationEvent, NegotiationEventKind};
use crate::state::{ContractNegotiationState, NegotiationType};
use crate::types::ContractOffer;
use crate::validation::ContractValidationService;

/// Default number of attempts per negotiation message.
pub const DEFAULT_SEND_RETRY_LIMIT: u32 = 7;

/// Default delay before resending a negotiation message.
pub const DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS: u64 = 1_000;

/// Dispatcher registry for negotiation messages.
pub type NegotiationDispatcherRegistry = RemoteMessageDispatcherRegistry<NegotiationMessage>;

/// Failure to create or look up a negotiation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationError {
    /// The store rejected the operation.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The negotiation could not be created in its first state.
    #[error(transparent)]
    State(#[from] StateError),

    /// A command could not be enqueued.
    #[error(transparent)]
    Command(#[from] CommandError),
}

/// A consumer's request to start negotiating `offer` with a provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractOfferRequest {
    /// Protocol binding.
    pub protocol: String,
    /// The provider.
    pub counter_party_id: String,
    /// The provider's protocol endpoint.
    pub counter_party_address: String,
    /// The offer taken from the provider's catalog.
    pub offer: ContractOffer,
}

/// A consumer's request as received by the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct ContractRequest {
    /// The consumer's negotiation id.
    pub correlation_id: String,
    /// The consumer.
    pub counter_party_id: String,
    /// Where the consumer receives replies.
    pub counter_party_address: String,
    /// Protocol binding.
    pub protocol: String,
    /// The terms the consumer asked for.
    pub offer: ContractOffer,
}

// ---------------------------------------------------------------------------
// Processors
// ---------------------------------------------------------------------------

type Step = fn(&NegotiationSteps, ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError>;

struct NegotiationSteps {
    clock: Arc<dyn Clock>,
    retry: EntitySendRetryManager,
    dispatchers: Arc<NegotiationDispatcherRegistry>,
    commands: Arc<CommandQueue<NegotiationCommand>>,
    participant_id: String,
    callback_address: String,
    runtime: Handle,
}

fn step(steps: &Arc<NegotiationSteps>, f: Step) -> impl StateProcessor<ContractNegotiation> {
    let steps = Arc::clone(steps);
    move |negotiation: ContractNegotiation| f(&steps, negotiation)
}

fn panic_text(payload: Box<dyn std::any::Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}

impl NegotiationSteps {
    fn now(&self) -> i64 {
        self.clock.now_millis()
    }

    fn last_offer(negotiation: &ContractNegotiation) -> Result<ContractOffer, ProcessError> {
        negotiation
            .last_offer()
            .cloned()
            .ok_or_else(|| ProcessError::Fatal(format!("negotiation {} has no offer", negotiation.id())))
    }

    /// Send `body` for the negotiation's current state. The outcome comes
    /// back as a [`NegotiationCommand::DispatchResult`].
    fn send(
        &self,
        negotiation: ContractNegotiation,
        body: NegotiationMessageBody,
    ) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let state = negotiation.state()?;
        if self.retry.retries_exhausted(&negotiation) {
            return Err(ProcessError::Fatal(format!(
                "sending {} failed after {} attempts",
                body.kind(),
                self.retry.send_retry_limit()
            )));
        }
        if self.retry.should_delay(&negotiation) {
            return Ok(Processed::Unchanged(negotiation));
        }

        let negotiation_id = negotiation.id().to_string();
        tracing::debug!(
            negotiation_id = %negotiation_id,
            state = %state,
            message = body.kind(),
            attempt = negotiation.meta().state_count,
            "sending negotiation message"
        );
        let message = NegotiationMessage {
            protocol: negotiation.protocol().to_string(),
            counter_party_address: negotiation.counter_party_address().to_string(),
            correlation_id: negotiation.correlation_id().to_string(),
            body,
        };
        let dispatchers = Arc::clone(&self.dispatchers);
        self.continue_with(negotiation_id.clone(), async move { dispatchers.send(message).await }, move |outcome| {
            NegotiationCommand::DispatchResult {
                negotiation_id,
                step: state,
                result: outcome.unwrap_or_else(|panic| Err(DispatchError::Rejected(panic))),
            }
        });
        Ok(Processed::InFlight)
    }

    fn continue_with<F, R>(
        &self,
        negotiation_id: String,
        work: F,
        report: impl FnOnce(Result<R, String>) -> NegotiationCommand + Send + 'static,
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
                tracing::error!(negotiation_id = %negotiation_id, error = %e, "failed to enqueue dispatch result");
            }
        });
    }

    fn initial(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let now = self.now();
        Ok(Processed::transitioned(
            negotiation.transition(ContractNegotiationState::Requesting, now)?,
        ))
    }

    fn requesting(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let offer = Self::last_offer(&negotiation)?;
        let body = NegotiationMessageBody::Request {
            offer,
            consumer_id: self.participant_id.clone(),
            callback_address: self.callback_address.clone(),
        };
        self.send(negotiation, body)
    }

    fn offered(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let now = self.now();
        Ok(Processed::transitioned(
            negotiation.transition(ContractNegotiationState::Approving, now)?,
        ))
    }

    fn approving(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let offer = Self::last_offer(&negotiation)?;
        self.send(negotiation, NegotiationMessageBody::Approval { offer })
    }

    fn agreed(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let now = self.now();
        let negotiation = negotiation.transition(ContractNegotiationState::Confirmed, now)?;
        let event = negotiation.event(NegotiationEventKind::Confirmed);
        Ok(Processed::with_event(negotiation, event))
    }

    fn declining(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let reason = format!("{} declined the negotiation", self.participant_id);
        self.send(negotiation, NegotiationMessageBody::Rejection { reason })
    }

    fn requested(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let now = self.now();
        let negotiation = confirm(negotiation, now).map_err(ProcessError::Fatal)?;
        Ok(Processed::transitioned(negotiation))
    }

    fn offering(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let offer = Self::last_offer(&negotiation)?;
        self.send(negotiation, NegotiationMessageBody::CounterOffer { offer })
    }

    fn confirming(&self, negotiation: ContractNegotiation) -> Result<Processed<ContractNegotiation>, ProcessError> {
        let agreement = negotiation
            .contract_agreement()
            .cloned()
            .ok_or_else(|| ProcessError::Fatal(format!("negotiation {} has no agreement", negotiation.id())))?;
        self.send(negotiation, NegotiationMessageBody::Agreement { agreement })
    }
}

// ---------------------------------------------------------------------------
// Managers
// ---------------------------------------------------------------------------

/// Operations shared by consumer and provider negotiation managers.
pub struct NegotiationManager {
    machine: Arc<StateMachineManager<ContractNegotiation, NegotiationCommand>>,
    steps: Arc<NegotiationSteps>,
    negotiation_type: NegotiationType,
    initiation: Mutex<()>,
}

impl std::fmt::Debug for NegotiationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationManager")
            .field("machine", &self.machine)
            .field("negotiation_type", &self.negotiation_type)
            .field("participant_id", &self.steps.participant_id)
            .finish_non_exhaustive()
    }
}

impl NegotiationManager {
    /// Start the polling loop.
    pub fn start(&self) -> Result<(), ManagerError> {
        self.machine.start()
    }

    /// Stop the polling loop and wait for it to exit.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.machine.stop().await
    }

    /// Run one polling iteration.
    pub fn tick(&self) -> usize {
        self.machine.tick()
    }

    /// Lifecycle status.
    pub fn status(&self) -> ManagerStatus {
        self.machine.status()
    }

    /// Event router negotiation events are published on.
    pub fn events(&self) -> &EventRouter<ContractNegotiationEvent> {
        self.machine.events()
    }

    /// Subscribe to negotiation events.
    pub fn subscribe(&self) -> broadcast::Receiver<ContractNegotiationEvent> {
        self.machine.events().subscribe()
    }

    /// Registered message dispatchers.
    pub fn dispatcher_registry(&self) -> &Arc<NegotiationDispatcherRegistry> {
        &self.steps.dispatchers
    }

    /// Queue `command` for the next tick.
    pub fn enqueue(&self, command: NegotiationCommand) -> Result<(), NegotiationError> {
        Ok(self.machine.commands().enqueue(command)?)
    }

    /// Load a negotiation by id.
    pub fn find(&self, id: &str) -> Result<Option<ContractNegotiation>, NegotiationError> {
        Ok(self.machine.store().find(id)?)
    }

    /// This side's negotiation correlated with `correlation_id`.
    pub fn find_by_correlation_id(&self, correlation_id: &str) -> Result<Option<ContractNegotiation>, NegotiationError> {
        let spec = QuerySpec::max()
            .with_criterion(Criterion::eq("correlationId", correlation_id))
            .with_criterion(Criterion::eq("type", self.negotiation_type.to_string()));
        Ok(self.machine.store().query(&spec)?.into_iter().next())
    }

    /// Negotiations matching `spec`.
    pub fn query(&self, spec: &QuerySpec) -> Result<Vec<ContractNegotiation>, NegotiationError> {
        Ok(self.machine.store().query(spec)?)
    }

    fn create(&self, negotiation: ContractNegotiation, kind: NegotiationEventKind) -> Result<String, NegotiationError> {
        let id = negotiation.id().to_string();
        let event = negotiation.event(kind);
        self.machine.store().save(negotiation)?;
        self.machine.events().publish(event);
        Ok(id)
    }
}

/// Drives the consumer side of negotiations.
#[derive(Debug)]
pub struct ConsumerNegotiationManager {
    inner: NegotiationManager,
}

impl Deref for ConsumerNegotiationManager {
    type Target = NegotiationManager;

    fn deref(&self) -> &NegotiationManager {
        &self.inner
    }
}

impl ConsumerNegotiationManager {
    /// Start building a manager called `name`.
    pub fn builder(name: impl Into<String>) -> NegotiationManagerBuilder {
        NegotiationManagerBuilder::new(name)
    }

    /// Start negotiating `request.offer`. Returns the negotiation id, which
    /// is also the correlation id the provider answers with.
    pub fn initiate(&self, request: ContractOfferRequest) -> Result<String, NegotiationError> {
        let now = self.steps.now();
        let id = generate_id();
        let mut negotiation = ContractNegotiation::new(
            id.clone(),
            NegotiationType::Consumer,
            id,
            request.counter_party_id,
            request.counter_party_address,
            request.protocol,
            now,
        );
        negotiation.add_offer(request.offer, now);
        let negotiation = negotiation.transition(ContractNegotiationState::Initial, now)?;
        let id = self.create(negotiation, NegotiationEventKind::Initiated)?;
        tracing::info!(negotiation_id = %id, "contract negotiation initiated");
        Ok(id)
    }
}

/// Drives the provider side of negotiations.
#[derive(Debug)]
pub struct ProviderNegotiationManager {
    inner: NegotiationManager,
    validation: Arc<ContractValidationService>,
}

impl Deref for ProviderNegotiationManager {
    type Target = NegotiationManager;

    fn deref(&self) -> &NegotiationManager {
        &self.inner
    }
}

impl ProviderNegotiationManager {
    /// Start building a manager called `name`.
    pub fn builder(name: impl Into<String>) -> NegotiationManagerBuilder {
        NegotiationManagerBuilder::new(name)
    }

    /// Record a consumer's request presented by `agent`.
    ///
    /// A request that passes validation waits in `REQUESTED` for the
    /// provider to agree or counter-offer; one that fails goes straight to
    /// `DECLINING`. A request repeating a known correlation id returns the
    /// existing negotiation.
    pub fn request_received(
        &self,
        agent: &ParticipantAgent,
        request: ContractRequest,
    ) -> Result<String, NegotiationError> {
        let _guard = self.inner.initiation.lock();
        if let Some(existing) = self.find_by_correlation_id(&request.correlation_id)? {
            tracing::debug!(
                negotiation_id = %existing.id(),
                correlation_id = %request.correlation_id,
                "contract request already received"
            );
            return Ok(existing.id().to_string());
        }

        let now = self.steps.now();
        let verdict = self.validation.validate_initial_offer(agent, &request.offer);
        let mut negotiation = ContractNegotiation::new(
            generate_id(),
            NegotiationType::Provider,
            request.correlation_id,
            request.counter_party_id,
            request.counter_party_address,
            request.protocol,
            now,
        );
        let negotiation = match verdict {
            Ok(sanitized) => {
                negotiation.add_offer(sanitized, now);
                negotiation.transition(ContractNegotiationState::Requested, now)?
            }
            Err(e) => {
                tracing::warn!(
                    negotiation_id = %negotiation.id(),
                    offer_id = %request.offer.id,
                    error = %e,
                    "contract request refused"
                );
                negotiation.add_offer(request.offer, now);
                negotiation
                    .transition(ContractNegotiationState::Requested, now)?
                    .transition(ContractNegotiationState::Declining, now)?
            }
        };
        let id = self.create(negotiation, NegotiationEventKind::Requested)?;
        tracing::info!(negotiation_id = %id, "contract request received");
        Ok(id)
    }
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Builder for [`ConsumerNegotiationManager`] and
/// [`ProviderNegotiationManager`].
pub struct NegotiationManagerBuilder {
    name: String,
    store: Option<Arc<dyn EntityStore<ContractNegotiation>>>,
    validation: Option<Arc<ContractValidationService>>,
    dispatchers: Option<Arc<NegotiationDispatcherRegistry>>,
    participant_id: Option<String>,
    callback_address: Option<String>,
    clock: Option<Arc<dyn Clock>>,
    wait_strategy: Option<Arc<dyn WaitStrategy>>,
    send_retry_strategy: Option<Arc<dyn WaitStrategy>>,
    send_retry_limit: u32,
    batch_size: Option<usize>,
    command_retry_limit: Option<u32>,
}

impl std::fmt::Debug for NegotiationManagerBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationManagerBuilder")
            .field("name", &self.name)
            .field("participant_id", &self.participant_id)
            .field("send_retry_limit", &self.send_retry_limit)
            .finish_non_exhaustive()
    }
}

impl NegotiationManagerBuilder {
    fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            store: None,
            validation: None,
            dispatchers: None,
            participant_id: None,
            callback_address: None,
            clock: None,
            wait_strategy: None,
            send_retry_strategy: None,
            send_retry_limit: DEFAULT_SEND_RETRY_LIMIT,
            batch_size: None,
            command_retry_limit: None,
        }
    }

    /// The negotiation store. Required.
    pub fn store(mut self, store: Arc<dyn EntityStore<ContractNegotiation>>) -> Self {
        self.store = Some(store);
        self
    }

    /// Checks for received offers and agreements. Required.
    pub fn validation(mut self, validation: Arc<ContractValidationService>) -> Self {
        self.validation = Some(validation);
        self
    }

    /// Dispatchers for outgoing messages.
    pub fn dispatcher_registry(mut self, registry: Arc<NegotiationDispatcherRegistry>) -> Self {
        self.dispatchers = Some(registry);
        self
    }

    /// The local participant. Required.
    pub fn participant_id(mut self, id: impl Into<String>) -> Self {
        self.participant_id = Some(id.into());
        self
    }

    /// Where counterparties reach this connector. Required for consumers.
    pub fn callback_address(mut self, address: impl Into<String>) -> Self {
        self.callback_address = Some(address.into());
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

    /// Backoff between attempts to send a message.
    pub fn send_retry_strategy(mut self, strategy: Arc<dyn WaitStrategy>) -> Self {
        self.send_retry_strategy = Some(strategy);
        self
    }

    /// Attempts per message before the negotiation fails.
    pub fn send_retry_limit(mut self, limit: u32) -> Self {
        self.send_retry_limit = limit;
        self
    }

    /// Negotiations leased per state per tick.
    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// How often a command failing on a store error is re-queued.
    pub fn command_retry_limit(mut self, limit: u32) -> Self {
        self.command_retry_limit = Some(limit);
        self
    }

    /// Build the consumer manager. Must be called inside a Tokio runtime.
    pub fn build_consumer(self) -> Result<ConsumerNegotiationManager, ManagerError> {
        if self.callback_address.is_none() {
            return Err(ManagerError::MissingComponent {
                manager: self.name,
                component: "callback address",
            });
        }
        use ContractNegotiationState::*;
        let (inner, _) = self.build_with(
            NegotiationType::Consumer,
            &[
                (Initial, NegotiationSteps::initial as Step),
                (Requesting, NegotiationSteps::requesting as Step),
                (Offered, NegotiationSteps::offered as Step),
                (Approving, NegotiationSteps::approving as Step),
                (Agreed, NegotiationSteps::agreed as Step),
                (Declining, NegotiationSteps::declining as Step),
            ],
        )?;
        Ok(ConsumerNegotiationManager { inner })
    }

    /// Build the provider manager. Must be called inside a Tokio runtime.
    pub fn build_provider(self) -> Result<ProviderNegotiationManager, ManagerError> {
        use ContractNegotiationState::*;
        let (inner, validation) = self.build_with(
            NegotiationType::Provider,
            &[
                (Requested, NegotiationSteps::requested as Step),
                (Offering, NegotiationSteps::offering as Step),
                (Confirming, NegotiationSteps::confirming as Step),
                (Declining, NegotiationSteps::declining as Step),
            ],
        )?;
        Ok(ProviderNegotiationManager { inner, validation })
    }

    fn build_with(
        self,
        negotiation_type: NegotiationType,
        processors: &[(ContractNegotiationState, Step)],
    ) -> Result<(NegotiationManager, Arc<ContractValidationService>), ManagerError> {
        let missing = |component| ManagerError::MissingComponent {
            manager: self.name.clone(),
            component,
        };
        let store = self.store.clone().ok_or_else(|| missing("store"))?;
        let validation = self.validation.clone().ok_or_else(|| missing("validation service"))?;
        let participant_id = self.participant_id.clone().ok_or_else(|| missing("participant id"))?;
        let runtime = Handle::try_current().map_err(|_| ManagerError::NoRuntime(self.name.clone()))?;

        let clock: Arc<dyn Clock> = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let send_retry_strategy = self.send_retry_strategy.unwrap_or_else(|| {
            Arc::new(ExponentialWaitStrategy::new(
                DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS,
                DEFAULT_SEND_RETRY_BASE_DELAY_MILLIS * 64,
            ))
        });
        let commands = Arc::new(CommandQueue::new());

        let steps = Arc::new(NegotiationSteps {
            clock: Arc::clone(&clock),
            retry: EntitySendRetryManager::new(send_retry_strategy, Arc::clone(&clock), self.send_retry_limit),
            dispatchers: self.dispatchers.unwrap_or_default(),
            commands: Arc::clone(&commands),
            participant_id,
            callback_address: self.callback_address.unwrap_or_default(),
            runtime,
        });

        let mut machine = StateMachineManager::builder(self.name)
            .store(store)
            .command_queue(commands)
            .command_handler(Arc::new(NegotiationCommandHandler::new(
                Arc::clone(&clock),
                Arc::clone(&validation),
            )))
            .clock(clock)
            .wait_strategy(
                self.wait_strategy
                    .unwrap_or_else(|| Arc::new(FixedWaitStrategy::new(1_000))),
            );
        for (state, f) in processors {
            machine = machine.processor(*state, step(&steps, *f));
        }
        if let Some(batch_size) = self.batch_size {
            machine = machine.batch_size(batch_size);
        }
        if let Some(limit) = self.command_retry_limit {
            machine = machine.command_retry_limit(limit);
        }

        let manager = NegotiationManager {
            machine: Arc::new(machine.build()?),
            steps,
            negotiation_type,
            initiation: Mutex::new(()),
        };
        Ok((manager, validation))
    }
}
