//! Consumer and provider negotiation managers talking to each other through
//! an in-process dispatcher.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use dsc_contract::{
    ConsumerNegotiationManager, ContractNegotiation, ContractNegotiationState, ContractOffer, ContractOfferRequest, ContractRequest,
    ContractValidationService, NegotiationCommand, NegotiationDispatcherRegistry, NegotiationMessage,
    NegotiationMessageBody, NegotiationPolicyArchive, OfferCatalog, ProviderNegotiationManager,
    CANCELLED_DETAIL, NEGOTIATION_SCOPE, PARTICIPANT_IDENTITY_CLAIM,
};
use dsc_core::{Clock, ManualClock, WorkerId};
use dsc_policy::{
    Action, Constraint, Operator, ParticipantAgent, Permission, Policy, PolicyArchive, PolicyEngine, RuleKind,
};
use dsc_state::{DispatchError, InMemoryEntityStore, RemoteMessageDispatcher, StatefulEntity};
use serde_json::Value;

const PROTOCOL: &str = "in-process";

/// Routes messages between the two managers.
#[derive(Default)]
struct Link {
    consumer: OnceLock<Arc<ConsumerNegotiationManager>>,
    provider: OnceLock<Arc<ProviderNegotiationManager>>,
}

struct ToProvider(Arc<Link>);

struct ToConsumer(Arc<Link>);

fn refused(e: impl std::fmt::Display) -> DispatchError {
    DispatchError::Rejected(e.to_string())
}

#[async_trait]
impl RemoteMessageDispatcher<NegotiationMessage> for ToProvider {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, message: NegotiationMessage) -> Result<(), DispatchError> {
        let provider = self
            .0
            .provider
            .get()
            .ok_or_else(|| DispatchError::Transient("provider not started".into()))?;
        match message.body {
            NegotiationMessageBody::Request {
                offer,
                consumer_id,
                callback_address,
            } => {
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

#[async_trait]
impl RemoteMessageDispatcher<NegotiationMessage> for ToConsumer {
    fn protocol(&self) -> &str {
        PROTOCOL
    }

    async fn send(&self, message: NegotiationMessage) -> Result<(), DispatchError> {
        let consumer = self
            .0
            .consumer
            .get()
            .ok_or_else(|| DispatchError::Transient("consumer not started".into()))?;
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

fn eu_only() -> Policy {
    Policy::new()
        .with_target("asset-1")
        .with_permission(Permission::new(Action::new("USE")).with_constraint(Constraint::atomic("region", Operator::Eq, "eu")))
}

fn catalog_offer(id: &str) -> ContractOffer {
    ContractOffer::new(id, "asset-1", "provider", eu_only())
}

fn provider_engine() -> Arc<PolicyEngine> {
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
    Arc::new(engine)
}

struct Connectors {
    link: Arc<Link>,
    provider_store: InMemoryEntityStore<ContractNegotiation>,
}

impl Connectors {
    fn consumer(&self) -> &Arc<ConsumerNegotiationManager> {
        self.link.consumer.get().unwrap()
    }

    fn provider(&self) -> &Arc<ProviderNegotiationManager> {
        self.link.provider.get().unwrap()
    }

    async fn run_until(&self, done: impl Fn(&Self) -> bool) {
        for _ in 0..40 {
            self.consumer().tick();
            self.provider().tick();
            tokio::time::sleep(Duration::from_millis(5)).await;
            if done(self) {
                return;
            }
        }
        panic!("negotiations did not settle");
    }

    fn consumer_state(&self, id: &str) -> ContractNegotiationState {
        self.consumer().find(id).unwrap().unwrap().state().unwrap()
    }

    fn provider_state(&self, correlation_id: &str) -> Option<ContractNegotiationState> {
        self.provider()
            .find_by_correlation_id(correlation_id)
            .unwrap()
            .map(|n| n.state().unwrap())
    }
}

fn connectors() -> Connectors {
    let clock = Arc::new(ManualClock::new(1_000));
    let link = Arc::new(Link::default());

    let consumer_dispatchers = Arc::new(NegotiationDispatcherRegistry::new());
    consumer_dispatchers.register(Arc::new(ToProvider(Arc::clone(&link))));
    let consumer_store: InMemoryEntityStore<ContractNegotiation> =
        InMemoryEntityStore::new(WorkerId::new("consumer"), Arc::clone(&clock) as Arc<dyn Clock>);
    let consumer = ConsumerNegotiationManager::builder("consumer-negotiations")
        .store(Arc::new(consumer_store))
        .validation(Arc::new(ContractValidationService::new(
            Arc::new(PolicyEngine::new()),
            Arc::clone(&clock) as Arc<dyn Clock>,
        )))
        .dispatcher_registry(consumer_dispatchers)
        .participant_id("consumer")
        .callback_address("http://consumer.test/api")
        .clock(Arc::clone(&clock) as Arc<dyn Clock>)
        .build_consumer()
        .unwrap();

    let provider_dispatchers = Arc::new(NegotiationDispatcherRegistry::new());
    provider_dispatchers.register(Arc::new(ToConsumer(Arc::clone(&link))));
    let provider_store: InMemoryEntityStore<ContractNegotiation> =
        InMemoryEntityStore::new(WorkerId::new("provider"), Arc::clone(&clock) as Arc<dyn Clock>);
    let catalog: Arc<dyn OfferCatalog> = Arc::new(|id: &str| (id == "offer-1").then(|| catalog_offer(id)));
    let provider = ProviderNegotiationManager::builder("provider-negotiations")
        .store(Arc::new(provider_store.clone()))
        .validation(Arc::new(
            ContractValidationService::new(provider_engine(), Arc::clone(&clock) as Arc<dyn Clock>)
                .with_catalog(catalog),
        ))
        .dispatcher_registry(provider_dispatchers)
        .participant_id("provider")
        .clock(clock as Arc<dyn Clock>)
        .build_provider()
        .unwrap();

    assert!(link.consumer.set(Arc::new(consumer)).is_ok());
    assert!(link.provider.set(Arc::new(provider)).is_ok());
    Connectors { link, provider_store }
}

fn offer_request(offer: ContractOffer) -> ContractOfferRequest {
    ContractOfferRequest {
        protocol: PROTOCOL.into(),
        counter_party_id: "provider".into(),
        counter_party_address: "http://provider.test/api".into(),
        offer,
    }
}

#[tokio::test]
async fn both_sides_confirm_the_same_agreement() {
    let connectors = connectors();
    let id = connectors.consumer().initiate(offer_request(catalog_offer("offer-1"))).unwrap();

    connectors
        .run_until(|c| {
            c.consumer_state(&id) == ContractNegotiationState::Confirmed
                && c.provider_state(&id) == Some(ContractNegotiationState::Confirmed)
        })
        .await;

    let consumer_side = connectors.consumer().find(&id).unwrap().unwrap();
    let provider_side = connectors.provider().find_by_correlation_id(&id).unwrap().unwrap();
    let agreement = consumer_side.contract_agreement().unwrap();
    assert_eq!(Some(agreement), provider_side.contract_agreement());
    assert_eq!(agreement.consumer_id(), "consumer");
    assert_eq!(agreement.policy(), &eu_only());

    let archive = NegotiationPolicyArchive::new(Arc::new(connectors.provider_store.clone()));
    assert_eq!(archive.find_policy_for_contract(agreement.id()), Some(eu_only()));
}

#[tokio::test]
async fn counter_offer_is_approved_before_agreement() {
    let connectors = connectors();
    let id = connectors.consumer().initiate(offer_request(catalog_offer("offer-1"))).unwrap();

    // Deliver the request without letting the provider agree yet.
    connectors.consumer().tick();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let provider_id = connectors
        .provider()
        .find_by_correlation_id(&id)
        .unwrap()
        .unwrap()
        .id()
        .to_string();
    connectors
        .provider()
        .enqueue(NegotiationCommand::CounterOffer {
            negotiation_id: provider_id,
            offer: catalog_offer("offer-1b").with_validity(0, 10_000),
        })
        .unwrap();

    connectors
        .run_until(|c| {
            c.consumer_state(&id) == ContractNegotiationState::Confirmed
                && c.provider_state(&id) == Some(ContractNegotiationState::Confirmed)
        })
        .await;

    let consumer_side = connectors.consumer().find(&id).unwrap().unwrap();
    let offers: Vec<&str> = consumer_side.contract_offers().iter().map(|o| o.id.as_str()).collect();
    assert_eq!(offers, ["offer-1", "offer-1b"]);
    assert_eq!(consumer_side.contract_agreement().unwrap().contract_end_date(), 10_000);
}

#[tokio::test]
async fn unknown_offer_is_declined_on_both_sides() {
    let connectors = connectors();
    let id = connectors.consumer().initiate(offer_request(catalog_offer("offer-9"))).unwrap();

    connectors
        .run_until(|c| {
            c.consumer_state(&id) == ContractNegotiationState::Declined
                && c.provider_state(&id) == Some(ContractNegotiationState::Declined)
        })
        .await;

    let provider_side = connectors.provider().find_by_correlation_id(&id).unwrap().unwrap();
    assert!(provider_side.contract_agreement().is_none());
}

#[tokio::test]
async fn cancelled_negotiation_sends_nothing() {
    let connectors = connectors();
    let id = connectors.consumer().initiate(offer_request(catalog_offer("offer-1"))).unwrap();
    connectors
        .consumer()
        .enqueue(NegotiationCommand::Cancel { negotiation_id: id.clone() })
        .unwrap();

    connectors.run_until(|c| c.consumer_state(&id) == ContractNegotiationState::Error).await;
    let negotiation = connectors.consumer().find(&id).unwrap().unwrap();
    assert_eq!(negotiation.meta().error_detail.as_deref(), Some(CANCELLED_DETAIL));
    assert_eq!(connectors.provider_state(&id), None);
}
