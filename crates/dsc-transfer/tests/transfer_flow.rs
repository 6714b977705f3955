//! End-to-end transfer process runs against in-memory collaborators.

mod common;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use common::{connector, request, settle, state_of, Buckets, Mode, DESTINATION};
use dsc_core::StatusResult;
use dsc_policy::Policy;
use dsc_state::StatefulEntity;
use dsc_transfer::{
    DataAddress, DataAddressResolver, DataFlowController, DataFlowManager, DataRequest,
    ProvisionResponse, ProvisionedResource, ResourceDefinition, ResourceManifestGenerator,
    StatusCheckerRegistry, TransferCommand, TransferEventKind, TransferProcess,
    TransferProcessState, Vault, KEY_NAME_PROPERTY,
};
use tokio::sync::broadcast::Receiver;

fn drain<E: Clone>(rx: &mut Receiver<E>) -> Vec<E> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

// ── Consumer ────────────────────────────────────────────────────────

#[tokio::test]
async fn managed_consumer_transfer_provisions_runs_and_cleans_up() {
    let done = Arc::new(AtomicBool::new(false));
    let checkers = Arc::new(StatusCheckerRegistry::new());
    let flag = done.clone();
    checkers.register(
        DESTINATION,
        Arc::new(move |_: &TransferProcess, _: &[ProvisionedResource]| flag.load(Ordering::SeqCst)),
    );
    let c = connector(Mode::Completed, |b| b.status_checkers(checkers));
    let mut events = c.manager.subscribe();

    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Provisioning);

    settle().await;
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Requesting);

    let process = c.manager.find(&id).unwrap().unwrap();
    let resource = &process.provisioned_resources()[0];
    let key = resource.data_address.as_ref().unwrap().property(KEY_NAME_PROPERTY).unwrap();
    assert_eq!(key, format!("bucket-{id}"));
    assert_eq!(c.vault.resolve_secret(key).as_deref(), Some("s3cr3t"));

    settle().await;
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Requested);

    c.manager
        .enqueue(TransferCommand::Acknowledge { process_id: id.clone() })
        .unwrap();
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::InProgress);

    done.store(true, Ordering::SeqCst);
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Deprovisioning);

    settle().await;
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Ended);
    assert_eq!(c.buckets.deprovisioned.load(Ordering::SeqCst), 1);
    assert_eq!(c.vault.resolve_secret(&format!("bucket-{id}")), None);

    let kinds: Vec<TransferEventKind> = drain(&mut events).into_iter().map(|e| e.kind).collect();
    assert_eq!(
        kinds,
        vec![
            TransferEventKind::Initiated,
            TransferEventKind::Provisioned,
            TransferEventKind::Requested,
            TransferEventKind::Started,
            TransferEventKind::Completed,
            TransferEventKind::Deprovisioned,
            TransferEventKind::Ended,
        ]
    );
}

#[tokio::test]
async fn deferred_provisioning_waits_for_the_resource() {
    let c = connector(Mode::Deferred, |b| b);
    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();
    c.manager.tick();
    settle().await;
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::ProvisioningRequested);

    // Nothing happens until the provisioner calls back.
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::ProvisioningRequested);

    let process = c.manager.find(&id).unwrap().unwrap();
    let definition = &process.resource_manifest().unwrap().definitions[0];
    c.manager
        .enqueue(TransferCommand::AddProvisionedResource {
            process_id: id.clone(),
            response: ProvisionResponse::completed(Buckets::resource_for(definition)),
        })
        .unwrap();
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Requesting);
}

#[tokio::test]
async fn cancel_during_provisioning_keeps_the_late_resource_for_cleanup() {
    let c = connector(Mode::Completed, |b| b);
    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();
    c.manager.tick();
    c.manager
        .enqueue(TransferCommand::Cancel { process_id: id.clone() })
        .unwrap();

    settle().await;
    c.manager.tick();
    let process = c.manager.find(&id).unwrap().unwrap();
    assert_eq!(process.state().unwrap(), TransferProcessState::Cancelled);
    assert_eq!(process.provisioned_resources().len(), 1);

    c.manager
        .enqueue(TransferCommand::Deprovision { process_id: id.clone() })
        .unwrap();
    c.manager.tick();
    settle().await;
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Ended);
    assert_eq!(c.buckets.deprovisioned.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn refused_request_fails_the_process() {
    let c = connector(Mode::Completed, |b| b);
    c.dispatcher.refuse.store(true, Ordering::SeqCst);
    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();

    for _ in 0..3 {
        c.manager.tick();
        settle().await;
    }

    let process = c.manager.find(&id).unwrap().unwrap();
    assert_eq!(process.state().unwrap(), TransferProcessState::Error);
    assert_eq!(
        process.meta().error_detail.as_deref(),
        Some("dispatch rejected: request refused by provider")
    );
    assert_eq!(c.dispatcher.sent.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn missing_provisioner_is_fatal() {
    let mut queues = ResourceManifestGenerator::new();
    queues.register_consumer_generator(|request: &DataRequest, _: &Policy| {
        Some(ResourceDefinition::new(format!("{}-queue", request.id), "queue"))
    });
    let c = connector(Mode::Completed, |b| b.manifest_generator(Arc::new(queues)));
    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();

    c.manager.tick();
    settle().await;
    c.manager.tick();

    let process = c.manager.find(&id).unwrap().unwrap();
    assert_eq!(process.state().unwrap(), TransferProcessState::Error);
    assert_eq!(
        process.meta().error_detail.as_deref(),
        Some("no provisioner found for resource definition dr-1-queue of type queue")
    );
    assert_eq!(c.buckets.provisioned.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cancelling_a_failed_process_keeps_its_error_detail() {
    let c = connector(Mode::Completed, |b| b);
    let id = c.manager.initiate_consumer_request(request("dr-1")).unwrap();
    c.manager
        .enqueue(TransferCommand::Fail {
            process_id: id.clone(),
            reason: "destination unreachable".into(),
        })
        .unwrap();
    c.manager
        .enqueue(TransferCommand::Cancel { process_id: id.clone() })
        .unwrap();
    c.manager.tick();

    let process = c.manager.find(&id).unwrap().unwrap();
    assert_eq!(process.state().unwrap(), TransferProcessState::Error);
    assert_eq!(process.meta().error_detail.as_deref(), Some("destination unreachable"));
}

// ── Provider ────────────────────────────────────────────────────────

struct Push {
    calls: AtomicUsize,
}

impl DataFlowController for Push {
    fn can_handle(&self, request: &DataRequest, _content: &DataAddress) -> bool {
        request.destination_type() == DESTINATION
    }

    fn initiate_flow(&self, _request: &DataRequest, _content: &DataAddress, _policy: &Policy) -> StatusResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn provider_starts_the_flow_and_ends_on_completion() {
    let push = Arc::new(Push {
        calls: AtomicUsize::new(0),
    });
    let flows = Arc::new(DataFlowManager::new());
    flows.register(push.clone());
    let resolver: Arc<dyn DataAddressResolver> =
        Arc::new(|asset: &str| (asset == "asset-1").then(|| DataAddress::new("object-store")));
    let c = connector(Mode::Completed, |b| b.data_flow_manager(flows).address_resolver(resolver));

    let id = c.manager.initiate_provider_request(request("dr-1")).unwrap();
    c.manager.tick();

    let process = c.manager.find(&id).unwrap().unwrap();
    assert_eq!(process.state().unwrap(), TransferProcessState::InProgress);
    assert_eq!(process.content_data_address().unwrap().address_type(), "object-store");
    assert!(process.provisioned_resources().is_empty());
    assert_eq!(push.calls.load(Ordering::SeqCst), 1);
    assert_eq!(c.dispatcher.sent.load(Ordering::SeqCst), 0);

    c.manager
        .enqueue(TransferCommand::Complete { process_id: id.clone() })
        .unwrap();
    c.manager.tick();
    assert_eq!(state_of(&c, &id), TransferProcessState::Ended);
}
