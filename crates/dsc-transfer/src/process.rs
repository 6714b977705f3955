//! # Transfer Process
//!
//! The persistent entity tracking one transfer from request to release of
//! its resources. Transitions consume the process and return the new value,
//! checked against [`TransferProcessState::advance`].

use std::collections::{BTreeMap, HashSet};

use dsc_core::StateError;
use dsc_state::{EntityMeta, EntityState, StatefulEntity};
use serde::{Deserialize, Serialize};

use crate::state::{ProcessType, TransferProcessState};
use crate::types::{
    DataAddress, DataRequest, DeprovisionedResource, ProvisionedResource, ResourceDefinition,
    ResourceManifest,
};

/// What happened to a transfer process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferEventKind {
    Initiated,
    ProvisioningRequested,
    Provisioned,
    Requested,
    Started,
    Completed,
    DeprovisioningRequested,
    Deprovisioned,
    Ended,
    Cancelled,
    Failed,
}

/// Lifecycle event published after a transfer process was persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcessEvent {
    /// What happened.
    pub kind: TransferEventKind,
    /// Process id.
    pub transfer_process_id: String,
    /// Epoch millis of the persisted change.
    pub at: i64,
}

/// One transfer, consumer or provider side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferProcess {
    #[serde(flatten)]
    meta: EntityMeta,
    #[serde(rename = "type")]
    process_type: ProcessType,
    data_request: DataRequest,
    content_data_address: Option<DataAddress>,
    resource_manifest: Option<ResourceManifest>,
    #[serde(default)]
    provisioned_resources: Vec<ProvisionedResource>,
    #[serde(default)]
    deprovisioned_resources: Vec<DeprovisionedResource>,
    #[serde(default)]
    properties: BTreeMap<String, String>,
}

impl StatefulEntity for TransferProcess {
    type State = TransferProcessState;
    type Event = TransferProcessEvent;
    const TYPE_NAME: &'static str = "TransferProcess";

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn error_state() -> TransferProcessState {
        TransferProcessState::Error
    }

    fn failure_event(&self) -> TransferProcessEvent {
        self.event(TransferEventKind::Failed)
    }
}

impl TransferProcess {
    /// A new, unsaved process for `data_request`.
    pub fn new(
        id: impl Into<String>,
        process_type: ProcessType,
        mut data_request: DataRequest,
        now: i64,
    ) -> Self {
        let id = id.into();
        data_request.process_id = Some(id.clone());
        Self {
            meta: EntityMeta::new(id, TransferProcessState::Unsaved.code(), now),
            process_type,
            data_request,
            content_data_address: None,
            resource_manifest: None,
            provisioned_resources: Vec::new(),
            deprovisioned_resources: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    /// Consumer or provider.
    pub fn process_type(&self) -> ProcessType {
        self.process_type
    }

    /// The request being served.
    pub fn data_request(&self) -> &DataRequest {
        &self.data_request
    }

    /// Source address resolved for provider transfers.
    pub fn content_data_address(&self) -> Option<&DataAddress> {
        self.content_data_address.as_ref()
    }

    /// Record the resolved source address.
    pub fn set_content_data_address(&mut self, address: DataAddress) {
        self.content_data_address = Some(address);
    }

    /// The manifest, once generated.
    pub fn resource_manifest(&self) -> Option<&ResourceManifest> {
        self.resource_manifest.as_ref()
    }

    /// Resources provisioned so far.
    pub fn provisioned_resources(&self) -> &[ProvisionedResource] {
        &self.provisioned_resources
    }

    /// Resources released so far.
    pub fn deprovisioned_resources(&self) -> &[DeprovisionedResource] {
        &self.deprovisioned_resources
    }

    /// Free-form properties.
    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    /// Set a property.
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// Whether the transfer has a natural end.
    pub fn is_finite(&self) -> bool {
        self.data_request.transfer_type.is_finite
    }

    /// An event of `kind` stamped with the last modification time.
    pub fn event(&self, kind: TransferEventKind) -> TransferProcessEvent {
        TransferProcessEvent {
            kind,
            transfer_process_id: self.meta.id.clone(),
            at: self.meta.updated_at,
        }
    }

    // -----------------------------------------------------------------------
    // Resource bookkeeping
    // -----------------------------------------------------------------------

    /// A provisioned resource by id.
    pub fn provisioned_resource(&self, id: &str) -> Option<&ProvisionedResource> {
        self.provisioned_resources.iter().find(|r| r.id == id)
    }

    /// Record a provisioned resource. A resource already recorded under the
    /// same id is replaced. A data-destination resource also becomes the
    /// request's destination.
    pub fn add_provisioned_resource(&mut self, resource: ProvisionedResource, now: i64) {
        if let Some(address) = &resource.data_address {
            self.data_request.data_destination = address.clone();
        }
        self.provisioned_resources.retain(|r| r.id != resource.id);
        self.provisioned_resources.push(resource);
        self.meta.updated_at = now;
    }

    /// Record a released resource.
    pub fn add_deprovisioned_resource(&mut self, resource: DeprovisionedResource, now: i64) {
        self.deprovisioned_resources
            .retain(|r| r.provisioned_resource_id != resource.provisioned_resource_id);
        self.deprovisioned_resources.push(resource);
        self.meta.updated_at = now;
    }

    /// Manifest definitions that have no provisioned resource yet.
    pub fn resources_to_provision(&self) -> Vec<ResourceDefinition> {
        let Some(manifest) = &self.resource_manifest else {
            return Vec::new();
        };
        let done: HashSet<&str> = self
            .provisioned_resources
            .iter()
            .map(|r| r.resource_definition_id.as_str())
            .collect();
        manifest
            .definitions
            .iter()
            .filter(|d| !done.contains(d.id.as_str()))
            .cloned()
            .collect()
    }

    /// Whether every manifest definition has a provisioned resource. A
    /// process without a manifest has not started provisioning.
    pub fn provisioning_complete(&self) -> bool {
        self.resource_manifest.is_some() && self.resources_to_provision().is_empty()
    }

    /// Provisioned resources not yet released.
    pub fn resources_to_deprovision(&self) -> Vec<ProvisionedResource> {
        let done: HashSet<&str> = self
            .deprovisioned_resources
            .iter()
            .filter(|r| !r.in_process)
            .map(|r| r.provisioned_resource_id.as_str())
            .collect();
        self.provisioned_resources
            .iter()
            .filter(|r| !done.contains(r.id.as_str()))
            .cloned()
            .collect()
    }

    /// Whether every provisioned resource has been released.
    pub fn deprovision_complete(&self) -> bool {
        self.resources_to_deprovision().is_empty()
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    /// Move to `target`, or re-enter the current state, if the transition
    /// table permits it.
    pub fn transition(mut self, target: TransferProcessState, now: i64) -> Result<Self, StateError> {
        let current = self.state()?;
        let next = current.advance(target, self.process_type)?;
        self.meta.transition_to(next.code(), now);
        Ok(self)
    }

    /// Enter `PROVISIONING` with `manifest` bound to this process.
    pub fn transition_provisioning(
        self,
        mut manifest: ResourceManifest,
        now: i64,
    ) -> Result<Self, StateError> {
        let mut next = self.transition(TransferProcessState::Provisioning, now)?;
        manifest.bind_to(&next.meta.id);
        next.resource_manifest = Some(manifest);
        Ok(next)
    }

    /// Enter `PROVISIONED`. Refused while any definition lacks a resource.
    pub fn transition_provisioned(self, now: i64) -> Result<Self, StateError> {
        if !self.provisioning_complete() {
            let from = self.state()?;
            return Err(StateError::invalid(
                from,
                TransferProcessState::Provisioned,
                format!("{} resource(s) still to provision", self.resources_to_provision().len()),
            ));
        }
        self.transition(TransferProcessState::Provisioned, now)
    }

    /// Enter `IN_PROGRESS` or `STREAMING` depending on the transfer type.
    pub fn transition_active(self, now: i64) -> Result<Self, StateError> {
        let target = TransferProcessState::active(self.is_finite());
        self.transition(target, now)
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    // ── Creation ────────────────────────────────────────────────────

    #[test]
    fn new_process_is_unsaved_and_owns_its_request() {
        let process = TransferProcess::new("tp-9", ProcessType::Provider, request("dr-9"), 5);
        assert_eq!(process.state().unwrap(), TransferProcessState::Unsaved);
        assert_eq!(process.meta().state_count, 0);
        assert_eq!(process.data_request().process_id.as_deref(), Some("tp-9"));
    }

    #[test]
    fn entering_initial_counts_once() {
        let process = process(ProcessType::Consumer);
        assert_eq!(process.state().unwrap(), TransferProcessState::Initial);
        assert_eq!(process.meta().state_count, 1);
    }

    // ── Provisioning bookkeeping ────────────────────────────────────

    #[test]
    fn manifest_is_bound_on_provisioning() {
        let process = provisioning(2);
        let manifest = process.resource_manifest().unwrap();
        assert!(manifest.definitions.iter().all(|d| d.transfer_process_id == "tp-1"));
        assert_eq!(process.resources_to_provision().len(), 2);
        assert!(!process.provisioning_complete());
    }

    #[test]
    fn provisioned_requires_every_definition() {
        let mut process = provisioning(2);
        let first = resource_for(&process, 0);
        process.add_provisioned_resource(first, 2);
        let err = process.clone().transition_provisioned(3).unwrap_err();
        assert!(err.to_string().contains("1 resource(s) still to provision"));

        let second = resource_for(&process, 1);
        process.add_provisioned_resource(second, 3);
        let process = process.transition_provisioned(4).unwrap();
        assert_eq!(process.state().unwrap(), TransferProcessState::Provisioned);
    }

    #[test]
    fn no_manifest_means_provisioning_not_complete() {
        assert!(!process(ProcessType::Consumer).provisioning_complete());
        assert!(provisioning(0).provisioning_complete());
    }

    #[test]
    fn re_adding_a_resource_replaces_it() {
        let mut process = provisioning(1);
        let resource = resource_for(&process, 0);
        process.add_provisioned_resource(resource.clone(), 2);
        process.add_provisioned_resource(resource, 3);
        assert_eq!(process.provisioned_resources().len(), 1);
    }

    #[test]
    fn data_destination_resource_redirects_request() {
        let mut process = provisioning(1);
        let bucket = DataAddress::new("AmazonS3").with_property("bucket", "b-1");
        let resource = resource_for(&process, 0).with_data_address(bucket.clone());
        process.add_provisioned_resource(resource, 2);
        assert_eq!(process.data_request().data_destination, bucket);
    }

    // ── Deprovisioning bookkeeping ──────────────────────────────────

    #[test]
    fn in_process_release_still_needs_completion() {
        let mut process = provisioning(1);
        let resource = resource_for(&process, 0);
        process.add_provisioned_resource(resource, 2);
        assert_eq!(process.resources_to_deprovision().len(), 1);

        process.add_deprovisioned_resource(DeprovisionedResource::in_process("res-0"), 3);
        assert!(!process.deprovision_complete());

        process.add_deprovisioned_resource(DeprovisionedResource::completed("res-0"), 4);
        assert!(process.deprovision_complete());
        assert_eq!(process.deprovisioned_resources().len(), 1);
    }

    // ── Transitions ─────────────────────────────────────────────────

    #[test]
    fn re_entering_a_state_increments_count() {
        let process = provisioning(1)
            .transition(TransferProcessState::Provisioning, 2)
            .unwrap();
        assert_eq!(process.meta().state_count, 2);
        assert_eq!(process.meta().state_timestamp, 2);
    }

    #[test]
    fn active_state_follows_transfer_type() {
        let mut request = request("dr-2");
        request.transfer_type.is_finite = false;
        let process = TransferProcess::new("tp-2", ProcessType::Provider, request, 0)
            .transition(TransferProcessState::Initial, 0)
            .and_then(|p| p.transition_provisioning(ResourceManifest::default(), 1))
            .and_then(|p| p.transition_provisioned(2))
            .and_then(|p| p.transition_active(3))
            .unwrap();
        assert_eq!(process.state().unwrap(), TransferProcessState::Streaming);
    }

    #[test]
    fn rejected_transition_names_both_states() {
        let err = process(ProcessType::Consumer)
            .transition(TransferProcessState::Completed, 1)
            .unwrap_err();
        assert_eq!(
            err,
            StateError::invalid("INITIAL", "COMPLETED", "transition not permitted")
        );
    }

    // ── Persistence ─────────────────────────────────────────────────

    #[test]
    fn json_round_trip_preserves_bookkeeping() {
        let mut process = provisioning(1)
            .transition(TransferProcessState::Provisioning, 7)
            .unwrap();
        let resource = resource_for(&process, 0);
        process.add_provisioned_resource(resource, 8);
        let process = process.into_error("provisioner exploded", 9);

        let json = serde_json::to_string(&process).unwrap();
        let back: TransferProcess = serde_json::from_str(&json).unwrap();
        assert_eq!(back, process);
        assert_eq!(back.meta().state, TransferProcessState::Error.code());
        assert_eq!(back.meta().state_count, 1);
        assert_eq!(back.meta().state_timestamp, 9);
        assert_eq!(back.meta().error_detail.as_deref(), Some("provisioner exploded"));
    }

    #[test]
    fn serialized_shape_is_queryable() {
        let json = serde_json::to_value(process(ProcessType::Consumer)).unwrap();
        assert_eq!(json["id"], "tp-1");
        assert_eq!(json["type"], "CONSUMER");
        assert_eq!(json["dataRequest"]["id"], "dr-1");
        assert_eq!(json["state"], 100);
    }

    #[test]
    fn failure_event_names_the_process() {
        let process = provisioning(0).into_error("boom", 3);
        let event = process.failure_event();
        assert_eq!(event.kind, TransferEventKind::Failed);
        assert_eq!(event.transfer_process_id, "tp-1");
        assert_eq!(event.at, 3);
    }
}
