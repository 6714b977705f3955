//! # Transfer Data Types
//!
//! The request that starts a transfer, the addresses data moves between,
//! and the records of resources provisioned for it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Property holding the address type.
pub const TYPE_PROPERTY: &str = "type";

/// Property holding the vault key of the address's secret.
pub const KEY_NAME_PROPERTY: &str = "keyName";

// ---------------------------------------------------------------------------
// Addresses and requests
// ---------------------------------------------------------------------------

/// A typed bag of properties locating data: a bucket, a URL, a queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataAddress {
    /// Address properties, including `type`.
    pub properties: BTreeMap<String, String>,
}

impl DataAddress {
    /// An address of the given type.
    pub fn new(address_type: impl Into<String>) -> Self {
        Self::default().with_property(TYPE_PROPERTY, address_type)
    }

    /// Set a property.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// The address type, or `""` when unset.
    pub fn address_type(&self) -> &str {
        self.property(TYPE_PROPERTY).unwrap_or_default()
    }

    /// Vault key of the secret needed to access this address.
    pub fn key_name(&self) -> Option<&str> {
        self.property(KEY_NAME_PROPERTY)
    }

    /// A property value.
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// Content type and finiteness of the data being moved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferType {
    /// MIME type of the content.
    pub content_type: String,
    /// `false` for open-ended streams.
    pub is_finite: bool,
}

impl Default for TransferType {
    fn default() -> Self {
        Self {
            content_type: "application/octet-stream".to_string(),
            is_finite: true,
        }
    }
}

/// What a party asks to have transferred, and where to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    /// Request id, unique per requesting party.
    pub id: String,
    /// Id of the process handling the request, set on creation.
    pub process_id: Option<String>,
    /// Endpoint of the counterparty connector.
    pub connector_address: String,
    /// Protocol used to talk to the counterparty.
    pub protocol: String,
    /// Counterparty connector id.
    pub connector_id: String,
    /// Requested asset.
    pub asset_id: String,
    /// Agreement governing the transfer.
    pub contract_id: String,
    /// Where the data should go.
    pub data_destination: DataAddress,
    /// Whether the connector provisions and later releases resources for
    /// this transfer.
    pub managed_resources: bool,
    /// Content type and finiteness.
    pub transfer_type: TransferType,
    /// Free-form properties.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl DataRequest {
    /// A managed, finite request for `asset_id` under `contract_id`.
    pub fn new(
        id: impl Into<String>,
        asset_id: impl Into<String>,
        contract_id: impl Into<String>,
        data_destination: DataAddress,
    ) -> Self {
        Self {
            id: id.into(),
            process_id: None,
            connector_address: String::new(),
            protocol: String::new(),
            connector_id: String::new(),
            asset_id: asset_id.into(),
            contract_id: contract_id.into(),
            data_destination,
            managed_resources: true,
            transfer_type: TransferType::default(),
            properties: BTreeMap::new(),
        }
    }

    /// Address the counterparty at `address` over `protocol`.
    pub fn with_counterparty(
        mut self,
        connector_id: impl Into<String>,
        address: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        self.connector_id = connector_id.into();
        self.connector_address = address.into();
        self.protocol = protocol.into();
        self
    }

    /// Set whether resources are managed by the connector.
    pub fn with_managed_resources(mut self, managed: bool) -> Self {
        self.managed_resources = managed;
        self
    }

    /// Set the transfer type.
    pub fn with_transfer_type(mut self, transfer_type: TransferType) -> Self {
        self.transfer_type = transfer_type;
        self
    }

    /// Type of the destination address.
    pub fn destination_type(&self) -> &str {
        self.data_destination.address_type()
    }
}

// ---------------------------------------------------------------------------
// Resources
// ---------------------------------------------------------------------------

/// A declarative request for one resource a transfer needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDefinition {
    /// Definition id.
    pub id: String,
    /// Owning process, set when the manifest is attached.
    pub transfer_process_id: String,
    /// Kind of resource, used to select a provisioner.
    pub resource_type: String,
    /// Provisioner-specific parameters.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl ResourceDefinition {
    /// A definition of the given kind.
    pub fn new(id: impl Into<String>, resource_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            transfer_process_id: String::new(),
            resource_type: resource_type.into(),
            properties: BTreeMap::new(),
        }
    }

    /// Set a parameter.
    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// The ordered resource definitions of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceManifest {
    /// Definitions in provisioning order.
    pub definitions: Vec<ResourceDefinition>,
}

impl ResourceManifest {
    /// A manifest over `definitions`.
    pub fn new(definitions: Vec<ResourceDefinition>) -> Self {
        Self { definitions }
    }

    /// Whether nothing needs provisioning.
    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Bind every definition to `process_id`.
    pub fn bind_to(&mut self, process_id: &str) {
        for definition in &mut self.definitions {
            definition.transfer_process_id = process_id.to_string();
        }
    }
}

/// A concrete resource created for a definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionedResource {
    /// Resource id.
    pub id: String,
    /// The definition it satisfies.
    pub resource_definition_id: String,
    /// Owning process.
    pub transfer_process_id: String,
    /// Kind of resource, used to select a deprovisioner.
    pub resource_type: String,
    /// Provider-side name, such as a bucket name.
    pub resource_name: String,
    /// For data-destination resources, the address data is written to.
    /// Provisioning such a resource redirects the process's destination.
    pub data_address: Option<DataAddress>,
}

impl ProvisionedResource {
    /// A resource satisfying `definition`.
    pub fn new(
        id: impl Into<String>,
        definition: &ResourceDefinition,
        resource_name: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            resource_definition_id: definition.id.clone(),
            transfer_process_id: definition.transfer_process_id.clone(),
            resource_type: definition.resource_type.clone(),
            resource_name: resource_name.into(),
            data_address: None,
        }
    }

    /// Mark the resource as the transfer's data destination.
    pub fn with_data_address(mut self, address: DataAddress) -> Self {
        self.data_address = Some(address);
        self
    }

    /// Whether data is written to this resource.
    pub fn is_data_destination(&self) -> bool {
        self.data_address.is_some()
    }
}

/// What a provisioner returns for one definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionResponse {
    /// The created (or creating) resource.
    pub resource: ProvisionedResource,
    /// Credential for the resource; stored in the vault, never on the
    /// process.
    pub secret_token: Option<String>,
    /// `true` when provisioning continues asynchronously and completion
    /// will be reported later.
    pub in_process: bool,
}

impl ProvisionResponse {
    /// A completed provisioning.
    pub fn completed(resource: ProvisionedResource) -> Self {
        Self {
            resource,
            secret_token: None,
            in_process: false,
        }
    }

    /// Provisioning that will complete asynchronously.
    pub fn in_process(resource: ProvisionedResource) -> Self {
        Self {
            resource,
            secret_token: None,
            in_process: true,
        }
    }

    /// Attach a secret token.
    pub fn with_secret(mut self, token: impl Into<String>) -> Self {
        self.secret_token = Some(token.into());
        self
    }
}

/// Record of a released resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionedResource {
    /// The released provisioned resource.
    pub provisioned_resource_id: String,
    /// `true` when release continues asynchronously.
    #[serde(default)]
    pub in_process: bool,
}

impl DeprovisionedResource {
    /// A completed release of `provisioned_resource_id`.
    pub fn completed(provisioned_resource_id: impl Into<String>) -> Self {
        Self {
            provisioned_resource_id: provisioned_resource_id.into(),
            in_process: false,
        }
    }

    /// A release that will complete asynchronously.
    pub fn in_process(provisioned_resource_id: impl Into<String>) -> Self {
        Self {
            provisioned_resource_id: provisioned_resource_id.into(),
            in_process: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_type_and_key_name() {
        let address = DataAddress::new("AmazonS3").with_property(KEY_NAME_PROPERTY, "s3-key");
        assert_eq!(address.address_type(), "AmazonS3");
        assert_eq!(address.key_name(), Some("s3-key"));
        assert_eq!(DataAddress::default().address_type(), "");
    }

    #[test]
    fn request_defaults_to_managed_finite() {
        let request = DataRequest::new("dr-1", "asset-1", "contract-1", DataAddress::new("HttpData"));
        assert!(request.managed_resources);
        assert!(request.transfer_type.is_finite);
        assert_eq!(request.destination_type(), "HttpData");
    }

    #[test]
    fn request_serializes_camel_case() {
        let request = DataRequest::new("dr-1", "asset-1", "contract-1", DataAddress::new("HttpData"));
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["contractId"], "contract-1");
        assert_eq!(json["transferType"]["isFinite"], true);
        assert_eq!(json["dataDestination"]["properties"]["type"], "HttpData");
    }

    #[test]
    fn manifest_binding_sets_process_id() {
        let mut manifest = ResourceManifest::new(vec![
            ResourceDefinition::new("d1", "bucket"),
            ResourceDefinition::new("d2", "queue"),
        ]);
        manifest.bind_to("tp-1");
        assert!(manifest.definitions.iter().all(|d| d.transfer_process_id == "tp-1"));
    }

    #[test]
    fn provisioned_resource_inherits_definition() {
        let mut definition = ResourceDefinition::new("d1", "bucket");
        definition.transfer_process_id = "tp-1".into();
        let resource = ProvisionedResource::new("r1", &definition, "bucket-r1");
        assert_eq!(resource.resource_definition_id, "d1");
        assert_eq!(resource.transfer_process_id, "tp-1");
        assert!(!resource.is_data_destination());
    }
}
