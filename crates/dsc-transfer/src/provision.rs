//! # Provisioning
//!
//! Provisioners create and release the infrastructure a transfer needs.
//! The [`ProvisionManager`] routes each resource definition to the first
//! registered provisioner that accepts it and collects one
//! [`StatusResult`] per definition, so a failure of one resource never
//! hides the outcome of the others.
//!
//! Secrets produced during provisioning go to a [`Vault`]; processes only
//! ever carry the vault key.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dsc_core::{StatusFailure, StatusResult};
use dsc_policy::Policy;
use parking_lot::RwLock;
use thiserror::Error;

use crate::types::{DeprovisionedResource, ProvisionResponse, ProvisionedResource, ResourceDefinition};

// ---------------------------------------------------------------------------
// Vault
// ---------------------------------------------------------------------------

/// Failure to access secret storage.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VaultError {
    /// The secret key is empty.
    #[error("secret key must not be empty")]
    EmptyKey,

    /// The backing store refused the operation.
    #[error("vault unavailable: {0}")]
    Unavailable(String),
}

/// Secret storage.
pub trait Vault: Send + Sync {
    /// Store `value` under `key`, replacing any previous value.
    fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError>;

    /// The secret stored under `key`.
    fn resolve_secret(&self, key: &str) -> Option<String>;

    /// Remove the secret stored under `key`.
    fn delete_secret(&self, key: &str) -> Result<(), VaultError>;
}

/// Process-local vault.
#[derive(Debug, Default)]
pub struct InMemoryVault {
    secrets: RwLock<HashMap<String, String>>,
}

impl InMemoryVault {
    /// An empty vault.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Vault for InMemoryVault {
    fn store_secret(&self, key: &str, value: &str) -> Result<(), VaultError> {
        if key.is_empty() {
            return Err(VaultError::EmptyKey);
        }
        self.secrets.write().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn resolve_secret(&self, key: &str) -> Option<String> {
        self.secrets.read().get(key).cloned()
    }

    fn delete_secret(&self, key: &str) -> Result<(), VaultError> {
        self.secrets.write().remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Provisioners
// ---------------------------------------------------------------------------

/// Creates and releases one kind of resource.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Whether this provisioner creates resources for `definition`.
    fn can_provision(&self, definition: &ResourceDefinition) -> bool;

    /// Whether this provisioner releases `resource`.
    fn can_deprovision(&self, resource: &ProvisionedResource) -> bool;

    /// Create the resource described by `definition`.
    async fn provision(
        &self,
        definition: ResourceDefinition,
        policy: &Policy,
    ) -> StatusResult<ProvisionResponse>;

    /// Release `resource`.
    async fn deprovision(
        &self,
        resource: ProvisionedResource,
        policy: &Policy,
    ) -> StatusResult<DeprovisionedResource>;
}

/// Routes definitions and resources to registered provisioners.
#[derive(Default)]
pub struct ProvisionManager {
    provisioners: RwLock<Vec<Arc<dyn Provisioner>>>,
}

impl std::fmt::Debug for ProvisionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProvisionManager")
            .field("provisioners", &self.provisioners.read().len())
            .finish()
    }
}

impl ProvisionManager {
    /// A manager with no provisioners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a provisioner. Earlier registrations take precedence.
    pub fn register(&self, provisioner: Arc<dyn Provisioner>) {
        self.provisioners.write().push(provisioner);
    }

    /// Provision every definition, in order. The result has one entry per
    /// definition.
    pub async fn provision(
        &self,
        definitions: Vec<ResourceDefinition>,
        policy: &Policy,
    ) -> Vec<StatusResult<ProvisionResponse>> {
        let mut results = Vec::with_capacity(definitions.len());
        for definition in definitions {
            let provisioner = self
                .provisioners
                .read()
                .iter()
                .find(|p| p.can_provision(&definition))
                .cloned();
            let result = match provisioner {
                Some(provisioner) => provisioner.provision(definition, policy).await,
                None => Err(StatusFailure::fatal(format!(
                    "no provisioner found for resource definition {} of type {}",
                    definition.id, definition.resource_type
                ))),
            };
            results.push(result);
        }
        results
    }

    /// Release every resource, in order. The result has one entry per
    /// resource.
    pub async fn deprovision(
        &self,
        resources: Vec<ProvisionedResource>,
        policy: &Policy,
    ) -> Vec<StatusResult<DeprovisionedResource>> {
        let mut results = Vec::with_capacity(resources.len());
        for resource in resources {
            let provisioner = self
                .provisioners
                .read()
                .iter()
                .find(|p| p.can_deprovision(&resource))
                .cloned();
            let result = match provisioner {
                Some(provisioner) => provisioner.deprovision(resource, policy).await,
                None => Err(StatusFailure::fatal(format!(
                    "no provisioner found for provisioned resource {} of type {}",
                    resource.id, resource.resource_type
                ))),
            };
            results.push(result);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Buckets;

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
            if definition.properties.contains_key("flaky") {
                return Err(StatusFailure::retry("bucket service busy"));
            }
            let resource = ProvisionedResource::new(format!("res-{}", definition.id), &definition, "b");
            Ok(ProvisionResponse::completed(resource).with_secret("s3cr3t"))
        }

        async fn deprovision(
            &self,
            resource: ProvisionedResource,
            _policy: &Policy,
        ) -> StatusResult<DeprovisionedResource> {
            Ok(DeprovisionedResource::completed(resource.id))
        }
    }

    fn manager() -> ProvisionManager {
        let manager = ProvisionManager::new();
        manager.register(Arc::new(Buckets));
        manager
    }

    // ── Vault ───────────────────────────────────────────────────────

    #[test]
    fn vault_stores_resolves_and_deletes() {
        let vault = InMemoryVault::new();
        vault.store_secret("k", "v").unwrap();
        assert_eq!(vault.resolve_secret("k").as_deref(), Some("v"));
        vault.delete_secret("k").unwrap();
        assert_eq!(vault.resolve_secret("k"), None);
        assert_eq!(vault.store_secret("", "v"), Err(VaultError::EmptyKey));
    }

    // ── Provisioning ────────────────────────────────────────────────

    #[tokio::test]
    async fn one_result_per_definition_in_order() {
        let results = manager()
            .provision(
                vec![
                    ResourceDefinition::new("d1", "bucket"),
                    ResourceDefinition::new("d2", "queue"),
                    ResourceDefinition::new("d3", "bucket").with_property("flaky", "1"),
                ],
                &Policy::new(),
            )
            .await;
        assert_eq!(results.len(), 3);

        let first = results[0].as_ref().unwrap();
        assert_eq!(first.resource.resource_definition_id, "d1");
        assert_eq!(first.secret_token.as_deref(), Some("s3cr3t"));

        let missing = results[1].as_ref().unwrap_err();
        assert!(missing.is_fatal());
        assert!(missing.detail().contains("of type queue"));

        assert!(!results[2].as_ref().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn deprovision_without_provisioner_is_fatal() {
        let definition = ResourceDefinition::new("d1", "queue");
        let resource = ProvisionedResource::new("r1", &definition, "q");
        let results = manager().deprovision(vec![resource], &Policy::new()).await;
        assert!(results[0].as_ref().unwrap_err().is_fatal());
    }

    #[tokio::test]
    async fn deprovision_routes_by_type() {
        let definition = ResourceDefinition::new("d1", "bucket");
        let resource = ProvisionedResource::new("r1", &definition, "b");
        let results = manager().deprovision(vec![resource], &Policy::new()).await;
        assert_eq!(results[0].as_ref().unwrap().provisioned_resource_id, "r1");
    }
}
