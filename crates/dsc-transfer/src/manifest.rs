//! # Resource Manifests
//!
//! Before a transfer is provisioned, registered definition generators turn
//! its request into the list of resources it needs. Consumers only
//! provision for managed-resource requests; providers always do.
//!
//! When a policy engine is attached, the contract policy is evaluated in
//! the [`MANIFEST_VERIFICATION_SCOPE`] before a manifest is produced.

use std::sync::Arc;

use dsc_policy::{ParticipantAgent, Policy, PolicyEngine, PolicyError};
use thiserror::Error;

use crate::state::ProcessType;
use crate::types::{DataRequest, ResourceDefinition, ResourceManifest};

/// Policy scope evaluated before a manifest is generated.
pub const MANIFEST_VERIFICATION_SCOPE: &str = "provision.manifest.verify";

/// Produces at most one resource definition for a request.
pub trait ResourceDefinitionGenerator: Send + Sync {
    /// The definition this generator contributes, if the request needs one.
    fn generate(&self, request: &DataRequest, policy: &Policy) -> Option<ResourceDefinition>;
}

impl<F> ResourceDefinitionGenerator for F
where
    F: Fn(&DataRequest, &Policy) -> Option<ResourceDefinition> + Send + Sync,
{
    fn generate(&self, request: &DataRequest, policy: &Policy) -> Option<ResourceDefinition> {
        self(request, policy)
    }
}

/// Failure to produce a manifest.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ManifestError {
    /// The contract policy forbids provisioning.
    #[error("resource manifest denied: {0}")]
    Denied(#[from] PolicyError),
}

/// Builds resource manifests from registered generators.
#[derive(Default)]
pub struct ResourceManifestGenerator {
    consumer: Vec<Arc<dyn ResourceDefinitionGenerator>>,
    provider: Vec<Arc<dyn ResourceDefinitionGenerator>>,
    policy_engine: Option<Arc<PolicyEngine>>,
}

impl std::fmt::Debug for ResourceManifestGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceManifestGenerator")
            .field("consumer_generators", &self.consumer.len())
            .field("provider_generators", &self.provider.len())
            .field("verifies_policy", &self.policy_engine.is_some())
            .finish()
    }
}

impl ResourceManifestGenerator {
    /// A generator with no registered definition generators.
    pub fn new() -> Self {
        Self::default()
    }

    /// Verify contract policies with `engine` before generating.
    pub fn with_policy_engine(mut self, engine: Arc<PolicyEngine>) -> Self {
        self.policy_engine = Some(engine);
        self
    }

    /// Register a generator for consumer-side resources.
    pub fn register_consumer_generator(&mut self, generator: impl ResourceDefinitionGenerator + 'static) {
        self.consumer.push(Arc::new(generator));
    }

    /// Register a generator for provider-side resources.
    pub fn register_provider_generator(&mut self, generator: impl ResourceDefinitionGenerator + 'static) {
        self.provider.push(Arc::new(generator));
    }

    /// The manifest for `request` on the given side.
    pub fn generate(
        &self,
        process_type: ProcessType,
        request: &DataRequest,
        policy: &Policy,
    ) -> Result<ResourceManifest, ManifestError> {
        if let Some(engine) = &self.policy_engine {
            engine.evaluate(MANIFEST_VERIFICATION_SCOPE, policy, &ParticipantAgent::new())?;
        }
        let generators = match process_type {
            ProcessType::Consumer if !request.managed_resources => return Ok(ResourceManifest::default()),
            ProcessType::Consumer => &self.consumer,
            ProcessType::Provider => &self.provider,
        };
        let definitions = generators
            .iter()
            .filter_map(|g| g.generate(request, policy))
            .collect();
        Ok(ResourceManifest::new(definitions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DataAddress;
    use dsc_policy::{Action, Prohibition, RuleKind};

    fn request(managed: bool) -> DataRequest {
        DataRequest::new("dr-1", "asset-1", "contract-1", DataAddress::new("bucket"))
            .with_managed_resources(managed)
    }

    fn bucket(request: &DataRequest, _policy: &Policy) -> Option<ResourceDefinition> {
        Some(ResourceDefinition::new(format!("def-{}", request.id), "bucket"))
    }

    fn generator() -> ResourceManifestGenerator {
        let mut generator = ResourceManifestGenerator::new();
        generator.register_consumer_generator(bucket);
        generator.register_consumer_generator(
            |_: &DataRequest, _: &Policy| -> Option<ResourceDefinition> { None },
        );
        generator.register_provider_generator(
            |_: &DataRequest, _: &Policy| -> Option<ResourceDefinition> {
                Some(ResourceDefinition::new("provider-def", "signed-url"))
            },
        );
        generator
    }

    #[test]
    fn consumer_manifest_collects_contributions() {
        let manifest = generator()
            .generate(ProcessType::Consumer, &request(true), &Policy::new())
            .unwrap();
        assert_eq!(manifest.definitions.len(), 1);
        assert_eq!(manifest.definitions[0].id, "def-dr-1");
    }

    #[test]
    fn unmanaged_consumer_request_needs_nothing() {
        let manifest = generator()
            .generate(ProcessType::Consumer, &request(false), &Policy::new())
            .unwrap();
        assert!(manifest.is_empty());
    }

    #[test]
    fn provider_always_generates() {
        let manifest = generator()
            .generate(ProcessType::Provider, &request(false), &Policy::new())
            .unwrap();
        assert_eq!(manifest.definitions[0].resource_type, "signed-url");
    }

    #[test]
    fn prohibited_provisioning_is_denied() {
        let mut engine = PolicyEngine::new();
        engine.bind("provision", MANIFEST_VERIFICATION_SCOPE);
        engine.register_rule_function(MANIFEST_VERIFICATION_SCOPE, RuleKind::Prohibition, |_, _| true);
        let policy = Policy::new().with_prohibition(Prohibition::new(Action::new("provision")));

        let err = generator()
            .with_policy_engine(Arc::new(engine))
            .generate(ProcessType::Consumer, &request(true), &policy)
            .unwrap_err();
        assert!(err.to_string().contains("action 'provision' is prohibited"));
    }
}
