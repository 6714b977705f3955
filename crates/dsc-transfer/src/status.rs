//! Completion checks for running transfers, keyed by destination type.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::process::TransferProcess;
use crate::types::ProvisionedResource;

/// Decides whether a running transfer has finished.
pub trait StatusChecker: Send + Sync {
    /// Whether `process` is complete, given its provisioned resources.
    fn is_complete(&self, process: &TransferProcess, resources: &[ProvisionedResource]) -> bool;
}

impl<F> StatusChecker for F
where
    F: Fn(&TransferProcess, &[ProvisionedResource]) -> bool + Send + Sync,
{
    fn is_complete(&self, process: &TransferProcess, resources: &[ProvisionedResource]) -> bool {
        self(process, resources)
    }
}

/// Status checkers by destination type.
#[derive(Default)]
pub struct StatusCheckerRegistry {
    checkers: RwLock<HashMap<String, Arc<dyn StatusChecker>>>,
}

impl std::fmt::Debug for StatusCheckerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut types: Vec<String> = self.checkers.read().keys().cloned().collect();
        types.sort();
        f.debug_struct("StatusCheckerRegistry")
            .field("destination_types", &types)
            .finish()
    }
}

impl StatusCheckerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `checker` for `destination_type`, replacing any previous one.
    pub fn register(&self, destination_type: impl Into<String>, checker: Arc<dyn StatusChecker>) {
        self.checkers.write().insert(destination_type.into(), checker);
    }

    /// The checker for `destination_type`.
    pub fn resolve(&self, destination_type: &str) -> Option<Arc<dyn StatusChecker>> {
        self.checkers.read().get(destination_type).cloned()
    }
}
