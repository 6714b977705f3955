//! # Data Flow Dispatch
//!
//! A [`DataFlowController`] knows how to move one kind of data. The
//! [`DataFlowManager`] tries controllers in registration order and hands
//! the request to the first one that accepts it.
//!
//! Dispatch never propagates a failure as a panic: no matching controller,
//! or a controller that panics while initiating, both come back as a
//! [`ResponseStatus::FatalError`](dsc_core::ResponseStatus::FatalError).

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use dsc_core::{StatusFailure, StatusResult};
use dsc_policy::Policy;
use parking_lot::RwLock;

use crate::types::{DataAddress, DataRequest};

/// Executes one kind of data movement.
pub trait DataFlowController: Send + Sync {
    /// Whether this controller can move data from `content` as `request`
    /// asks.
    fn can_handle(&self, request: &DataRequest, content: &DataAddress) -> bool;

    /// Start moving the data.
    fn initiate_flow(
        &self,
        request: &DataRequest,
        content: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<()>;
}

/// Resolves where an asset's content lives, for providers serving it.
pub trait DataAddressResolver: Send + Sync {
    /// The content address of `asset_id`.
    fn resolve_for_asset(&self, asset_id: &str) -> Option<DataAddress>;
}

impl<F> DataAddressResolver for F
where
    F: Fn(&str) -> Option<DataAddress> + Send + Sync,
{
    fn resolve_for_asset(&self, asset_id: &str) -> Option<DataAddress> {
        self(asset_id)
    }
}

/// Ordered registry of data flow controllers.
#[derive(Default)]
pub struct DataFlowManager {
    controllers: RwLock<Vec<Arc<dyn DataFlowController>>>,
}

impl std::fmt::Debug for DataFlowManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataFlowManager")
            .field("controllers", &self.controllers.read().len())
            .finish()
    }
}

impl DataFlowManager {
    /// A manager with no controllers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a controller. Registration order is priority order.
    pub fn register(&self, controller: Arc<dyn DataFlowController>) {
        self.controllers.write().push(controller);
    }

    /// Initiate the flow for `request` with the first accepting controller.
    pub fn initiate(
        &self,
        request: &DataRequest,
        content: &DataAddress,
        policy: &Policy,
    ) -> StatusResult<()> {
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            let controller = self
                .controllers
                .read()
                .iter()
                .find(|c| c.can_handle(request, content))
                .cloned();
            controller.map(|c| c.initiate_flow(request, content, policy))
        }));
        match outcome {
            Ok(Some(result)) => result,
            Ok(None) => Err(StatusFailure::fatal(format!(
                "Unable to process data request {}. No data flow controller found for destination type '{}'",
                request.id,
                request.destination_type()
            ))),
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(request_id = %request.id, error = %message, "data flow controller panicked");
                Err(StatusFailure::fatal(format!(
                    "Unable to process data request {}. Data flow controller throws an exception: {message}",
                    request.id
                )))
            }
        }
    }
}
