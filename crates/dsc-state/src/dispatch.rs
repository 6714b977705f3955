//! # Remote Message Dispatch
//!
//! Managers send protocol messages to counterparties without knowing the
//! wire protocol: each message names its protocol, and the registry hands
//! it to the dispatcher registered for that protocol.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

/// Failure to deliver a remote message.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// Network or counterparty unavailability; the send may be retried.
    #[error("transient dispatch failure: {0}")]
    Transient(String),

    /// The counterparty or the local registry refused the message.
    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

impl DispatchError {
    /// Whether a later retry could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// A message addressed to a counterparty over a named protocol.
pub trait RemoteMessage: Send + Sync + 'static {
    /// Protocol binding, such as `ids-multipart`.
    fn protocol(&self) -> &str;

    /// Counterparty endpoint.
    fn counter_party_address(&self) -> &str;
}

/// Sends messages over one protocol.
#[async_trait]
pub trait RemoteMessageDispatcher<M: RemoteMessage, R = ()>: Send + Sync {
    /// Protocol this dispatcher handles.
    fn protocol(&self) -> &str;

    /// Deliver `message` and return the counterparty's response.
    async fn send(&self, message: M) -> Result<R, DispatchError>;
}

/// Protocol-keyed dispatcher registry.
pub struct RemoteMessageDispatcherRegistry<M: RemoteMessage, R = ()> {
    dispatchers: RwLock<HashMap<String, Arc<dyn RemoteMessageDispatcher<M, R>>>>,
}

impl<M: RemoteMessage, R> Default for RemoteMessageDispatcherRegistry<M, R> {
    fn default() -> Self {
        Self {
            dispatchers: RwLock::new(HashMap::new()),
        }
    }
}

impl<M: RemoteMessage, R> std::fmt::Debug for RemoteMessageDispatcherRegistry<M, R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut protocols: Vec<String> = self.dispatchers.read().keys().cloned().collect();
        protocols.sort();
        f.debug_struct("RemoteMessageDispatcherRegistry")
            .field("protocols", &protocols)
            .finish()
    }
}

impl<M: RemoteMessage, R: Send + 'static> RemoteMessageDispatcherRegistry<M, R> {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `dispatcher` for its protocol, replacing any previous one.
    pub fn register(&self, dispatcher: Arc<dyn RemoteMessageDispatcher<M, R>>) {
        let protocol = dispatcher.protocol().to_string();
        self.dispatchers.write().insert(protocol, dispatcher);
    }

    /// Send `message` through the dispatcher for its protocol.
    pub async fn send(&self, message: M) -> Result<R, DispatchError> {
        let dispatcher = self.dispatchers.read().get(message.protocol()).cloned();
        match dispatcher {
            Some(dispatcher) => dispatcher.send(message).await,
            None => Err(DispatchError::Rejected(format!(
                "no dispatcher registered for protocol '{}'",
                message.protocol()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct Ping {
        protocol: String,
    }

    impl RemoteMessage for Ping {
        fn protocol(&self) -> &str {
            &self.protocol
        }

        fn counter_party_address(&self) -> &str {
            "http://provider.test/api"
        }
    }

    struct Counting {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RemoteMessageDispatcher<Ping, u32> for Counting {
        fn protocol(&self) -> &str {
            "test-protocol"
        }

        async fn send(&self, _message: Ping) -> Result<u32, DispatchError> {
            Ok(self.calls.fetch_add(1, Ordering::SeqCst) + 1)
        }
    }

    #[tokio::test]
    async fn routes_by_protocol() {
        let registry = RemoteMessageDispatcherRegistry::<Ping, u32>::new();
        registry.register(Arc::new(Counting {
            calls: AtomicU32::new(0),
        }));
        let reply = registry
            .send(Ping {
                protocol: "test-protocol".into(),
            })
            .await
            .unwrap();
        assert_eq!(reply, 1);
    }

    #[tokio::test]
    async fn unknown_protocol_is_rejected() {
        let registry = RemoteMessageDispatcherRegistry::<Ping, u32>::new();
        let err = registry
            .send(Ping {
                protocol: "carrier-pigeon".into(),
            })
            .await
            .unwrap_err();
        assert!(!err.is_transient());
        assert!(err.to_string().contains("carrier-pigeon"));
    }
}
