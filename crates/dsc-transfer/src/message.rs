//! Protocol messages a consumer sends for a transfer.

use dsc_state::RemoteMessage;

use crate::types::DataRequest;

/// Asks the provider to start serving `data_request`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequestMessage {
    /// Consumer-side process id, used by the provider to correlate replies.
    pub process_id: String,
    /// The request as the consumer sees it after provisioning.
    pub data_request: DataRequest,
}

impl RemoteMessage for TransferRequestMessage {
    fn protocol(&self) -> &str {
        &self.data_request.protocol
    }

    fn counter_party_address(&self) -> &str {
        &self.data_request.connector_address
    }
}
