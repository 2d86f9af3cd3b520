//! Broker transport contract.
//!
//! The publisher depends only on these traits. A session is one channel on a
//! broker connection: once confirm mode is enabled it numbers every transmit
//! starting at 1 and reports acks and nacks for those numbers asynchronously
//! through the registered [`ConfirmListener`].

use crate::envelope::Envelope;
use crate::error::TransportResult;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// Receives broker confirmations for one session.
///
/// Called from the transport's own task, concurrently with publishing, any
/// number of times and in any order.
pub trait ConfirmListener: Send + Sync {
    /// The broker durably accepted `sequence` (or everything up to it).
    fn on_ack(&self, sequence: u64, multiple: bool);

    /// The broker rejected `sequence` (or everything up to it).
    fn on_nack(&self, sequence: u64, multiple: bool);
}

/// Per-message wire properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WireProperties {
    pub persistent: bool,
    pub content_type: String,
    pub type_tag: String,
    pub message_id: String,
    pub headers: BTreeMap<String, String>,
    pub timestamp: i64,
}

impl WireProperties {
    /// Build properties for an envelope.
    pub fn for_envelope(envelope: &Envelope, content_type: &str, persistent: bool) -> Self {
        Self {
            persistent,
            content_type: content_type.to_string(),
            type_tag: envelope.message_type().to_string(),
            message_id: envelope.message_id().to_string(),
            headers: envelope.metadata().to_headers(),
            timestamp: envelope.created_at().timestamp(),
        }
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Open a fresh session. The caller must [`Session::close`] it.
    async fn open_session(&self) -> TransportResult<Box<dyn Session>>;
}

/// One broker channel.
#[async_trait]
pub trait Session: Send {
    /// Register the receiver of ack/nack notifications.
    fn set_confirm_listener(&mut self, listener: Arc<dyn ConfirmListener>);

    /// Enable publisher confirms; `next_sequence_number` becomes 1.
    async fn enable_confirms(&mut self) -> TransportResult<()>;

    /// Sequence number the next transmit will be assigned.
    fn next_sequence_number(&self) -> u64;

    /// Declare a durable, non-exclusive destination. Idempotent.
    async fn declare_destination(&mut self, name: &str) -> TransportResult<()>;

    /// Send one message and return its assigned sequence number.
    async fn transmit(
        &mut self,
        destination: &str,
        properties: &WireProperties,
        body: &[u8],
    ) -> TransportResult<u64>;

    /// Wait until every transmitted message has been acked or nacked.
    ///
    /// Returns `false` if `timeout` elapsed first.
    async fn wait_for_confirms(&mut self, timeout: Duration) -> TransportResult<bool>;

    /// Close the session. Confirmations arriving afterwards are dropped.
    async fn close(&mut self) -> TransportResult<()>;
}
