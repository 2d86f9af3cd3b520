//! Confirm publisher: at-least-once publishing over broker publisher confirms.
//!
//! Envelopes are transmitted on a session in confirm mode. The broker assigns
//! every transmit a delivery tag starting at 1 and later acks or nacks those
//! tags, individually or cumulatively ("multiple"). The publisher keeps every
//! unconfirmed envelope in a [`SequencedOutbox`], resolves it when its
//! confirmation arrives, and republishes nacked envelopes on a fresh session
//! until everything is acked.
//!
//! # Guarantees
//!
//! 1. **Monotonic**: delivery tags are consumed in publish order, across batches
//! 2. **Cumulative-aware**: a `multiple` confirm resolves every tag up to it
//! 3. **First resolution wins**: duplicate or contradictory confirms are no-ops
//! 4. **Bounded**: the call fails if confirms do not drain within the timeout
//!
//! # Architecture
//!
//! ```text
//! caller -> BatchPublisher -> Session.transmit ----> broker
//!               |                                      |
//!           SequencedOutbox <- ConfirmationTracker <- ack/nack
//!               |
//!           RetryCoordinator (nacked -> next round)
//! ```

pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod outbox;
pub mod publisher;
pub mod retry;
pub mod tracker;
pub mod transport;

#[cfg(test)]
mod tests;

pub use config::{ConfirmStrategy, PublisherConfig, RetryPolicy};
pub use envelope::{Envelope, Metadata};
pub use error::{PublishError, PublishResult, TransportError, TransportResult};
pub use memory::{AckMode, ConfirmScript, MemoryBroker, ScriptedOutcome};
pub use outbox::SequencedOutbox;
pub use publisher::{BatchPublisher, PublishReport, RoundOutcome};
pub use retry::RetryCoordinator;
pub use tracker::{ConfirmOutcome, ConfirmationEvent, ConfirmationTracker, RetryQueue};
pub use transport::{ConfirmListener, Connection, Session, WireProperties};
