//! Translates broker acks and nacks into outbox resolutions.

use crate::envelope::Envelope;
use crate::outbox::SequencedOutbox;
use crate::transport::ConfirmListener;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Broker verdict for a delivery tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmOutcome {
    Acked,
    Nacked,
}

/// One ack or nack as reported by the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmationEvent {
    pub sequence: u64,
    pub outcome: ConfirmOutcome,
    /// Resolves every outstanding tag <= `sequence`, not just the one named.
    pub cumulative: bool,
}

impl ConfirmationEvent {
    pub fn ack(sequence: u64, cumulative: bool) -> Self {
        Self {
            sequence,
            outcome: ConfirmOutcome::Acked,
            cumulative,
        }
    }

    pub fn nack(sequence: u64, cumulative: bool) -> Self {
        Self {
            sequence,
            outcome: ConfirmOutcome::Nacked,
            cumulative,
        }
    }
}

/// Ordered envelopes rejected by the broker, awaiting re-publication.
#[derive(Default)]
pub struct RetryQueue {
    envelopes: Mutex<VecDeque<Envelope>>,
}

impl RetryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, envelopes: impl IntoIterator<Item = Envelope>) {
        self.envelopes.lock().extend(envelopes);
    }

    /// Take everything queued so far, oldest first.
    pub fn drain(&self) -> Vec<Envelope> {
        self.envelopes.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.envelopes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.lock().is_empty()
    }
}

/// Applies confirmation events to a round's outbox.
///
/// Resolution is first-wins: once a tag leaves the outbox any later ack or
/// nack for it is a no-op, so duplicate or contradictory confirms never
/// double-count or double-enqueue.
pub struct ConfirmationTracker {
    outbox: Arc<SequencedOutbox>,
    retry_queue: Arc<RetryQueue>,
    acked: AtomicUsize,
    nacked: AtomicUsize,
}

impl ConfirmationTracker {
    pub fn new(outbox: Arc<SequencedOutbox>, retry_queue: Arc<RetryQueue>) -> Self {
        Self {
            outbox,
            retry_queue,
            acked: AtomicUsize::new(0),
            nacked: AtomicUsize::new(0),
        }
    }

    /// Apply one event. Returns the number of envelopes it resolved.
    ///
    /// Counters and the retry queue are updated before the outbox reports the
    /// new outstanding count, so a publisher woken by the drain always sees
    /// every nacked envelope queued.
    pub fn handle(&self, event: ConfirmationEvent) -> usize {
        let resolved = self
            .outbox
            .resolve_with(event.sequence, event.cumulative, |resolved| {
                self.settle(event.outcome, resolved);
            });

        if resolved.is_empty() {
            trace!(
                delivery_tag = event.sequence,
                outcome = ?event.outcome,
                multiple = event.cumulative,
                "Confirmation matched no outstanding message"
            );
            return 0;
        }

        for (sequence, envelope) in &resolved {
            match event.outcome {
                ConfirmOutcome::Acked => debug!(
                    delivery_tag = sequence,
                    message_id = %envelope.message_id(),
                    multiple = event.cumulative,
                    "Message ack-ed"
                ),
                ConfirmOutcome::Nacked => warn!(
                    delivery_tag = sequence,
                    message_id = %envelope.message_id(),
                    multiple = event.cumulative,
                    "Message nack-ed, queued for republish"
                ),
            }
        }

        resolved.len()
    }

    fn settle(&self, outcome: ConfirmOutcome, resolved: &[(u64, Envelope)]) {
        match outcome {
            ConfirmOutcome::Acked => {
                self.acked.fetch_add(resolved.len(), Ordering::Release);
            }
            ConfirmOutcome::Nacked => {
                self.nacked.fetch_add(resolved.len(), Ordering::Release);
                self.retry_queue
                    .extend(resolved.iter().map(|(_, envelope)| envelope.clone()));
            }
        }
    }

    pub fn acked_count(&self) -> usize {
        self.acked.load(Ordering::Acquire)
    }

    pub fn nacked_count(&self) -> usize {
        self.nacked.load(Ordering::Acquire)
    }
}

impl ConfirmListener for ConfirmationTracker {
    fn on_ack(&self, sequence: u64, multiple: bool) {
        self.handle(ConfirmationEvent::ack(sequence, multiple));
    }

    fn on_nack(&self, sequence: u64, multiple: bool) {
        self.handle(ConfirmationEvent::nack(sequence, multiple));
    }
}
