//! Batched publishing with broker confirms.

use crate::config::{ConfirmStrategy, PublisherConfig};
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult};
use crate::outbox::SequencedOutbox;
use crate::retry::RetryCoordinator;
use crate::tracker::{ConfirmationTracker, RetryQueue};
use crate::transport::{Connection, Session, WireProperties};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of one publish round on one session.
#[derive(Debug, Default)]
pub struct RoundOutcome {
    /// Envelopes transmitted.
    pub published: usize,
    /// Envelopes acked.
    pub confirmed: usize,
    /// Envelopes nacked, in publish order.
    pub nacked: Vec<Envelope>,
}

/// Summary of a completed publish call across all rounds.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Transmissions, retries included.
    pub published: usize,
    /// Envelopes acked.
    pub confirmed: usize,
    /// Nacks received.
    pub nacked: usize,
    /// Publish rounds run, the first one included.
    pub rounds: u32,
    pub elapsed: Duration,
}

impl PublishReport {
    pub(crate) fn absorb(&mut self, round: &RoundOutcome) {
        self.published += round.published;
        self.confirmed += round.confirmed;
        self.nacked += round.nacked.len();
        self.rounds += 1;
    }
}

/// Publishes envelopes and blocks until the broker has acked every one.
///
/// Each round opens its own session, enables confirms and records every
/// envelope in a fresh [`SequencedOutbox`] under the sequence number the
/// session is about to assign. Nacked envelopes are handed to the
/// [`RetryCoordinator`], which republishes them in a new round.
pub struct BatchPublisher {
    connection: Arc<dyn Connection>,
    config: PublisherConfig,
    retry: RetryCoordinator,
}

impl BatchPublisher {
    pub fn new(connection: Arc<dyn Connection>, config: PublisherConfig) -> PublishResult<Self> {
        config.validate()?;
        let retry = RetryCoordinator::new(config.retry.clone());
        Ok(Self {
            connection,
            config,
            retry,
        })
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Publish a single envelope.
    pub async fn publish(&self, envelope: Envelope) -> PublishResult<PublishReport> {
        self.publish_all(vec![envelope]).await
    }

    /// Publish `envelopes`, republishing nacked ones until all are acked.
    ///
    /// Fails on a transport fault, a confirmation timeout, or once the retry
    /// policy gives up.
    pub async fn publish_all(&self, envelopes: Vec<Envelope>) -> PublishResult<PublishReport> {
        self.retry
            .run(envelopes, |batch, round| self.publish_round(batch, round))
            .await
    }

    /// Run one round on a fresh session. The session is closed on every path.
    pub(crate) async fn publish_round(
        &self,
        envelopes: Vec<Envelope>,
        round: u32,
    ) -> PublishResult<RoundOutcome> {
        let outbox = Arc::new(SequencedOutbox::new());
        let retry_queue = Arc::new(RetryQueue::new());
        let tracker = Arc::new(ConfirmationTracker::new(outbox.clone(), retry_queue.clone()));

        let mut session = self.connection.open_session().await?;
        let result = self
            .drive_round(session.as_mut(), &envelopes, &outbox, &tracker, round)
            .await;

        if let Err(e) = session.close().await {
            warn!(round, error = %e, "Failed to close session");
        }

        let published = match result {
            Ok(published) => published,
            Err(e) => {
                if !outbox.is_empty() {
                    warn!(
                        round,
                        abandoned = outbox.len(),
                        "Round failed, abandoning unconfirmed messages"
                    );
                }
                return Err(e);
            }
        };

        Ok(RoundOutcome {
            published,
            confirmed: tracker.acked_count(),
            nacked: retry_queue.drain(),
        })
    }

    async fn drive_round(
        &self,
        session: &mut dyn Session,
        envelopes: &[Envelope],
        outbox: &SequencedOutbox,
        tracker: &Arc<ConfirmationTracker>,
        round: u32,
    ) -> PublishResult<usize> {
        session.set_confirm_listener(tracker.clone());
        session.enable_confirms().await?;
        info!(
            round,
            start_sequence = session.next_sequence_number(),
            "Confirm mode enabled"
        );

        let mut declared = HashSet::new();
        let mut published = 0;

        for (index, batch) in envelopes.chunks(self.config.chunk_size()).enumerate() {
            for envelope in batch {
                let destination = envelope.destination();
                if !declared.contains(&destination) {
                    session.declare_destination(&destination).await?;
                    declared.insert(destination.clone());
                }

                let properties = WireProperties::for_envelope(
                    envelope,
                    &self.config.content_type,
                    self.config.persistent,
                );

                // Recorded before transmit so an early confirm always finds it
                let expected = session.next_sequence_number();
                outbox.add(expected, envelope.clone())?;

                let assigned = session
                    .transmit(&destination, &properties, envelope.payload())
                    .await?;
                if assigned != expected {
                    return Err(PublishError::SequenceMismatch { expected, assigned });
                }
                published += 1;

                debug!(
                    sequence = assigned,
                    next_sequence = session.next_sequence_number(),
                    message_id = %envelope.message_id(),
                    destination = %destination,
                    "Published message"
                );
            }

            if self.config.strategy != ConfirmStrategy::Streaming {
                let timeout = self.config.batch_confirm_timeout();
                if !session.wait_for_confirms(timeout).await? {
                    warn!(
                        round,
                        batch = index + 1,
                        outstanding = outbox.len(),
                        "Batch not confirmed in time"
                    );
                    return Err(PublishError::BatchConfirmTimeout {
                        batch: index + 1,
                        timeout,
                    });
                }
            }
        }

        let timeout = self.config.timeout();
        if !outbox.wait_until_drained(timeout).await {
            let outstanding = outbox.len();
            warn!(round, outstanding, ?timeout, "Confirmations timed out");
            return Err(PublishError::ConfirmationTimeout {
                outstanding,
                timeout,
            });
        }

        Ok(published)
    }
}
