//! Republishing of nacked envelopes.

use crate::config::RetryPolicy;
use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult};
use crate::publisher::{PublishReport, RoundOutcome};
use std::future::Future;
use std::time::Instant;
use tracing::{info, warn};

/// Drives publish rounds until no envelope is left nacked.
///
/// Rounds run strictly one after another: a retry round only starts once the
/// previous round's outbox has drained. The retry cap and the deadline are
/// checked between rounds, never during one.
#[derive(Debug, Clone, Default)]
pub struct RetryCoordinator {
    policy: RetryPolicy,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Publish `envelopes` with `publish_round`, feeding each round's nacks
    /// into the next. `publish_round` receives the envelopes and the 1-based
    /// round number.
    pub async fn run<F, Fut>(
        &self,
        envelopes: Vec<Envelope>,
        mut publish_round: F,
    ) -> PublishResult<PublishReport>
    where
        F: FnMut(Vec<Envelope>, u32) -> Fut,
        Fut: Future<Output = PublishResult<RoundOutcome>>,
    {
        let started = Instant::now();
        let mut report = PublishReport::default();
        let mut pending = envelopes;
        let deadline = self.policy.deadline();

        while !pending.is_empty() {
            let round = report.rounds + 1;
            let outcome = publish_round(pending, round).await?;
            report.absorb(&outcome);
            pending = outcome.nacked;

            if pending.is_empty() {
                break;
            }

            let retries_done = round - 1;
            if self.policy.max_rounds.is_some_and(|max| retries_done >= max) {
                warn!(
                    rounds = retries_done,
                    remaining = pending.len(),
                    "Retry rounds exhausted"
                );
                return Err(PublishError::RetriesExhausted {
                    rounds: retries_done,
                    remaining: pending.len(),
                });
            }
            if let Some(deadline) = deadline {
                let elapsed = started.elapsed();
                if elapsed >= deadline {
                    warn!(?elapsed, remaining = pending.len(), "Retry deadline exceeded");
                    return Err(PublishError::RetryDeadlineExceeded {
                        elapsed,
                        remaining: pending.len(),
                    });
                }
            }

            info!(round = round + 1, count = pending.len(), "Republishing nacked messages");
        }

        report.elapsed = started.elapsed();
        if report.rounds > 0 {
            info!("All published messages are confirmed");
        }
        info!(
            published = report.published,
            confirmed = report.confirmed,
            nacked = report.nacked,
            rounds = report.rounds,
            "Published {} messages in {} ms",
            report.confirmed,
            report.elapsed.as_millis()
        );

        Ok(report)
    }
}
