//! Sequence-number keyed outbox of in-flight envelopes.

use crate::envelope::Envelope;
use crate::error::{PublishError, PublishResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::watch;

/// In-flight envelopes keyed by delivery tag.
///
/// Shared between the publishing task (writer) and the transport's
/// confirmation callbacks (resolvers). Every mutation happens under one lock,
/// so a cumulative resolution is atomic with respect to concurrent `add`s.
/// The outstanding count is mirrored into a `watch` channel so waiters are
/// woken when the outbox drains instead of polling it.
pub struct SequencedOutbox {
    entries: Mutex<BTreeMap<u64, Envelope>>,
    outstanding: watch::Sender<usize>,
}

impl SequencedOutbox {
    /// Create an empty outbox.
    pub fn new() -> Self {
        let (outstanding, _) = watch::channel(0);
        Self {
            entries: Mutex::new(BTreeMap::new()),
            outstanding,
        }
    }

    /// Record `envelope` under `sequence`.
    ///
    /// A sequence number that is already present means the session handed out
    /// the same delivery tag twice; that is reported, never overwritten.
    pub fn add(&self, sequence: u64, envelope: Envelope) -> PublishResult<()> {
        let mut entries = self.entries.lock();
        if entries.contains_key(&sequence) {
            return Err(PublishError::DuplicateSequence(sequence));
        }
        entries.insert(sequence, envelope);
        self.outstanding.send_replace(entries.len());
        Ok(())
    }

    /// Look up an outstanding envelope.
    pub fn get(&self, sequence: u64) -> Option<Envelope> {
        self.entries.lock().get(&sequence).cloned()
    }

    /// Remove and return every entry with key <= `sequence`, in ascending order.
    pub fn resolve_up_to(&self, sequence: u64) -> Vec<(u64, Envelope)> {
        self.resolve_with(sequence, true, |_| {})
    }

    /// Remove and return the single entry for `sequence`, if still present.
    pub fn resolve_one(&self, sequence: u64) -> Option<Envelope> {
        self.resolve_with(sequence, false, |_| {})
            .pop()
            .map(|(_, envelope)| envelope)
    }

    /// Resolve one or all-up-to `sequence` depending on `cumulative`.
    pub fn resolve(&self, sequence: u64, cumulative: bool) -> Vec<(u64, Envelope)> {
        self.resolve_with(sequence, cumulative, |_| {})
    }

    /// Resolve like [`resolve`](Self::resolve), running `settle` on the
    /// removed entries before drain waiters are notified.
    ///
    /// `settle` runs under the outbox lock and only when something was
    /// removed. Anything it records is visible to a waiter that observes the
    /// resulting count.
    pub fn resolve_with<F>(
        &self,
        sequence: u64,
        cumulative: bool,
        settle: F,
    ) -> Vec<(u64, Envelope)>
    where
        F: FnOnce(&[(u64, Envelope)]),
    {
        let mut entries = self.entries.lock();
        let resolved: Vec<(u64, Envelope)> = if cumulative {
            match sequence.checked_add(1) {
                Some(bound) => {
                    let remaining = entries.split_off(&bound);
                    std::mem::replace(&mut *entries, remaining).into_iter().collect()
                }
                None => std::mem::take(&mut *entries).into_iter().collect(),
            }
        } else {
            entries
                .remove(&sequence)
                .map(|envelope| vec![(sequence, envelope)])
                .unwrap_or_default()
        };

        if !resolved.is_empty() {
            settle(&resolved);
            self.outstanding.send_replace(entries.len());
        }
        resolved
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Outstanding sequence numbers in ascending order.
    pub fn sequences(&self) -> Vec<u64> {
        self.entries.lock().keys().copied().collect()
    }

    /// Wait until the outbox is empty.
    ///
    /// Returns `false` if `timeout` elapsed first.
    pub async fn wait_until_drained(&self, timeout: Duration) -> bool {
        let mut outstanding = self.outstanding.subscribe();
        let drained = matches!(
            tokio::time::timeout(timeout, outstanding.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        drained
    }
}

impl Default for SequencedOutbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn envelope(tag: &str) -> Envelope {
        Envelope::new("TestMessage", tag.as_bytes().to_vec())
    }

    fn filled(range: std::ops::RangeInclusive<u64>) -> SequencedOutbox {
        let outbox = SequencedOutbox::new();
        for seq in range {
            outbox.add(seq, envelope(&seq.to_string())).unwrap();
        }
        outbox
    }

    #[test]
    fn test_add_and_get() {
        let outbox = SequencedOutbox::new();
        assert!(outbox.is_empty());

        let e = envelope("a");
        outbox.add(1, e.clone()).unwrap();

        assert_eq!(outbox.get(1), Some(e));
        assert_eq!(outbox.get(2), None);
        assert_eq!(outbox.len(), 1);
    }

    #[test]
    fn test_add_duplicate_sequence_fails() {
        let outbox = SequencedOutbox::new();
        let first = envelope("first");
        outbox.add(7, first.clone()).unwrap();

        let err = outbox.add(7, envelope("second")).unwrap_err();
        assert!(matches!(err, PublishError::DuplicateSequence(7)));
        // The first entry is untouched
        assert_eq!(outbox.get(7), Some(first));
    }

    #[test]
    fn test_resolve_up_to_is_inclusive_and_ordered() {
        let outbox = filled(1..=5);

        let resolved = outbox.resolve_up_to(3);
        let seqs: Vec<u64> = resolved.iter().map(|(s, _)| *s).collect();

        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(outbox.sequences(), vec![4, 5]);
    }

    #[test]
    fn test_resolve_up_to_max() {
        let outbox = filled(1..=3);
        assert_eq!(outbox.resolve_up_to(u64::MAX).len(), 3);
        assert!(outbox.is_empty());
    }

    #[test]
    fn test_resolve_one_only_removes_named() {
        let outbox = filled(1..=5);

        assert!(outbox.resolve_one(3).is_some());
        assert_eq!(outbox.sequences(), vec![1, 2, 4, 5]);

        // Second resolution of the same tag is a no-op
        assert!(outbox.resolve_one(3).is_none());
        assert_eq!(outbox.len(), 4);
    }

    #[test]
    fn test_resolve_unknown_sequence_is_noop() {
        let outbox = filled(5..=6);
        assert!(outbox.resolve(2, false).is_empty());
        assert!(outbox.resolve(4, true).is_empty());
        assert_eq!(outbox.len(), 2);
    }

    #[tokio::test]
    async fn test_wait_until_drained_empty_returns_immediately() {
        let outbox = SequencedOutbox::new();
        assert!(outbox.wait_until_drained(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_until_drained_times_out() {
        let outbox = filled(1..=2);
        outbox.resolve_one(1);

        let start = std::time::Instant::now();
        assert!(!outbox.wait_until_drained(Duration::from_millis(100)).await);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_wait_until_drained_wakes_on_resolution() {
        let outbox = Arc::new(filled(1..=3));

        let resolver = {
            let outbox = outbox.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                outbox.resolve_one(2);
                tokio::time::sleep(Duration::from_millis(20)).await;
                outbox.resolve_up_to(3);
            })
        };

        assert!(outbox.wait_until_drained(Duration::from_secs(5)).await);
        resolver.await.unwrap();
    }

    #[test]
    fn test_resolve_with_settles_before_count_changes() {
        let outbox = filled(1..=3);
        let watcher = outbox.outstanding.subscribe();
        let mut seen = Vec::new();

        outbox.resolve_with(2, true, |resolved| {
            // Still the pre-resolution count while settling
            assert_eq!(*watcher.borrow(), 3);
            seen.extend(resolved.iter().map(|(seq, _)| *seq));
        });

        assert_eq!(seen, vec![1, 2]);
        assert_eq!(*watcher.borrow(), 1);
    }

    #[test]
    fn test_resolve_with_skips_settle_when_nothing_resolved() {
        let outbox = filled(3..=4);
        let mut called = false;
        outbox.resolve_with(1, false, |_| called = true);
        assert!(!called);
    }

    #[tokio::test]
    async fn test_concurrent_add_and_resolve() {
        let outbox = Arc::new(SequencedOutbox::new());

        let writer = {
            let outbox = outbox.clone();
            tokio::spawn(async move {
                for seq in 1..=500u64 {
                    outbox.add(seq, envelope("x")).unwrap();
                    if seq % 50 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            })
        };

        let resolver = {
            let outbox = outbox.clone();
            tokio::spawn(async move {
                let mut resolved = 0;
                while resolved < 500 {
                    let highest = outbox.sequences().last().copied();
                    if let Some(seq) = highest {
                        resolved += outbox.resolve_up_to(seq).len();
                    }
                    tokio::task::yield_now().await;
                }
                resolved
            })
        };

        writer.await.unwrap();
        assert_eq!(resolver.await.unwrap(), 500);
        assert!(outbox.is_empty());
    }
}
