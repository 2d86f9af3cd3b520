//! Transport failure tests.
//!
//! Covered:
//! - A transmit fault aborts the call and abandons unconfirmed messages
//! - Sessions are closed on every exit path
//! - Repeated or mismatched sequence numbers are fatal and never retried

use super::harness::{person_envelopes, publisher, test_config, Fault, FaultyConnection};
use crate::error::{PublishError, TransportError};
use crate::memory::{ConfirmScript, MemoryBroker};
use crate::publisher::BatchPublisher;
use std::sync::Arc;
use std::time::Duration;

/// Fault in the second batch: the call fails and nothing is retried.
#[tokio::test]
async fn transmit_fault_aborts_call() {
    let broker = MemoryBroker::new().fail_transmit_after(3);
    let publisher = publisher(&broker, test_config().with_batch_size(2));

    let err = publisher.publish_all(person_envelopes(5)).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::Transport(TransportError::ConnectionClosed(_))
    ));
    // 1, 2, 3 transmitted; 4 failed; 5 never attempted
    assert_eq!(broker.deliveries().len(), 3);
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.sessions_closed(), 1);
}

/// The first batch was confirmed before the fault and stays stored.
#[tokio::test]
async fn confirmed_batches_survive_later_fault() {
    let broker = MemoryBroker::new().fail_transmit_after(2);
    let publisher = publisher(&broker, test_config().with_batch_size(2));

    assert!(publisher.publish_all(person_envelopes(4)).await.is_err());

    let sequences: Vec<u64> = broker
        .stored("person_message")
        .iter()
        .map(|d| d.sequence)
        .collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
async fn session_open_failure_propagates() {
    let broker = MemoryBroker::new();
    broker.disconnect();
    let publisher = publisher(&broker, test_config());

    let err = publisher.publish_all(person_envelopes(1)).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::Transport(TransportError::ConnectionClosed(_))
    ));
    assert_eq!(broker.sessions_opened(), 0);
}

/// Success, nack-retry, timeout and transport fault all release their sessions.
#[tokio::test]
async fn sessions_closed_on_every_path() {
    let cases = [
        MemoryBroker::new(),
        MemoryBroker::new().with_script(ConfirmScript::nack_first_attempt(|_| true)),
        MemoryBroker::new().with_script(ConfirmScript::withhold_all()),
        MemoryBroker::new().fail_transmit_after(1),
    ];

    for broker in cases {
        let config = test_config()
            .with_timeout(Duration::from_millis(100))
            .with_batch_confirm_timeout(Duration::from_millis(100));
        let publisher = publisher(&broker, config);
        let _ = publisher.publish_all(person_envelopes(3)).await;

        assert!(broker.sessions_opened() > 0);
        assert_eq!(broker.sessions_opened(), broker.sessions_closed());
    }
}

/// A session that hands out the same tag twice is an invariant violation.
#[tokio::test]
async fn repeated_sequence_number_is_fatal() {
    let broker = MemoryBroker::new();
    let connection = FaultyConnection::new(broker.clone(), Fault::RepeatSequence);
    let publisher = BatchPublisher::new(Arc::new(connection), test_config()).unwrap();

    let err = publisher.publish_all(person_envelopes(3)).await.unwrap_err();

    assert!(matches!(err, PublishError::DuplicateSequence(1)));
    assert!(err.is_invariant_violation());
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.sessions_closed(), 1);
}

#[tokio::test]
async fn mismatched_sequence_number_is_fatal() {
    let broker = MemoryBroker::new();
    let connection = FaultyConnection::new(broker.clone(), Fault::SkewSequence);
    let publisher = BatchPublisher::new(Arc::new(connection), test_config()).unwrap();

    let err = publisher.publish_all(person_envelopes(2)).await.unwrap_err();

    assert!(matches!(
        err,
        PublishError::SequenceMismatch {
            expected: 1,
            assigned: 2
        }
    ));
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.sessions_closed(), 1);
}
