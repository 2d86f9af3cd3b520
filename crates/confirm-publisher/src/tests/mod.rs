//! End-to-end tests for the publisher against the in-process broker.
//!
//! - `harness.rs`           - Fixtures, short-timeout config, faulty sessions
//! - `sequencing.rs`        - Batching, sequence numbers, strategies, wire properties
//! - `resolution.rs`        - Ack/nack resolution, cumulative and single
//! - `retry.rs`             - Republishing nacked messages, retry bounds
//! - `timeout.rs`           - Drain and per-batch timeouts
//! - `transport_failure.rs` - Transport faults, session release, sequence invariants

mod transport_failure;
