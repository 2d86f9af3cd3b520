//! In-process broker implementing the transport contract.
//!
//! Used by the console runner and the test-suite. Every session owns a
//! dispatcher task that delivers acks and nacks to the registered listener
//! asynchronously, the way a real broker client's callback thread does.
//! What the broker answers for each transmit is decided by a [`ConfirmScript`].

use crate::error::{TransportError, TransportResult};
use crate::tracker::ConfirmOutcome;
use crate::transport::{ConfirmListener, Connection, Session, WireProperties};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// What the broker answers for one transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ack,
    Nack,
    /// Never confirm.
    Withhold,
}

/// One message as seen by the broker.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub session: u64,
    pub sequence: u64,
    pub destination: String,
    pub message_id: String,
    /// 1 for the first transmit of a message id, 2 for its first retry, ...
    pub attempt: u32,
    pub properties: WireProperties,
    pub body: Vec<u8>,
}

/// A confirmation the broker emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfirmRecord {
    pub session: u64,
    pub sequence: u64,
    pub outcome: ConfirmOutcome,
    pub multiple: bool,
}

/// How settled deliveries are reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AckMode {
    /// One confirm per delivery tag.
    #[default]
    Individual,
    /// Runs of consecutive tags with the same outcome are collapsed into a
    /// single `multiple` confirm, once no lower tag is still unsettled.
    Cumulative,
}

/// Decides the outcome of every transmit.
#[derive(Clone)]
pub struct ConfirmScript(Arc<dyn Fn(&Delivery) -> ScriptedOutcome + Send + Sync>);

impl ConfirmScript {
    pub fn new(decide: impl Fn(&Delivery) -> ScriptedOutcome + Send + Sync + 'static) -> Self {
        Self(Arc::new(decide))
    }

    pub fn ack_all() -> Self {
        Self::new(|_| ScriptedOutcome::Ack)
    }

    pub fn nack_all() -> Self {
        Self::new(|_| ScriptedOutcome::Nack)
    }

    pub fn withhold_all() -> Self {
        Self::new(|_| ScriptedOutcome::Withhold)
    }

    /// Nack the first attempt of deliveries matching `predicate`, ack the rest.
    pub fn nack_first_attempt(
        predicate: impl Fn(&Delivery) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::new(move |delivery| {
            if delivery.attempt == 1 && predicate(delivery) {
                ScriptedOutcome::Nack
            } else {
                ScriptedOutcome::Ack
            }
        })
    }

    /// Nack each transmit with probability `rate`.
    pub fn random_nacks(rate: f64) -> Self {
        let rate = if rate.is_finite() { rate.clamp(0.0, 1.0) } else { 0.0 };
        Self::new(move |_| {
            if rand::thread_rng().gen_bool(rate) {
                ScriptedOutcome::Nack
            } else {
                ScriptedOutcome::Ack
            }
        })
    }

    fn decide(&self, delivery: &Delivery) -> ScriptedOutcome {
        (self.0)(delivery)
    }
}

impl Default for ConfirmScript {
    fn default() -> Self {
        Self::ack_all()
    }
}

impl fmt::Debug for ConfirmScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConfirmScript(..)")
    }
}

#[derive(Debug, Clone, Default)]
struct BrokerSettings {
    script: ConfirmScript,
    ack_mode: AckMode,
    confirm_delay: Duration,
    fail_transmit_after: Option<usize>,
}

#[derive(Default)]
struct BrokerState {
    settings: Mutex<BrokerSettings>,
    disconnected: AtomicBool,
    queues: Mutex<BTreeMap<String, Vec<Delivery>>>,
    deliveries: Mutex<Vec<Delivery>>,
    confirms: Mutex<Vec<ConfirmRecord>>,
    attempts: Mutex<HashMap<String, u32>>,
    transmits: AtomicUsize,
    next_session: AtomicU64,
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    confirm_waits: AtomicUsize,
}

impl BrokerState {
    fn next_attempt(&self, message_id: &str) -> u32 {
        let mut attempts = self.attempts.lock();
        let attempt = attempts.entry(message_id.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }

    fn store(&self, deliveries: &[Delivery]) {
        let mut queues = self.queues.lock();
        for delivery in deliveries {
            queues
                .entry(delivery.destination.clone())
                .or_default()
                .push(delivery.clone());
        }
    }

    fn record_closed(&self, session: u64) {
        self.sessions_closed.fetch_add(1, Ordering::SeqCst);
        debug!(session, "Memory session closed");
    }
}

/// In-process broker. Cheap to clone; clones share state.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script: ConfirmScript) -> Self {
        self.set_script(script);
        self
    }

    pub fn with_ack_mode(self, ack_mode: AckMode) -> Self {
        self.state.settings.lock().ack_mode = ack_mode;
        self
    }

    /// Delay before each dispatcher pass emits its confirms.
    pub fn with_confirm_delay(self, delay: Duration) -> Self {
        self.state.settings.lock().confirm_delay = delay;
        self
    }

    /// Let `count` transmits succeed, then fail every later one as if the
    /// connection dropped.
    pub fn fail_transmit_after(self, count: usize) -> Self {
        self.state.settings.lock().fail_transmit_after = Some(count);
        self
    }

    /// Replace the script for sessions opened from now on.
    pub fn set_script(&self, script: ConfirmScript) {
        self.state.settings.lock().script = script;
    }

    /// Refuse new sessions.
    pub fn disconnect(&self) {
        self.state.disconnected.store(true, Ordering::SeqCst);
    }

    /// Every transmit, in order.
    pub fn deliveries(&self) -> Vec<Delivery> {
        self.state.deliveries.lock().clone()
    }

    /// Every confirm emitted, in order.
    pub fn confirms(&self) -> Vec<ConfirmRecord> {
        self.state.confirms.lock().clone()
    }

    /// Acked messages stored in `destination`.
    pub fn stored(&self, destination: &str) -> Vec<Delivery> {
        self.state
            .queues
            .lock()
            .get(destination)
            .cloned()
            .unwrap_or_default()
    }

    /// Total acked messages across destinations.
    pub fn stored_count(&self) -> usize {
        self.state.queues.lock().values().map(Vec::len).sum()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.state.queues.lock().keys().cloned().collect()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    /// Number of `wait_for_confirms` calls across sessions.
    pub fn confirm_waits(&self) -> usize {
        self.state.confirm_waits.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryBroker {
    async fn open_session(&self) -> TransportResult<Box<dyn Session>> {
        if self.state.disconnected.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed("broker disconnected".into()));
        }
        let id = self.state.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.sessions_opened.fetch_add(1, Ordering::SeqCst);
        debug!(session = id, "Memory session opened");
        Ok(Box::new(MemorySession::new(id, self.state.clone())))
    }
}

type SharedListener = Arc<Mutex<Option<Arc<dyn ConfirmListener>>>>;

struct Settlement {
    outcome: ScriptedOutcome,
    delivery: Delivery,
}

/// One channel on a [`MemoryBroker`].
pub struct MemorySession {
    id: u64,
    broker: Arc<BrokerState>,
    listener: SharedListener,
    script: ConfirmScript,
    next_sequence: u64,
    confirms_enabled: bool,
    closed: bool,
    unconfirmed: Arc<watch::Sender<usize>>,
    settlements: Option<mpsc::UnboundedSender<Settlement>>,
    dispatcher: Option<JoinHandle<()>>,
}

impl MemorySession {
    fn new(id: u64, broker: Arc<BrokerState>) -> Self {
        let script = broker.settings.lock().script.clone();
        let (unconfirmed, _) = watch::channel(0);
        Self {
            id,
            broker,
            listener: Arc::new(Mutex::new(None)),
            script,
            next_sequence: 0,
            confirms_enabled: false,
            closed: false,
            unconfirmed: Arc::new(unconfirmed),
            settlements: None,
            dispatcher: None,
        }
    }

    fn ensure_open(&self) -> TransportResult<()> {
        if self.closed {
            return Err(TransportError::SessionClosed);
        }
        Ok(())
    }

    fn shutdown(&mut self) {
        self.closed = true;
        self.settlements = None;
        if let Some(dispatcher) = self.dispatcher.take() {
            dispatcher.abort();
        }
    }
}

#[async_trait]
impl Session for MemorySession {
    fn set_confirm_listener(&mut self, listener: Arc<dyn ConfirmListener>) {
        *self.listener.lock() = Some(listener);
    }

    async fn enable_confirms(&mut self) -> TransportResult<()> {
        self.ensure_open()?;
        if self.confirms_enabled {
            return Ok(());
        }

        let settings = self.broker.settings.lock().clone();
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Dispatcher {
            session: self.id,
            broker: self.broker.clone(),
            listener: self.listener.clone(),
            unconfirmed: self.unconfirmed.clone(),
            ack_mode: settings.ack_mode,
            delay: settings.confirm_delay,
            pending: BTreeMap::new(),
        };

        self.dispatcher = Some(tokio::spawn(dispatcher.run(rx)));
        self.settlements = Some(tx);
        self.confirms_enabled = true;
        self.next_sequence = 1;
        Ok(())
    }

    fn next_sequence_number(&self) -> u64 {
        self.next_sequence
    }

    async fn declare_destination(&mut self, name: &str) -> TransportResult<()> {
        self.ensure_open()?;
        self.broker.queues.lock().entry(name.to_string()).or_default();
        Ok(())
    }

    async fn transmit(
        &mut self,
        destination: &str,
        properties: &WireProperties,
        body: &[u8],
    ) -> TransportResult<u64> {
        self.ensure_open()?;
        if !self.broker.queues.lock().contains_key(destination) {
            return Err(TransportError::UnknownDestination(destination.to_string()));
        }

        let limit = self.broker.settings.lock().fail_transmit_after;
        let transmitted = self.broker.transmits.fetch_add(1, Ordering::SeqCst);
        if limit.is_some_and(|limit| transmitted >= limit) {
            return Err(TransportError::ConnectionClosed(
                "connection reset during transmit".into(),
            ));
        }

        let sequence = self.next_sequence;
        let delivery = Delivery {
            session: self.id,
            sequence,
            destination: destination.to_string(),
            message_id: properties.message_id.clone(),
            attempt: self.broker.next_attempt(&properties.message_id),
            properties: properties.clone(),
            body: body.to_vec(),
        };
        self.broker.deliveries.lock().push(delivery.clone());
        trace!(session = self.id, sequence, destination, "Memory transmit");

        let Some(settlements) = &self.settlements else {
            // Without confirm mode the message is stored and never confirmed
            self.broker.store(std::slice::from_ref(&delivery));
            return Ok(0);
        };

        let outcome = self.script.decide(&delivery);
        self.next_sequence += 1;
        self.unconfirmed.send_modify(|count| *count += 1);
        settlements
            .send(Settlement { outcome, delivery })
            .map_err(|_| TransportError::SessionClosed)?;

        Ok(sequence)
    }

    async fn wait_for_confirms(&mut self, timeout: Duration) -> TransportResult<bool> {
        self.ensure_open()?;
        if !self.confirms_enabled {
            return Err(TransportError::ConfirmModeRequired);
        }
        self.broker.confirm_waits.fetch_add(1, Ordering::SeqCst);

        let mut unconfirmed = self.unconfirmed.subscribe();
        let settled = matches!(
            tokio::time::timeout(timeout, unconfirmed.wait_for(|count| *count == 0)).await,
            Ok(Ok(_))
        );
        Ok(settled)
    }

    async fn close(&mut self) -> TransportResult<()> {
        self.ensure_open()?;
        self.shutdown();
        self.broker.record_closed(self.id);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.closed {
            self.shutdown();
            self.broker.record_closed(self.id);
        }
    }
}

/// Delivers a session's confirms to its listener.
struct Dispatcher {
    session: u64,
    broker: Arc<BrokerState>,
    listener: SharedListener,
    unconfirmed: Arc<watch::Sender<usize>>,
    ack_mode: AckMode,
    delay: Duration,
    /// Transmitted but not yet confirmed, withheld entries included.
    pending: BTreeMap<u64, Settlement>,
}

impl Dispatcher {
    async fn run(mut self, mut settlements: mpsc::UnboundedReceiver<Settlement>) {
        while let Some(first) = settlements.recv().await {
            self.accept(first);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            while let Ok(next) = settlements.try_recv() {
                self.accept(next);
            }
            self.flush();
        }
    }

    fn accept(&mut self, settlement: Settlement) {
        self.pending.insert(settlement.delivery.sequence, settlement);
    }

    fn flush(&mut self) {
        if self.ack_mode == AckMode::Cumulative {
            self.flush_cumulative_prefix();
        }

        let ready: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, s)| s.outcome != ScriptedOutcome::Withhold)
            .map(|(&sequence, _)| sequence)
            .collect();
        for sequence in ready {
            if let Some(settlement) = self.pending.remove(&sequence) {
                self.emit(vec![settlement], false);
            }
        }
    }

    /// Collapse same-outcome runs at the front of the pending set.
    fn flush_cumulative_prefix(&mut self) {
        loop {
            let Some((&start, first)) = self.pending.first_key_value() else {
                return;
            };
            let outcome = first.outcome;
            if outcome == ScriptedOutcome::Withhold {
                return;
            }

            let mut end = start;
            for (&sequence, settlement) in self.pending.range(start + 1..) {
                if sequence != end + 1 || settlement.outcome != outcome {
                    break;
                }
                end = sequence;
            }

            let run: Vec<Settlement> = (start..=end)
                .filter_map(|sequence| self.pending.remove(&sequence))
                .collect();
            let multiple = run.len() > 1;
            self.emit(run, multiple);
        }
    }

    fn emit(&self, run: Vec<Settlement>, multiple: bool) {
        let Some(last) = run.last() else {
            return;
        };
        let sequence = last.delivery.sequence;
        let outcome = match last.outcome {
            ScriptedOutcome::Nack => ConfirmOutcome::Nacked,
            _ => ConfirmOutcome::Acked,
        };

        if outcome == ConfirmOutcome::Acked {
            let deliveries: Vec<Delivery> = run.iter().map(|s| s.delivery.clone()).collect();
            self.broker.store(&deliveries);
        }
        self.broker.confirms.lock().push(ConfirmRecord {
            session: self.session,
            sequence,
            outcome,
            multiple,
        });

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            match outcome {
                ConfirmOutcome::Acked => listener.on_ack(sequence, multiple),
                ConfirmOutcome::Nacked => listener.on_nack(sequence, multiple),
            }
        }

        self.unconfirmed
            .send_modify(|count| *count = count.saturating_sub(run.len()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::Envelope;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<(u64, bool, bool)>>,
    }

    impl ConfirmListener for Recorder {
        fn on_ack(&self, sequence: u64, multiple: bool) {
            self.events.lock().push((sequence, true, multiple));
        }

        fn on_nack(&self, sequence: u64, multiple: bool) {
            self.events.lock().push((sequence, false, multiple));
        }
    }

    fn props() -> WireProperties {
        WireProperties::for_envelope(
            &Envelope::new("Ping", b"{}".to_vec()),
            "application/json",
            true,
        )
    }

    async fn open(broker: &MemoryBroker) -> (Box<dyn Session>, Arc<Recorder>) {
        let mut session = broker.open_session().await.unwrap();
        let recorder = Arc::new(Recorder::default());
        session.set_confirm_listener(recorder.clone());
        session.enable_confirms().await.unwrap();
        session.declare_destination("ping").await.unwrap();
        (session, recorder)
    }

    #[tokio::test]
    async fn test_sequence_numbers_start_at_one() {
        let broker = MemoryBroker::new();
        let mut session = broker.open_session().await.unwrap();
        session.enable_confirms().await.unwrap();
        session.declare_destination("ping").await.unwrap();

        assert_eq!(session.next_sequence_number(), 1);
        assert_eq!(session.transmit("ping", &props(), b"a").await.unwrap(), 1);
        assert_eq!(session.transmit("ping", &props(), b"b").await.unwrap(), 2);
        assert_eq!(session.next_sequence_number(), 3);

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_individual_acks() {
        let broker = MemoryBroker::new();
        let (mut session, recorder) = open(&broker).await;

        for _ in 0..3 {
            session.transmit("ping", &props(), b"x").await.unwrap();
        }
        assert!(session.wait_for_confirms(Duration::from_secs(1)).await.unwrap());

        assert_eq!(
            *recorder.events.lock(),
            vec![(1, true, false), (2, true, false), (3, true, false)]
        );
        assert_eq!(broker.stored("ping").len(), 3);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_cumulative_acks_collapse_runs() {
        let broker = MemoryBroker::new()
            .with_ack_mode(AckMode::Cumulative)
            .with_script(ConfirmScript::new(|d| {
                if d.sequence == 3 {
                    ScriptedOutcome::Nack
                } else {
                    ScriptedOutcome::Ack
                }
            }));
        let (mut session, recorder) = open(&broker).await;

        for _ in 0..5 {
            session.transmit("ping", &props(), b"x").await.unwrap();
        }
        assert!(session.wait_for_confirms(Duration::from_secs(1)).await.unwrap());

        assert_eq!(
            *recorder.events.lock(),
            vec![(2, true, true), (3, false, false), (5, true, true)]
        );
        assert_eq!(broker.stored_count(), 4);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_withheld_blocks_cumulative_prefix() {
        let broker = MemoryBroker::new()
            .with_ack_mode(AckMode::Cumulative)
            .with_script(ConfirmScript::new(|d| {
                if d.sequence == 1 {
                    ScriptedOutcome::Withhold
                } else {
                    ScriptedOutcome::Ack
                }
            }));
        let (mut session, recorder) = open(&broker).await;

        for _ in 0..3 {
            session.transmit("ping", &props(), b"x").await.unwrap();
        }
        assert!(!session.wait_for_confirms(Duration::from_millis(50)).await.unwrap());

        // Later tags are confirmed one by one so tag 1 is never swept up
        assert_eq!(*recorder.events.lock(), vec![(2, true, false), (3, true, false)]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_transmit_requires_declared_destination() {
        let broker = MemoryBroker::new();
        let mut session = broker.open_session().await.unwrap();
        session.enable_confirms().await.unwrap();

        let err = session.transmit("nowhere", &props(), b"x").await.unwrap_err();
        assert_eq!(err, TransportError::UnknownDestination("nowhere".into()));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_session_rejects_operations() {
        let broker = MemoryBroker::new();
        let (mut session, _) = open(&broker).await;
        session.close().await.unwrap();

        assert_eq!(
            session.transmit("ping", &props(), b"x").await.unwrap_err(),
            TransportError::SessionClosed
        );
        assert_eq!(session.close().await.unwrap_err(), TransportError::SessionClosed);
        assert_eq!(broker.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_dropped_session_counts_as_closed() {
        let broker = MemoryBroker::new();
        {
            let _session = broker.open_session().await.unwrap();
        }
        assert_eq!(broker.sessions_opened(), 1);
        assert_eq!(broker.sessions_closed(), 1);
    }

    #[tokio::test]
    async fn test_wait_requires_confirm_mode() {
        let broker = MemoryBroker::new();
        let mut session = broker.open_session().await.unwrap();
        assert_eq!(
            session.wait_for_confirms(Duration::from_millis(10)).await.unwrap_err(),
            TransportError::ConfirmModeRequired
        );
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_injected_transmit_fault() {
        let broker = MemoryBroker::new().fail_transmit_after(1);
        let (mut session, _) = open(&broker).await;

        assert!(session.transmit("ping", &props(), b"a").await.is_ok());
        assert!(matches!(
            session.transmit("ping", &props(), b"b").await,
            Err(TransportError::ConnectionClosed(_))
        ));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnected_broker_refuses_sessions() {
        let broker = MemoryBroker::new();
        broker.disconnect();
        assert!(matches!(
            broker.open_session().await,
            Err(TransportError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn test_attempts_tracked_per_message_id() {
        let broker = MemoryBroker::new();
        let (mut session, _) = open(&broker).await;
        let properties = props();

        session.transmit("ping", &properties, b"x").await.unwrap();
        session.transmit("ping", &properties, b"x").await.unwrap();

        let attempts: Vec<u32> = broker.deliveries().iter().map(|d| d.attempt).collect();
        assert_eq!(attempts, vec![1, 2]);
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_declared_destinations_listed() {
        let broker = MemoryBroker::new();
        let mut session = broker.open_session().await.unwrap();
        session.declare_destination("a").await.unwrap();
        session.declare_destination("a").await.unwrap();
        session.close().await.unwrap();

        assert_eq!(broker.destinations(), vec!["a".to_string()]);
        assert!(broker.stored("a").is_empty());
    }
}
