//! Mock implementations for testing
//!
//! [`InMemoryBroker`] implements the transport traits with the broker
//! behaviour the gateway depends on: idempotent declarations, conflicts on
//! mismatched parameters, passive lookups, routing per exchange type with
//! mandatory returns, and channels that close on channel-level errors.
//! Faults can be scripted for connects and publishes.

use crate::messaging::Sleeper;
use crate::transport::{
    BindingSpec, BrokerChannel, BrokerConnection, BrokerError, Connector, ExchangeSpec,
    ExchangeType, OutboundMessage, PublishConfirm, QueueSpec,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// AMQP reply code for an unroutable mandatory message
pub const NO_ROUTE: u16 = 312;

/// Scripted outcome for the next publish
#[derive(Debug, Clone, PartialEq)]
pub enum PublishFault {
    Error(BrokerError),
    Nack,
}

/// A message accepted by the in-memory broker
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message: OutboundMessage,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueSpec>,
    bindings: BTreeSet<BindingSpec>,
    queued: HashMap<String, VecDeque<OutboundMessage>>,
    published: Vec<PublishedMessage>,
    publish_faults: VecDeque<PublishFault>,
}

#[derive(Debug, Default)]
struct BrokerShared {
    state: Mutex<BrokerState>,
    link_down: AtomicBool,
    fail_channel_open: AtomicBool,
    fail_connection_close: AtomicBool,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    connection_closes: AtomicUsize,
    publish_attempts: AtomicUsize,
}

/// In-memory stand-in for an AMQP broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<BrokerShared>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A new open connection to this broker
    pub fn connection(&self) -> Arc<MockConnection> {
        Arc::new(MockConnection {
            broker: self.clone(),
            open: AtomicBool::new(true),
        })
    }

    /// Pre-provision an exchange out of band
    pub fn seed_exchange(&self, spec: ExchangeSpec) {
        self.state().exchanges.insert(spec.name.clone(), spec);
    }

    /// Pre-provision a queue out of band
    pub fn seed_queue(&self, spec: QueueSpec) {
        let mut state = self.state();
        state.queued.entry(spec.name.clone()).or_default();
        state.queues.insert(spec.name.clone(), spec);
    }

    /// Pre-provision a binding out of band
    pub fn seed_binding(&self, binding: BindingSpec) {
        self.state().bindings.insert(binding);
    }

    /// Outcomes for the next publishes, consumed in order
    pub fn inject_publish_faults(&self, faults: Vec<PublishFault>) {
        self.state().publish_faults.extend(faults);
    }

    /// Simulate the broker dropping every connection
    pub fn drop_connections(&self) {
        self.shared.link_down.store(true, Ordering::SeqCst);
    }

    pub fn restore_connections(&self) {
        self.shared.link_down.store(false, Ordering::SeqCst);
    }

    /// Make channel creation fail while the connection stays up
    pub fn fail_channel_open(&self, fail: bool) {
        self.shared.fail_channel_open.store(fail, Ordering::SeqCst);
    }

    /// Make client-initiated connection closes fail, leaving the connection open
    pub fn fail_connection_close(&self, fail: bool) {
        self.shared.fail_connection_close.store(fail, Ordering::SeqCst);
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeSpec> {
        self.state().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueSpec> {
        self.state().queues.get(name).cloned()
    }

    pub fn exchange_count(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn queue_count(&self) -> usize {
        self.state().queues.len()
    }

    pub fn bindings(&self) -> Vec<BindingSpec> {
        self.state().bindings.iter().cloned().collect()
    }

    /// Messages waiting in a queue, oldest first
    pub fn messages(&self, queue: &str) -> Vec<OutboundMessage> {
        self.state()
            .queued
            .get(queue)
            .map(|messages| messages.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every acknowledged publish, in order
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.clone()
    }

    pub fn publish_attempts(&self) -> usize {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }

    /// Channels opened and not yet closed
    pub fn open_channel_count(&self) -> usize {
        let opened = self.shared.channels_opened.load(Ordering::SeqCst);
        let closed = self.shared.channels_closed.load(Ordering::SeqCst);
        opened.saturating_sub(closed)
    }

    pub fn channels_opened(&self) -> usize {
        self.shared.channels_opened.load(Ordering::SeqCst)
    }

    /// Client-initiated connection closes
    pub fn connection_closes(&self) -> usize {
        self.shared.connection_closes.load(Ordering::SeqCst)
    }

    fn is_up(&self) -> bool {
        !self.shared.link_down.load(Ordering::SeqCst)
    }

    fn route(
        &self,
        state: &BrokerState,
        exchange: &ExchangeSpec,
        routing_key: &str,
    ) -> Vec<String> {
        state
            .bindings
            .iter()
            .filter(|binding| binding.exchange == exchange.name)
            .filter(|binding| match exchange.kind {
                ExchangeType::Direct => binding.routing_key == routing_key,
                ExchangeType::Topic => topic_matches(&binding.routing_key, routing_key),
                // Header arguments are not modelled; every binding matches
                ExchangeType::Fanout | ExchangeType::Headers => true,
            })
            .map(|binding| binding.queue.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// AMQP topic pattern match: `*` is one word, `#` is zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Connection to an [`InMemoryBroker`]
#[derive(Debug)]
pub struct MockConnection {
    broker: InMemoryBroker,
    open: AtomicBool,
}

#[async_trait]
impl BrokerConnection for MockConnection {
    async fn open_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::ConnectionClosed("connection is closed".to_string()));
        }
        if self.broker.shared.fail_channel_open.load(Ordering::SeqCst) {
            return Err(BrokerError::Protocol("channel open refused".to_string()));
        }

        self.broker
            .shared
            .channels_opened
            .fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockChannel {
            broker: self.broker.clone(),
            open: AtomicBool::new(true),
        }))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.is_open() && self.broker.shared.fail_connection_close.load(Ordering::SeqCst) {
            return Err(BrokerError::Io("close handshake failed".to_string()));
        }
        if self.open.swap(false, Ordering::SeqCst) && self.broker.is_up() {
            self.broker
                .shared
                .connection_closes
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.is_up()
    }
}

/// Channel on an [`InMemoryBroker`]
///
/// Like AMQP, a channel-level error (`NOT_FOUND`, `PRECONDITION_FAILED`)
/// closes the channel. Scripted `ChannelClosed` and `Io` publish faults close
/// it too, as they would with a real client library.
#[derive(Debug)]
pub struct MockChannel {
    broker: InMemoryBroker,
    open: AtomicBool,
}

impl MockChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.is_open() {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed("channel is closed".to_string()))
        }
    }

    fn mark_closed(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            self.broker
                .shared
                .channels_closed
                .fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fail(&self, error: BrokerError) -> BrokerError {
        self.mark_closed();
        error
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let existing = state.exchanges.get(&spec.name).cloned();
        match existing {
            Some(existing) if &existing != spec => Err(self.fail(BrokerError::PreconditionFailed(
                format!(
                    "inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    spec.name, spec.kind, existing.kind
                ),
            ))),
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(spec.name.clone(), spec.clone());
                Ok(())
            }
        }
    }

    async fn lookup_exchange(&self, name: &str) -> Result<(), BrokerError> {
        self.ensure_open()?;
        if name.is_empty() || self.broker.state().exchanges.contains_key(name) {
            Ok(())
        } else {
            Err(self.fail(BrokerError::NotFound(format!("no exchange '{name}' in vhost '/'"))))
        }
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        let existing = state.queues.get(&spec.name).cloned();
        match existing {
            Some(existing) if &existing != spec => Err(self.fail(BrokerError::PreconditionFailed(
                format!(
                    "inequivalent arg 'x-max-priority' for queue '{}': \
                     received {:?} but current is {:?}",
                    spec.name, spec.max_priority, existing.max_priority
                ),
            ))),
            Some(_) => Ok(()),
            None => {
                state.queues.insert(spec.name.clone(), spec.clone());
                state.queued.entry(spec.name.clone()).or_default();
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &BindingSpec) -> Result<(), BrokerError> {
        self.ensure_open()?;
        let mut state = self.broker.state();
        if !state.exchanges.contains_key(&binding.exchange) {
            return Err(self.fail(BrokerError::NotFound(format!(
                "no exchange '{}' in vhost '/'",
                binding.exchange
            ))));
        }
        if !state.queues.contains_key(&binding.queue) {
            return Err(self.fail(BrokerError::NotFound(format!(
                "no queue '{}' in vhost '/'",
                binding.queue
            ))));
        }
        state.bindings.insert(binding.clone());
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutboundMessage,
    ) -> Result<PublishConfirm, BrokerError> {
        self.broker
            .shared
            .publish_attempts
            .fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;

        let mut state = self.broker.state();
        match state.publish_faults.pop_front() {
            Some(PublishFault::Error(error)) => {
                if matches!(error, BrokerError::ChannelClosed(_) | BrokerError::Io(_)) {
                    self.mark_closed();
                }
                return Err(error);
            }
            Some(PublishFault::Nack) => return Ok(PublishConfirm::Nacked),
            None => {}
        }

        let targets = if exchange.is_empty() {
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            match state.exchanges.get(exchange) {
                Some(spec) => self.broker.route(&state, spec, routing_key),
                None => {
                    return Err(self.fail(BrokerError::NotFound(format!(
                        "no exchange '{exchange}' in vhost '/'"
                    ))))
                }
            }
        };

        if targets.is_empty() {
            return Ok(PublishConfirm::Returned {
                reply_code: NO_ROUTE,
                reply_text: "NO_ROUTE".to_string(),
            });
        }

        for queue in targets {
            state.queued.entry(queue).or_default().push_back(message.clone());
        }
        state.published.push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            message: message.clone(),
        });
        Ok(PublishConfirm::Acked)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.mark_closed();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.broker.is_up()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ConnectBehavior {
    FailFirst(u32),
    Unreachable,
    Hang,
}

/// Connector to an [`InMemoryBroker`] with scripted connect failures
#[derive(Debug)]
pub struct MockConnector {
    broker: InMemoryBroker,
    behavior: ConnectBehavior,
    attempts: AtomicU32,
}

impl MockConnector {
    pub fn new(broker: InMemoryBroker) -> Self {
        Self {
            broker,
            behavior: ConnectBehavior::FailFirst(0),
            attempts: AtomicU32::new(0),
        }
    }

    /// Refuse the first `failures` attempts, then connect
    pub fn failing_first(mut self, failures: u32) -> Self {
        self.behavior = ConnectBehavior::FailFirst(failures);
        self
    }

    /// Refuse every attempt
    pub fn unreachable(mut self) -> Self {
        self.behavior = ConnectBehavior::Unreachable;
        self
    }

    /// Never answer, so only a timeout ends the attempt
    pub fn hanging(mut self) -> Self {
        self.behavior = ConnectBehavior::Hang;
        self
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, _url: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        match self.behavior {
            ConnectBehavior::Hang => std::future::pending().await,
            ConnectBehavior::Unreachable => {
                Err(BrokerError::Io("connection refused".to_string()))
            }
            ConnectBehavior::FailFirst(failures) if attempt <= failures => {
                Err(BrokerError::Io("connection refused".to_string()))
            }
            ConnectBehavior::FailFirst(_) => Ok(self.broker.connection()),
        }
    }
}

/// Sleeper that records requested delays and returns immediately
#[derive(Debug, Default)]
pub struct RecordingSleeper {
    sleeps: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .map(|sleeps| sleeps.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}
