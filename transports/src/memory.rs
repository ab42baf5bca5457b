//! In-process broker
//!
//! Topics live in one [`MemoryBroker`]. A subscription is a single queue fed
//! by every topic it is attached to; all consumers created with the same
//! subscription name pull from that queue (shared delivery). Messages
//! published while a topic has no subscription are held, up to a per-topic
//! limit that drops the oldest, and handed to the first subscription that
//! attaches from the earliest position.
//!
//! Acknowledgment is tracked per subscription. A nacked message is put back
//! on the queue after the subscription's redelivery delay.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch};

use pubsub_bench_core::transport::{
    ConnectOptions, Connector, Consumer, Credentials, InitialPosition, MessageId, Producer,
    ProducerOptions, ReceiveError, ReceivedMessage, SendCallback, SubscribeOptions, Transport,
    TransportError,
};

use crate::MEMORY_SCHEME;

// ============================================================================
// Broker
// ============================================================================

/// Fault injection for producers
#[derive(Debug, Clone, Default)]
pub struct FaultConfig {
    /// Fail every n-th publish (1-based); `None` never fails
    pub fail_every: Option<u64>,
    /// Artificial delay before each publish
    pub publish_delay: Option<Duration>,
}

/// Per-subscription counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Messages acknowledged
    pub acked: u64,
    /// Messages negatively acknowledged
    pub nacked: u64,
    /// Messages handed out and not yet acked or nacked
    pub unacked: usize,
}

/// Messages held per topic before the oldest are dropped
pub const DEFAULT_BACKLOG_LIMIT: usize = 100_000;

/// Shared in-process broker
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

struct BrokerInner {
    state: Mutex<BrokerState>,
    faults: FaultConfig,
    backlog_limit: usize,
    publishes: AtomicU64,
    published: AtomicU64,
    backlog_dropped: AtomicU64,
}

impl Default for BrokerInner {
    fn default() -> Self {
        Self {
            state: Mutex::default(),
            faults: FaultConfig::default(),
            backlog_limit: DEFAULT_BACKLOG_LIMIT,
            publishes: AtomicU64::new(0),
            published: AtomicU64::new(0),
            backlog_dropped: AtomicU64::new(0),
        }
    }
}

#[derive(Default)]
struct BrokerState {
    /// Subscriptions attached to each topic
    attached: HashMap<String, Vec<Arc<Subscription>>>,
    /// Messages waiting for the first subscription on a topic
    backlog: HashMap<String, VecDeque<ReceivedMessage>>,
    /// Subscriptions by name
    subscriptions: HashMap<String, Arc<Subscription>>,
}

impl MemoryBroker {
    /// Empty broker with no faults
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty broker with fault injection
    pub fn with_faults(faults: FaultConfig) -> Self {
        Self::with_options(faults, DEFAULT_BACKLOG_LIMIT)
    }

    /// Empty broker with fault injection and a per-topic backlog limit
    pub fn with_options(faults: FaultConfig, backlog_limit: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                faults,
                backlog_limit,
                ..Default::default()
            }),
        }
    }

    /// Messages accepted so far
    pub fn published(&self) -> u64 {
        self.inner.published.load(Ordering::Acquire)
    }

    /// Counters for a subscription, if it exists
    pub fn subscription_stats(&self, name: &str) -> Option<SubscriptionStats> {
        self.inner
            .lock()
            .subscriptions
            .get(name)
            .map(|sub| sub.stats())
    }

    /// Messages held for topics nobody subscribed to yet
    pub fn backlog_len(&self, topic: &str) -> usize {
        self.inner.lock().backlog.get(topic).map_or(0, VecDeque::len)
    }

    /// Held messages discarded because a topic's backlog was full
    pub fn backlog_dropped(&self) -> u64 {
        self.inner.backlog_dropped.load(Ordering::Acquire)
    }
}

impl BrokerInner {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Apply fault injection, then route the message
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<MessageId, TransportError> {
        if let Some(delay) = self.faults.publish_delay {
            tokio::time::sleep(delay).await;
        }
        let attempt = self.publishes.fetch_add(1, Ordering::AcqRel) + 1;
        if let Some(n) = self.faults.fail_every {
            if n > 0 && attempt % n == 0 {
                return Err(TransportError::Send(format!("injected failure on publish {}", attempt)));
            }
        }

        let seq = self.published.fetch_add(1, Ordering::AcqRel);
        let message = ReceivedMessage {
            id: MessageId::new(format!("{}:{}", seq, attempt)),
            topic: topic.to_string(),
            payload,
        };
        let id = message.id.clone();

        let mut state = self.lock();
        let live: Vec<Arc<Subscription>> = state
            .attached
            .get(topic)
            .map(|subs| subs.iter().filter(|s| !s.is_closed()).cloned().collect())
            .unwrap_or_default();
        if live.is_empty() {
            let held = state.backlog.entry(topic.to_string()).or_default();
            if held.len() >= self.backlog_limit {
                held.pop_front();
                if self.backlog_dropped.fetch_add(1, Ordering::AcqRel) == 0 {
                    tracing::warn!(
                        topic,
                        limit = self.backlog_limit,
                        "Backlog full, dropping oldest held messages"
                    );
                }
            }
            if self.backlog_limit > 0 {
                held.push_back(message);
            }
        } else {
            for sub in live {
                sub.deliver(message.clone());
            }
        }
        Ok(id)
    }

    fn subscribe(&self, options: &SubscribeOptions) -> Arc<Subscription> {
        let mut state = self.lock();
        let existing = state
            .subscriptions
            .get(&options.subscription_name)
            .filter(|s| !s.is_closed())
            .cloned();
        let sub = match existing {
            Some(existing) => existing,
            None => {
                let sub = Arc::new(Subscription::new(
                    options.subscription_name.clone(),
                    options.nack_redelivery_delay,
                ));
                state
                    .subscriptions
                    .insert(options.subscription_name.clone(), Arc::clone(&sub));
                sub
            }
        };

        for topic in &options.topics {
            let subs = state.attached.entry(topic.clone()).or_default();
            if subs.iter().any(|s| Arc::ptr_eq(s, &sub)) {
                continue;
            }
            subs.retain(|s| !s.is_closed());
            let first = subs.is_empty();
            subs.push(Arc::clone(&sub));

            if first {
                let held = state.backlog.remove(topic).unwrap_or_default();
                if options.initial_position == InitialPosition::Earliest {
                    for message in held {
                        sub.deliver(message);
                    }
                }
            }
        }
        sub
    }
}

// ============================================================================
// Subscription
// ============================================================================

struct Subscription {
    name: String,
    tx: mpsc::UnboundedSender<ReceivedMessage>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ReceivedMessage>>,
    unacked: Mutex<HashMap<MessageId, ReceivedMessage>>,
    closed: watch::Sender<bool>,
    redelivery_delay: Duration,
    acked: AtomicU64,
    nacked: AtomicU64,
}

impl Subscription {
    fn new(name: String, redelivery_delay: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed, _) = watch::channel(false);
        Self {
            name,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            unacked: Mutex::new(HashMap::new()),
            closed,
            redelivery_delay,
            acked: AtomicU64::new(0),
            nacked: AtomicU64::new(0),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn deliver(&self, message: ReceivedMessage) {
        // The receiver lives as long as the subscription.
        let _ = self.tx.send(message);
    }

    fn unacked(&self) -> MutexGuard<'_, HashMap<MessageId, ReceivedMessage>> {
        self.unacked.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn take_unacked(&self, id: &MessageId) -> Result<ReceivedMessage, TransportError> {
        self.unacked()
            .remove(id)
            .ok_or_else(|| TransportError::Ack(format!("message {} is not outstanding", id)))
    }

    fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            acked: self.acked.load(Ordering::Acquire),
            nacked: self.nacked.load(Ordering::Acquire),
            unacked: self.unacked().len(),
        }
    }
}

// ============================================================================
// Connector and transport
// ============================================================================

/// Connector for `memory://` addresses, bound to one broker
#[derive(Clone, Default)]
pub struct MemoryConnector {
    broker: MemoryBroker,
}

impl MemoryConnector {
    /// Connector handing out transports on `broker`
    pub fn new(broker: MemoryBroker) -> Self {
        Self { broker }
    }

    /// The broker behind this connector
    pub fn broker(&self) -> &MemoryBroker {
        &self.broker
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &str,
        credentials: Option<Credentials>,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Transport>, TransportError> {
        if !address.starts_with(MEMORY_SCHEME) {
            return Err(TransportError::UnsupportedAddress(address.to_string()));
        }
        tracing::debug!(
            address,
            authenticated = credentials.is_some(),
            operation_timeout_ms = options.operation_timeout.as_millis() as u64,
            "Connected to in-memory broker"
        );
        Ok(Arc::new(MemoryTransport {
            broker: self.broker.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
    closed: AtomicBool,
}

impl MemoryTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            Err(TransportError::Closed("transport"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &str {
        "memory"
    }

    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        self.ensure_open()?;
        if options.topic.is_empty() {
            return Err(TransportError::ProducerCreate {
                topic: options.topic,
                reason: "empty topic".to_string(),
            });
        }
        tracing::debug!(topic = %options.topic, name = ?options.name, "Producer created");
        Ok(Arc::new(MemoryProducer {
            shared: Arc::new(ProducerShared {
                topic: options.topic,
                send_timeout: options.send_timeout,
                broker: Arc::clone(&self.broker.inner),
                closed: AtomicBool::new(false),
            }),
        }))
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn Consumer>, TransportError> {
        self.ensure_open()?;
        if options.topics.is_empty() {
            return Err(TransportError::Subscribe("no topics".to_string()));
        }
        let subscription = self.broker.inner.subscribe(&options);
        tracing::debug!(
            subscription = %subscription.name,
            topics = options.topics.len(),
            kind = ?options.kind,
            "Subscribed"
        );
        Ok(Arc::new(MemoryConsumer { subscription }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// Producer
// ============================================================================

struct ProducerShared {
    topic: String,
    send_timeout: Duration,
    broker: Arc<BrokerInner>,
    closed: AtomicBool,
}

impl ProducerShared {
    async fn send(&self, payload: Bytes) -> Result<MessageId, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed("producer"));
        }
        tokio::time::timeout(self.send_timeout, self.broker.publish(&self.topic, payload))
            .await
            .map_err(|_| TransportError::Timeout(self.send_timeout))?
    }
}

struct MemoryProducer {
    shared: Arc<ProducerShared>,
}

#[async_trait]
impl Producer for MemoryProducer {
    fn topic(&self) -> &str {
        &self.shared.topic
    }

    async fn send(&self, payload: Bytes) -> Result<MessageId, TransportError> {
        self.shared.send(payload).await
    }

    fn send_async(&self, payload: Bytes, on_complete: SendCallback) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = Arc::clone(&self.shared);
                handle.spawn(async move { on_complete(shared.send(payload).await) });
            }
            Err(_) => on_complete(Err(TransportError::Send(
                "no async runtime for send_async".to_string(),
            ))),
        }
    }

    async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct MemoryConsumer {
    subscription: Arc<Subscription>,
}

#[async_trait]
impl Consumer for MemoryConsumer {
    async fn receive(&self) -> Result<ReceivedMessage, ReceiveError> {
        let sub = &self.subscription;
        let mut closed = sub.closed.subscribe();

        let next = tokio::select! {
            biased;
            _ = async { let _ = closed.wait_for(|c| *c).await; } => None,
            message = async { sub.rx.lock().await.recv().await } => message,
        };

        match next {
            Some(message) if sub.is_closed() => Err(ReceiveError::ChannelClosed {
                pending: Some(message),
            }),
            Some(message) => {
                sub.unacked().insert(message.id.clone(), message.clone());
                Ok(message)
            }
            None => Err(ReceiveError::ChannelClosed { pending: None }),
        }
    }

    async fn ack(&self, id: &MessageId) -> Result<(), TransportError> {
        self.subscription.take_unacked(id)?;
        self.subscription.acked.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    async fn nack(&self, id: &MessageId) -> Result<(), TransportError> {
        let sub = &self.subscription;
        // A message handed over together with ChannelClosed was never
        // registered as outstanding.
        let message = sub.take_unacked(id).ok();
        sub.nacked.fetch_add(1, Ordering::AcqRel);

        if let Some(message) = message {
            let redeliver = Arc::clone(sub);
            let delay = sub.redelivery_delay;
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    if !redeliver.is_closed() {
                        redeliver.deliver(message);
                    }
                });
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if !self.subscription.closed.send_replace(true) {
            tracing::debug!(subscription = %self.subscription.name, "Subscription closed");
        }
    }
}
