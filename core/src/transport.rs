//! Transport contract
//!
//! The broker client is an external collaborator. These traits are the
//! narrow interface the workers and the orchestrator call through;
//! implementations live in the `pubsub-bench-transports` crate (or in test
//! mocks).

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

// ============================================================================
// Identifiers and messages
// ============================================================================

/// Opaque message identifier assigned by the transport
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a transport-specific id representation
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// String form of the id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A message handed to a consumer
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Transport id, used for ack/nack
    pub id: MessageId,
    /// Topic the message arrived on
    pub topic: String,
    /// Raw payload
    pub payload: Bytes,
}

// ============================================================================
// Options
// ============================================================================

/// Authentication material for [`Connector::connect`]
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// Bearer token
    Token(String),
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::Token(_) => f.write_str("Token(<redacted>)"),
        }
    }
}

/// Client-level timeouts
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Timeout for broker operations (lookup, create, subscribe)
    pub operation_timeout: Duration,
    /// Timeout for establishing a connection
    pub connection_timeout: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            connection_timeout: Duration::from_secs(5),
        }
    }
}

/// Options for [`Transport::create_producer`]
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    /// Destination address
    pub topic: String,
    /// Optional producer name
    pub name: Option<String>,
    /// Upper bound on a single blocking send
    pub send_timeout: Duration,
}

impl ProducerOptions {
    /// Options for `topic` with defaults for everything else
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            name: None,
            send_timeout: Duration::from_millis(400),
        }
    }
}

/// Subscription delivery mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionKind {
    /// Messages are spread across all consumers of the subscription
    Shared,
    /// A single consumer receives everything
    Exclusive,
}

/// Where a new subscription starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitialPosition {
    /// Oldest retained message
    Earliest,
    /// Only messages published after subscribing
    Latest,
}

/// Options for [`Transport::subscribe`]
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Topics to subscribe to
    pub topics: Vec<String>,
    /// Subscription name
    pub subscription_name: String,
    /// Delivery mode
    pub kind: SubscriptionKind,
    /// Start position
    pub initial_position: InitialPosition,
    /// Delay before a nacked message is redelivered
    pub nack_redelivery_delay: Duration,
}

impl SubscribeOptions {
    /// Shared, from-earliest subscription to `topics`
    pub fn shared(topics: Vec<String>, subscription_name: impl Into<String>) -> Self {
        Self {
            topics,
            subscription_name: subscription_name.into(),
            kind: SubscriptionKind::Shared,
            initial_position: InitialPosition::Earliest,
            nack_redelivery_delay: Duration::from_millis(500),
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Transport errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Could not connect to the broker
    #[error("connection failed: {0}")]
    Connect(String),

    /// Subscription was rejected
    #[error("subscribe failed: {0}")]
    Subscribe(String),

    /// Producer could not be created
    #[error("producer creation failed for {topic}: {reason}")]
    ProducerCreate {
        /// Destination address
        topic: String,
        /// Transport message
        reason: String,
    },

    /// A send failed
    #[error("send failed: {0}")]
    Send(String),

    /// A send did not complete in time
    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    /// Ack or nack failed
    #[error("acknowledgment failed: {0}")]
    Ack(String),

    /// The resource was already closed
    #[error("{0} is closed")]
    Closed(&'static str),

    /// Address scheme is not handled by any transport
    #[error("unsupported broker address: {0}")]
    UnsupportedAddress(String),

    /// The broker lives inside this process, so a standalone producer or
    /// consumer would have nobody on the other side
    #[error("{address} is process-local and only usable by loopback runs, not {role}")]
    ProcessLocal {
        /// Broker address
        address: String,
        /// Role that asked for it
        role: String,
    },
}

/// Error returned by [`Consumer::receive`]
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// The delivery channel is closed; the worker should stop
    ///
    /// `pending` carries a message that was handed over but could not be
    /// processed; it must be negatively acknowledged.
    #[error("receive channel closed")]
    ChannelClosed {
        /// Message in flight when the channel closed
        pending: Option<ReceivedMessage>,
    },

    /// Any other receive failure; the worker keeps running
    #[error(transparent)]
    Transport(#[from] TransportError),
}

// ============================================================================
// Traits
// ============================================================================

/// Completion callback for [`Producer::send_async`]
///
/// Invoked exactly once per call.
pub type SendCallback = Box<dyn FnOnce(Result<MessageId, TransportError>) + Send + 'static>;

/// Factory for transports, selected by broker address
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the broker at `address`
    async fn connect(
        &self,
        address: &str,
        credentials: Option<Credentials>,
        options: ConnectOptions,
    ) -> Result<Arc<dyn Transport>, TransportError>;
}

/// A connected broker client
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name for logging (e.g. "memory")
    fn name(&self) -> &str;

    /// Create a producer bound to one destination
    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Arc<dyn Producer>, TransportError>;

    /// Subscribe to a set of destinations
    async fn subscribe(&self, options: SubscribeOptions)
        -> Result<Arc<dyn Consumer>, TransportError>;

    /// Close the client connection
    async fn close(&self);
}

/// Producer bound to one destination
#[async_trait]
pub trait Producer: Send + Sync {
    /// Destination address
    fn topic(&self) -> &str;

    /// Blocking send; returns once the broker acknowledged or failed
    async fn send(&self, payload: Bytes) -> Result<MessageId, TransportError>;

    /// Non-blocking send; `on_complete` runs exactly once with the outcome
    fn send_async(&self, payload: Bytes, on_complete: SendCallback);

    /// Close the producer
    async fn close(&self);
}

/// Consumer handle shared by all consumer workers
#[async_trait]
pub trait Consumer: Send + Sync {
    /// Wait for the next message
    ///
    /// Must be cancel-safe: dropping the future before it resolves must not
    /// lose a message.
    async fn receive(&self) -> Result<ReceivedMessage, ReceiveError>;

    /// Acknowledge a message
    async fn ack(&self, id: &MessageId) -> Result<(), TransportError>;

    /// Negatively acknowledge a message so it is redelivered
    async fn nack(&self, id: &MessageId) -> Result<(), TransportError>;

    /// Close the consumer
    async fn close(&self);
}
