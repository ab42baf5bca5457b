//! Builder pattern for worker construction

use std::sync::Arc;

use crate::config::SendMode;
use crate::destination::Destinations;
use crate::error::{BenchError, BenchResult};
use crate::metrics::LatencyStats;
use crate::transport::Consumer;

use super::consumer::ConsumerWorker;
use super::producer::{ProducerWorker, SendTally, SendTarget};
use super::rate_limiter::MessageRateLimiter;

/// Builder for [`ProducerWorker`]
///
/// # Example
/// ```ignore
/// let worker = ProducerWorkerBuilder::new(0)
///     .targets(targets)
///     .payload("hello")
///     .hostname("bench-01")
///     .send_mode(SendMode::Async)
///     .rate_limit(Some(25.0))
///     .build()?;
/// ```
pub struct ProducerWorkerBuilder {
    id: usize,
    targets: Option<Arc<[SendTarget]>>,
    payload: Arc<str>,
    hostname: Arc<str>,
    send_mode: SendMode,
    rate_limit: Option<f64>,
    rate_burst: u32,
    log_detail: bool,
    tally: Option<Arc<SendTally>>,
}

impl ProducerWorkerBuilder {
    /// Create a new builder with the given worker ID
    pub fn new(id: usize) -> Self {
        Self {
            id,
            targets: None,
            payload: Arc::from(""),
            hostname: Arc::from(""),
            send_mode: SendMode::default(),
            rate_limit: None,
            rate_burst: 1,
            log_detail: false,
            tally: None,
        }
    }

    /// Set the destinations to publish to
    pub fn targets(mut self, targets: Arc<[SendTarget]>) -> Self {
        self.targets = Some(targets);
        self
    }

    /// Set the payload text
    pub fn payload(mut self, payload: impl Into<Arc<str>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the sender hostname
    pub fn hostname(mut self, hostname: impl Into<Arc<str>>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the send mode
    pub fn send_mode(mut self, mode: SendMode) -> Self {
        self.send_mode = mode;
        self
    }

    /// Set this worker's rate (messages per second); `None` is unlimited
    pub fn rate_limit(mut self, rps: Option<f64>) -> Self {
        self.rate_limit = rps;
        self
    }

    /// Set the token bucket capacity
    pub fn rate_burst(mut self, burst: u32) -> Self {
        self.rate_burst = burst;
        self
    }

    /// Log every sent envelope
    pub fn log_detail(mut self, enabled: bool) -> Self {
        self.log_detail = enabled;
        self
    }

    /// Share async send outcomes with the caller; a private tally is used
    /// otherwise
    pub fn send_tally(mut self, tally: Arc<SendTally>) -> Self {
        self.tally = Some(tally);
        self
    }

    /// Build the worker
    ///
    /// # Errors
    /// Returns an error if no targets were given.
    pub fn build(self) -> BenchResult<ProducerWorker> {
        let targets = self.targets.ok_or(BenchError::missing_config("targets"))?;
        if targets.is_empty() {
            return Err(BenchError::config("producer worker needs at least one target"));
        }

        Ok(ProducerWorker::new(
            self.id,
            targets,
            self.payload,
            self.hostname,
            self.send_mode,
            MessageRateLimiter::new(self.rate_limit, self.rate_burst),
            self.log_detail,
            self.tally.unwrap_or_default(),
        ))
    }
}

/// Builder for [`ConsumerWorker`]
pub struct ConsumerWorkerBuilder {
    id: usize,
    consumer: Option<Arc<dyn Consumer>>,
    destinations: Option<Arc<Destinations>>,
    latency: Option<LatencyStats>,
    hostname: Arc<str>,
    log_detail: bool,
}

impl ConsumerWorkerBuilder {
    /// Create a new builder with the given worker ID
    pub fn new(id: usize) -> Self {
        Self {
            id,
            consumer: None,
            destinations: None,
            latency: None,
            hostname: Arc::from(""),
            log_detail: false,
        }
    }

    /// Set the shared consumer
    pub fn consumer(mut self, consumer: Arc<dyn Consumer>) -> Self {
        self.consumer = Some(consumer);
        self
    }

    /// Set the resolved destinations
    pub fn destinations(mut self, destinations: Arc<Destinations>) -> Self {
        self.destinations = Some(destinations);
        self
    }

    /// Set the shared latency buckets; leave unset to disable collection
    pub fn latency_stats(mut self, stats: LatencyStats) -> Self {
        self.latency = Some(stats);
        self
    }

    /// Set the receiver hostname
    pub fn hostname(mut self, hostname: impl Into<Arc<str>>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Log every received envelope
    pub fn log_detail(mut self, enabled: bool) -> Self {
        self.log_detail = enabled;
        self
    }

    /// Build the worker
    ///
    /// # Errors
    /// Returns an error if the consumer or the destinations are missing.
    pub fn build(self) -> BenchResult<ConsumerWorker> {
        let consumer = self.consumer.ok_or(BenchError::missing_config("consumer"))?;
        let destinations = self
            .destinations
            .ok_or(BenchError::missing_config("destinations"))?;

        Ok(ConsumerWorker::new(
            self.id,
            consumer,
            destinations,
            self.latency,
            self.hostname,
            self.log_detail,
        ))
    }
}
