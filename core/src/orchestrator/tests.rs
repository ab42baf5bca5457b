//! Integration tests for the Orchestrator module

use super::*;
use crate::config::{BenchConfig, Role};
use crate::envelope::Envelope;
use crate::error::BenchError;
use crate::transport::{
    Consumer, MessageId, Producer, ProducerOptions, ReceiveError, ReceivedMessage, SendCallback,
    SubscribeOptions, Transport, TransportError,
};
use crate::worker::WorkerStats;

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Mock Transport
// ============================================================================

/// Shared observations across the mock transport, producers and consumer
#[derive(Default)]
struct Counters {
    producers_created: AtomicUsize,
    producers_closed: AtomicUsize,
    sends: AtomicUsize,
    sends_after_close: AtomicUsize,
    active_receives: AtomicUsize,
    receives_active_at_close: AtomicUsize,
    consumer_closed: AtomicBool,
    transport_closed: AtomicBool,
}

struct MockTransport {
    counters: Arc<Counters>,
    fail_producer_at: Option<usize>,
    fail_subscribe: bool,
}

impl MockTransport {
    fn new() -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            fail_producer_at: None,
            fail_subscribe: false,
        }
    }

    fn with_failing_producer(mut self, index: usize) -> Self {
        self.fail_producer_at = Some(index);
        self
    }

    fn with_failing_subscribe(mut self) -> Self {
        self.fail_subscribe = true;
        self
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_producer(
        &self,
        options: ProducerOptions,
    ) -> Result<Arc<dyn Producer>, TransportError> {
        let index = self.counters.producers_created.fetch_add(1, Ordering::SeqCst);
        if self.fail_producer_at == Some(index) {
            return Err(TransportError::ProducerCreate {
                topic: options.topic,
                reason: "Simulated failure".to_string(),
            });
        }
        Ok(Arc::new(MockProducer {
            topic: options.topic,
            closed: AtomicBool::new(false),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn subscribe(
        &self,
        options: SubscribeOptions,
    ) -> Result<Arc<dyn Consumer>, TransportError> {
        if self.fail_subscribe {
            return Err(TransportError::Subscribe("Simulated failure".to_string()));
        }
        Ok(Arc::new(MockConsumer {
            topic: options.topics[0].clone(),
            counter: AtomicUsize::new(0),
            counters: Arc::clone(&self.counters),
        }))
    }

    async fn close(&self) {
        self.counters.transport_closed.store(true, Ordering::SeqCst);
    }
}

struct MockProducer {
    topic: String,
    closed: AtomicBool,
    counters: Arc<Counters>,
}

impl MockProducer {
    fn attempt(&self) -> Result<MessageId, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            self.counters.sends_after_close.fetch_add(1, Ordering::SeqCst);
            return Err(TransportError::Closed("producer"));
        }
        let n = self.counters.sends.fetch_add(1, Ordering::SeqCst);
        Ok(MessageId::new(n.to_string()))
    }
}

#[async_trait]
impl Producer for MockProducer {
    fn topic(&self) -> &str {
        &self.topic
    }

    async fn send(&self, _payload: Bytes) -> Result<MessageId, TransportError> {
        tokio::time::sleep(Duration::from_millis(1)).await;
        self.attempt()
    }

    fn send_async(&self, _payload: Bytes, on_complete: SendCallback) {
        on_complete(self.attempt());
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.counters.producers_closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Delivers a fresh well-formed envelope on the first topic every millisecond
struct MockConsumer {
    topic: String,
    counter: AtomicUsize,
    counters: Arc<Counters>,
}

struct ActiveReceive<'a>(&'a Counters);

impl<'a> ActiveReceive<'a> {
    fn enter(counters: &'a Counters) -> Self {
        counters.active_receives.fetch_add(1, Ordering::SeqCst);
        Self(counters)
    }
}

impl Drop for ActiveReceive<'_> {
    fn drop(&mut self) {
        self.0.active_receives.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Consumer for MockConsumer {
    async fn receive(&self) -> Result<ReceivedMessage, ReceiveError> {
        let _active = ActiveReceive::enter(&self.counters);
        tokio::time::sleep(Duration::from_millis(1)).await;
        if self.counters.consumer_closed.load(Ordering::SeqCst) {
            return Err(ReceiveError::ChannelClosed { pending: None });
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        Ok(ReceivedMessage {
            id: MessageId::new(n.to_string()),
            topic: self.topic.clone(),
            payload: Bytes::from(Envelope::new(0, "ns1", "x", "mock-host").encode()),
        })
    }

    async fn ack(&self, _id: &MessageId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn nack(&self, _id: &MessageId) -> Result<(), TransportError> {
        Ok(())
    }

    async fn close(&self) {
        self.counters.receives_active_at_close.store(
            self.counters.active_receives.load(Ordering::SeqCst),
            Ordering::SeqCst,
        );
        self.counters.consumer_closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn config(producers: usize, consumers: usize) -> BenchConfig {
    let mut config = BenchConfig::from_yaml(
        r#"
broker:
  tenant: bench
  namespace: ns1,ns2
  topic: latency
producer:
  payload: hello
  send_mode: sync
shutdown:
  grace_period_secs: 0
"#,
    )
    .unwrap();
    config.producer.threads = producers;
    config.consumer.threads = consumers;
    config
}

fn orchestrator(transport: MockTransport, role: Role, config: BenchConfig) -> Orchestrator {
    OrchestratorBuilder::new()
        .config(config)
        .role(role)
        .transport(Arc::new(transport))
        .hostname("test-host")
        .stats_interval(Duration::from_millis(50))
        .build()
        .expect("Failed to build orchestrator")
}

// ============================================================================
// Unit Tests
// ============================================================================

#[test]
fn test_aggregated_stats_default() {
    let stats = AggregatedStats::default();
    assert_eq!(stats.total_workers, 0);
    assert_eq!(stats.total_sent, 0);
    assert_eq!(stats.send_success_rate(), 0.0);
}

#[test]
fn test_aggregated_stats_success_rate() {
    let stats = AggregatedStats {
        total_sent: 90,
        total_send_failures: 10,
        ..Default::default()
    };
    assert!((stats.send_success_rate() - 0.9).abs() < 0.001);
}

#[test]
fn test_aggregate_worker_stats_empty() {
    let stats = aggregate_worker_stats(&[]);
    assert_eq!(stats.total_workers, 0);
    assert_eq!(stats.total_received, 0);
}

#[test]
fn test_aggregate_worker_stats() {
    let mut s1 = WorkerStats::new();
    s1.received = 50;
    s1.acked = 50;
    s1.decode_failures = 2;
    s1.start();
    std::thread::sleep(Duration::from_millis(10));
    s1.stop();

    let mut s2 = WorkerStats::new();
    s2.received = 30;
    s2.acked = 29;
    s2.nacked = 1;
    s2.start();
    std::thread::sleep(Duration::from_millis(10));
    s2.stop();

    let aggregated = aggregate_worker_stats(&[s1, s2]);

    assert_eq!(aggregated.total_workers, 2);
    assert_eq!(aggregated.total_received, 80);
    assert_eq!(aggregated.total_acked, 79);
    assert_eq!(aggregated.total_nacked, 1);
    assert_eq!(aggregated.total_decode_failures, 2);
    assert!(aggregated.total_duration >= Duration::from_millis(10));
    assert!(aggregated.receives_per_second > 0.0);
}

#[test]
fn test_builder_missing_transport() {
    let result = OrchestratorBuilder::new()
        .config(config(1, 1))
        .role(Role::Produce)
        .build();

    assert!(matches!(result, Err(BenchError::MissingConfig("transport"))));
}

#[test]
fn test_builder_missing_role() {
    let result = OrchestratorBuilder::new()
        .config(config(1, 1))
        .transport(Arc::new(MockTransport::new()))
        .build();

    assert!(matches!(result, Err(BenchError::MissingConfig("role"))));
}

#[test]
fn test_builder_invalid_config() {
    let mut config = config(1, 1);
    config.producer.rate_burst = 0;
    let result = OrchestratorBuilder::new()
        .config(config)
        .role(Role::Loopback)
        .transport(Arc::new(MockTransport::new()))
        .build();

    assert!(matches!(result, Err(BenchError::Config(_))));
}

#[test]
fn test_builder_invalid_rate() {
    let result = OrchestratorBuilder::new()
        .config(config(1, 1))
        .role(Role::Produce)
        .transport(Arc::new(MockTransport::new()))
        .rate(Some(-1.0))
        .build();

    assert!(result.is_err());
}

#[test]
fn test_orchestrator_debug_format() {
    let orchestrator = orchestrator(MockTransport::new(), Role::Produce, config(1, 1));

    let debug = format!("{:?}", orchestrator);
    assert!(debug.contains("Orchestrator"));
    assert!(debug.contains("mock"));
    assert_eq!(orchestrator.destinations().len(), 2);
}

// ============================================================================
// Integration Tests
// ============================================================================

#[tokio::test]
async fn test_orchestrator_loopback_run() {
    let transport = MockTransport::new();
    let counters = Arc::clone(&transport.counters);
    let orchestrator = orchestrator(transport, Role::Loopback, config(2, 2));

    let report = orchestrator
        .run_for(Duration::from_millis(200))
        .await
        .expect("Run failed");

    assert_eq!(report.role, Role::Loopback);
    assert_eq!(report.producers.total_workers, 2);
    assert_eq!(report.consumers.total_workers, 2);
    assert_eq!(report.failed_workers, 0);
    assert!(report.producers.total_sent > 0);
    assert!(report.consumers.total_received > 0);
    assert_eq!(report.consumers.total_acked, report.consumers.total_received);

    assert_eq!(counters.producers_closed.load(Ordering::SeqCst), 2);
    assert!(counters.consumer_closed.load(Ordering::SeqCst));
    assert!(counters.transport_closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_orchestrator_shutdown_joins_all_workers_before_close() {
    let transport = MockTransport::new();
    let counters = Arc::clone(&transport.counters);
    let orchestrator = Arc::new(orchestrator(transport, Role::Loopback, config(10, 10)));

    let runner = Arc::clone(&orchestrator);
    let run_handle = tokio::spawn(async move { runner.run().await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(orchestrator.shutdown());
    assert!(!orchestrator.shutdown());

    let report = run_handle
        .await
        .expect("Run task panicked")
        .expect("Run failed");

    assert_eq!(report.producers.total_workers, 10);
    assert_eq!(report.consumers.total_workers, 10);
    assert_eq!(counters.receives_active_at_close.load(Ordering::SeqCst), 0);
    assert_eq!(counters.sends_after_close.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_zero_workers_wait_for_shutdown() {
    let transport = MockTransport::new();
    let counters = Arc::clone(&transport.counters);
    let orchestrator = orchestrator(transport, Role::Loopback, config(0, 0));

    let start = std::time::Instant::now();
    let report = orchestrator
        .run_for(Duration::from_millis(100))
        .await
        .expect("Run failed");

    assert!(start.elapsed() >= Duration::from_millis(100));
    assert_eq!(report.producers.total_workers, 0);
    assert_eq!(report.consumers.total_workers, 0);
    assert_eq!(report.failed_workers, 0);
    assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
    assert!(counters.transport_closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_zero_producers_still_consume() {
    let orchestrator = orchestrator(MockTransport::new(), Role::Loopback, config(0, 2));

    let report = orchestrator
        .run_for(Duration::from_millis(100))
        .await
        .expect("Run failed");

    assert_eq!(report.producers.total_workers, 0);
    assert_eq!(report.consumers.total_workers, 2);
}

#[tokio::test]
async fn test_orchestrator_runs_once() {
    let orchestrator = orchestrator(MockTransport::new(), Role::Consume, config(1, 1));

    orchestrator.shutdown();
    orchestrator.shutdown();
    let report = orchestrator.run().await.expect("Run failed");
    assert_eq!(report.consumers.total_workers, 1);

    let second = orchestrator.run().await;
    assert!(matches!(second, Err(BenchError::Orchestration(_))));
}

#[tokio::test]
async fn test_final_flush_covers_every_received_message() {
    let transport = MockTransport::new();
    let orchestrator = OrchestratorBuilder::new()
        .config(config(1, 3))
        .role(Role::Consume)
        .transport(Arc::new(transport))
        .stats_interval(Duration::from_secs(60))
        .build()
        .unwrap();

    let report = orchestrator
        .run_for(Duration::from_millis(150))
        .await
        .expect("Run failed");

    let flushed: u64 = report.final_stats.iter().map(|r| r.count).sum();
    assert!(flushed > 0);
    assert_eq!(flushed as usize, report.consumers.total_received);
    assert_eq!(report.final_stats[0].tag, "ns1");
    assert!(report.final_stats[0].p50_ms <= report.final_stats[0].p99_ms);
    assert_eq!(orchestrator.latency_stats().total_count(), 0);
}

#[tokio::test]
async fn test_log_counter_disabled_skips_stats() {
    let mut cfg = config(1, 2);
    cfg.consumer.log_counter = false;
    let orchestrator = orchestrator(MockTransport::new(), Role::Consume, cfg);

    let report = orchestrator
        .run_for(Duration::from_millis(100))
        .await
        .expect("Run failed");

    assert!(report.consumers.total_received > 0);
    assert!(report.final_stats.is_empty());
    assert_eq!(orchestrator.latency_stats().total_count(), 0);
}

#[tokio::test]
async fn test_producer_setup_failure_is_fatal() {
    let transport = MockTransport::new().with_failing_producer(1);
    let counters = Arc::clone(&transport.counters);
    let orchestrator = orchestrator(transport, Role::Produce, config(4, 1));

    let result = orchestrator.run().await;

    assert!(matches!(result, Err(BenchError::Transport(_))));
    assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
    assert_eq!(counters.producers_closed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_subscribe_failure_is_fatal() {
    let transport = MockTransport::new().with_failing_subscribe();
    let counters = Arc::clone(&transport.counters);
    let orchestrator = orchestrator(transport, Role::Loopback, config(1, 1));

    let result = orchestrator.run().await;

    assert!(matches!(result, Err(BenchError::Transport(_))));
    assert_eq!(counters.sends.load(Ordering::SeqCst), 0);
    assert_eq!(counters.producers_closed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_is_split_across_workers() {
    let transport = MockTransport::new();
    let counters = Arc::clone(&transport.counters);
    let orchestrator = OrchestratorBuilder::new()
        .config(config(4, 1))
        .role(Role::Produce)
        .transport(Arc::new(transport))
        .rate(Some(100.0))
        .build()
        .unwrap();

    let report = orchestrator
        .run_for(Duration::from_secs(1))
        .await
        .expect("Run failed");

    // 4 workers at 25/s each, plus one immediate token per worker.
    let sent = counters.sends.load(Ordering::SeqCst);
    assert!((80..=130).contains(&sent), "sent {}", sent);
    assert_eq!(report.producers.total_sent, sent);
}
