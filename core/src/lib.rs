//! pubsub-bench-core: load generation and latency measurement for pub/sub brokers
//!
//! This crate provides everything a benchmark run needs except the broker
//! client itself:
//!
//! - Destination resolution and the message envelope codec
//! - Rate-limited producer and consumer workers
//! - Per-tag latency aggregation with p50/p99 reporting
//! - The orchestrator and its graceful-shutdown protocol
//! - The transport traits a broker client implements
//! - Configuration and error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod destination;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod shutdown;
pub mod transport;
pub mod worker;

pub use config::{BenchConfig, ConfigError, Role, SendMode};
pub use destination::{resolve, Destination, DestinationError, Destinations, TopicTemplate};
pub use envelope::{DecodeError, Envelope, InboundEnvelope};
pub use error::*;
pub use metrics::{percentile, LatencyStats, PerTagStats, PercentileError, StatsError, TagReport};
pub use orchestrator::{AggregatedStats, Orchestrator, OrchestratorBuilder, RunReport};
pub use shutdown::{Shutdown, ShutdownListener};
pub use transport::{
    ConnectOptions, Connector, Consumer, Credentials, MessageId, Producer, ProducerOptions,
    ReceiveError, ReceivedMessage, SubscribeOptions, Transport, TransportError,
};
pub use worker::{ConsumerWorker, MessageRateLimiter, ProducerWorker, WorkerStats};

#[cfg(test)]
mod integration_tests {
    use super::*;
    use chrono::Utc;

    // =========================================================================
    // Resolver and codec working together
    // =========================================================================

    #[test]
    fn test_resolved_tags_survive_the_wire() {
        let destinations = resolve("acme", "orders,billing", "events", &TopicTemplate::default())
            .expect("resolve failed");

        for destination in &destinations {
            let line = Envelope::new(1, destination.tag.as_str(), "p", "host-a").encode();
            let tag = destinations
                .tag_for_topic(&destination.address)
                .expect("address maps back to a tag");

            let inbound =
                InboundEnvelope::decode(&line, MessageId::new("1"), Utc::now(), "host-b", tag)
                    .expect("decode failed");
            assert_eq!(inbound.envelope.tag, destination.tag);
        }
    }

    #[test]
    fn test_recorded_latency_drains_once() {
        let destinations =
            resolve("acme", "orders", "events", &TopicTemplate::default()).unwrap();
        let stats = LatencyStats::with_tags(destinations.tags());

        let envelope = Envelope::new(0, "orders", "p", "host-a");
        let inbound = InboundEnvelope::decode(
            &envelope.encode(),
            MessageId::new("1"),
            envelope.send_time + chrono::Duration::milliseconds(12),
            "host-b",
            "orders",
        )
        .unwrap();
        stats.record("orders", inbound.latency_ms());

        let reports = stats.drain();
        assert_eq!(reports.len(), 1);
        let report = reports[0].as_ref().unwrap();
        assert_eq!(report.count, 1);
        assert!((report.p50_ms - 12.0).abs() < 1e-9);
        assert!(stats.drain().is_empty());
    }

    // =========================================================================
    // Serialization formats
    // =========================================================================

    #[test]
    fn test_destination_json_format() {
        let destinations = resolve("t", "a", "x", &TopicTemplate::default()).unwrap();
        let json = serde_json::to_string(destinations.as_slice()).unwrap();
        assert_eq!(json, r#"[{"tag":"a","address":"persistent://t/t_a/x"}]"#);
    }

    #[test]
    fn test_role_lowercase_serialization() {
        assert_eq!(serde_json::to_string(&Role::Produce).unwrap(), "\"produce\"");
        assert_eq!(serde_json::to_string(&Role::Loopback).unwrap(), "\"loopback\"");
    }

    #[test]
    fn test_send_mode_serialization() {
        assert_eq!(serde_json::to_string(&SendMode::Sync).unwrap(), "\"sync\"");
        assert_eq!(serde_json::to_string(&SendMode::Async).unwrap(), "\"async\"");
    }
}
