//! Consumer worker loop

use std::sync::Arc;
use std::time::Duration;

use crate::destination::Destinations;
use crate::envelope::{now_micros, InboundEnvelope};
use crate::error::BenchResult;
use crate::metrics::{names, LatencyStats};
use crate::shutdown::ShutdownListener;
use crate::transport::{Consumer, ReceiveError, ReceivedMessage};

use super::stats::WorkerStats;

/// Pause after a failed receive before asking the transport again
pub const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Consumer worker: receive, decode, record latency, ack, repeat
///
/// All consumer workers share one consumer handle (a shared subscription)
/// and one [`LatencyStats`].
pub struct ConsumerWorker {
    /// Worker id
    id: usize,

    /// Shared consumer
    consumer: Arc<dyn Consumer>,

    /// Resolved destinations, used to map a topic back to its tag
    destinations: Arc<Destinations>,

    /// Latency buckets; `None` disables collection
    latency: Option<LatencyStats>,

    /// Receiver hostname
    hostname: Arc<str>,

    /// Log every received envelope
    log_detail: bool,
}

impl ConsumerWorker {
    /// Create a new consumer worker
    pub fn new(
        id: usize,
        consumer: Arc<dyn Consumer>,
        destinations: Arc<Destinations>,
        latency: Option<LatencyStats>,
        hostname: Arc<str>,
        log_detail: bool,
    ) -> Self {
        Self {
            id,
            consumer,
            destinations,
            latency,
            hostname,
            log_detail,
        }
    }

    /// Worker id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the receive loop until shutdown or until the channel closes
    pub async fn run(self, mut shutdown: ShutdownListener) -> BenchResult<WorkerStats> {
        let mut stats = WorkerStats::new();
        stats.start();

        tracing::debug!(worker_id = self.id, "Consumer worker started");

        loop {
            let received = tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    tracing::debug!(worker_id = self.id, "Consumer worker received shutdown signal");
                    break;
                }

                result = self.consumer.receive() => result,
            };

            match received {
                Ok(message) => self.process(message, &mut stats).await,
                Err(ReceiveError::ChannelClosed { pending }) => {
                    if let Some(message) = pending {
                        match self.consumer.nack(&message.id).await {
                            Ok(()) => stats.nacked += 1,
                            Err(e) => tracing::warn!(
                                worker_id = self.id,
                                message_id = %message.id,
                                error = %e,
                                "Nack failed"
                            ),
                        }
                    }
                    tracing::error!(worker_id = self.id, "Receive channel closed, consumer worker stopping");
                    break;
                }
                Err(ReceiveError::Transport(e)) => {
                    tracing::error!(worker_id = self.id, error = %e, "Receive failed");
                    tokio::select! {
                        biased;

                        _ = shutdown.recv() => break,

                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        stats.stop();
        tracing::debug!(
            worker_id = self.id,
            received = stats.received,
            decode_failures = stats.decode_failures,
            elapsed_ms = ?stats.elapsed().map(|d| d.as_millis()),
            "Consumer worker finished"
        );

        Ok(stats)
    }

    /// Handle one delivered message; it is always acknowledged
    async fn process(&self, message: ReceivedMessage, stats: &mut WorkerStats) {
        let receive_time = now_micros();
        stats.received += 1;

        match self.destinations.tag_for_topic(&message.topic) {
            Some(tag) => {
                metrics::counter!(names::MESSAGES_RECEIVED, "tag" => tag.to_string()).increment(1);
                let line = String::from_utf8_lossy(&message.payload);
                match InboundEnvelope::decode(
                    &line,
                    message.id.clone(),
                    receive_time,
                    &*self.hostname,
                    tag,
                ) {
                    Ok(inbound) => {
                        if let Some(latency) = &self.latency {
                            latency.record(tag, inbound.latency_ms());
                        }
                        if self.log_detail {
                            tracing::info!(worker_id = self.id, "{}", inbound.log_line(self.id));
                        }
                    }
                    Err(e) => {
                        stats.decode_failures += 1;
                        metrics::counter!(names::DECODE_FAILURES).increment(1);
                        tracing::warn!(
                            worker_id = self.id,
                            message_id = %message.id,
                            tag,
                            error = %e,
                            "Envelope decode failed, message excluded from stats"
                        );
                    }
                }
            }
            None => {
                stats.unattributed += 1;
                tracing::warn!(
                    worker_id = self.id,
                    message_id = %message.id,
                    topic = %message.topic,
                    "Topic does not map to a configured namespace, message excluded from stats"
                );
            }
        }

        match self.consumer.ack(&message.id).await {
            Ok(()) => stats.acked += 1,
            Err(e) => tracing::warn!(
                worker_id = self.id,
                message_id = %message.id,
                error = %e,
                "Ack failed"
            ),
        }
    }
}
