//! Producer worker loop

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::SendMode;
use crate::envelope::Envelope;
use crate::error::{BenchError, BenchResult};
use crate::metrics::names;
use crate::shutdown::ShutdownListener;
use crate::transport::{Producer, TransportError};

use super::rate_limiter::{MessageRateLimiter, Permit};
use super::stats::WorkerStats;

/// A destination tag paired with the producer that publishes to it
#[derive(Clone)]
pub struct SendTarget {
    /// Namespace tag embedded in every envelope sent here
    pub tag: String,
    /// Producer bound to the destination address
    pub producer: Arc<dyn Producer>,
}

/// Outcome counters for fire-and-forget sends
///
/// Completion callbacks update the counters from whatever task the transport
/// runs them on, including after the worker loop has returned. The worker
/// folds the counts it sees at exit into its [`WorkerStats`] and records
/// that point with an exit mark; [`SendTally::late`] yields what completed
/// afterwards.
#[derive(Debug, Default)]
pub struct SendTally {
    submitted: AtomicUsize,
    confirmed: AtomicUsize,
    failed: AtomicUsize,
    confirmed_at_exit: AtomicUsize,
    failed_at_exit: AtomicUsize,
}

/// Point-in-time view of a [`SendTally`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TallySnapshot {
    /// Sends handed to `send_async`
    pub submitted: usize,
    /// Completions reporting success
    pub confirmed: usize,
    /// Completions reporting failure
    pub failed: usize,
}

impl TallySnapshot {
    /// Submitted sends with no completion yet
    pub fn unresolved(&self) -> usize {
        self.submitted
            .saturating_sub(self.confirmed)
            .saturating_sub(self.failed)
    }
}

impl SendTally {
    /// Empty tally
    pub fn new() -> Self {
        Self::default()
    }

    /// Current counts
    pub fn snapshot(&self) -> TallySnapshot {
        // Completions never outrun submissions, so read submissions last.
        let confirmed = self.confirmed.load(Ordering::Acquire);
        let failed = self.failed.load(Ordering::Acquire);
        TallySnapshot {
            submitted: self.submitted.load(Ordering::Acquire),
            confirmed,
            failed,
        }
    }

    /// Completions since the exit mark, plus what is still unresolved
    pub fn late(&self) -> (TallySnapshot, usize) {
        let now = self.snapshot();
        let late = TallySnapshot {
            submitted: 0,
            confirmed: now
                .confirmed
                .saturating_sub(self.confirmed_at_exit.load(Ordering::Acquire)),
            failed: now
                .failed
                .saturating_sub(self.failed_at_exit.load(Ordering::Acquire)),
        };
        (late, now.unresolved())
    }

    pub(crate) fn submit(&self) {
        self.submitted.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn complete(&self, ok: bool) {
        let counter = if ok { &self.confirmed } else { &self.failed };
        counter.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn mark_exit(&self) -> TallySnapshot {
        let at_exit = self.snapshot();
        self.confirmed_at_exit.store(at_exit.confirmed, Ordering::Release);
        self.failed_at_exit.store(at_exit.failed, Ordering::Release);
        at_exit
    }
}

impl std::fmt::Debug for SendTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SendTarget")
            .field("tag", &self.tag)
            .field("topic", &self.producer.topic())
            .finish()
    }
}

/// Producer worker: rate-limit, pick a destination, send, repeat
///
/// All producer workers share the same targets through `Arc`. The rate
/// limiter and the random generator are owned by the worker.
pub struct ProducerWorker {
    /// Worker id, embedded in every envelope as the thread id
    id: usize,

    /// Destinations to pick from, uniformly at random
    targets: Arc<[SendTarget]>,

    /// Payload text
    payload: Arc<str>,

    /// Sender hostname
    hostname: Arc<str>,

    /// Blocking or fire-and-forget
    send_mode: SendMode,

    /// Per-worker token bucket
    rate_limiter: MessageRateLimiter,

    /// Log every sent envelope
    log_detail: bool,

    /// Async send outcomes, shared with completion callbacks
    tally: Arc<SendTally>,
}

impl ProducerWorker {
    /// Create a new producer worker
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        targets: Arc<[SendTarget]>,
        payload: Arc<str>,
        hostname: Arc<str>,
        send_mode: SendMode,
        rate_limiter: MessageRateLimiter,
        log_detail: bool,
        tally: Arc<SendTally>,
    ) -> Self {
        Self {
            id,
            targets,
            payload,
            hostname,
            send_mode,
            rate_limiter,
            log_detail,
            tally,
        }
    }

    /// Worker id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the send loop until shutdown
    ///
    /// In-flight asynchronous sends are not awaited. An async send counts as
    /// sent only once its completion confirms it; sends still unresolved at
    /// exit are reported as `in_flight`. Later completions stay readable
    /// through the worker's [`SendTally`].
    pub async fn run(self, mut shutdown: ShutdownListener) -> BenchResult<WorkerStats> {
        if self.targets.is_empty() {
            return Err(BenchError::worker("producer worker has no destinations"));
        }

        let mut stats = WorkerStats::new();
        stats.start();
        let mut rng = StdRng::from_entropy();

        tracing::debug!(
            worker_id = self.id,
            mode = ?self.send_mode,
            rate = ?self.rate_limiter.rate(),
            "Producer worker started"
        );

        loop {
            if shutdown.is_shutdown() {
                break;
            }
            if self.rate_limiter.wait(&mut shutdown).await == Permit::Cancelled {
                break;
            }

            let target = &self.targets[rng.gen_range(0..self.targets.len())];
            let envelope = Envelope::new(
                self.id,
                target.tag.as_str(),
                &*self.payload,
                &*self.hostname,
            );
            let line = Bytes::from(envelope.encode());

            match self.send_mode {
                SendMode::Sync => match target.producer.send(line).await {
                    Ok(message_id) => {
                        stats.sent += 1;
                        metrics::counter!(names::MESSAGES_SENT, "tag" => target.tag.clone())
                            .increment(1);
                        if self.log_detail {
                            tracing::info!(
                                worker_id = self.id,
                                message_id = %message_id,
                                "{}",
                                envelope.redacted()
                            );
                        }
                    }
                    Err(e) => {
                        stats.send_failures += 1;
                        record_send_failure(self.id, &target.tag, &e);
                    }
                },
                SendMode::Async => {
                    self.tally.submit();
                    let callback = completion_callback(
                        self.id,
                        target.tag.clone(),
                        self.log_detail.then(|| envelope.redacted()),
                        Arc::clone(&self.tally),
                    );
                    target.producer.send_async(line, callback);
                }
            }

            // Unthrottled loops must still let the runtime schedule the
            // shutdown trigger and async completions.
            if !self.rate_limiter.is_enabled() {
                tokio::task::yield_now().await;
            }
        }

        let at_exit = self.tally.mark_exit();
        stats.sent += at_exit.confirmed;
        stats.send_failures += at_exit.failed;
        stats.in_flight = at_exit.unresolved();
        stats.stop();

        tracing::debug!(
            worker_id = self.id,
            sent = stats.sent,
            send_failures = stats.send_failures,
            in_flight = stats.in_flight,
            elapsed_ms = ?stats.elapsed().map(|d| d.as_millis()),
            "Producer worker finished"
        );

        Ok(stats)
    }
}

fn record_send_failure(worker_id: usize, tag: &str, error: &TransportError) {
    metrics::counter!(names::SEND_FAILURES, "tag" => tag.to_string()).increment(1);
    tracing::warn!(worker_id, tag, error = %error, "Send failed");
}

fn completion_callback(
    worker_id: usize,
    tag: String,
    detail: Option<String>,
    tally: Arc<SendTally>,
) -> crate::transport::SendCallback {
    Box::new(move |result| match result {
        Ok(message_id) => {
            tally.complete(true);
            metrics::counter!(names::MESSAGES_SENT, "tag" => tag).increment(1);
            if let Some(line) = detail {
                tracing::info!(worker_id, message_id = %message_id, "{}", line);
            }
        }
        Err(e) => {
            tally.complete(false);
            record_send_failure(worker_id, &tag, &e);
        }
    })
}
