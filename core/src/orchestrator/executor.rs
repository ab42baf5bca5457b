//! Orchestrator execution logic

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::task::JoinHandle;

use crate::config::{BenchConfig, Role};
use crate::destination::Destinations;
use crate::error::{BenchError, BenchResult};
use crate::metrics::LatencyStats;
use crate::shutdown::{listen_for_signals, Shutdown};
use crate::transport::{Consumer, Transport};
use crate::worker::{
    per_worker_rate, ConsumerWorkerBuilder, ProducerWorkerBuilder, SendTally, SendTarget,
    WorkerStats,
};

use super::aggregator::{
    aggregate_worker_stats, emit_reports, run_stats_ticker, settle_async_sends, RunReport,
};

type WorkerHandle = JoinHandle<BenchResult<WorkerStats>>;

/// Transport resources opened for one run
struct Resources {
    targets: Arc<[SendTarget]>,
    consumer: Option<Arc<dyn Consumer>>,
}

/// Orchestrator manages the run lifecycle
///
/// Opens producers and the subscription, spawns the worker pools and the
/// stats ticker, and on shutdown joins every worker before flushing stats
/// and closing transport resources.
pub struct Orchestrator {
    pub(crate) config: BenchConfig,
    pub(crate) role: Role,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) destinations: Arc<Destinations>,
    pub(crate) hostname: Arc<str>,
    pub(crate) rate: Option<f64>,
    pub(crate) stats_interval: Duration,
    pub(crate) grace_period: Duration,
    pub(crate) shutdown: Shutdown,
    pub(crate) latency: LatencyStats,
    pub(crate) started: AtomicBool,
}

impl Orchestrator {
    /// Shutdown flag for this run
    pub fn shutdown_handle(&self) -> Shutdown {
        self.shutdown.clone()
    }

    /// Trigger shutdown of all workers
    ///
    /// Returns `true` only for the first call.
    pub fn shutdown(&self) -> bool {
        self.shutdown.trigger()
    }

    /// Resolved destinations
    pub fn destinations(&self) -> &Destinations {
        &self.destinations
    }

    /// Shared latency buckets
    pub fn latency_stats(&self) -> &LatencyStats {
        &self.latency
    }

    /// Role being run
    pub fn role(&self) -> Role {
        self.role
    }

    /// Run until shutdown
    ///
    /// Setup failures (producer creation, subscribe) are returned before any
    /// worker starts. An orchestrator runs at most once.
    pub async fn run(&self) -> BenchResult<RunReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(BenchError::orchestration("orchestrator has already run"));
        }
        let start = Instant::now();

        tracing::info!(
            role = %self.role,
            transport = self.transport.name(),
            destinations = self.destinations.len(),
            producer_threads = self.role.produces().then_some(self.config.producer.threads),
            consumer_threads = self.role.consumes().then_some(self.config.consumer.threads),
            rate = ?self.rate,
            "Starting run"
        );

        let resources = self.open_resources().await?;

        let (producer_handles, tallies) = self.spawn_producers(&resources.targets)?;
        let consumer_handles = match &resources.consumer {
            Some(consumer) => self.spawn_consumers(consumer)?,
            None => Vec::new(),
        };
        if producer_handles.is_empty() && consumer_handles.is_empty() {
            tracing::warn!("No workers configured, waiting for shutdown");
            self.shutdown.subscribe().recv().await;
        }
        let collect_stats = self.role.consumes() && self.config.consumer.log_counter;
        let ticker = collect_stats.then(|| {
            tokio::spawn(run_stats_ticker(
                self.latency.clone(),
                self.stats_interval,
                self.shutdown.subscribe(),
            ))
        });

        // Workers return once they observe the flag (or their channel closed).
        let (producer_stats, producer_failures) = join_workers("producer", producer_handles).await;
        let (consumer_stats, consumer_failures) = join_workers("consumer", consumer_handles).await;
        tracing::info!("All workers stopped");

        // Workers may all have exited on their own; stop the ticker either way.
        self.shutdown.trigger();
        if let Some(ticker) = ticker {
            if let Err(e) = ticker.await {
                tracing::error!(error = %e, "Stats ticker panicked");
            }
        }
        let final_stats = if collect_stats {
            emit_reports(self.latency.drain())
        } else {
            Vec::new()
        };

        self.close_resources(resources).await;
        let elapsed = start.elapsed();

        if !self.grace_period.is_zero() {
            tracing::info!(
                grace_secs = self.grace_period.as_secs(),
                "Holding for metric scraping before exit"
            );
            tokio::time::sleep(self.grace_period).await;
        }

        // Async sends may have completed during the grace period.
        let mut producers = aggregate_worker_stats(&producer_stats);
        settle_async_sends(&mut producers, &tallies);

        let report = RunReport {
            role: self.role,
            producers,
            consumers: aggregate_worker_stats(&consumer_stats),
            failed_workers: producer_failures + consumer_failures,
            final_stats,
            elapsed,
        };
        tracing::info!(
            elapsed_secs = report.elapsed.as_secs_f64(),
            sent = report.producers.total_sent,
            send_failures = report.producers.total_send_failures,
            in_flight = report.producers.total_in_flight,
            received = report.consumers.total_received,
            decode_failures = report.consumers.total_decode_failures,
            "Run completed"
        );

        let expected = producer_stats.len() + consumer_stats.len() + report.failed_workers;
        if expected > 0 && report.failed_workers == expected {
            return Err(BenchError::orchestration(format!(
                "All {} workers failed to complete",
                report.failed_workers
            )));
        }

        Ok(report)
    }

    /// Run with SIGINT/SIGTERM handling
    ///
    /// The first signal triggers graceful shutdown; later ones are logged
    /// and ignored.
    pub async fn run_with_signal_handling(&self) -> BenchResult<RunReport> {
        let signal_handle = tokio::spawn(listen_for_signals(self.shutdown.clone()));

        let result = self.run().await;

        signal_handle.abort();

        result
    }

    /// Run for a fixed duration, then shut down
    pub async fn run_for(&self, duration: Duration) -> BenchResult<RunReport> {
        let shutdown = self.shutdown.clone();
        let timeout_handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if shutdown.trigger() {
                tracing::info!("Run duration reached, initiating shutdown...");
            }
        });

        let result = self.run().await;

        timeout_handle.abort();

        result
    }

    async fn open_resources(&self) -> BenchResult<Resources> {
        let mut targets = Vec::new();
        if self.role.produces() {
            for destination in self.destinations.iter() {
                let options = self.config.producer_options(&destination.address);
                match self.transport.create_producer(options).await {
                    Ok(producer) => targets.push(SendTarget {
                        tag: destination.tag.clone(),
                        producer,
                    }),
                    Err(e) => {
                        tracing::error!(topic = %destination.address, error = %e, "Failed to create producer");
                        close_targets(&targets).await;
                        return Err(e.into());
                    }
                }
            }
        }

        let consumer = if self.role.consumes() {
            let options = self.config.subscribe_options(&self.destinations);
            match self.transport.subscribe(options).await {
                Ok(consumer) => Some(consumer),
                Err(e) => {
                    tracing::error!(error = %e, "Failed to subscribe");
                    close_targets(&targets).await;
                    return Err(e.into());
                }
            }
        } else {
            None
        };

        Ok(Resources {
            targets: targets.into(),
            consumer,
        })
    }

    fn spawn_producers(
        &self,
        targets: &Arc<[SendTarget]>,
    ) -> BenchResult<(Vec<WorkerHandle>, Vec<Arc<SendTally>>)> {
        if !self.role.produces() {
            return Ok((Vec::new(), Vec::new()));
        }
        let cfg = &self.config.producer;
        let rate = per_worker_rate(self.rate, cfg.threads);
        let payload: Arc<str> = Arc::from(cfg.payload.as_str());

        let mut handles = Vec::with_capacity(cfg.threads);
        let mut tallies = Vec::with_capacity(cfg.threads);
        for worker_id in 0..cfg.threads {
            let tally = Arc::new(SendTally::new());
            tallies.push(Arc::clone(&tally));
            let worker = ProducerWorkerBuilder::new(worker_id)
                .targets(Arc::clone(targets))
                .payload(Arc::clone(&payload))
                .hostname(Arc::clone(&self.hostname))
                .send_mode(cfg.send_mode)
                .rate_limit(rate)
                .rate_burst(cfg.rate_burst)
                .log_detail(cfg.log_detail)
                .send_tally(tally)
                .build()?;
            let shutdown = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        Ok((handles, tallies))
    }

    fn spawn_consumers(&self, consumer: &Arc<dyn Consumer>) -> BenchResult<Vec<WorkerHandle>> {
        let cfg = &self.config.consumer;

        let mut handles = Vec::with_capacity(cfg.threads);
        for worker_id in 0..cfg.threads {
            let mut builder = ConsumerWorkerBuilder::new(worker_id)
                .consumer(Arc::clone(consumer))
                .destinations(Arc::clone(&self.destinations))
                .hostname(Arc::clone(&self.hostname))
                .log_detail(cfg.log_detail);
            if cfg.log_counter {
                builder = builder.latency_stats(self.latency.clone());
            }
            let worker = builder.build()?;
            let shutdown = self.shutdown.subscribe();

            handles.push(tokio::spawn(async move { worker.run(shutdown).await }));
        }
        Ok(handles)
    }

    async fn close_resources(&self, resources: Resources) {
        close_targets(&resources.targets).await;
        if let Some(consumer) = resources.consumer {
            consumer.close().await;
        }
        self.transport.close().await;
        tracing::debug!("Transport resources closed");
    }
}

async fn close_targets(targets: &[SendTarget]) {
    join_all(targets.iter().map(|t| t.producer.close())).await;
}

/// Join every handle; returns the stats of clean exits and the failure count
async fn join_workers(role: &str, handles: Vec<WorkerHandle>) -> (Vec<WorkerStats>, usize) {
    let mut results = Vec::with_capacity(handles.len());
    let mut failures = 0;

    for (idx, outcome) in join_all(handles).await.into_iter().enumerate() {
        match outcome {
            Ok(Ok(stats)) => {
                tracing::debug!(role, worker_id = idx, "Worker completed");
                results.push(stats);
            }
            Ok(Err(e)) => {
                failures += 1;
                tracing::error!(role, worker_id = idx, error = %e, "Worker returned error");
            }
            Err(e) => {
                failures += 1;
                tracing::error!(role, worker_id = idx, error = %e, "Worker task panicked");
            }
        }
    }

    (results, failures)
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("role", &self.role)
            .field("transport", &self.transport.name())
            .field("destinations", &self.destinations.len())
            .field("rate", &self.rate)
            .field("stats_interval", &self.stats_interval)
            .field("grace_period", &self.grace_period)
            .finish()
    }
}
