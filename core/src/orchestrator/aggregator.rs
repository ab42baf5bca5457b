//! Result aggregation: periodic latency stats and per-worker totals

use std::time::Duration;

use serde::Serialize;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::Role;
use crate::metrics::{LatencyStats, StatsError, TagReport};
use crate::shutdown::ShutdownListener;
use crate::worker::{SendTally, WorkerStats};

/// Interval between stats emissions
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(1);

/// Aggregated statistics from all workers of one role
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregatedStats {
    /// Number of workers that returned stats
    pub total_workers: usize,

    /// Total sends confirmed by the transport
    pub total_sent: usize,

    /// Total failed sends
    pub total_send_failures: usize,

    /// Async sends still without a completion
    pub total_in_flight: usize,

    /// Total messages received
    pub total_received: usize,

    /// Total messages acknowledged
    pub total_acked: usize,

    /// Total messages negatively acknowledged
    pub total_nacked: usize,

    /// Total envelopes that failed to decode
    pub total_decode_failures: usize,

    /// Total messages with no tag for their topic
    pub total_unattributed: usize,

    /// Maximum duration across all workers
    pub total_duration: Duration,

    /// Overall sends per second
    pub sends_per_second: f64,

    /// Overall receives per second
    pub receives_per_second: f64,
}

impl AggregatedStats {
    /// Share of send attempts confirmed so far (0.0 - 1.0)
    ///
    /// Sends still in flight count as not (yet) successful.
    pub fn send_success_rate(&self) -> f64 {
        let attempts = self.total_sent + self.total_send_failures + self.total_in_flight;
        if attempts > 0 {
            self.total_sent as f64 / attempts as f64
        } else {
            0.0
        }
    }
}

/// Aggregate statistics from multiple workers
pub fn aggregate_worker_stats(stats: &[WorkerStats]) -> AggregatedStats {
    if stats.is_empty() {
        return AggregatedStats::default();
    }

    let mut total = WorkerStats::new();
    for s in stats {
        total.merge(s);
    }

    // Use the maximum elapsed time across all workers
    let total_duration = stats
        .iter()
        .filter_map(|s| s.elapsed())
        .max()
        .unwrap_or(Duration::ZERO);

    let secs = total_duration.as_secs_f64();
    let rate_multiplier = if secs > 0.0 { 1.0 / secs } else { 0.0 };

    AggregatedStats {
        total_workers: stats.len(),
        total_sent: total.sent,
        total_send_failures: total.send_failures,
        total_in_flight: total.in_flight,
        total_received: total.received,
        total_acked: total.acked,
        total_nacked: total.nacked,
        total_decode_failures: total.decode_failures,
        total_unattributed: total.unattributed,
        total_duration,
        sends_per_second: total.sent as f64 * rate_multiplier,
        receives_per_second: total.received as f64 * rate_multiplier,
    }
}

/// Fold async completions that arrived after the producers stopped
///
/// `in_flight` is recomputed from the tallies, so sends of workers that
/// failed to return stats are included there too.
pub fn settle_async_sends(stats: &mut AggregatedStats, tallies: &[std::sync::Arc<SendTally>]) {
    let mut in_flight = 0;
    for tally in tallies {
        let (late, unresolved) = tally.late();
        stats.total_sent += late.confirmed;
        stats.total_send_failures += late.failed;
        in_flight += unresolved;
    }
    stats.total_in_flight = in_flight;
    let secs = stats.total_duration.as_secs_f64();
    if secs > 0.0 {
        stats.sends_per_second = stats.total_sent as f64 / secs;
    }
}

/// Outcome of one orchestrated run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// What was run
    pub role: Role,

    /// Producer worker totals
    pub producers: AggregatedStats,

    /// Consumer worker totals
    pub consumers: AggregatedStats,

    /// Workers that returned an error or panicked
    pub failed_workers: usize,

    /// Stats emitted by the final flush after all workers joined
    pub final_stats: Vec<TagReport>,

    /// Wall time from start to the end of cleanup (grace period excluded)
    pub elapsed: Duration,
}

/// Log and publish drained interval results
///
/// Failures are logged per tag; the tag was already reset by the drain.
pub fn emit_reports(results: Vec<Result<TagReport, StatsError>>) -> Vec<TagReport> {
    results
        .into_iter()
        .filter_map(|result| match result {
            Ok(report) => {
                report.publish();
                tracing::info!(
                    tag = %report.tag,
                    count = report.count,
                    p50_ms = report.p50_ms,
                    p99_ms = report.p99_ms,
                    "Interval stats"
                );
                Some(report)
            }
            Err(e) => {
                tracing::error!(tag = %e.tag, count = e.count, error = %e.source, "Stats computation failed");
                None
            }
        })
        .collect()
}

/// Drain `stats` every `interval` until shutdown
///
/// The first emission happens one interval after start. Returns the number
/// of drains performed.
pub async fn run_stats_ticker(
    stats: LatencyStats,
    interval: Duration,
    mut shutdown: ShutdownListener,
) -> usize {
    let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut drains = 0;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => break,

            _ = ticker.tick() => {
                emit_reports(stats.drain());
                drains += 1;
            }
        }
    }

    tracing::debug!(drains, "Stats ticker stopped");
    drains
}
