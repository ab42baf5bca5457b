//! Latency aggregation and percentile calculation
//!
//! Consumer workers append one latency sample per received message to a
//! per-tag bucket; the stats ticker drains every non-empty bucket once per
//! interval. Both sides go through the same mutex, so a drain never loses
//! or double-counts a concurrent append.
//!
//! Counters and gauges are recorded through the `metrics` facade; exporting
//! them is left to whatever recorder the embedding process installs.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Metric names recorded by the workers and the stats ticker
pub mod names {
    /// Sends the transport confirmed (counter, label `tag`)
    pub const MESSAGES_SENT: &str = "pubsub_bench_messages_sent_total";
    /// Failed sends (counter, label `tag`)
    pub const SEND_FAILURES: &str = "pubsub_bench_send_failures_total";
    /// Messages received (counter, label `tag`)
    pub const MESSAGES_RECEIVED: &str = "pubsub_bench_messages_received_total";
    /// Envelopes that could not be decoded (counter)
    pub const DECODE_FAILURES: &str = "pubsub_bench_decode_failures_total";
    /// p50 latency of the last interval in ms (gauge, label `tag`)
    pub const LATENCY_P50_MS: &str = "pubsub_bench_latency_p50_ms";
    /// p99 latency of the last interval in ms (gauge, label `tag`)
    pub const LATENCY_P99_MS: &str = "pubsub_bench_latency_p99_ms";
    /// Messages counted in the last interval (gauge, label `tag`)
    pub const INTERVAL_MESSAGES: &str = "pubsub_bench_interval_messages";
}

/// Percentile calculation errors
#[derive(Debug, Error, Clone, Copy, PartialEq)]
pub enum PercentileError {
    /// No samples
    #[error("no samples to compute a percentile from")]
    Empty,

    /// Requested percentile is outside [0, 100]
    #[error("percentile {0} is outside [0, 100]")]
    OutOfRange(f64),

    /// A sample is NaN
    #[error("sample set contains NaN")]
    NaN,
}

/// Percentile of `samples` using linear interpolation between closest ranks
///
/// `p` is in percent. The rank is `p / 100 * (n - 1)`; the result always
/// lies within `[min(samples), max(samples)]`.
pub fn percentile(samples: &[f64], p: f64) -> Result<f64, PercentileError> {
    let sorted = sorted_samples(samples)?;
    percentile_of_sorted(&sorted, p)
}

fn sorted_samples(samples: &[f64]) -> Result<Vec<f64>, PercentileError> {
    if samples.is_empty() {
        return Err(PercentileError::Empty);
    }
    if samples.iter().any(|v| v.is_nan()) {
        return Err(PercentileError::NaN);
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(f64::total_cmp);
    Ok(sorted)
}

fn percentile_of_sorted(sorted: &[f64], p: f64) -> Result<f64, PercentileError> {
    if !(0.0..=100.0).contains(&p) {
        return Err(PercentileError::OutOfRange(p));
    }
    if sorted.len() == 1 {
        return Ok(sorted[0]);
    }

    let idx = p / 100.0 * (sorted.len() - 1) as f64;
    let lower = idx.floor() as usize;
    let upper = idx.ceil() as usize;
    let frac = idx - lower as f64;

    Ok(sorted[lower] * (1.0 - frac) + sorted[upper] * frac)
}

/// Counters for one tag within the current interval
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerTagStats {
    /// Messages counted this interval
    pub count: u64,
    /// Latency samples this interval, in milliseconds, in append order
    pub latency_samples: Vec<f64>,
}

impl PerTagStats {
    /// Summarize into a report (p50/p99)
    pub fn summarize(&self, tag: &str) -> Result<TagReport, StatsError> {
        let wrap = |source| StatsError {
            tag: tag.to_string(),
            count: self.count,
            source,
        };
        let sorted = sorted_samples(&self.latency_samples).map_err(wrap)?;
        let p50 = percentile_of_sorted(&sorted, 50.0).map_err(wrap)?;
        let p99 = percentile_of_sorted(&sorted, 99.0).map_err(wrap)?;

        Ok(TagReport {
            tag: tag.to_string(),
            count: self.count,
            p50_ms: p50,
            p99_ms: p99,
        })
    }
}

/// One tag's interval summary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagReport {
    /// Namespace tag
    pub tag: String,
    /// Messages in the interval
    pub count: u64,
    /// Median latency (ms)
    pub p50_ms: f64,
    /// 99th percentile latency (ms)
    pub p99_ms: f64,
}

impl TagReport {
    /// Push this report to the latency gauges
    pub fn publish(&self) {
        let tag = self.tag.clone();
        metrics::gauge!(names::LATENCY_P50_MS, "tag" => tag.clone()).set(self.p50_ms);
        metrics::gauge!(names::LATENCY_P99_MS, "tag" => tag.clone()).set(self.p99_ms);
        metrics::gauge!(names::INTERVAL_MESSAGES, "tag" => tag).set(self.count as f64);
    }
}

/// Percentile failure for one tag; the tag was still reset
#[derive(Debug, Error, Clone, PartialEq)]
#[error("cannot compute percentiles for tag '{tag}' ({count} messages): {source}")]
pub struct StatsError {
    /// Namespace tag
    pub tag: String,
    /// Messages that were counted (and discarded)
    pub count: u64,
    /// Underlying failure
    pub source: PercentileError,
}

/// Shared per-tag latency buckets
///
/// Cloning yields another handle to the same buckets.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    inner: Arc<Mutex<HashMap<String, PerTagStats>>>,
}

impl LatencyStats {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with buckets pre-created for `tags`
    pub fn with_tags<'a>(tags: impl IntoIterator<Item = &'a str>) -> Self {
        let map = tags
            .into_iter()
            .map(|tag| (tag.to_string(), PerTagStats::default()))
            .collect();
        Self {
            inner: Arc::new(Mutex::new(map)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, PerTagStats>> {
        // A worker that panicked mid-append leaves the map consistent enough
        // to keep measuring.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record one message with its latency
    pub fn record(&self, tag: &str, latency_ms: f64) {
        let mut map = self.lock();
        if !map.contains_key(tag) {
            map.insert(tag.to_string(), PerTagStats::default());
        }
        if let Some(entry) = map.get_mut(tag) {
            entry.count += 1;
            entry.latency_samples.push(latency_ms);
        }
    }

    /// Copy of one tag's current bucket
    pub fn snapshot(&self, tag: &str) -> Option<PerTagStats> {
        self.lock().get(tag).cloned()
    }

    /// Sum of counts across all tags
    pub fn total_count(&self) -> u64 {
        self.lock().values().map(|s| s.count).sum()
    }

    /// Drain every tag with `count > 0`
    ///
    /// Each drained tag is reset (count 0, empty buffer) before its
    /// percentiles are computed, so a failed computation cannot leak samples
    /// into the next interval. Results are ordered by tag.
    pub fn drain(&self) -> Vec<Result<TagReport, StatsError>> {
        let mut map = self.lock();
        let mut results: Vec<_> = map
            .iter_mut()
            .filter(|(_, stats)| stats.count > 0)
            .map(|(tag, stats)| {
                let taken = std::mem::take(stats);
                taken.summarize(tag)
            })
            .collect();
        drop(map);

        results.sort_by(|a, b| result_tag(a).cmp(result_tag(b)));
        results
    }
}

fn result_tag(result: &Result<TagReport, StatsError>) -> &str {
    match result {
        Ok(report) => &report.tag,
        Err(err) => &err.tag,
    }
}

/// Local recorder capture for tests
#[cfg(test)]
pub(crate) mod recorded {
    use std::future::Future;

    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    /// Everything recorded while a closure ran: name, `tag` label, value
    pub(crate) struct Recorded(Vec<(String, Option<String>, DebugValue)>);

    /// Run `f` with a fresh recorder installed on this thread
    pub(crate) fn capture<T>(f: impl FnOnce() -> T) -> (T, Recorded) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let output = metrics::with_local_recorder(&recorder, f);
        let entries = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(composite, _, _, value)| {
                let key = composite.key();
                let tag = key
                    .labels()
                    .find(|label| label.key() == "tag")
                    .map(|label| label.value().to_string());
                (key.name().to_string(), tag, value)
            })
            .collect();
        (output, Recorded(entries))
    }

    /// Drive `future` on a current-thread runtime so every task records
    /// into the captured recorder
    pub(crate) fn capture_async<F: Future>(future: F) -> (F::Output, Recorded) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        capture(|| runtime.block_on(future))
    }

    impl Recorded {
        /// Counter value, 0 if it was never touched
        pub(crate) fn counter(&self, name: &str, tag: Option<&str>) -> u64 {
            self.find(name, tag).map_or(0, |value| match value {
                DebugValue::Counter(n) => *n,
                other => panic!("{} is not a counter: {:?}", name, other),
            })
        }

        /// Gauge value, if it was set
        pub(crate) fn gauge(&self, name: &str, tag: &str) -> Option<f64> {
            self.find(name, Some(tag)).map(|value| match value {
                DebugValue::Gauge(v) => v.0,
                other => panic!("{} is not a gauge: {:?}", name, other),
            })
        }

        fn find(&self, name: &str, tag: Option<&str>) -> Option<&DebugValue> {
            self.0
                .iter()
                .find(|(n, t, _)| n == name && t.as_deref() == tag)
                .map(|(_, _, value)| value)
        }
    }
}
