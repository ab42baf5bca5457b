//! Per-worker counters

use std::time::{Duration, Instant};

/// Counters kept by one worker for its whole run
///
/// Producer workers fill the send counters, consumer workers the receive
/// counters. The values are local to one worker and merged by the
/// orchestrator after join.
#[derive(Debug, Default, Clone)]
pub struct WorkerStats {
    /// Sends the transport confirmed (sync: returned Ok, async: completed Ok)
    pub sent: usize,

    /// Sends that failed (sync errors and failed async completions)
    pub send_failures: usize,

    /// Async sends with no completion when the worker stopped
    pub in_flight: usize,

    /// Messages received
    pub received: usize,

    /// Messages acknowledged
    pub acked: usize,

    /// Messages negatively acknowledged
    pub nacked: usize,

    /// Messages whose envelope could not be decoded
    pub decode_failures: usize,

    /// Messages whose topic did not map to a configured tag
    pub unattributed: usize,

    /// Loop entry
    pub started_at: Option<Instant>,

    /// Loop exit
    pub ended_at: Option<Instant>,
}

impl WorkerStats {
    /// Zeroed counters, no window
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark loop entry
    pub fn start(&mut self) {
        self.started_at = Some(Instant::now());
    }

    /// Mark loop exit
    pub fn stop(&mut self) {
        self.ended_at = Some(Instant::now());
    }

    /// Send attempts (confirmed, failed and still in flight)
    pub fn send_attempts(&self) -> usize {
        self.sent + self.send_failures + self.in_flight
    }

    /// Length of the run window; still growing while the worker runs
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.started_at?;
        Some(match self.ended_at {
            Some(end) => end.saturating_duration_since(start),
            None => start.elapsed(),
        })
    }

    /// Messages sent per second over the worker's lifetime
    pub fn sends_per_second(&self) -> f64 {
        rate(self.sent, self.elapsed())
    }

    /// Messages received per second over the worker's lifetime
    pub fn receives_per_second(&self) -> f64 {
        rate(self.received, self.elapsed())
    }

    /// Fold another worker's counters in, widening the window to cover both
    pub fn merge(&mut self, other: &WorkerStats) {
        self.sent += other.sent;
        self.send_failures += other.send_failures;
        self.in_flight += other.in_flight;
        self.received += other.received;
        self.acked += other.acked;
        self.nacked += other.nacked;
        self.decode_failures += other.decode_failures;
        self.unattributed += other.unattributed;
        self.started_at = match (self.started_at, other.started_at) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.ended_at = match (self.ended_at, other.ended_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

fn rate(count: usize, elapsed: Option<Duration>) -> f64 {
    match elapsed.map(|d| d.as_secs_f64()) {
        Some(secs) if secs > 0.0 => count as f64 / secs,
        _ => 0.0,
    }
}
