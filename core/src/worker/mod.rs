//! Producer and consumer workers
//!
//! A worker is one tokio task running a tight loop until the shutdown flag
//! flips. Workers of the same role are identical and independent: they share
//! transport handles through `Arc` and nothing else, except that consumer
//! workers all append into the one [`LatencyStats`](crate::metrics::LatencyStats).
//!
//! Producer loop: **wait for a token -> pick a destination -> build envelope
//! -> send -> repeat**.
//!
//! Consumer loop: **receive -> extract tag -> decode -> record latency -> ack
//! -> repeat**.
//!
//! Both loops return their [`WorkerStats`] when they stop.
//!
//! # Example
//!
//! ```ignore
//! use pubsub_bench_core::worker::{ProducerWorkerBuilder, SendTarget};
//! use pubsub_bench_core::config::SendMode;
//!
//! let worker = ProducerWorkerBuilder::new(0)
//!     .targets(targets)
//!     .payload("hello")
//!     .hostname("bench-01")
//!     .send_mode(SendMode::Sync)
//!     .rate_limit(Some(100.0))
//!     .build()?;
//!
//! let stats = worker.run(shutdown.subscribe()).await?;
//! println!("Sent: {}", stats.sent);
//! ```

mod builder;
mod consumer;
mod producer;
mod rate_limiter;
mod stats;

pub use builder::{ConsumerWorkerBuilder, ProducerWorkerBuilder};
pub use consumer::{ConsumerWorker, RECEIVE_RETRY_DELAY};
pub use producer::{ProducerWorker, SendTally, SendTarget, TallySnapshot};
pub use rate_limiter::{per_worker_rate, MessageRateLimiter, Permit};
pub use stats::WorkerStats;
