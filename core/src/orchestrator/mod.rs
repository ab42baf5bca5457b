//! Orchestrator for run lifecycle management
//!
//! The Orchestrator coordinates one benchmark run:
//! - Opening a producer per destination and the shared subscription
//! - Spawning the producer and consumer worker pools
//! - Driving the once-per-interval stats ticker
//! - Graceful shutdown: join every worker, flush stats once, close the
//!   transport, then hold for the grace period
//!
//! # Example
//!
//! ```ignore
//! use pubsub_bench_core::{OrchestratorBuilder, Role};
//!
//! let orchestrator = OrchestratorBuilder::new()
//!     .config(config)
//!     .role(Role::Consume)
//!     .transport(transport)
//!     .hostname(hostname)
//!     .build()?;
//!
//! let report = orchestrator.run_with_signal_handling().await?;
//! ```

mod aggregator;
mod builder;
mod executor;

pub use aggregator::{
    aggregate_worker_stats, emit_reports, run_stats_ticker, settle_async_sends, AggregatedStats,
    RunReport,
    DEFAULT_STATS_INTERVAL,
};
pub use builder::OrchestratorBuilder;
pub use executor::Orchestrator;

#[cfg(test)]
mod tests;
