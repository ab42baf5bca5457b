//! Builder pattern for Orchestrator construction

use std::sync::Arc;
use std::time::Duration;

use crate::config::{BenchConfig, Role};
use crate::error::{BenchError, BenchResult};
use crate::metrics::LatencyStats;
use crate::shutdown::Shutdown;
use crate::transport::Transport;

use super::aggregator::DEFAULT_STATS_INTERVAL;
use super::executor::Orchestrator;

/// Builder for creating an Orchestrator with proper configuration
///
/// # Example
///
/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .config(config)
///     .role(Role::Produce)
///     .transport(transport)
///     .hostname("bench-01")
///     .rate(Some(1000.0))
///     .build()?;
/// ```
pub struct OrchestratorBuilder {
    config: Option<BenchConfig>,
    role: Option<Role>,
    transport: Option<Arc<dyn Transport>>,
    hostname: String,
    rate: Option<f64>,
    stats_interval: Duration,
    grace_period: Option<Duration>,
    shutdown: Option<Shutdown>,
}

impl OrchestratorBuilder {
    /// Create a new orchestrator builder
    pub fn new() -> Self {
        Self {
            config: None,
            role: None,
            transport: None,
            hostname: String::new(),
            rate: None,
            stats_interval: DEFAULT_STATS_INTERVAL,
            grace_period: None,
            shutdown: None,
        }
    }

    /// Set the benchmark configuration
    pub fn config(mut self, config: BenchConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the role to run
    pub fn role(mut self, role: Role) -> Self {
        self.role = Some(role);
        self
    }

    /// Set the connected transport
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the local hostname embedded in envelopes
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = hostname.into();
        self
    }

    /// Set the global producer rate (messages per second); `None` is unlimited
    pub fn rate(mut self, rps: Option<f64>) -> Self {
        self.rate = rps;
        self
    }

    /// Override the stats interval
    pub fn stats_interval(mut self, interval: Duration) -> Self {
        self.stats_interval = interval;
        self
    }

    /// Override the configured grace period
    pub fn grace_period(mut self, grace: Duration) -> Self {
        self.grace_period = Some(grace);
        self
    }

    /// Use an existing shutdown flag instead of a fresh one
    pub fn shutdown(mut self, shutdown: Shutdown) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Build the orchestrator
    ///
    /// # Errors
    ///
    /// Returns an error if config, role or transport are not set, or if the
    /// configuration does not validate for the role.
    pub fn build(self) -> BenchResult<Orchestrator> {
        let config = self.config.ok_or_else(|| BenchError::missing_config("config"))?;
        let role = self.role.ok_or_else(|| BenchError::missing_config("role"))?;
        let transport = self
            .transport
            .ok_or_else(|| BenchError::missing_config("transport"))?;

        if self.stats_interval.is_zero() {
            return Err(BenchError::config("stats interval must be positive"));
        }
        config.validate(role, self.rate)?;
        let destinations = config.destinations()?;
        let latency = LatencyStats::with_tags(destinations.tags());

        Ok(Orchestrator {
            grace_period: self.grace_period.unwrap_or_else(|| config.grace_period()),
            config,
            role,
            transport,
            destinations: Arc::new(destinations),
            hostname: Arc::from(self.hostname),
            rate: self.rate,
            stats_interval: self.stats_interval,
            shutdown: self.shutdown.unwrap_or_default(),
            latency,
            started: Default::default(),
        })
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}
