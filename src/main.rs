//! pubsub-bench - load generation and latency measurement for pub/sub brokers

use std::fs::{self, File};
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use pubsub_bench_core::{BenchConfig, OrchestratorBuilder, Role};
use pubsub_bench_transports::connector_for;
use tracing_subscriber::EnvFilter;

mod cli;

use cli::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let hostname = nix::unistd::gethostname().map(|h| h.to_string_lossy().into_owned());
    init_tracing(
        cli.verbose,
        cli.log_dir.as_deref(),
        cli.command.log_name(),
        hostname.as_deref().unwrap_or(""),
    )?;
    let hostname = hostname.unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Hostname lookup failed, using empty host");
        String::new()
    });

    match cli.command.role() {
        Some(role) => run(role, cli.command.config(), cli.command.rate(), hostname).await,
        None => validate(cli.command.config()),
    }
}

/// Stdout by default, JSON lines in `DIR/<role>.dev.log.<YYYYMMDD>_<host>` with `--log-dir`
fn init_tracing(verbose: bool, log_dir: Option<&Path>, name: &str, hostname: &str) -> Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    let filter = EnvFilter::from_default_env().add_directive(level.into());

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create log directory {:?}", dir))?;
            let path = dir.join(format!(
                "{}.dev.log.{}_{}",
                name,
                chrono::Local::now().format("%Y%m%d"),
                hostname
            ));
            let file = File::create(&path)
                .with_context(|| format!("Failed to create log file {:?}", path))?;
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn run(role: Role, name: &str, rate: Option<f64>, hostname: String) -> Result<()> {
    let config =
        BenchConfig::load(name).with_context(|| format!("Failed to load config {:?}", name))?;
    config.validate(role, rate)?;

    let address = config.broker.address.clone();
    let credentials = config.credentials()?;
    let connector = connector_for(&address, role)?;
    let transport = connector
        .connect(&address, credentials, config.connect_options())
        .await
        .with_context(|| format!("Failed to connect to {}", address))?;

    tracing::info!(
        %role,
        transport = transport.name(),
        address = %address,
        rate = ?rate,
        "pubsub-bench starting"
    );

    let orchestrator = OrchestratorBuilder::new()
        .config(config)
        .role(role)
        .transport(transport)
        .hostname(hostname)
        .rate(rate)
        .build()?;

    let report = orchestrator.run_with_signal_handling().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn validate(name: &str) -> Result<()> {
    let config =
        BenchConfig::load(name).with_context(|| format!("Failed to load config {:?}", name))?;
    config.validate(Role::Loopback, None)?;
    let destinations = config.destinations()?;

    tracing::info!(destinations = destinations.len(), "Configuration is valid");
    println!("{}", serde_json::to_string_pretty(destinations.as_slice())?);
    Ok(())
}
