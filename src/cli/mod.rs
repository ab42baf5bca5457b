//! CLI argument parsing

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pubsub_bench_core::Role;

#[derive(Parser)]
#[command(name = "pubsub-bench")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Write JSON logs to this directory instead of stdout
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Publish rate-limited messages to every destination
    Produce {
        /// Config name or path (`<name>.yml` / `<name>.yaml` are tried)
        #[arg(short, long)]
        config: String,
        /// Messages per second across all producer workers; 0 is unlimited
        #[arg(short, long, default_value_t = 0.0)]
        rate: f64,
    },
    /// Consume from every destination and report latency
    Consume {
        /// Config name or path
        #[arg(short, long)]
        config: String,
    },
    /// Produce and consume in one process
    Loopback {
        /// Config name or path
        #[arg(short, long)]
        config: String,
        /// Messages per second across all producer workers; 0 is unlimited
        #[arg(short, long, default_value_t = 0.0)]
        rate: f64,
    },
    /// Validate a configuration file and print its destinations
    Validate {
        /// Config name or path
        #[arg(short, long)]
        config: String,
    },
}

impl Commands {
    /// Role to run, `None` for commands that do not start workers
    pub fn role(&self) -> Option<Role> {
        match self {
            Commands::Produce { .. } => Some(Role::Produce),
            Commands::Consume { .. } => Some(Role::Consume),
            Commands::Loopback { .. } => Some(Role::Loopback),
            Commands::Validate { .. } => None,
        }
    }

    /// Config name or path given with `--config`
    pub fn config(&self) -> &str {
        match self {
            Commands::Produce { config, .. }
            | Commands::Consume { config }
            | Commands::Loopback { config, .. }
            | Commands::Validate { config } => config,
        }
    }

    /// Requested rate; 0 means unlimited
    pub fn rate(&self) -> Option<f64> {
        match self {
            Commands::Produce { rate, .. } | Commands::Loopback { rate, .. } if *rate != 0.0 => {
                Some(*rate)
            }
            _ => None,
        }
    }

    /// Prefix of the log file name
    pub fn log_name(&self) -> &'static str {
        self.role().map_or("validate", Role::as_str)
    }
}
