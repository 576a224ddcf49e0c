//! snapcoord
//!
//! Takes Consul snapshots on a schedule, holding a Consul lock so only one
//! process in the fleet captures at a time, and fans each snapshot out to
//! the configured outputs.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use snapcoord::clock::SystemClock;
use snapcoord::config::{self, AppConfig, OutputKind};
use snapcoord::scheduler::{exit_code, Scheduler, Shutdown, ShutdownPhase};

#[derive(Parser, Debug)]
#[command(name = env!("CARGO_BIN_NAME"), version, about, rename_all = "kebab-case")]
struct Args {
    /// YAML configuration file; flags below override its values
    #[arg(long, short, env = "SNAPCOORD_CONFIG")]
    config: Option<PathBuf>,

    /// Consul HTTP address
    #[arg(long, env = "CONSUL_HTTP_ADDR")]
    consul_url: Option<String>,

    /// Consul ACL token
    #[arg(long, env = "CONSUL_HTTP_TOKEN", hide_env_values = true)]
    consul_token: Option<String>,

    /// Key used as the cluster-wide lock
    #[arg(long)]
    lock_key: Option<String>,

    /// Session TTL, e.g. "10m"
    #[arg(long, value_parser = humantime::parse_duration)]
    lock_timeout: Option<Duration>,

    /// Time between runs, e.g. "1h"
    #[arg(long, value_parser = humantime::parse_duration)]
    interval: Option<Duration>,

    /// Outputs to write to
    #[arg(long, value_enum, value_delimiter = ',')]
    outputs: Vec<OutputKind>,

    #[arg(long)]
    filename_prefix: Option<String>,

    #[arg(long)]
    file_extension: Option<String>,

    /// Directory for the local output
    #[arg(long)]
    destination: Option<PathBuf>,

    /// Create the local destination if it is missing
    #[arg(long)]
    create_destination: bool,

    /// Move the snapshot into the local destination instead of copying it
    #[arg(long)]
    take_ownership: bool,

    /// Local retention, e.g. "7d"; 0 keeps everything
    #[arg(long, value_parser = humantime::parse_duration)]
    local_retention: Option<Duration>,

    /// Object storage bucket
    #[arg(long)]
    bucket: Option<String>,

    /// Object storage retention, e.g. "30d"; 0 keeps everything
    #[arg(long, value_parser = humantime::parse_duration)]
    object_retention: Option<Duration>,

    #[arg(long, env = "SNAPCOORD_OBJECT_ACCESS_KEY_ID")]
    access_key_id: Option<String>,

    #[arg(long, env = "SNAPCOORD_OBJECT_SECRET_ACCESS_KEY", hide_env_values = true)]
    secret_access_key: Option<String>,

    #[arg(long, env = "SNAPCOORD_OBJECT_SESSION_TOKEN", hide_env_values = true)]
    session_token: Option<String>,

    /// Run a single backup and exit
    #[arg(long)]
    once: bool,

    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn apply(self, config: &mut AppConfig) {
        if let Some(url) = self.consul_url {
            config.consul.url = url;
        }
        if self.consul_token.is_some() {
            config.consul.token = self.consul_token;
        }
        if let Some(key) = self.lock_key {
            config.consul.lock_key = key;
        }
        if let Some(ttl) = self.lock_timeout {
            config.consul.lock_timeout = ttl;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if !self.outputs.is_empty() {
            config.outputs = self.outputs;
        }
        if let Some(prefix) = self.filename_prefix {
            config.filename_prefix = prefix;
        }
        if let Some(ext) = self.file_extension {
            config.file_extension = ext;
        }
        if let Some(destination) = self.destination {
            config.local.destination_path = destination;
        }
        config.local.create_destination |= self.create_destination;
        config.local.take_ownership |= self.take_ownership;
        if let Some(retention) = self.local_retention {
            config.local.retention = retention;
        }
        if let Some(bucket) = self.bucket {
            config.object_storage.bucket = bucket;
        }
        if let Some(retention) = self.object_retention {
            config.object_storage.retention = retention;
        }
        if self.access_key_id.is_some() {
            config.object_storage.access_key_id = self.access_key_id;
        }
        if self.secret_access_key.is_some() {
            config.object_storage.secret_access_key = self.secret_access_key;
        }
        if self.session_token.is_some() {
            config.object_storage.session_token = self.session_token;
        }
    }
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

/// Escalate shutdown on every interrupt or termination signal
fn listen_for_signals(shutdown: Shutdown) {
    tokio::spawn(async move {
        loop {
            if let Err(err) = wait_for_signal().await {
                error!(error = %err, "Could not listen for shutdown signals");
                return;
            }
            match shutdown.request() {
                ShutdownPhase::Graceful => info!("Shutting down after the current run; signal again to abort it"),
                ShutdownPhase::Forced => warn!("Aborting the current run"),
                ShutdownPhase::Running => {}
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = match &args.config {
        Some(path) => config::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => AppConfig::default(),
    };
    let once = args.once;
    args.apply(&mut config);

    let orchestrator = config
        .build_orchestrator(Arc::new(SystemClock))
        .await
        .context("invalid configuration")?;
    let scheduler = Scheduler::new(Arc::new(orchestrator), config.interval);

    let shutdown = Shutdown::new();
    listen_for_signals(shutdown.clone());

    if once {
        let code = match scheduler.run_single(&shutdown).await {
            Some(report) => exit_code(report.outcome),
            None => 1,
        };
        return Ok(ExitCode::from(code));
    }

    let summary = scheduler.run(shutdown).await;
    info!(runs = summary.runs, failed = summary.failed, "Exiting");
    Ok(ExitCode::SUCCESS)
}
