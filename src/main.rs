//! # terminal-sync
//!
//! Command-line entry point.
//!
//! ## Usage
//!
//! ```bash
//! terminal-sync sync --config config/sync.toml --users users.json \
//!   --metrics-output ./reports/run.json
//! terminal-sync ping --config config/sync.toml
//! ```
//!
//! `users.json` is a JSON array of user records with camelCase keys
//! (`userId`, `name`, `citizenIdNo`, `faceImageBase64`, `faceUrl`).

use anyhow::Context;
use clap::{Parser, Subcommand};
use env_logger::Builder;
use futures_util::future::join_all;
use log::{info, LevelFilter};
use std::io::Write;
use std::sync::Arc;

use terminal_sync::common::models::{mask_secret, Credentials};
use terminal_sync::{
    DeviceAdapter, DeviceDirectory, FaceLimiter, SyncConfig, SyncScheduler, UserSyncItem,
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Push users and faces to every configured terminal
    Sync {
        /// Path to the configuration file (TOML format)
        #[arg(short, long)]
        config: String,

        /// Path to a JSON array of user records
        #[arg(short, long)]
        users: String,

        /// Path to write the sync report JSON (optional)
        #[arg(long)]
        metrics_output: Option<String>,
    },
    /// Check which configured terminals answer
    Ping {
        /// Path to the configuration file (TOML format)
        #[arg(short, long)]
        config: String,
    },
}

/// Initialize the logging system with timestamp, level, and message formatting.
///
/// INFO by default; `RUST_LOG` overrides it.
fn init_logger() {
    Builder::new()
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.args()
            )
        })
        .filter_level(LevelFilter::Info)
        .parse_default_env()
        .init();
}

fn describe_devices(config: &SyncConfig) {
    for device in &config.devices {
        let auth = match device.credentials() {
            Credentials::Digest { username, .. } => format!("digest as {}", username),
            Credentials::Token(token) => format!("token {}", mask_secret(&token)),
            Credentials::None => "no credentials".to_string(),
        };
        info!("  - {} at {} ({})", device.id, device.base_url(), auth);
    }
}

async fn run_sync(
    config_path: &str,
    users_path: &str,
    metrics_output: Option<&str>,
) -> anyhow::Result<()> {
    let config = SyncConfig::from_file(config_path)
        .with_context(|| format!("loading config {}", config_path))?;
    let raw = std::fs::read_to_string(users_path)
        .with_context(|| format!("reading users {}", users_path))?;
    let users: Vec<UserSyncItem> =
        serde_json::from_str(&raw).with_context(|| format!("parsing users {}", users_path))?;

    info!(
        "🚀 Syncing {} users to {} devices",
        users.len(),
        config.devices.len()
    );
    describe_devices(&config);

    let adapter = DeviceAdapter::from_config(&config)?;
    let registry = Arc::new(DeviceDirectory::from_devices(config.devices.clone()));
    let face_limiter = FaceLimiter::new(config.scheduler.face_concurrency);
    let scheduler = SyncScheduler::new(adapter, registry, config.scheduler.clone(), face_limiter);

    let report = scheduler.sync(&users).await?;
    let stats = report.aggregate();
    info!(
        "📊 {} outcomes: {} ok, {} failed ({:.1}%)",
        stats.total_outcomes, stats.successful, stats.failed, stats.failure_rate
    );
    for (kind, count) in &stats.failure_kinds {
        info!("   {}: {}", kind, count);
    }

    if let Some(path) = metrics_output {
        report
            .export_to_json(path)
            .with_context(|| format!("writing report {}", path))?;
        info!("📁 Report written to {}", path);
    }

    Ok(())
}

async fn run_ping(config_path: &str) -> anyhow::Result<()> {
    let config = SyncConfig::from_file(config_path)
        .with_context(|| format!("loading config {}", config_path))?;
    let adapter = DeviceAdapter::from_config(&config)?;

    let results = join_all(config.devices.iter().map(|device| {
        let adapter = &adapter;
        async move { (device, adapter.ping(device).await) }
    }))
    .await;

    for (device, online) in results {
        println!(
            "{}\t{}\t{}",
            device.id,
            device.base_url(),
            if online { "online" } else { "offline" }
        );
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logger();

    let args = Args::parse();

    match args.command {
        Command::Sync {
            config,
            users,
            metrics_output,
        } => run_sync(&config, &users, metrics_output.as_deref()).await,
        Command::Ping { config } => run_ping(&config).await,
    }
}
