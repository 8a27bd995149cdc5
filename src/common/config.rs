//! # Configuration
//!
//! TOML configuration for a sync run. Every section has defaults, so a minimal
//! file only lists `[[devices]]`.
//!
//! # Example TOML
//!
//! ```toml
//! [scheduler]
//! device_concurrency = 4
//! request_concurrency = 4
//! face_concurrency = 6
//!
//! [transfer]
//! timeout_ms = 15000
//! max_retries = 3
//!
//! [device]
//! attempts = 3
//!
//! [[devices]]
//! id = "lobby-1"
//! host = "10.0.0.21"
//! username = "admin"
//! password = "secret"
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::time::Duration;

use super::models::DeviceConnection;

/// Upper bound on users per `insertMulti` request.
pub const MAX_BATCH_SIZE: usize = 10;

/// Load a TOML configuration file and deserialize it into the specified type.
///
/// # Arguments
/// - `path`: Path to the TOML configuration file
///
/// # Returns
/// - `Ok(T)`: Successfully loaded and parsed configuration
/// - `Err`: File I/O or parsing error
///
/// # Example
/// ```ignore
/// let config: SyncConfig = load_config("config/sync.toml")?;
/// ```
pub fn load_config<T>(path: &str) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)?;
    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Complete configuration for the `terminal-sync` binary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Fan-out limits
    pub scheduler: SchedulerConfig,
    /// Timeouts and retry/backoff for every HTTP exchange
    pub transfer: TransferConfig,
    /// Per-device call behaviour
    pub device: DeviceConfig,
    /// Terminals to synchronize
    pub devices: Vec<DeviceConnection>,
}

impl SyncConfig {
    pub fn from_file(path: &str) -> Result<Self> {
        load_config(path)
    }
}

/// Concurrency limits for the fan-out scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Devices synchronized at the same time
    pub device_concurrency: usize,
    /// Metadata batches or face uploads in flight per device
    pub request_concurrency: usize,
    /// Face uploads and image downloads in flight across the whole process
    pub face_concurrency: usize,
    /// Users per metadata batch (clamped to 1..=10)
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            device_concurrency: 4,
            request_concurrency: 4,
            face_concurrency: 6,
            batch_size: MAX_BATCH_SIZE,
        }
    }
}

impl SchedulerConfig {
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_BATCH_SIZE)
    }
}

/// Timeout and retry settings for the transfer client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Deadline for one attempt, headers and body included
    pub timeout_ms: u64,
    /// TCP/TLS connect deadline
    pub connect_timeout_ms: u64,
    /// Retries after the first attempt (attempts = max_retries + 1)
    pub max_retries: u32,
    /// Backoff base for attempt 0
    pub base_delay_ms: u64,
    /// Backoff cap before jitter
    pub max_delay_ms: u64,
    /// Upper bound of the uniform jitter added to each delay
    pub jitter_ms: u64,
    /// Redirects followed by image downloads
    pub max_redirects: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 15_000,
            connect_timeout_ms: 10_000,
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter_ms: 300,
            max_redirects: 3,
        }
    }
}

impl TransferConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Settings for calls made through the device adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Full digest handshakes attempted per logical device call
    pub attempts: u32,
    /// Deadline for a device ping
    pub ping_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            ping_timeout_ms: 3_000,
        }
    }
}
