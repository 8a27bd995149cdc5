pub mod client;
pub mod common;
pub mod discovery;
pub mod processing;

pub use client::{DeviceAdapter, FaceLimiter, SyncReport, SyncScheduler};
pub use common::config::SyncConfig;
pub use common::error::{ErrorKind, SyncError, SyncResult};
pub use common::models::{DeviceConnection, UserSyncItem};
pub use discovery::{DeviceDirectory, DeviceRegistry};
