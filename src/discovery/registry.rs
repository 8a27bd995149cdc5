//! # Device Registry
//!
//! The scheduler reads the fleet through [`DeviceRegistry`]; persistent
//! storage lives behind that trait. [`DeviceDirectory`] is the in-memory
//! implementation used by the CLI (devices from the config file) and tests.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

use crate::common::models::DeviceConnection;

/// Source of the devices to synchronize.
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    /// Current list of terminals. An error aborts the whole sync call.
    async fn list_devices(&self) -> Result<Vec<DeviceConnection>>;
}

/// In-memory registry keyed by device id.
#[derive(Debug, Default)]
pub struct DeviceDirectory {
    devices: RwLock<HashMap<String, DeviceConnection>>,
}

impl DeviceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_devices(devices: impl IntoIterator<Item = DeviceConnection>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
        Self {
            devices: RwLock::new(devices),
        }
    }

    /// Adds or replaces a device.
    pub async fn register_device(&self, device: DeviceConnection) {
        self.devices.write().await.insert(device.id.clone(), device);
    }

    pub async fn unregister_device(&self, device_id: &str) -> Option<DeviceConnection> {
        self.devices.write().await.remove(device_id)
    }

    pub async fn get_device(&self, device_id: &str) -> Option<DeviceConnection> {
        self.devices.read().await.get(device_id).cloned()
    }

    /// Replaces the whole directory.
    pub async fn apply_snapshot(&self, devices: Vec<DeviceConnection>) {
        *self.devices.write().await = devices
            .into_iter()
            .map(|d| (d.id.clone(), d))
            .collect();
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }
}

#[async_trait]
impl DeviceRegistry for DeviceDirectory {
    /// Devices ordered by id.
    async fn list_devices(&self) -> Result<Vec<DeviceConnection>> {
        let mut devices: Vec<DeviceConnection> =
            self.devices.read().await.values().cloned().collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(devices)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(id: &str) -> DeviceConnection {
        DeviceConnection::new(id, "10.0.0.1", "admin", "pw")
    }

    #[tokio::test]
    async fn test_register_and_list_sorted() {
        let directory = DeviceDirectory::new();
        directory.register_device(device("b")).await;
        directory.register_device(device("a")).await;
        directory.register_device(device("b")).await;

        let ids: Vec<String> = directory
            .list_devices()
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_unregister_and_snapshot() {
        let directory = DeviceDirectory::from_devices(vec![device("a"), device("b")]);
        assert_eq!(directory.len().await, 2);

        assert!(directory.unregister_device("a").await.is_some());
        assert!(directory.get_device("a").await.is_none());
        assert!(directory.get_device("b").await.is_some());

        directory.apply_snapshot(Vec::new()).await;
        assert!(directory.is_empty().await);
        assert!(directory.list_devices().await.unwrap().is_empty());
    }
}
