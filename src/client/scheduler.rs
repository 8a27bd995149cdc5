//! # Fan-out Scheduler
//!
//! Pushes a list of users to every registered terminal.
//!
//! ## Responsibilities
//!
//! - **Registry read**: one `list_devices` call per run; failure is fatal
//! - **Face preparation**: every face is resolved (URL download or inline
//!   base64) and validated once per run, then shared by all devices
//! - **Device fan-out**: at most `device_concurrency` devices in flight
//! - **Per-device phases**: metadata batches of up to ten users first, face
//!   uploads after, each phase with `request_concurrency` calls in flight
//! - **Global face cap**: face downloads and uploads across all devices share
//!   one [`FaceLimiter`]
//! - **Failure isolation**: every failure becomes a [`SyncOutcome`]; sibling
//!   work always runs to completion
//!
//! Only a registry failure or a malformed input record escapes
//! [`SyncScheduler::sync_users_to_devices`].

use futures_util::stream::{self, StreamExt};
use log::{debug, error, info, warn};
use std::borrow::Cow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, SemaphorePermit};

use super::device::DeviceAdapter;
use super::metrics::{DeviceReport, SyncOutcome, SyncPhase, SyncReport};
use crate::common::config::SchedulerConfig;
use crate::common::error::{SyncError, SyncResult};
use crate::common::models::{DeviceConnection, UserSyncItem};
use crate::discovery::registry::DeviceRegistry;
use crate::processing::face::{encode_image, validate_face, NormalizedFace};

// ============================================================================
// FACE LIMITER
// ============================================================================

/// Process-wide cap on concurrent face downloads and uploads.
///
/// Clones share the same permits. Build one at the top level and hand it to
/// every scheduler that should share the budget.
#[derive(Debug, Clone)]
pub struct FaceLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl FaceLimiter {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self) -> SyncResult<SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|_| SyncError::LimiterClosed)
    }

    /// Runs `task` while holding one permit.
    pub async fn run<F, T>(&self, task: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let _permit = self.acquire().await?;
        task.await
    }
}

/// A face that passed validation, ready for every device.
#[derive(Debug, Clone)]
struct ReadyFace {
    face: NormalizedFace,
    name: Option<String>,
}

/// Keyed by the record's index in the input, so repeated user ids stay apart.
type PreparedFaces = HashMap<usize, SyncResult<ReadyFace>>;

// ============================================================================
// SCHEDULER
// ============================================================================

pub struct SyncScheduler {
    adapter: DeviceAdapter,
    registry: Arc<dyn DeviceRegistry>,
    config: SchedulerConfig,
    face_limiter: FaceLimiter,
}

impl SyncScheduler {
    pub fn new(
        adapter: DeviceAdapter,
        registry: Arc<dyn DeviceRegistry>,
        config: SchedulerConfig,
        face_limiter: FaceLimiter,
    ) -> Self {
        Self {
            adapter,
            registry,
            config,
            face_limiter,
        }
    }

    pub fn adapter(&self) -> &DeviceAdapter {
        &self.adapter
    }

    pub fn face_limiter(&self) -> &FaceLimiter {
        &self.face_limiter
    }

    /// [`sync_users_to_devices`](Self::sync_users_to_devices) with the
    /// configured device concurrency.
    pub async fn sync(&self, users: &[UserSyncItem]) -> SyncResult<SyncReport> {
        self.sync_users_to_devices(users, self.config.device_concurrency)
            .await
    }

    /// Synchronizes `users` to every device in the registry.
    ///
    /// Resolves after every device has settled. An empty registry is a
    /// logged no-op that returns an empty report.
    ///
    /// # Errors
    /// - `InvalidInput` if any user record has an impossible shape (nothing is sent)
    /// - `RegistryUnavailable` if the device list cannot be read
    pub async fn sync_users_to_devices(
        &self,
        users: &[UserSyncItem],
        device_concurrency: usize,
    ) -> SyncResult<SyncReport> {
        info!("🔄 Sync triggered for {} users", users.len());

        for user in users {
            user.check_shape()?;
        }

        let devices = self.registry.list_devices().await.map_err(|e| {
            error!("❌ Failed to list devices: {:#}", e);
            SyncError::RegistryUnavailable(format!("{:#}", e))
        })?;

        let mut report = SyncReport::new();
        if devices.is_empty() {
            info!("No devices registered, nothing to sync");
            report.finish();
            return Ok(report);
        }

        let faces = self.prepare_faces(users).await;
        let request_concurrency = self.config.request_concurrency;

        report.devices = stream::iter(devices.iter())
            .map(|device| self.sync_device(device, users, &faces, request_concurrency))
            .buffer_unordered(device_concurrency.max(1))
            .collect()
            .await;
        report.finish();

        let stats = report.aggregate();
        info!(
            "🏁 Sync {} finished: {} devices, {} ok, {} failed ({} faces added, {} updated, {} already present)",
            report.run_id,
            stats.total_devices,
            stats.successful,
            stats.failed,
            stats.faces_added,
            stats.faces_updated,
            stats.faces_already_present
        );

        Ok(report)
    }

    /// Synchronizes `users` to a single device.
    ///
    /// Records with an impossible shape are reported as failed outcomes
    /// instead of being sent.
    pub async fn sync_to_device(
        &self,
        device: &DeviceConnection,
        users: &[UserSyncItem],
        request_concurrency: usize,
    ) -> DeviceReport {
        let rejected: Vec<SyncOutcome> = users
            .iter()
            .filter_map(|user| {
                user.check_shape().err().map(|e| {
                    warn!("⚠️ {}: skipping user {:?}: {}", device.id, user.user_id, e);
                    SyncOutcome::failure(&device.id, &user.user_id, SyncPhase::Metadata, &e, Duration::ZERO)
                })
            })
            .collect();

        let users: Cow<'_, [UserSyncItem]> = if rejected.is_empty() {
            Cow::Borrowed(users)
        } else {
            Cow::Owned(
                users
                    .iter()
                    .filter(|u| u.check_shape().is_ok())
                    .cloned()
                    .collect(),
            )
        };

        let faces = self.prepare_faces(&users).await;
        let mut report = self
            .sync_device(device, &users, &faces, request_concurrency)
            .await;
        report.outcomes.extend(rejected);
        report
    }

    /// Resolves and validates every face once.
    async fn prepare_faces(&self, users: &[UserSyncItem]) -> PreparedFaces {
        stream::iter(users.iter().enumerate().filter(|(_, u)| u.has_face()))
            .map(|(index, user)| async move { (index, self.prepare_face(user).await) })
            .buffer_unordered(self.face_limiter.capacity())
            .collect()
            .await
    }

    async fn prepare_face(&self, user: &UserSyncItem) -> SyncResult<ReadyFace> {
        let image_b64 = match (&user.face_image_base64, &user.face_url) {
            (Some(b64), _) => Cow::Borrowed(b64.as_str()),
            (None, Some(url)) => {
                let transfer = self.adapter.transfer();
                let bytes = self
                    .face_limiter
                    .run(transfer.fetch_buffer_with_retry(url, transfer.policy().max_retries))
                    .await
                    .map_err(|e| {
                        warn!("⚠️ Face download for {} failed: {}", user.user_id, e);
                        e
                    })?;
                Cow::Owned(encode_image(&bytes))
            }
            (None, None) => {
                return Err(SyncError::InvalidInput(format!(
                    "user {} carries no face",
                    user.user_id
                )))
            }
        };

        // Terminals get the display name; long names are cut, not rejected.
        let name = user.display_name();
        let validation = validate_face(&user.user_id, Some(&name), &image_b64);
        match validation.normalized {
            Some(face) => {
                debug!(
                    "Face for {} ready ({}x{}, {} bytes)",
                    user.user_id,
                    face.width,
                    face.height,
                    face.bytes.len()
                );
                Ok(ReadyFace {
                    face,
                    name: validation.name,
                })
            }
            None => {
                warn!(
                    "⚠️ Face for {} rejected: {}",
                    user.user_id,
                    validation.issues.join("; ")
                );
                Err(SyncError::Validation(validation.issues))
            }
        }
    }

    /// Metadata phase, then face phase, on one device.
    async fn sync_device(
        &self,
        device: &DeviceConnection,
        users: &[UserSyncItem],
        faces: &PreparedFaces,
        request_concurrency: usize,
    ) -> DeviceReport {
        let concurrency = request_concurrency.max(1);
        let mut report = DeviceReport::new(device.id.clone());
        info!(
            "📡 Syncing {} users to {} ({})",
            users.len(),
            device.id,
            device.base_url()
        );

        let batches: Vec<Vec<SyncOutcome>> =
            stream::iter(users.chunks(self.config.effective_batch_size()))
                .map(|batch| self.sync_batch(device, batch))
                .buffer_unordered(concurrency)
                .collect()
                .await;
        report.outcomes.extend(batches.into_iter().flatten());

        let face_outcomes: Vec<SyncOutcome> =
            stream::iter(users.iter().enumerate().filter(|(_, u)| u.has_face()))
                .map(|(index, user)| self.sync_face(device, user, faces.get(&index)))
                .buffer_unordered(concurrency)
                .collect()
                .await;
        report.outcomes.extend(face_outcomes);

        if report.failed() == 0 {
            info!("✅ {}: {} operations succeeded", device.id, report.succeeded());
        } else {
            warn!(
                "⚠️ {}: {} succeeded, {} failed",
                device.id,
                report.succeeded(),
                report.failed()
            );
        }
        report
    }

    async fn sync_batch(&self, device: &DeviceConnection, batch: &[UserSyncItem]) -> Vec<SyncOutcome> {
        let started = Instant::now();
        match self.adapter.insert_user_batch(device, batch).await {
            Ok(()) => {
                debug!("{}: batch of {} users stored", device.id, batch.len());
                batch
                    .iter()
                    .map(|u| {
                        SyncOutcome::success(&device.id, &u.user_id, SyncPhase::Metadata, started.elapsed())
                    })
                    .collect()
            }
            Err(e) => {
                warn!(
                    "⚠️ {}: insertMulti for {} users failed: {}",
                    device.id,
                    batch.len(),
                    e
                );
                batch
                    .iter()
                    .map(|u| {
                        SyncOutcome::failure(&device.id, &u.user_id, SyncPhase::Metadata, &e, started.elapsed())
                    })
                    .collect()
            }
        }
    }

    async fn sync_face(
        &self,
        device: &DeviceConnection,
        user: &UserSyncItem,
        prepared: Option<&SyncResult<ReadyFace>>,
    ) -> SyncOutcome {
        let ready = match prepared {
            Some(Ok(ready)) => ready,
            Some(Err(e)) => {
                debug!("{}: skipping face for {}: {}", device.id, user.user_id, e);
                return SyncOutcome::failure(&device.id, &user.user_id, SyncPhase::Face, e, Duration::ZERO);
            }
            None => {
                let e = SyncError::InvalidInput(format!("face for {} was not prepared", user.user_id));
                return SyncOutcome::failure(&device.id, &user.user_id, SyncPhase::Face, &e, Duration::ZERO);
            }
        };

        let started = Instant::now();
        let result = self
            .face_limiter
            .run(
                self.adapter
                    .upsert_face(device, &user.user_id, &ready.face, ready.name.as_deref()),
            )
            .await;

        match result {
            Ok(action) => {
                info!("✅ {}: face {} for {}", device.id, action.as_str(), user.user_id);
                SyncOutcome::success(&device.id, &user.user_id, SyncPhase::Face, started.elapsed())
                    .with_face(action)
            }
            Err(e) => {
                warn!("⚠️ {}: face for {} failed: {}", device.id, user.user_id, e);
                SyncOutcome::failure(&device.id, &user.user_id, SyncPhase::Face, &e, started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::digest::DigestClient;
    use crate::client::transfer::TransferClient;
    use crate::common::config::{DeviceConfig, TransferConfig};
    use crate::discovery::registry::DeviceDirectory;
    use crate::processing::face::tests::jpeg_base64;
    use async_trait::async_trait;

    struct BrokenRegistry;

    #[async_trait]
    impl DeviceRegistry for BrokenRegistry {
        async fn list_devices(&self) -> anyhow::Result<Vec<DeviceConnection>> {
            anyhow::bail!("database offline")
        }
    }

    fn scheduler(registry: Arc<dyn DeviceRegistry>) -> SyncScheduler {
        let transfer = TransferClient::new(&TransferConfig::default()).unwrap();
        let adapter = DeviceAdapter::new(DigestClient::new(transfer), &DeviceConfig::default());
        SyncScheduler::new(adapter, registry, SchedulerConfig::default(), FaceLimiter::new(2))
    }

    #[tokio::test]
    async fn test_face_limiter_bounds_permits() {
        let limiter = FaceLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);

        let shared = limiter.clone();
        let permit = limiter.acquire().await.unwrap();
        assert_eq!(shared.available(), 0);
        drop(permit);
        assert_eq!(shared.available(), 1);

        let value = shared.run(async { Ok::<_, SyncError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_registry_failure_is_fatal() {
        let scheduler = scheduler(Arc::new(BrokenRegistry));
        let err = scheduler
            .sync_users_to_devices(&[UserSyncItem::new("1", "Alice")], 2)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::RegistryUnavailable(ref m) if m.contains("database offline")));
    }

    #[tokio::test]
    async fn test_empty_registry_is_a_no_op() {
        let scheduler = scheduler(Arc::new(DeviceDirectory::new()));
        let report = scheduler
            .sync_users_to_devices(&[UserSyncItem::new("1", "Alice")], 2)
            .await
            .unwrap();
        assert!(report.devices.is_empty());
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_invalid_shape_propagates_before_registry() {
        let scheduler = scheduler(Arc::new(BrokenRegistry));
        let users = [
            UserSyncItem::new("1", "Alice"),
            UserSyncItem::new("2", "Bob")
                .with_face_base64("/9j/")
                .with_face_url("http://x/y.jpg"),
        ];
        let err = scheduler.sync_users_to_devices(&users, 2).await.unwrap_err();
        assert!(matches!(err, SyncError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_prepare_faces_validates_once() {
        let scheduler = scheduler(Arc::new(DeviceDirectory::new()));
        let users = [
            UserSyncItem::new("1", "Alice").with_face_base64(jpeg_base64(32, 32)),
            UserSyncItem::new("2", "Bob").with_face_base64("iVBORw0KGgo="),
            UserSyncItem::new("3", "Carol"),
        ];

        let faces = scheduler.prepare_faces(&users).await;
        assert_eq!(faces.len(), 2);
        assert!(faces[&0].is_ok());
        assert!(matches!(faces[&1], Err(SyncError::Validation(_))));
        assert!(!faces.contains_key(&2));
    }

    #[tokio::test]
    async fn test_prepare_faces_keeps_repeated_ids_apart() {
        let scheduler = scheduler(Arc::new(DeviceDirectory::new()));
        let users = [
            UserSyncItem::new("7", "Alice").with_face_base64(jpeg_base64(32, 32)),
            UserSyncItem::new("7", "Alice").with_face_base64("not*base64!"),
        ];

        let faces = scheduler.prepare_faces(&users).await;
        assert_eq!(faces.len(), 2);
        assert!(faces[&0].is_ok());
        assert!(matches!(faces[&1], Err(SyncError::Validation(_))));
    }
}
