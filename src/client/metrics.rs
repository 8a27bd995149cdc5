//! # Sync Reports
//!
//! Per-(device, user) outcomes of a sync run and their aggregation.
//!
//! Outcomes are returned from the futures that produced them and collected by
//! the scheduler, so no locking is involved. A [`SyncReport`] can be
//! summarised with [`SyncReport::aggregate`] or written out as JSON.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

use super::device::FaceUpsert;
use crate::common::error::{ErrorKind, SyncError};

/// Which half of a device sync produced an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Metadata,
    Face,
}

/// Result for one user on one device in one phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub device_id: String,
    pub user_id: String,
    pub phase: SyncPhase,
    pub ok: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: Option<String>,
    /// Set for successful face uploads
    pub face: Option<FaceUpsert>,
    pub latency_ms: u64,
}

impl SyncOutcome {
    pub fn success(device_id: &str, user_id: &str, phase: SyncPhase, latency: Duration) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            phase,
            ok: true,
            error_kind: None,
            detail: None,
            face: None,
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn failure(
        device_id: &str,
        user_id: &str,
        phase: SyncPhase,
        error: &SyncError,
        latency: Duration,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            user_id: user_id.to_string(),
            phase,
            ok: false,
            error_kind: Some(error.kind()),
            detail: Some(error.to_string()),
            face: None,
            latency_ms: latency.as_millis() as u64,
        }
    }

    pub fn with_face(mut self, face: FaceUpsert) -> Self {
        self.face = Some(face);
        self
    }
}

/// Everything that happened on one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeviceReport {
    pub device_id: String,
    pub outcomes: Vec<SyncOutcome>,
}

impl DeviceReport {
    pub fn new(device_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            outcomes: Vec::new(),
        }
    }

    pub fn succeeded(&self) -> usize {
        self.outcomes.iter().filter(|o| o.ok).count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.ok).count()
    }

    pub fn outcomes_in(&self, phase: SyncPhase) -> impl Iterator<Item = &SyncOutcome> {
        self.outcomes.iter().filter(move |o| o.phase == phase)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStats {
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct AggregatedStats {
    pub total_devices: usize,
    pub total_outcomes: usize,
    pub successful: usize,
    pub failed: usize,
    pub failure_rate: f64,

    pub metadata_failures: usize,
    pub face_failures: usize,

    pub faces_added: usize,
    pub faces_updated: usize,
    pub faces_already_present: usize,

    // Face upload latency, successful uploads only (milliseconds)
    pub face_latency_min_ms: u64,
    pub face_latency_max_ms: u64,
    pub face_latency_avg_ms: f64,
    pub face_latency_p50_ms: u64,
    pub face_latency_p95_ms: u64,

    pub device_breakdown: HashMap<String, DeviceStats>,

    // Failures per error kind
    pub failure_kinds: HashMap<String, usize>,
}

/// All outcomes of one `sync_users_to_devices` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub devices: Vec<DeviceReport>,
}

impl Default for SyncReport {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncReport {
    pub fn new() -> Self {
        Self {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: None,
            devices: Vec::new(),
        }
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn device(&self, device_id: &str) -> Option<&DeviceReport> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn outcomes(&self) -> impl Iterator<Item = &SyncOutcome> {
        self.devices.iter().flat_map(|d| d.outcomes.iter())
    }

    pub fn aggregate(&self) -> AggregatedStats {
        let mut stats = AggregatedStats {
            total_devices: self.devices.len(),
            ..Default::default()
        };

        for device in &self.devices {
            stats.device_breakdown.insert(
                device.device_id.clone(),
                DeviceStats {
                    succeeded: device.succeeded(),
                    failed: device.failed(),
                },
            );
        }

        stats.total_outcomes = self.outcomes().count();
        if stats.total_outcomes == 0 {
            return stats;
        }

        stats.successful = self.outcomes().filter(|o| o.ok).count();
        stats.failed = stats.total_outcomes - stats.successful;
        stats.failure_rate = (stats.failed as f64 / stats.total_outcomes as f64) * 100.0;

        for outcome in self.outcomes() {
            match (outcome.ok, outcome.phase) {
                (false, SyncPhase::Metadata) => stats.metadata_failures += 1,
                (false, SyncPhase::Face) => stats.face_failures += 1,
                _ => {}
            }
            match outcome.face {
                Some(FaceUpsert::Added) => stats.faces_added += 1,
                Some(FaceUpsert::Updated) => stats.faces_updated += 1,
                Some(FaceUpsert::AlreadyPresent) => stats.faces_already_present += 1,
                None => {}
            }
            if let Some(kind) = outcome.error_kind {
                *stats
                    .failure_kinds
                    .entry(kind.as_str().to_string())
                    .or_insert(0) += 1;
            }
        }

        let mut face_latencies: Vec<u64> = self
            .outcomes()
            .filter(|o| o.ok && o.phase == SyncPhase::Face)
            .map(|o| o.latency_ms)
            .collect();

        if !face_latencies.is_empty() {
            face_latencies.sort_unstable();

            stats.face_latency_min_ms = face_latencies[0];
            stats.face_latency_max_ms = face_latencies[face_latencies.len() - 1];
            stats.face_latency_avg_ms =
                face_latencies.iter().sum::<u64>() as f64 / face_latencies.len() as f64;
            stats.face_latency_p50_ms = percentile(&face_latencies, 50.0);
            stats.face_latency_p95_ms = percentile(&face_latencies, 95.0);
        }

        stats
    }

    pub fn export_to_json<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let stats = self.aggregate();

        let output = serde_json::json!({
            "run_id": self.run_id,
            "started_at": self.started_at,
            "finished_at": self.finished_at,
            "aggregated_stats": stats,
            "devices": self.devices,
        });

        let json_string = serde_json::to_string_pretty(&output)?;
        let mut file = File::create(path)?;
        file.write_all(json_string.as_bytes())?;

        Ok(())
    }
}

fn percentile(sorted_data: &[u64], percentile: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }

    let index = (percentile / 100.0 * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[index.min(sorted_data.len() - 1)]
}
