//! # Device Adapter
//!
//! Maps logical operations onto the terminal CGI API:
//!
//! | Operation | Endpoint |
//! |---|---|
//! | insert users | `POST /cgi-bin/AccessUser.cgi?action=insertMulti&format=json` |
//! | add face | `POST /cgi-bin/FaceInfoManager.cgi?action=add&format=json` |
//! | update face | `POST /cgi-bin/FaceInfoManager.cgi?action=update&format=json` |
//! | ping | `GET /cgi-bin/magicBox.cgi?action=getDeviceType` |
//!
//! ## Retry layers
//!
//! Every call runs inside an outer loop of `attempts` full digest handshakes.
//! Inside each handshake, every single HTTP exchange has its own transport
//! retries ([`TransferClient`]). Only retryable errors restart the outer loop;
//! a definitive device answer never does.
//!
//! ## Face upsert
//!
//! Add first. A duplicate answer is an idempotent success
//! ([`FaceUpsert::AlreadyPresent`]) and skips the update. Any other rejection
//! falls through to update; when both are rejected the error carries both
//! failure bodies.

use log::{debug, info, warn};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio::time::sleep;

use super::digest::DigestClient;
use super::transfer::{truncate_body, HttpRequest, HttpResponse, TransferClient};
use crate::common::config::{DeviceConfig, SyncConfig, MAX_BATCH_SIZE};
use crate::common::error::{SyncError, SyncResult};
use crate::common::models::{
    DeviceConnection, FaceInfo, FaceInfoBody, InsertUsersBody, UserRecord, UserSyncItem,
};
use crate::processing::face::{encode_image, validate_face, NormalizedFace};

pub const USER_INSERT_PATH: &str = "/cgi-bin/AccessUser.cgi?action=insertMulti&format=json";
pub const FACE_ADD_PATH: &str = "/cgi-bin/FaceInfoManager.cgi?action=add&format=json";
pub const FACE_UPDATE_PATH: &str = "/cgi-bin/FaceInfoManager.cgi?action=update&format=json";
pub const DEVICE_TYPE_PATH: &str = "/cgi-bin/magicBox.cgi?action=getDeviceType";

/// Vendor code meaning "record already exists".
const DUPLICATE_CODE: i64 = 8;

const CODE_KEYS: [&str; 4] = ["Ret", "ret", "Code", "code"];
const DESCRIPTION_KEYS: [&str; 2] = ["Description", "desc"];
const NEGATED_EXIST: [&str; 5] = ["not exist", "no exist", "n't exist", "nonexist", "non-exist"];
const RESULT_LIST_KEYS: [&str; 6] = ["FaceList", "faceList", "RetList", "retList", "Data", "data"];

// ============================================================================
// REPLY CLASSIFICATION
// ============================================================================

/// How a terminal answered a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceReply {
    /// 2xx with the vendor success marker
    Success,
    /// 409, code 8, or an "already exists" description (negations excluded)
    Duplicate,
    /// Anything else, with a truncated reason
    Rejected(String),
}

/// Outcome of a face add: an explicit value instead of an error branch.
pub type AddResult = DeviceReply;

impl DeviceReply {
    /// Classifies a terminal answer.
    ///
    /// Success means 2xx and one of: empty body, a body starting with `OK`,
    /// or JSON whose code/`Status` is 0, `"0"`, `"ok"`, `"success"` or absent
    /// with no `error` object. Result lists (`FaceList`, `RetList`, `Data`)
    /// are judged by their first entry.
    pub fn classify(status: StatusCode, body: &str) -> Self {
        if status == StatusCode::CONFLICT {
            return Self::Duplicate;
        }

        let text = body.trim();
        let json = serde_json::from_str::<Value>(text).ok();
        if let Some(value) = &json {
            if is_duplicate(result_entry(value)) {
                return Self::Duplicate;
            }
        }

        if !status.is_success() {
            return Self::Rejected(format!("HTTP {}: {}", status.as_u16(), truncate_body(text)));
        }
        if text.is_empty() || text.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("ok")) {
            return Self::Success;
        }

        match json {
            Some(value) => {
                let has_error = value
                    .get("error")
                    .is_some_and(|e| e.is_object());
                if !has_error && is_success(result_entry(&value)) {
                    Self::Success
                } else {
                    Self::Rejected(format!("HTTP {}: {}", status.as_u16(), truncate_body(text)))
                }
            }
            None => Self::Rejected(format!("HTTP {}: {}", status.as_u16(), truncate_body(text))),
        }
    }

    pub fn from_response(response: &HttpResponse) -> Self {
        Self::classify(response.status, &response.text())
    }
}

/// The entry a verdict is read from: the first element of a nested result
/// list when there is one, otherwise the document itself.
fn result_entry(value: &Value) -> &Value {
    fn nested_list(value: &Value) -> Option<&Vec<Value>> {
        match value {
            Value::Array(items) => Some(items),
            Value::Object(map) => RESULT_LIST_KEYS
                .iter()
                .filter_map(|key| map.get(*key))
                .find_map(|inner| match inner {
                    Value::Array(items) => Some(items),
                    Value::Object(_) => nested_list(inner),
                    _ => None,
                }),
            _ => None,
        }
    }

    nested_list(value)
        .and_then(|items| items.first())
        .unwrap_or(value)
}

fn first_field<'a>(entry: &'a Value, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| entry.get(*key))
        .find(|v| !v.is_null())
}

fn is_duplicate(entry: &Value) -> bool {
    let code_is_duplicate = match first_field(entry, &CODE_KEYS) {
        Some(Value::Number(n)) => n.as_i64() == Some(DUPLICATE_CODE),
        Some(Value::String(s)) => s.trim() == DUPLICATE_CODE.to_string(),
        _ => false,
    };
    let description_reports_existing = first_field(entry, &DESCRIPTION_KEYS)
        .and_then(Value::as_str)
        .is_some_and(reports_existing);
    code_is_duplicate || description_reports_existing
}

/// "already exists" and the like, but not "not exist" / "does not exist".
fn reports_existing(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("exist") && !NEGATED_EXIST.iter().any(|n| lower.contains(n))
}

fn is_success(entry: &Value) -> bool {
    let code = first_field(entry, &CODE_KEYS).or_else(|| first_field(entry, &["Status"]));
    match code {
        None => true,
        Some(Value::Number(n)) => n.as_f64() == Some(0.0),
        Some(Value::String(s)) => {
            matches!(s.trim().to_ascii_lowercase().as_str(), "ok" | "0" | "success")
        }
        Some(_) => false,
    }
}

/// What `upsert_face` did on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaceUpsert {
    /// The add call succeeded
    Added,
    /// The add was rejected and the update succeeded
    Updated,
    /// The add reported a duplicate; no update was sent
    AlreadyPresent,
}

impl FaceUpsert {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Updated => "updated",
            Self::AlreadyPresent => "already_present",
        }
    }
}

// ============================================================================
// ADAPTER
// ============================================================================

/// Terminal operations on top of the digest and transfer clients.
#[derive(Debug, Clone)]
pub struct DeviceAdapter {
    digest: DigestClient,
    attempts: u32,
    ping_timeout: Duration,
}

impl DeviceAdapter {
    pub fn new(digest: DigestClient, config: &DeviceConfig) -> Self {
        Self {
            digest,
            attempts: config.attempts.max(1),
            ping_timeout: Duration::from_millis(config.ping_timeout_ms),
        }
    }

    /// Builds the whole client stack from a configuration file's sections.
    pub fn from_config(config: &SyncConfig) -> SyncResult<Self> {
        let transfer = TransferClient::new(&config.transfer)?;
        Ok(Self::new(DigestClient::new(transfer), &config.device))
    }

    pub fn transfer(&self) -> &TransferClient {
        self.digest.transfer()
    }

    /// Inserts up to ten users in one `insertMulti` call.
    ///
    /// A duplicate answer counts as success.
    ///
    /// # Errors
    /// - `InvalidInput` for an empty batch or more than ten users
    /// - `DeviceRejection` when the terminal refuses the batch
    /// - Transport errors once every attempt is used up
    pub async fn insert_user_batch(
        &self,
        device: &DeviceConnection,
        users: &[UserSyncItem],
    ) -> SyncResult<()> {
        if users.is_empty() || users.len() > MAX_BATCH_SIZE {
            return Err(SyncError::InvalidInput(format!(
                "user batch must hold 1..={} users, got {}",
                MAX_BATCH_SIZE,
                users.len()
            )));
        }

        let body = InsertUsersBody {
            user_data: users.iter().map(UserRecord::from).collect(),
        };
        let request = HttpRequest::post_json(endpoint(device, USER_INSERT_PATH)?, &body)?;
        let response = self.call(device, &request).await?;

        match DeviceReply::from_response(&response) {
            DeviceReply::Success | DeviceReply::Duplicate => {
                debug!("{}: inserted {} users", device.id, users.len());
                Ok(())
            }
            DeviceReply::Rejected(reason) => Err(SyncError::DeviceRejection {
                status: response.status.as_u16(),
                body: reason,
            }),
        }
    }

    /// Inserts a single user.
    pub async fn upsert_user(&self, device: &DeviceConnection, user: &UserSyncItem) -> SyncResult<()> {
        self.insert_user_batch(device, std::slice::from_ref(user))
            .await
    }

    /// Sends the face `add` call and classifies the answer.
    pub async fn add_face(
        &self,
        device: &DeviceConnection,
        user_id: &str,
        face: &NormalizedFace,
        name: Option<&str>,
    ) -> SyncResult<AddResult> {
        self.send_face(device, FACE_ADD_PATH, user_id, face, name)
            .await
    }

    /// Sends the face `update` call and classifies the answer.
    pub async fn update_face(
        &self,
        device: &DeviceConnection,
        user_id: &str,
        face: &NormalizedFace,
        name: Option<&str>,
    ) -> SyncResult<DeviceReply> {
        self.send_face(device, FACE_UPDATE_PATH, user_id, face, name)
            .await
    }

    /// Enrolls a validated face, falling back from add to update.
    ///
    /// # Returns
    /// - `Added`: add succeeded, update never called
    /// - `AlreadyPresent`: add reported a duplicate, update never called
    /// - `Updated`: add rejected, update succeeded
    ///
    /// # Errors
    /// - `FaceUpsertFailed` carrying both truncated bodies when add and update fail
    /// - Transport errors from the add call, returned without trying update
    pub async fn upsert_face(
        &self,
        device: &DeviceConnection,
        user_id: &str,
        face: &NormalizedFace,
        name: Option<&str>,
    ) -> SyncResult<FaceUpsert> {
        let add_reason = match self.add_face(device, user_id, face, name).await? {
            DeviceReply::Success => return Ok(FaceUpsert::Added),
            DeviceReply::Duplicate => {
                debug!("{}: face for {} already enrolled", device.id, user_id);
                return Ok(FaceUpsert::AlreadyPresent);
            }
            DeviceReply::Rejected(reason) => reason,
        };

        warn!(
            "{}: face add for {} rejected, trying update: {}",
            device.id, user_id, add_reason
        );

        let update_reason = match self.update_face(device, user_id, face, name).await {
            Ok(DeviceReply::Success) => return Ok(FaceUpsert::Updated),
            Ok(DeviceReply::Duplicate) => "update reported a duplicate record".to_string(),
            Ok(DeviceReply::Rejected(reason)) => reason,
            Err(e) => e.to_string(),
        };

        Err(SyncError::FaceUpsertFailed {
            add: add_reason,
            update: update_reason,
        })
    }

    /// Downloads a face image, validates it and enrolls it on one terminal.
    ///
    /// # Errors
    /// - `Http` / `Transient` / `Timeout` from the download
    /// - `Validation` when the image is not an acceptable JPEG
    /// - Anything [`upsert_face`](Self::upsert_face) returns
    pub async fn push_face_from_url(
        &self,
        device: &DeviceConnection,
        user_id: &str,
        name: &str,
        url: &str,
    ) -> SyncResult<FaceUpsert> {
        let retries = self.transfer().policy().max_retries;
        let bytes = self
            .transfer()
            .fetch_buffer_with_retry(url, retries)
            .await?;

        let validation = validate_face(user_id, Some(name), &encode_image(&bytes));
        let Some(face) = validation.normalized else {
            return Err(SyncError::Validation(validation.issues));
        };

        self.upsert_face(device, user_id, &face, validation.name.as_deref())
            .await
    }

    /// Checks that a terminal answers an authenticated request.
    ///
    /// Uses the short ping deadline and no retries; any failure is `false`.
    pub async fn ping(&self, device: &DeviceConnection) -> bool {
        let url = match endpoint(device, DEVICE_TYPE_PATH) {
            Ok(url) => url,
            Err(e) => {
                warn!("❌ {}: {}", device.id, e);
                return false;
            }
        };

        match self
            .digest
            .request(device, &HttpRequest::get(url), 0, self.ping_timeout)
            .await
        {
            Ok(response) if response.is_success() => {
                info!("✅ {} online ({})", device.id, device.base_url());
                true
            }
            Ok(response) => {
                warn!("❌ {} answered ping with {}", device.id, response.status);
                false
            }
            Err(e) => {
                warn!("❌ {} unreachable: {}", device.id, e);
                false
            }
        }
    }

    async fn send_face(
        &self,
        device: &DeviceConnection,
        path: &str,
        user_id: &str,
        face: &NormalizedFace,
        name: Option<&str>,
    ) -> SyncResult<DeviceReply> {
        let body = FaceInfoBody {
            user_id: user_id.to_string(),
            info: FaceInfo {
                photo_data: vec![face.base64.clone()],
                user_name: name.map(str::to_string),
            },
        };
        let request = HttpRequest::post_json(endpoint(device, path)?, &body)?;
        let response = self.call(device, &request).await?;
        Ok(DeviceReply::from_response(&response))
    }

    /// Runs the full digest handshake up to `attempts` times.
    async fn call(&self, device: &DeviceConnection, request: &HttpRequest) -> SyncResult<HttpResponse> {
        let mut attempt = 0;
        loop {
            match self.digest.request_with_digest(device, request).await {
                Err(e) if e.is_retryable() && attempt + 1 < self.attempts => {
                    let delay = self.transfer().policy().delay_for_attempt(attempt);
                    warn!(
                        "{}: {} failed (handshake {}/{}), retrying in {:?}: {}",
                        device.id,
                        request.uri(),
                        attempt + 1,
                        self.attempts,
                        delay,
                        e
                    );
                    sleep(delay).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

fn endpoint(device: &DeviceConnection, path: &str) -> SyncResult<Url> {
    Url::parse(&format!("{}{}", device.base_url(), path)).map_err(|e| {
        SyncError::InvalidInput(format!("device {} has an unusable address: {}", device.id, e))
    })
}
