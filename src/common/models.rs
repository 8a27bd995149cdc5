//! # Data Model
//!
//! Records handed to the sync engine and the vendor CGI payloads built from them.
//!
//! - [`UserSyncItem`]: one employee to enroll, optionally carrying a face
//! - [`DeviceConnection`]: one physical access-control terminal
//! - [`InsertUsersBody`] / [`FaceInfoBody`]: bit-exact JSON bodies for the terminal CGI API
//!
//! Both input records are read-only once handed to the scheduler.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use super::error::{SyncError, SyncResult};

/// Longest person identifier a terminal accepts.
pub const MAX_PERSON_ID_LEN: usize = 64;

/// Longest display name a terminal accepts.
pub const MAX_NAME_CHARS: usize = 32;

// ============================================================================
// USERS
// ============================================================================

/// One employee record to push to every terminal.
///
/// At most one of `face_image_base64` / `face_url` is set when a face should be
/// enrolled; with neither, only metadata is synced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserSyncItem {
    pub user_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citizen_id_no: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_image_base64: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub face_url: Option<String>,
}

impl UserSyncItem {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            citizen_id_no: None,
            face_image_base64: None,
            face_url: None,
        }
    }

    pub fn with_citizen_id(mut self, citizen_id_no: impl Into<String>) -> Self {
        self.citizen_id_no = Some(citizen_id_no.into());
        self
    }

    pub fn with_face_base64(mut self, face: impl Into<String>) -> Self {
        self.face_image_base64 = Some(face.into());
        self
    }

    pub fn with_face_url(mut self, url: impl Into<String>) -> Self {
        self.face_url = Some(url.into());
        self
    }

    /// True when the record asks for a face enrollment.
    pub fn has_face(&self) -> bool {
        self.face_image_base64.is_some() || self.face_url.is_some()
    }

    /// Display name as sent to terminals: trimmed and cut to 32 characters.
    pub fn display_name(&self) -> String {
        self.name.trim().chars().take(MAX_NAME_CHARS).collect()
    }

    /// Rejects records that can never be synced.
    ///
    /// # Errors
    /// - `InvalidInput` if the user id is malformed, the name is blank, or both
    ///   face sources are present
    pub fn check_shape(&self) -> SyncResult<()> {
        if !is_valid_person_id(&self.user_id) {
            return Err(SyncError::InvalidInput(format!(
                "userId {:?} must match [A-Za-z0-9_-:.@]{{1,64}}",
                self.user_id
            )));
        }
        if self.name.trim().is_empty() {
            return Err(SyncError::InvalidInput(format!(
                "user {} has an empty name",
                self.user_id
            )));
        }
        if self.face_image_base64.is_some() && self.face_url.is_some() {
            return Err(SyncError::InvalidInput(format!(
                "user {} carries both faceImageBase64 and faceUrl",
                self.user_id
            )));
        }
        Ok(())
    }
}

/// Checks an identifier against `^[\w\-:.@]{1,64}$` (ASCII word characters).
pub fn is_valid_person_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_PERSON_ID_LEN
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ':' | '.' | '@'))
}

// ============================================================================
// DEVICES
// ============================================================================

/// URL scheme of a terminal's management API.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    #[default]
    Http,
    Https,
}

impl Scheme {
    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }

    pub fn default_port(self) -> u16 {
        match self {
            Scheme::Http => 80,
            Scheme::Https => 443,
        }
    }
}

/// Connection details for one terminal, owned by the device registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConnection {
    /// Registry identifier used in logs and reports
    pub id: String,
    /// IP address or hostname
    pub host: String,
    /// Management port; defaults to 80 / 443 by scheme
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub scheme: Scheme,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Opaque bearer/basic token used instead of digest credentials
    #[serde(default)]
    pub api_token: Option<String>,
}

/// How requests to a terminal are authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credentials<'a> {
    /// HTTP Digest using a username/password pair.
    Digest { username: &'a str, password: &'a str },
    /// Pre-built `Authorization` header value.
    Token(String),
    /// Nothing configured.
    None,
}

impl DeviceConnection {
    pub fn new(
        id: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port: None,
            scheme: Scheme::Http,
            username: Some(username.into()),
            password: Some(password.into()),
            api_token: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.scheme.default_port())
    }

    /// `scheme://host:port`, without a trailing slash.
    pub fn base_url(&self) -> String {
        format!("{}://{}:{}", self.scheme.as_str(), self.host, self.port())
    }

    /// Resolves the credentials to use. Username/password wins over a token.
    pub fn credentials(&self) -> Credentials<'_> {
        match (&self.username, &self.password, &self.api_token) {
            (Some(username), password, _) if !username.is_empty() => Credentials::Digest {
                username,
                password: password.as_deref().unwrap_or(""),
            },
            (_, _, Some(token)) if !token.trim().is_empty() => {
                Credentials::Token(token_auth_header(token))
            }
            _ => Credentials::None,
        }
    }
}

/// Turns an opaque device token into an `Authorization` header value.
///
/// Values already carrying a `Basic`/`Bearer` scheme are kept; `user:pass`
/// becomes Basic; anything else is treated as a bearer token.
pub fn token_auth_header(token: &str) -> String {
    let trimmed = token.trim();
    let lower = trimmed.to_ascii_lowercase();
    if lower.starts_with("basic ") || lower.starts_with("bearer ") {
        trimmed.to_string()
    } else if trimmed.contains(':') {
        format!("Basic {}", STANDARD.encode(trimmed))
    } else {
        format!("Bearer {}", trimmed)
    }
}

/// Masks a secret for logging: `su***en`, or `***` for short values.
pub fn mask_secret(secret: &str) -> String {
    let chars: Vec<char> = secret.chars().collect();
    if chars.len() <= 4 {
        return "***".to_string();
    }
    let head: String = chars[..2].iter().collect();
    let tail: String = chars[chars.len() - 2..].iter().collect();
    format!("{}***{}", head, tail)
}

// ============================================================================
// VENDOR CGI PAYLOADS
// ============================================================================

/// Body of `POST /cgi-bin/AccessUser.cgi?action=insertMulti&format=json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InsertUsersBody {
    #[serde(rename = "UserData")]
    pub user_data: Vec<UserRecord>,
}

/// One entry of [`InsertUsersBody`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "UserName")]
    pub user_name: String,
    #[serde(rename = "CitizenIDNo", skip_serializing_if = "Option::is_none")]
    pub citizen_id_no: Option<String>,
}

impl From<&UserSyncItem> for UserRecord {
    fn from(user: &UserSyncItem) -> Self {
        Self {
            user_id: user.user_id.clone(),
            user_name: user.display_name(),
            citizen_id_no: user.citizen_id_no.clone(),
        }
    }
}

/// Body of `POST /cgi-bin/FaceInfoManager.cgi?action=add|update&format=json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceInfoBody {
    #[serde(rename = "UserID")]
    pub user_id: String,
    #[serde(rename = "Info")]
    pub info: FaceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceInfo {
    #[serde(rename = "PhotoData")]
    pub photo_data: Vec<String>,
    #[serde(rename = "UserName", skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_person_id_charset() {
        assert!(is_valid_person_id("emp-0001"));
        assert!(is_valid_person_id("a.b:c@d_e"));
        assert!(!is_valid_person_id(""));
        assert!(!is_valid_person_id("has space"));
        assert!(!is_valid_person_id("nguyễn"));
        assert!(!is_valid_person_id(&"x".repeat(65)));
        assert!(is_valid_person_id(&"x".repeat(64)));
    }

    #[test]
    fn test_check_shape() {
        assert!(UserSyncItem::new("1", "Alice").check_shape().is_ok());
        assert!(UserSyncItem::new("1", "   ").check_shape().is_err());
        assert!(UserSyncItem::new("bad id", "Alice").check_shape().is_err());

        let both = UserSyncItem::new("1", "Alice")
            .with_face_base64("/9j/")
            .with_face_url("http://img");
        assert!(matches!(both.check_shape(), Err(SyncError::InvalidInput(_))));
    }

    #[test]
    fn test_user_deserializes_camel_case() {
        let user: UserSyncItem = serde_json::from_str(
            r#"{"userId":"7","name":"Bob","citizenIdNo":"0123","faceUrl":"http://x/y.jpg"}"#,
        )
        .unwrap();
        assert_eq!(user.user_id, "7");
        assert_eq!(user.citizen_id_no.as_deref(), Some("0123"));
        assert!(user.has_face());
        assert!(user.face_image_base64.is_none());
    }

    #[test]
    fn test_display_name_truncates() {
        let user = UserSyncItem::new("1", format!("  {}  ", "n".repeat(40)));
        assert_eq!(user.display_name().chars().count(), MAX_NAME_CHARS);
    }

    #[test]
    fn test_base_url_defaults_port_by_scheme() {
        let device = DeviceConnection::new("d1", "10.0.0.1", "admin", "pass");
        assert_eq!(device.base_url(), "http://10.0.0.1:80");

        let device = device.with_scheme(Scheme::Https);
        assert_eq!(device.base_url(), "https://10.0.0.1:443");

        let device = device.with_port(8443);
        assert_eq!(device.base_url(), "https://10.0.0.1:8443");
    }

    #[test]
    fn test_credentials_resolution() {
        let device = DeviceConnection::new("d1", "10.0.0.1", "admin", "pass");
        assert_eq!(
            device.credentials(),
            Credentials::Digest {
                username: "admin",
                password: "pass"
            }
        );

        let mut token_device = device.clone();
        token_device.username = None;
        token_device.password = None;
        token_device.api_token = Some("abc123".into());
        assert_eq!(
            token_device.credentials(),
            Credentials::Token("Bearer abc123".into())
        );

        token_device.api_token = None;
        assert_eq!(token_device.credentials(), Credentials::None);
    }

    #[test]
    fn test_token_auth_header() {
        assert_eq!(token_auth_header("Bearer abc"), "Bearer abc");
        assert_eq!(token_auth_header("basic Zm9v"), "basic Zm9v");
        assert_eq!(token_auth_header("admin:pass"), "Basic YWRtaW46cGFzcw==");
        assert_eq!(token_auth_header("tok"), "Bearer tok");
    }

    #[test]
    fn test_mask_secret() {
        assert_eq!(mask_secret("supersecrettoken"), "su***en");
        assert_eq!(mask_secret("abc"), "***");
    }

    #[test]
    fn test_insert_users_body_wire_format() {
        let users = [
            UserSyncItem::new("1", "Alice").with_citizen_id("0790"),
            UserSyncItem::new("2", "Bob"),
        ];
        let body = InsertUsersBody {
            user_data: users.iter().map(UserRecord::from).collect(),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "UserData": [
                    { "UserID": "1", "UserName": "Alice", "CitizenIDNo": "0790" },
                    { "UserID": "2", "UserName": "Bob" }
                ]
            })
        );
    }

    #[test]
    fn test_face_body_wire_format() {
        let body = FaceInfoBody {
            user_id: "1".into(),
            info: FaceInfo {
                photo_data: vec!["/9j/AA==".into()],
                user_name: Some("U1".into()),
            },
        };
        assert_eq!(
            serde_json::to_value(&body).unwrap(),
            serde_json::json!({ "UserID": "1", "Info": { "PhotoData": ["/9j/AA=="], "UserName": "U1" } })
        );
    }
}
