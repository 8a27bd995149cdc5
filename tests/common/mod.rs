#![allow(dead_code)]

use base64::{engine::general_purpose::STANDARD, Engine as _};
use md5::{Digest, Md5};
use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use wiremock::{MockServer, Request, Respond, ResponseTemplate};

use terminal_sync::common::config::{DeviceConfig, TransferConfig};
use terminal_sync::{
    DeviceAdapter, DeviceConnection, DeviceDirectory, FaceLimiter, SyncConfig, SyncScheduler,
};

pub const USERNAME: &str = "admin";
pub const PASSWORD: &str = "secret";
pub const REALM: &str = "Login to 9F2C1E";
pub const NONCE: &str = "58ab1f03cf4e2a7b";
pub const OPAQUE: &str = "b8d2c1a0";

pub const USER_PATH: &str = "/cgi-bin/AccessUser.cgi";
pub const FACE_PATH: &str = "/cgi-bin/FaceInfoManager.cgi";

/// Config with tiny delays so retry tests run fast.
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.transfer = TransferConfig {
        timeout_ms: 2_000,
        connect_timeout_ms: 1_000,
        max_retries: 2,
        base_delay_ms: 5,
        max_delay_ms: 20,
        jitter_ms: 5,
        max_redirects: 3,
    };
    config.device = DeviceConfig {
        attempts: 1,
        ping_timeout_ms: 500,
    };
    config.scheduler.request_concurrency = 2;
    config
}

pub fn device_for(server: &MockServer, id: &str) -> DeviceConnection {
    let addr = server.address();
    DeviceConnection::new(id, addr.ip().to_string(), USERNAME, PASSWORD).with_port(addr.port())
}

pub fn adapter(config: &SyncConfig) -> DeviceAdapter {
    DeviceAdapter::from_config(config).unwrap()
}

pub fn scheduler(config: &SyncConfig, devices: Vec<DeviceConnection>) -> SyncScheduler {
    SyncScheduler::new(
        adapter(config),
        Arc::new(DeviceDirectory::from_devices(devices)),
        config.scheduler.clone(),
        FaceLimiter::new(config.scheduler.face_concurrency),
    )
}

pub fn jpeg_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(width, height, image::Rgb([200, 180, 160]));
    let mut out = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Jpeg)
        .unwrap();
    out
}

pub fn jpeg_base64(width: u32, height: u32) -> String {
    STANDARD.encode(jpeg_bytes(width, height))
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Parses `key="value", key=value` pairs of an Authorization header.
pub fn digest_params(header: &str) -> HashMap<String, String> {
    header
        .trim_start_matches("Digest ")
        .split(", ")
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.to_string(), v.trim_matches('"').to_string()))
        .collect()
}

pub fn path_and_query(request: &Request) -> String {
    match request.url.query() {
        Some(q) => format!("{}?{}", request.url.path(), q),
        None => request.url.path().to_string(),
    }
}

/// Checks an Authorization header the way a terminal would.
pub fn digest_is_valid(request: &Request, header: &str) -> bool {
    let params = digest_params(header);
    let get = |k: &str| params.get(k).map(String::as_str).unwrap_or_default();

    if get("username") != USERNAME
        || get("realm") != REALM
        || get("nonce") != NONCE
        || get("opaque") != OPAQUE
        || get("qop") != "auth"
        || get("nc") != "00000001"
        || get("uri") != path_and_query(request)
    {
        return false;
    }

    let ha1 = md5_hex(&format!("{}:{}:{}", USERNAME, REALM, PASSWORD));
    let ha2 = md5_hex(&format!("{}:{}", request.method.as_str(), get("uri")));
    let expected = md5_hex(&format!(
        "{}:{}:00000001:{}:auth:{}",
        ha1,
        NONCE,
        get("cnonce"),
        ha2
    ));
    get("response") == expected
}

/// A terminal endpoint behind digest auth answering `status` / `body`.
pub struct DigestTerminal {
    pub status: u16,
    pub body: String,
}

impl DigestTerminal {
    pub fn ok() -> Self {
        Self::answering(200, "OK")
    }

    pub fn answering(status: u16, body: &str) -> Self {
        Self {
            status,
            body: body.to_string(),
        }
    }
}

impl Respond for DigestTerminal {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        match request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        {
            Some(header) if digest_is_valid(request, header) => {
                ResponseTemplate::new(self.status).set_body_string(self.body.clone())
            }
            Some(_) => ResponseTemplate::new(403).set_body_string("bad digest"),
            None => challenge(),
        }
    }
}

fn challenge() -> ResponseTemplate {
    ResponseTemplate::new(401).insert_header(
        "WWW-Authenticate",
        format!(
            r#"Digest realm="{}", qop="auth", nonce="{}", opaque="{}""#,
            REALM, NONCE, OPAQUE
        ),
    )
}

/// A terminal that answers 503 to its first `failures` authorized requests
/// and treats a repeated client nonce as a stale replay.
pub struct FlakyTerminal {
    failures: AtomicUsize,
    seen: Mutex<HashSet<String>>,
}

impl FlakyTerminal {
    pub fn failing_first(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            seen: Mutex::new(HashSet::new()),
        }
    }
}

impl Respond for FlakyTerminal {
    fn respond(&self, request: &Request) -> ResponseTemplate {
        let header = match request
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
        {
            Some(header) if digest_is_valid(request, header) => header,
            Some(_) => return ResponseTemplate::new(403).set_body_string("bad digest"),
            None => return challenge(),
        };

        let cnonce = digest_params(header)["cnonce"].clone();
        if !self.seen.lock().unwrap().insert(cnonce) {
            return challenge().set_body_string("stale");
        }
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return ResponseTemplate::new(503).set_body_string("busy");
        }
        ResponseTemplate::new(200).set_body_string("OK")
    }
}

pub async fn requests_to(server: &MockServer, path: &str, action: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|r| {
            r.url.path() == path && r.url.query_pairs().any(|(k, v)| k == "action" && v == action)
        })
        .collect()
}

pub fn is_authorized(request: &Request) -> bool {
    request.headers.contains_key("authorization")
}
