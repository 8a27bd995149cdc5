//! # Digest Auth Client
//!
//! RFC 2617 challenge/response against a single terminal endpoint, `qop=auth`
//! and MD5 only.
//!
//! ## Exchange
//!
//! 1. Probe without `Authorization` (POST probes carry an empty body)
//! 2. Anything but 401 is returned as the final answer
//! 3. On 401, parse the `WWW-Authenticate: Digest ...` challenge
//! 4. Reissue the original request once with the computed `Authorization`
//!
//! A challenge is used for exactly one request: `nc` is always `00000001` and
//! every handshake draws a fresh client nonce. Each leg of the exchange is a
//! single [`TransferClient`] call; a retry always starts over from the probe.

use bytes::Bytes;
use log::{debug, warn};
use md5::{Digest, Md5};
use reqwest::header::{HeaderValue, AUTHORIZATION, WWW_AUTHENTICATE};
use reqwest::{Method, StatusCode};
use std::time::Duration;
use tokio::time::sleep;

use super::transfer::{HttpRequest, HttpResponse, TransferClient};
use crate::common::error::{SyncError, SyncResult};
use crate::common::models::{Credentials, DeviceConnection};

/// Nonce count sent with every response; challenges are never reused.
pub const NONCE_COUNT: &str = "00000001";

/// A parsed `WWW-Authenticate: Digest` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestChallenge {
    pub realm: String,
    pub nonce: String,
    pub qop: String,
    pub opaque: Option<String>,
}

impl DigestChallenge {
    /// Parses a challenge header value.
    ///
    /// Parameter values may be quoted strings (commas allowed inside) or bare
    /// tokens. `qop` defaults to `auth`; a `qop` list must offer `auth`.
    ///
    /// # Errors
    /// - `Protocol` if the scheme is not Digest, `realm`/`nonce` is missing,
    ///   `auth` is not offered, or the algorithm is not MD5
    pub fn parse(header: &str) -> SyncResult<Self> {
        let header = header.trim();
        let params = match header.split_once(char::is_whitespace) {
            Some((scheme, rest)) if scheme.eq_ignore_ascii_case("digest") => rest,
            _ => {
                return Err(SyncError::Protocol(format!(
                    "expected a Digest challenge, got {:?}",
                    header
                )))
            }
        };

        let mut realm = None;
        let mut nonce = None;
        let mut qop = None;
        let mut opaque = None;
        let mut algorithm = None;

        for part in split_params(params) {
            let Some((key, value)) = part.split_once('=') else {
                continue;
            };
            let value = unquote(value.trim());
            match key.trim().to_ascii_lowercase().as_str() {
                "realm" => realm = Some(value),
                "nonce" => nonce = Some(value),
                "qop" => qop = Some(value),
                "opaque" => opaque = Some(value),
                "algorithm" => algorithm = Some(value),
                _ => {}
            }
        }

        let realm = realm.ok_or_else(|| SyncError::Protocol("challenge without realm".into()))?;
        let nonce = nonce
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SyncError::Protocol("challenge without nonce".into()))?;

        if let Some(algorithm) = algorithm {
            if !algorithm.eq_ignore_ascii_case("md5") {
                return Err(SyncError::Protocol(format!(
                    "unsupported digest algorithm {}",
                    algorithm
                )));
            }
        }

        let qop = match qop {
            None => "auth".to_string(),
            Some(offered) => {
                if !offered.split(',').any(|q| q.trim() == "auth") {
                    return Err(SyncError::Protocol(format!(
                        "unsupported qop {:?}",
                        offered
                    )));
                }
                "auth".to_string()
            }
        };

        Ok(Self {
            realm,
            nonce,
            qop,
            opaque,
        })
    }

    /// Computes `MD5(HA1:nonce:nc:cnonce:qop:HA2)` as 32 lowercase hex chars.
    pub fn response(
        &self,
        username: &str,
        password: &str,
        method: &Method,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let ha1 = md5_hex(&format!("{}:{}:{}", username, self.realm, password));
        let ha2 = md5_hex(&format!("{}:{}", method.as_str(), uri));
        md5_hex(&format!(
            "{}:{}:{}:{}:{}:{}",
            ha1, self.nonce, NONCE_COUNT, cnonce, self.qop, ha2
        ))
    }

    /// Builds the full `Authorization` header value.
    pub fn authorization(
        &self,
        username: &str,
        password: &str,
        method: &Method,
        uri: &str,
        cnonce: &str,
    ) -> String {
        let response = self.response(username, password, method, uri, cnonce);
        let mut header = format!(
            "Digest username=\"{}\", realm=\"{}\", nonce=\"{}\", uri=\"{}\", qop={}, nc={}, cnonce=\"{}\", response=\"{}\"",
            username, self.realm, self.nonce, uri, self.qop, NONCE_COUNT, cnonce, response
        );
        if let Some(opaque) = &self.opaque {
            header.push_str(&format!(", opaque=\"{}\"", opaque));
        }
        header
    }
}

fn md5_hex(input: &str) -> String {
    hex::encode(Md5::digest(input.as_bytes()))
}

/// Fresh 16-hex-char client nonce.
pub fn new_cnonce() -> String {
    hex::encode(rand::random::<[u8; 8]>())
}

/// Splits challenge parameters on commas outside quoted strings.
fn split_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut in_quotes = false;
    let mut escaped = false;
    let mut start = 0;

    for (i, c) in params.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(params[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(params[start..].trim());
    parts.retain(|p| !p.is_empty());
    parts
}

fn unquote(value: &str) -> String {
    match value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
    {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

// ============================================================================
// CLIENT
// ============================================================================

/// Performs one authenticated request against a terminal.
#[derive(Debug, Clone)]
pub struct DigestClient {
    transfer: TransferClient,
}

impl DigestClient {
    pub fn new(transfer: TransferClient) -> Self {
        Self { transfer }
    }

    pub fn transfer(&self) -> &TransferClient {
        &self.transfer
    }

    /// Sends `request` to `device` using the transfer client's defaults.
    pub async fn request_with_digest(
        &self,
        device: &DeviceConnection,
        request: &HttpRequest,
    ) -> SyncResult<HttpResponse> {
        self.request(
            device,
            request,
            self.transfer.policy().max_retries,
            self.transfer.timeout(),
        )
        .await
    }

    /// Sends `request` to `device`, answering a digest challenge if one comes.
    ///
    /// Both legs of a handshake are sent once. A retryable failure on either
    /// leg starts a new handshake with a fresh probe, up to `retries` times,
    /// so an `Authorization` header is never sent twice. Token and
    /// credential-less devices carry no challenge state and use
    /// [`TransferClient::fetch_with_retry`] directly.
    ///
    /// # Returns
    /// - The probe response when it is not a 401
    /// - Otherwise the response to the authorized request, whatever its status
    ///
    /// # Errors
    /// - `Protocol` if the 401 lacks a usable Digest challenge, or the device
    ///   answers 401 without having a username/password
    /// - Transport errors from the transfer client
    pub async fn request(
        &self,
        device: &DeviceConnection,
        request: &HttpRequest,
        retries: u32,
        timeout: Duration,
    ) -> SyncResult<HttpResponse> {
        let (username, password) = match device.credentials() {
            Credentials::Token(token) => {
                let value = HeaderValue::from_str(&token).map_err(|_| {
                    SyncError::InvalidInput(format!(
                        "device {} has a token that is not a valid header value",
                        device.id
                    ))
                })?;
                let authorized = request.clone().with_header(AUTHORIZATION, value);
                let response = self
                    .transfer
                    .fetch_with_retry(&authorized, retries, timeout)
                    .await?;
                return reject_unauthorized(device, response, "refused its token");
            }
            Credentials::None => {
                let response = self
                    .transfer
                    .fetch_with_retry(request, retries, timeout)
                    .await?;
                return reject_unauthorized(
                    device,
                    response,
                    "demands authentication but has no credentials",
                );
            }
            Credentials::Digest { username, password } => (username, password),
        };

        let mut last_error = None;
        for handshake in 0..=retries {
            if handshake > 0 {
                let delay = self.transfer.policy().delay_for_attempt(handshake - 1);
                debug!(
                    "🔄 Handshake {}/{} with {} for {} in {:?}",
                    handshake + 1,
                    retries + 1,
                    device.id,
                    request.uri(),
                    delay
                );
                sleep(delay).await;
            }

            match self
                .handshake(device, request, username, password, timeout)
                .await
            {
                Err(e) if e.is_retryable() => {
                    warn!(
                        "{}: handshake for {} failed ({}/{}): {}",
                        device.id,
                        request.uri(),
                        handshake + 1,
                        retries + 1,
                        e
                    );
                    last_error = Some(e);
                }
                result => return result,
            }
        }

        Err(last_error.unwrap_or_else(|| SyncError::transient("no handshake was made")))
    }

    /// One probe and, on a challenge, one authorized request.
    async fn handshake(
        &self,
        device: &DeviceConnection,
        request: &HttpRequest,
        username: &str,
        password: &str,
        timeout: Duration,
    ) -> SyncResult<HttpResponse> {
        let probe = if request.method == Method::GET || request.method == Method::HEAD {
            request.clone()
        } else {
            request.clone().with_body(Bytes::new())
        };
        let first = self.transfer.fetch_with_retry(&probe, 0, timeout).await?;
        if first.status != StatusCode::UNAUTHORIZED {
            return Ok(first);
        }

        let header = first
            .headers
            .get_all(WWW_AUTHENTICATE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find(|v| {
                v.trim_start()
                    .get(..6)
                    .is_some_and(|s| s.eq_ignore_ascii_case("digest"))
            })
            .ok_or_else(|| {
                SyncError::Protocol(format!(
                    "device {} answered 401 without a Digest challenge",
                    device.id
                ))
            })?;
        let challenge = DigestChallenge::parse(header)?;

        let uri = request.uri();
        let authorization =
            challenge.authorization(username, password, &request.method, &uri, &new_cnonce());
        let value = HeaderValue::from_str(&authorization)
            .map_err(|e| SyncError::Protocol(format!("unusable challenge values: {}", e)))?;
        debug!(
            "🔐 Digest challenge from {} (realm {:?}), retrying {} {}",
            device.id, challenge.realm, request.method, uri
        );

        let authorized = request.clone().with_header(AUTHORIZATION, value);
        self.transfer.fetch_with_retry(&authorized, 0, timeout).await
    }
}

fn reject_unauthorized(
    device: &DeviceConnection,
    response: HttpResponse,
    reason: &str,
) -> SyncResult<HttpResponse> {
    if response.status == StatusCode::UNAUTHORIZED {
        return Err(SyncError::Protocol(format!("device {} {}", device.id, reason)));
    }
    Ok(response)
}
