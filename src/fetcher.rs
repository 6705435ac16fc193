//! Client for the remote reputation service.
//!
//! One authenticated `POST {host}/fetch` per run. The service answers with
//! either a change set or one of three scalar sentinels; those are mapped
//! to [`FetchOutcome`] / [`SyncError`] here so nothing downstream compares
//! strings.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, info};

use crate::config::{Filter, SecureString};
use crate::error::SyncError;
use crate::validation::normalize_host;

/// Full snapshots of large lists are big; refuse anything beyond this.
const MAX_RESPONSE_SIZE: usize = 256 * 1024 * 1024;

const SENTINEL_EMPTY: &str = "[]";
const SENTINEL_INVALID_TOKEN: &str = "-1";
const SENTINEL_SERVER_ERROR: &str = "2";

/// One remote change: block (`removed == false`) or unblock an address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub ip: String,
    pub removed: bool,
}

impl ChangeRecord {
    pub fn add(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            removed: false,
        }
    }

    pub fn remove(ip: &str) -> Self {
        Self {
            ip: ip.to_string(),
            removed: true,
        }
    }
}

/// Parsed change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncResponse {
    /// Processed in received order
    pub changes: Vec<ChangeRecord>,
    pub new_watermark: i64,
    /// The list is the complete remote state, not a delta
    pub is_full_snapshot: bool,
}

/// Successful fetch result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Changes(SyncResponse),
    /// Nothing changed since the watermark
    Empty,
}

/// Request body: `{"token": ..., "filter": {"since": ..., ...}}`
#[derive(Debug, Serialize)]
pub struct FetchRequest {
    pub token: SecureString,
    pub filter: Filter,
}

impl FetchRequest {
    /// Build the request; a forced or initial fetch asks for `since: 0`.
    pub fn new(token: &SecureString, filter: &Filter, force_full: bool) -> Self {
        let mut filter = filter.clone();
        if force_full || filter.since <= 0 {
            filter.since = 0;
        }
        Self {
            token: token.clone(),
            filter,
        }
    }

    pub fn is_full(&self) -> bool {
        self.filter.since == 0
    }
}

#[derive(Deserialize)]
struct WireResponse {
    #[serde(default)]
    ips: Vec<WireRecord>,
    #[serde(rename = "currentTimestamp")]
    current_timestamp: i64,
    #[serde(default)]
    full: bool,
}

#[derive(Deserialize)]
struct WireRecord {
    ip: String,
    #[serde(default, deserialize_with = "deserialize_flag")]
    deleted: bool,
}

/// `deleted` is `0|1` on the wire; accept booleans too.
fn deserialize_flag<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Int(i64),
        Bool(bool),
    }

    match Flag::deserialize(deserializer)? {
        Flag::Int(0) => Ok(false),
        Flag::Int(1) => Ok(true),
        Flag::Int(other) => Err(serde::de::Error::custom(format!(
            "invalid deleted flag {}, expected 0 or 1",
            other
        ))),
        Flag::Bool(b) => Ok(b),
    }
}

/// Map a response body to an outcome.
///
/// Sentinels may arrive bare (`-1`) or JSON-quoted (`"-1"`), with or
/// without a trailing newline.
pub fn parse_fetch_response(body: &str) -> Result<FetchOutcome, SyncError> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    let scalar = compact.trim_matches('"');

    match scalar {
        SENTINEL_EMPTY => return Ok(FetchOutcome::Empty),
        SENTINEL_INVALID_TOKEN => return Err(SyncError::InvalidToken),
        SENTINEL_SERVER_ERROR => return Err(SyncError::Server),
        "" => return Err(SyncError::Parse("empty response body".to_string())),
        _ => {}
    }

    let wire: WireResponse =
        serde_json::from_str(body).map_err(|e| SyncError::Parse(e.to_string()))?;

    Ok(FetchOutcome::Changes(SyncResponse {
        changes: wire
            .ips
            .into_iter()
            .map(|r| ChangeRecord {
                ip: r.ip,
                removed: r.deleted,
            })
            .collect(),
        new_watermark: wire.current_timestamp,
        is_full_snapshot: wire.full,
    }))
}

/// Source of remote changes.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetch changes since `filter.since`, or everything when `force_full`
    /// is set or the watermark is zero.
    async fn fetch(
        &self,
        host: &str,
        token: &SecureString,
        filter: &Filter,
        force_full: bool,
    ) -> Result<FetchOutcome, SyncError>;
}

/// HTTPS client for the remote service
pub struct HttpRemote {
    client: Client,
    timeout: Duration,
}

impl HttpRemote {
    /// Build the client. `ignore_cert` disables TLS certificate checks.
    pub fn new(timeout: Duration, ignore_cert: bool) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(format!("blocksync/{}", env!("CARGO_PKG_VERSION")))
            .danger_accept_invalid_certs(ignore_cert)
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { client, timeout })
    }

    fn map_transport_error(&self, err: reqwest::Error) -> SyncError {
        if err.is_timeout() {
            SyncError::Network(format!(
                "request timed out after {}s",
                self.timeout.as_secs()
            ))
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteSource for HttpRemote {
    async fn fetch(
        &self,
        host: &str,
        token: &SecureString,
        filter: &Filter,
        force_full: bool,
    ) -> Result<FetchOutcome, SyncError> {
        let base = normalize_host(host).map_err(|e| SyncError::Config(e.to_string()))?;
        let url = format!("{}/fetch", base);
        let request = FetchRequest::new(token, filter, force_full);

        if request.is_full() {
            info!("Requesting full snapshot from {}", base);
        } else {
            info!("Requesting changes since {} from {}", request.filter.since, base);
        }

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncError::InvalidToken,
                s if s.is_server_error() => SyncError::Server,
                s => SyncError::Network(format!("HTTP {}", s)),
            });
        }

        if let Some(content_length) = response.content_length() {
            if content_length as usize > MAX_RESPONSE_SIZE {
                return Err(SyncError::Network(format!(
                    "Response too large: {} bytes (max: {} bytes)",
                    content_length, MAX_RESPONSE_SIZE
                )));
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        if body.len() > MAX_RESPONSE_SIZE {
            return Err(SyncError::Network(format!(
                "Downloaded content too large: {} bytes (max: {} bytes)",
                body.len(),
                MAX_RESPONSE_SIZE
            )));
        }

        debug!("Received {} bytes from {}", body.len(), url);
        parse_fetch_response(&body)
    }
}
