use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
const VERSION_HEADER: &str = "X-CPA-VERSION";
const COMMIT_HEADER: &str = "X-CPA-COMMIT";

/// Typed failures from the sidecar management API. The mapping from
/// transport errors and HTTP statuses is fixed; callers match on the kind,
/// not on strings.
#[derive(Debug, Error)]
pub enum ManagementError {
    #[error("DNS resolution failed")]
    DnsFailed,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("request timed out")]
    Timeout,
    #[error("management authentication failed")]
    AuthFailed,
    #[error("not found")]
    NotFound,
    #[error("bad request: {body}")]
    BadRequest { body: String },
    #[error("server error {status}")]
    ServerError { status: u16 },
    #[error("management request failed: {0}")]
    Unknown(String),
}

/// Health probe result, including the build metadata the sidecar reports via
/// response headers.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct SidecarHealth {
    pub version: Option<String>,
    pub commit: Option<String>,
}

/// A claude-api-key record managed through the sidecar.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaudeKeyRecord {
    pub name: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// A model definition exposed by the sidecar per channel.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub id: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Client for the sidecar's `/v0/management` endpoints.
///
/// Requests carry `Authorization: Bearer <management key>` and a five second
/// timeout. Self-signed HTTPS is accepted only behind an explicit opt-in.
#[derive(Clone, Debug)]
pub struct ManagementClient {
    http: reqwest::Client,
    base_url: String,
    management_key: String,
}

impl ManagementClient {
    /// Builds a client for `<protocol>://<host>[:port]`. Default ports are
    /// elided from the base URL (80 for http, 443 for https).
    pub fn new(
        protocol: &str,
        host: &str,
        port: Option<u16>,
        management_key: impl Into<String>,
        accept_invalid_certs: bool,
    ) -> Result<Self, ManagementError> {
        let base_url = build_base_url(protocol, host, port);
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .danger_accept_invalid_certs(accept_invalid_certs && protocol == "https")
            .build()
            .map_err(|err| ManagementError::Unknown(err.to_string()))?;
        Ok(Self {
            http,
            base_url,
            management_key: management_key.into(),
        })
    }

    /// Client for the local sidecar on loopback.
    pub fn local(port: u16, management_key: impl Into<String>) -> Result<Self, ManagementError> {
        Self::new("http", "127.0.0.1", Some(port), management_key, false)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// `GET /health`, returning the build metadata headers.
    pub async fn health(&self) -> Result<SidecarHealth, ManagementError> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .bearer_auth(&self.management_key)
            .send()
            .await
            .map_err(map_transport)?;
        let health = SidecarHealth {
            version: header_string(&response, VERSION_HEADER),
            commit: header_string(&response, COMMIT_HEADER),
        };
        check_status(&response)?;
        Ok(health)
    }

    /// `GET /v0/management/claude-api-key`.
    pub async fn claude_keys(&self) -> Result<Vec<ClaudeKeyRecord>, ManagementError> {
        self.request_json(reqwest::Method::GET, "/v0/management/claude-api-key", None)
            .await
    }

    /// `PUT /v0/management/claude-api-key` (replace the full set).
    pub async fn put_claude_keys(&self, keys: &[ClaudeKeyRecord]) -> Result<(), ManagementError> {
        self.request_empty(
            reqwest::Method::PUT,
            "/v0/management/claude-api-key",
            Some(serde_json::to_value(keys).map_err(|err| ManagementError::Unknown(err.to_string()))?),
        )
        .await
    }

    /// `PATCH /v0/management/claude-api-key` (upsert one entry).
    pub async fn patch_claude_key(&self, key: &ClaudeKeyRecord) -> Result<(), ManagementError> {
        self.request_empty(
            reqwest::Method::PATCH,
            "/v0/management/claude-api-key",
            Some(serde_json::to_value(key).map_err(|err| ManagementError::Unknown(err.to_string()))?),
        )
        .await
    }

    /// `DELETE /v0/management/claude-api-key?name=<name>`.
    pub async fn delete_claude_key(&self, name: &str) -> Result<(), ManagementError> {
        let path = format!("/v0/management/claude-api-key?name={name}");
        self.request_empty(reqwest::Method::DELETE, &path, None).await
    }

    /// `GET /v0/management/model-definitions?channel=<channel>`.
    pub async fn model_definitions(
        &self,
        channel: &str,
    ) -> Result<Vec<ModelDefinition>, ManagementError> {
        let path = format!("/v0/management/model-definitions?channel={channel}");
        self.request_json(reqwest::Method::GET, &path, None).await
    }

    /// `POST /oauth/<provider>/start` for the paste-callback flow; returns
    /// the authorization URL.
    pub async fn oauth_start(&self, provider_tag: &str) -> Result<String, ManagementError> {
        let path = format!("/oauth/{provider_tag}/start");
        let body: Value = self.request_json(reqwest::Method::POST, &path, None).await?;
        body.get("url")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ManagementError::Unknown("oauth start response has no url".to_string()))
    }

    /// `POST /oauth-callback` with the user-transported callback URL.
    pub async fn oauth_callback(&self, callback_url: &str) -> Result<(), ManagementError> {
        self.request_empty(
            reqwest::Method::POST,
            "/oauth-callback",
            Some(serde_json::json!({ "url": callback_url })),
        )
        .await
    }

    async fn request_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, ManagementError> {
        let response = self.send(method, path, body).await?;
        response
            .json::<T>()
            .await
            .map_err(|err| ManagementError::Unknown(format!("malformed response: {err}")))
    }

    async fn request_empty(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<(), ManagementError> {
        self.send(method, path, body).await.map(|_| ())
    }

    async fn send(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<reqwest::Response, ManagementError> {
        let mut request = self
            .http
            .request(method, format!("{}{path}", self.base_url))
            .bearer_auth(&self.management_key);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request.send().await.map_err(map_transport)?;
        check_status(&response)?;
        Ok(response)
    }
}

/// `http://host` for port 80, `https://host` for 443, explicit otherwise.
pub fn build_base_url(protocol: &str, host: &str, port: Option<u16>) -> String {
    let default_port = match protocol {
        "https" => 443,
        _ => 80,
    };
    match port {
        Some(port) if port != default_port => format!("{protocol}://{host}:{port}"),
        _ => format!("{protocol}://{host}"),
    }
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn check_status(response: &reqwest::Response) -> Result<(), ManagementError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    Err(match status.as_u16() {
        401 | 403 => ManagementError::AuthFailed,
        404 => ManagementError::NotFound,
        400 => ManagementError::BadRequest {
            body: String::new(),
        },
        code if (500..600).contains(&code) => ManagementError::ServerError { status: code },
        code => ManagementError::Unknown(format!("unexpected status {code}")),
    })
}

/// Fixed transport-error table: DNS, unreachable, refused, timeout, then
/// unknown.
fn map_transport(err: reqwest::Error) -> ManagementError {
    if err.is_timeout() {
        return ManagementError::Timeout;
    }
    let text = source_chain(&err).to_lowercase();
    if text.contains("dns") || text.contains("name or service not known") || text.contains("eai_again")
    {
        ManagementError::DnsFailed
    } else if text.contains("unreachable") {
        ManagementError::NetworkUnreachable
    } else if text.contains("connection refused") {
        ManagementError::ConnectionRefused
    } else if text.contains("timed out") {
        ManagementError::Timeout
    } else {
        ManagementError::Unknown(err.to_string())
    }
}

fn source_chain(err: &reqwest::Error) -> String {
    let mut parts = vec![err.to_string()];
    let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(err);
    while let Some(current) = source {
        parts.push(current.to_string());
        source = current.source();
    }
    parts.join(": ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_ports_are_elided() {
        assert_eq!(build_base_url("http", "localhost", Some(80)), "http://localhost");
        assert_eq!(
            build_base_url("https", "proxy.example.com", Some(443)),
            "https://proxy.example.com"
        );
        assert_eq!(
            build_base_url("http", "127.0.0.1", Some(1317)),
            "http://127.0.0.1:1317"
        );
        assert_eq!(build_base_url("https", "h", None), "https://h");
    }

    #[tokio::test]
    async fn refused_connection_maps_to_typed_error() {
        // Reserve a port and close it again so nothing is listening.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let client = ManagementClient::local(port, "key").unwrap();
        match client.health().await {
            Err(ManagementError::ConnectionRefused) => {}
            other => panic!("expected ConnectionRefused, got {other:?}"),
        }
    }
}
