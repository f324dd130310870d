use ccs_provider::Provider;
use chrono::DateTime;
use reqwest::StatusCode;
use serde_json::{json, Value};
use tracing::debug;

use crate::refresh::RefreshEngine;
use crate::registry::{Account, AccountStore};
use crate::token::TokenDocument;

/// An account whose every model/bucket/window sits at or below this fraction
/// is treated as exhausted for failover purposes.
pub const FAILOVER_THRESHOLD: f64 = 0.05;

const CLOUDCODE_BASE: &str = "https://cloudcode-pa.googleapis.com";
const CHATGPT_BASE: &str = "https://chatgpt.com";

/// Typed outcome of a quota probe.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum QuotaStatus {
    Ok,
    /// 401: token is bad, interactive reauth needed.
    NeedsReauth,
    /// 403: forbidden or project unprovisioned.
    Forbidden,
    /// 429: the quota endpoint itself is rate-limited.
    RateLimited,
    Error,
}

/// Remaining capacity for one model.
#[derive(Clone, Debug, PartialEq)]
pub struct ModelQuota {
    pub model: String,
    /// Clamped to [0, 1].
    pub remaining_fraction: f64,
    /// Rounded and clamped to 0..=100.
    pub remaining_percent: u8,
}

impl ModelQuota {
    pub(crate) fn new(model: impl Into<String>, fraction: f64) -> Self {
        let remaining_fraction = clamp_fraction(fraction);
        Self {
            model: model.into(),
            remaining_fraction,
            remaining_percent: percent_of(remaining_fraction),
        }
    }
}

/// Gemini quota entries grouped by series/token-type bucket.
#[derive(Clone, Debug, PartialEq)]
pub struct BucketQuota {
    pub bucket: String,
    pub models: Vec<ModelQuota>,
}

/// One Codex usage window.
#[derive(Clone, Debug, PartialEq)]
pub struct UsageWindow {
    pub window: String,
    pub used_percent: u8,
    pub remaining_fraction: f64,
    pub resets_at_ms: Option<i64>,
}

/// Structured result of one quota fetch. `success=false` carries the typed
/// status and an error string; the caller decides whether that is fatal.
#[derive(Clone, Debug)]
pub struct QuotaReport {
    pub provider: Provider,
    pub account_id: String,
    pub success: bool,
    pub status: QuotaStatus,
    pub models: Vec<ModelQuota>,
    pub buckets: Vec<BucketQuota>,
    pub windows: Vec<UsageWindow>,
    pub reset_time_ms: Option<i64>,
    pub error: Option<String>,
}

impl QuotaReport {
    fn empty(provider: Provider, account_id: &str) -> Self {
        Self {
            provider,
            account_id: account_id.to_string(),
            success: false,
            status: QuotaStatus::Error,
            models: Vec::new(),
            buckets: Vec::new(),
            windows: Vec::new(),
            reset_time_ms: None,
            error: None,
        }
    }

    fn failure(provider: Provider, account_id: &str, status: QuotaStatus, error: String) -> Self {
        let mut report = Self::empty(provider, account_id);
        report.status = status;
        report.error = Some(error);
        report
    }

    /// True when any model, bucket entry, or window retains more than
    /// `threshold` of its capacity.
    pub fn any_remaining_above(&self, threshold: f64) -> bool {
        self.models
            .iter()
            .chain(self.buckets.iter().flat_map(|bucket| bucket.models.iter()))
            .any(|model| model.remaining_fraction > threshold)
            || self
                .windows
                .iter()
                .any(|window| window.remaining_fraction > threshold)
    }

    /// A successful probe whose every figure is at or below the failover
    /// threshold.
    pub fn exhausted(&self) -> bool {
        self.success && !self.any_remaining_above(FAILOVER_THRESHOLD)
    }
}

/// HTTP client for the provider quota endpoints.
///
/// Base URLs are injectable so tests can stand up a local server; defaults
/// point at the real services.
#[derive(Clone, Debug)]
pub struct QuotaClient {
    http: reqwest::Client,
    engine: RefreshEngine,
    cloudcode_base: String,
    chatgpt_base: String,
}

impl Default for QuotaClient {
    fn default() -> Self {
        Self::new(RefreshEngine::new())
    }
}

impl QuotaClient {
    pub fn new(engine: RefreshEngine) -> Self {
        Self {
            http: reqwest::Client::new(),
            engine,
            cloudcode_base: CLOUDCODE_BASE.to_string(),
            chatgpt_base: CHATGPT_BASE.to_string(),
        }
    }

    pub fn with_cloudcode_base(mut self, base: impl Into<String>) -> Self {
        self.cloudcode_base = base.into();
        self
    }

    pub fn with_chatgpt_base(mut self, base: impl Into<String>) -> Self {
        self.chatgpt_base = base.into();
        self
    }

    /// Fetches remaining quota for one account. Never returns `Err`; every
    /// failure mode is encoded in the report.
    pub async fn fetch(
        &self,
        store: &AccountStore,
        provider: Provider,
        account: &Account,
    ) -> QuotaReport {
        let Some(path) = store.locate_token_file(&account.token_file) else {
            return QuotaReport::failure(
                provider,
                &account.id,
                QuotaStatus::Error,
                "token file missing".to_string(),
            );
        };

        // Gemini tokens are ours to refresh; do it up front so the probe
        // does not 401 on a stale access token.
        if provider == Provider::Gemini {
            if let Err(err) = self.engine.refresh_file(provider, &path).await {
                debug!(%provider, error = %err, "pre-probe refresh failed, probing anyway");
            }
        }

        let access_token = match TokenDocument::load(&path) {
            Ok(token) => match token.access_token() {
                Some(access) => access.to_string(),
                None => {
                    return QuotaReport::failure(
                        provider,
                        &account.id,
                        QuotaStatus::NeedsReauth,
                        "token file has no access token".to_string(),
                    )
                }
            },
            Err(err) => {
                return QuotaReport::failure(provider, &account.id, QuotaStatus::Error, err.to_string())
            }
        };

        match provider {
            Provider::Agy => self.fetch_agy(&account.id, &access_token, account.project_id.as_deref()).await,
            Provider::Codex => self.fetch_codex(&account.id, &access_token).await,
            Provider::Gemini => self.fetch_gemini(&account.id, &access_token).await,
            other => QuotaReport::failure(
                other,
                &account.id,
                QuotaStatus::Error,
                format!("quota probing is not supported for {other}"),
            ),
        }
    }

    /// Antigravity: resolve (and validate) the project via `loadCodeAssist`,
    /// then pull per-model remaining fractions from `fetchAvailableModels`.
    async fn fetch_agy(
        &self,
        account_id: &str,
        access_token: &str,
        known_project: Option<&str>,
    ) -> QuotaReport {
        let provider = Provider::Agy;
        let load = self
            .post_json(
                &format!("{}/v1internal:loadCodeAssist", self.cloudcode_base),
                access_token,
                json!({"metadata": {"pluginType": "GEMINI"}}),
            )
            .await;
        let load = match load {
            Ok(value) => value,
            Err((status, error)) => {
                return QuotaReport::failure(provider, account_id, status, error)
            }
        };
        let project = load
            .get("cloudaicompanionProject")
            .and_then(Value::as_str)
            .or(known_project);
        let Some(project) = project else {
            return QuotaReport::failure(
                provider,
                account_id,
                QuotaStatus::Forbidden,
                "no Cloud Code project provisioned for this account".to_string(),
            );
        };

        let models = self
            .post_json(
                &format!("{}/v1internal:fetchAvailableModels", self.cloudcode_base),
                access_token,
                json!({"project": project}),
            )
            .await;
        match models {
            Ok(value) => {
                let (models, reset_time_ms) = parse_agy_models(&value);
                let mut report = QuotaReport::empty(provider, account_id);
                report.success = true;
                report.status = QuotaStatus::Ok;
                report.models = models;
                report.reset_time_ms = reset_time_ms;
                report
            }
            Err((status, error)) => QuotaReport::failure(provider, account_id, status, error),
        }
    }

    /// Codex: one usage endpoint covering the primary/secondary/code-review
    /// rate-limit windows.
    async fn fetch_codex(&self, account_id: &str, access_token: &str) -> QuotaReport {
        let provider = Provider::Codex;
        let url = format!("{}/backend-api/codex/usage", self.chatgpt_base);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await;
        match self.decode(response).await {
            Ok(value) => {
                let windows = parse_codex_windows(&value);
                let mut report = QuotaReport::empty(provider, account_id);
                report.success = true;
                report.status = QuotaStatus::Ok;
                report.reset_time_ms = windows
                    .iter()
                    .filter_map(|window| window.resets_at_ms)
                    .min();
                report.windows = windows;
                report
            }
            Err((status, error)) => QuotaReport::failure(provider, account_id, status, error),
        }
    }

    /// Gemini CLI: per-model remaining fractions, grouped into flash/pro
    /// series and input/output token-type buckets.
    async fn fetch_gemini(&self, account_id: &str, access_token: &str) -> QuotaReport {
        let provider = Provider::Gemini;
        let result = self
            .post_json(
                &format!("{}/v1internal:retrieveUserQuota", self.cloudcode_base),
                access_token,
                json!({}),
            )
            .await;
        match result {
            Ok(value) => {
                let buckets = parse_gemini_buckets(&value);
                let mut report = QuotaReport::empty(provider, account_id);
                report.success = true;
                report.status = QuotaStatus::Ok;
                report.buckets = buckets;
                report
            }
            Err((status, error)) => QuotaReport::failure(provider, account_id, status, error),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        access_token: &str,
        body: Value,
    ) -> Result<Value, (QuotaStatus, String)> {
        let response = self
            .http
            .post(url)
            .bearer_auth(access_token)
            .json(&body)
            .send()
            .await;
        self.decode(response).await
    }

    async fn decode(
        &self,
        response: Result<reqwest::Response, reqwest::Error>,
    ) -> Result<Value, (QuotaStatus, String)> {
        let response = response.map_err(|err| (QuotaStatus::Error, err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            response
                .json::<Value>()
                .await
                .map_err(|err| (QuotaStatus::Error, format!("malformed response: {err}")))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err((map_status(status), format!("{status}: {body}")))
        }
    }
}

/// 401 means reauth, 403 forbidden/unprovisioned, 429 rate-limited; anything
/// else is an opaque error string.
fn map_status(status: StatusCode) -> QuotaStatus {
    match status.as_u16() {
        401 => QuotaStatus::NeedsReauth,
        403 => QuotaStatus::Forbidden,
        429 => QuotaStatus::RateLimited,
        _ => QuotaStatus::Error,
    }
}

pub(crate) fn clamp_fraction(fraction: f64) -> f64 {
    if !fraction.is_finite() {
        return 0.0;
    }
    fraction.clamp(0.0, 1.0)
}

fn percent_of(fraction: f64) -> u8 {
    (clamp_fraction(fraction) * 100.0).round().clamp(0.0, 100.0) as u8
}

fn parse_epoch_or_iso(value: &Value) -> Option<i64> {
    if let Some(ms) = value.as_i64() {
        return (ms > 0).then_some(ms);
    }
    let text = value.as_str()?;
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|parsed| parsed.timestamp_millis())
}

fn parse_agy_models(value: &Value) -> (Vec<ModelQuota>, Option<i64>) {
    let mut models = Vec::new();
    let mut reset: Option<i64> = None;
    let Some(entries) = value.get("models").and_then(Value::as_array) else {
        return (models, reset);
    };
    for entry in entries {
        let Some(name) = entry
            .get("model")
            .or_else(|| entry.get("name"))
            .and_then(Value::as_str)
        else {
            continue;
        };
        let fraction = entry
            .get("remainingFraction")
            .or_else(|| entry.get("quotaInfo").and_then(|info| info.get("remainingFraction")))
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        models.push(ModelQuota::new(name, fraction));

        let entry_reset = entry
            .get("resetTime")
            .or_else(|| entry.get("quotaInfo").and_then(|info| info.get("resetTime")))
            .and_then(parse_epoch_or_iso);
        reset = match (reset, entry_reset) {
            (Some(current), Some(candidate)) => Some(current.min(candidate)),
            (None, candidate) => candidate,
            (current, None) => current,
        };
    }
    (models, reset)
}

fn parse_codex_windows(value: &Value) -> Vec<UsageWindow> {
    let Some(limits) = value.get("rate_limits").and_then(Value::as_object) else {
        return Vec::new();
    };
    let mut windows = Vec::new();
    for window in ["primary", "secondary", "code_review"] {
        let Some(entry) = limits.get(window) else {
            continue;
        };
        let used = entry
            .get("used_percent")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let used_percent = used.clamp(0.0, 100.0).round() as u8;
        let resets_at_ms = entry
            .get("resets_at")
            .and_then(parse_epoch_or_iso)
            .or_else(|| {
                entry
                    .get("resets_in_seconds")
                    .and_then(Value::as_i64)
                    .map(|secs| crate::now_ms() + secs * 1000)
            });
        windows.push(UsageWindow {
            window: window.to_string(),
            used_percent,
            remaining_fraction: clamp_fraction(1.0 - used / 100.0),
            resets_at_ms,
        });
    }
    windows
}

/// Flash-series, pro-series, and token-type buckets for Gemini CLI quota.
fn parse_gemini_buckets(value: &Value) -> Vec<BucketQuota> {
    let Some(entries) = value.get("quotas").and_then(Value::as_array) else {
        return Vec::new();
    };
    let mut buckets: Vec<BucketQuota> = Vec::new();
    for entry in entries {
        let Some(model) = entry.get("model").and_then(Value::as_str) else {
            continue;
        };
        let fraction = entry
            .get("remainingFraction")
            .and_then(Value::as_f64)
            .unwrap_or(0.0);
        let bucket_name = entry
            .get("tokenType")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| series_bucket(model).to_string());
        match buckets.iter_mut().find(|bucket| bucket.bucket == bucket_name) {
            Some(bucket) => bucket.models.push(ModelQuota::new(model, fraction)),
            None => buckets.push(BucketQuota {
                bucket: bucket_name,
                models: vec![ModelQuota::new(model, fraction)],
            }),
        }
    }
    buckets
}

fn series_bucket(model: &str) -> &'static str {
    let lower = model.to_lowercase();
    if lower.contains("flash") {
        "flash"
    } else if lower.contains("pro") {
        "pro"
    } else {
        "other"
    }
}
