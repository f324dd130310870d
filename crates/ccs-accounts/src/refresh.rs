use std::path::{Path, PathBuf};
use std::time::Duration;

use ccs_provider::Provider;
use serde::Deserialize;
use tokio::time;
use tracing::{debug, warn};

use crate::error::AccountsError;
use crate::registry::{Account, AccountStore};
use crate::token::{TokenDocument, TokenStatus};

/// Google's public desktop-client credentials for the Gemini CLI. These are
/// not secrets; every Gemini CLI install ships them.
const GEMINI_CLIENT_ID: &str =
    "681255809395-oo8ft2oprdrnp9e3aqf6av3hmdib135j.apps.googleusercontent.com";
const GEMINI_CLIENT_SECRET: &str = "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";
const GOOGLE_TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

const MAX_ATTEMPTS: u32 = 3;
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(10);
const BACKOFF_BASE: Duration = Duration::from_secs(1);

/// Error substrings after which retrying cannot help.
const UNRECOVERABLE: [&str; 7] = [
    "no refresh token",
    "invalid client",
    "invalid_client",
    "invalid grant",
    "invalid_grant",
    "token has been revoked",
    "token not found",
];

/// Result of one refresh request.
#[derive(Clone, Debug)]
pub struct RefreshOutcome {
    pub success: bool,
    /// Refresh is owned by the sidecar; nothing was (or should be) done
    /// locally.
    pub delegated: bool,
    /// A new access token was actually written.
    pub refreshed: bool,
    pub error: Option<String>,
}

impl RefreshOutcome {
    fn delegated() -> Self {
        Self {
            success: true,
            delegated: true,
            refreshed: false,
            error: None,
        }
    }

    fn fresh_enough() -> Self {
        Self {
            success: true,
            delegated: false,
            refreshed: false,
            error: None,
        }
    }

    fn refreshed() -> Self {
        Self {
            success: true,
            delegated: false,
            refreshed: true,
            error: None,
        }
    }
}

#[derive(Deserialize)]
struct GoogleTokenResponse {
    access_token: String,
    expires_in: i64,
}

/// Refreshes the one token family this process owns locally (Gemini CLI
/// tokens); everything else is delegated to the sidecar.
#[derive(Clone, Debug)]
pub struct RefreshEngine {
    http: reqwest::Client,
    token_endpoint: String,
}

impl Default for RefreshEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl RefreshEngine {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            token_endpoint: GOOGLE_TOKEN_ENDPOINT.to_string(),
        }
    }

    /// Overrides the OAuth token endpoint. Test hook.
    pub fn with_token_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.token_endpoint = endpoint.into();
        self
    }

    /// Where the Gemini CLI itself keeps its credentials. Refreshing that
    /// file in place keeps the CLI-native shape intact.
    pub fn gemini_native_credentials_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".gemini").join("oauth_creds.json"))
    }

    /// Ensures the account's token is usable, refreshing when it is expiring
    /// soon or already expired. Delegated providers always report
    /// `{success, delegated}` without touching the network.
    pub async fn ensure_valid(
        &self,
        store: &AccountStore,
        provider: Provider,
        account: &Account,
    ) -> Result<RefreshOutcome, AccountsError> {
        if provider.refresh_delegated() {
            return Ok(RefreshOutcome::delegated());
        }
        let path = store
            .locate_token_file(&account.token_file)
            .ok_or_else(|| AccountsError::TokenMissing {
                path: store.expected_token_path(account),
            })?;
        let token = TokenDocument::load(&path)?;
        match token.status() {
            TokenStatus::Valid => Ok(RefreshOutcome::fresh_enough()),
            TokenStatus::Invalid => Err(AccountsError::RefreshUnrecoverable {
                provider,
                reason: "no refresh token in token file".to_string(),
            }),
            TokenStatus::Missing => Err(AccountsError::TokenMissing { path }),
            TokenStatus::ExpiringSoon | TokenStatus::Expired => {
                self.refresh_file(provider, &path).await
            }
        }
    }

    /// Refreshes the token file at `path` with retries. Exponential backoff
    /// from one second, three attempts, ten seconds per attempt; an
    /// unrecoverable error message aborts immediately.
    pub async fn refresh_file(
        &self,
        provider: Provider,
        path: &Path,
    ) -> Result<RefreshOutcome, AccountsError> {
        if provider.refresh_delegated() {
            return Ok(RefreshOutcome::delegated());
        }

        let mut token = TokenDocument::load(path)?;
        let refresh_token = token
            .refresh_token()
            .ok_or_else(|| AccountsError::RefreshUnrecoverable {
                provider,
                reason: "no refresh token in token file".to_string(),
            })?
            .to_string();

        let mut backoff = BACKOFF_BASE;
        let mut last_error = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            match time::timeout(ATTEMPT_TIMEOUT, self.request_access_token(&refresh_token)).await {
                Ok(Ok(response)) => {
                    token.apply_refreshed_access(&response.access_token, response.expires_in);
                    token.save()?;
                    debug!(%provider, path = %path.display(), "access token refreshed");
                    return Ok(RefreshOutcome::refreshed());
                }
                Ok(Err(message)) => {
                    if is_unrecoverable(&message) {
                        return Err(AccountsError::RefreshUnrecoverable {
                            provider,
                            reason: message,
                        });
                    }
                    last_error = message;
                }
                Err(_) => {
                    last_error = format!("refresh attempt timed out after {ATTEMPT_TIMEOUT:?}");
                }
            }
            if attempt < MAX_ATTEMPTS {
                warn!(%provider, attempt, error = %last_error, "token refresh attempt failed");
                time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(AccountsError::RefreshFailed {
            provider,
            reason: last_error,
        })
    }

    async fn request_access_token(&self, refresh_token: &str) -> Result<GoogleTokenResponse, String> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", GEMINI_CLIENT_ID),
            ("client_secret", GEMINI_CLIENT_SECRET),
        ];
        let response = self
            .http
            .post(&self.token_endpoint)
            .form(&params)
            .send()
            .await
            .map_err(|err| err.to_string())?;

        let status = response.status();
        if status.is_success() {
            response
                .json::<GoogleTokenResponse>()
                .await
                .map_err(|err| format!("malformed token response: {err}"))
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(format!("token endpoint returned {status}: {body}"))
        }
    }
}

fn is_unrecoverable(message: &str) -> bool {
    let lower = message.to_lowercase();
    UNRECOVERABLE.iter().any(|marker| lower.contains(marker))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_markers_match_case_insensitively() {
        assert!(is_unrecoverable("Token has been revoked"));
        assert!(is_unrecoverable(
            "token endpoint returned 400: {\"error\":\"invalid_grant\"}"
        ));
        assert!(!is_unrecoverable("connection reset by peer"));
    }

    #[tokio::test]
    async fn delegated_providers_never_touch_the_network() {
        // The engine points at an unroutable endpoint; a delegated refresh
        // must still succeed instantly.
        let engine = RefreshEngine::new().with_token_endpoint("http://127.0.0.1:1/token");
        for provider in [
            Provider::Codex,
            Provider::Agy,
            Provider::Qwen,
            Provider::IFlow,
            Provider::Kiro,
            Provider::Ghcp,
        ] {
            let outcome = engine
                .refresh_file(provider, Path::new("/nonexistent/token.json"))
                .await
                .unwrap();
            assert!(outcome.success && outcome.delegated && !outcome.refreshed);
        }
    }
}
