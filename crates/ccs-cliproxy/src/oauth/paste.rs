use std::sync::Arc;
use std::time::Duration;

use ccs_accounts::Account;
use ccs_provider::Provider;
use serde::{Deserialize, Serialize};
use tokio::time;
use tracing::info;

use crate::error::CliproxyError;
use crate::management::ManagementClient;
use crate::oauth::{OauthDriver, OauthOptions};

/// How long a started paste flow stays claimable before it expires.
const PASTE_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Persisted marker for an in-flight paste flow, so a concurrent invocation
/// reports "already in progress" instead of racing the sidecar state.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PasteState {
    provider: Provider,
    started_at: i64,
}

impl OauthDriver {
    /// Paste-callback flow for hosts with no reachable loopback: the sidecar
    /// mints the authorization URL over its management port, the user
    /// completes consent elsewhere and pastes the resulting callback URL
    /// back, and we forward it to the sidecar's `/oauth-callback`.
    ///
    /// The pasted URL must carry a `code` query parameter. Waiting for the
    /// paste gives up after ten minutes with a typed timeout.
    pub async fn login_paste(
        &self,
        provider: Provider,
        management: &ManagementClient,
        options: OauthOptions,
    ) -> Result<Option<Account>, CliproxyError> {
        let Some(nickname) = self.resolve_gate_and_nickname(provider, &options)? else {
            return Ok(None);
        };

        let state_path = self.root.paste_state_path();
        if let Some(existing) = load_state(&state_path) {
            let age_ms = super::epoch_ms() - existing.started_at;
            if age_ms < PASTE_EXPIRY.as_millis() as i64 {
                return Err(CliproxyError::PasteFlowInProgress {
                    provider: existing.provider,
                });
            }
        }
        let started_at = super::epoch_ms();
        save_state(
            &state_path,
            &PasteState {
                provider,
                started_at,
            },
        )?;

        let result = self
            .run_paste(provider, management, started_at, nickname.as_deref())
            .await;
        let _ = std::fs::remove_file(&state_path);
        result
    }

    async fn run_paste(
        &self,
        provider: Provider,
        management: &ManagementClient,
        started_at: i64,
        nickname: Option<&str>,
    ) -> Result<Option<Account>, CliproxyError> {
        let auth_url = management.oauth_start(provider.tag()).await?;
        eprintln!();
        eprintln!("Open this URL in any browser and complete the login:");
        eprintln!("  {auth_url}");
        eprintln!();
        eprintln!("Then paste the full callback URL the browser was redirected to.");

        let prompter = Arc::clone(&self.prompter);
        let pasted = time::timeout(
            PASTE_EXPIRY,
            tokio::task::spawn_blocking(move || prompter.input("Callback URL")),
        )
        .await
        .map_err(|_| CliproxyError::AuthTimeout {
            provider,
            timeout: PASTE_EXPIRY,
        })?
        .map_err(|err| CliproxyError::Http(err.to_string()))?;

        let Some(callback_url) = pasted else {
            return Ok(None);
        };
        if !has_code_param(&callback_url) {
            return Err(CliproxyError::CallbackCodeMissing);
        }

        management.oauth_callback(&callback_url).await?;
        info!(%provider, "callback forwarded to sidecar");

        self.complete(provider, started_at, nickname).await.map(Some)
    }
}

/// Whether the URL's query string carries a non-empty `code` parameter.
fn has_code_param(url: &str) -> bool {
    let Some((_, query)) = url.split_once('?') else {
        return false;
    };
    let query = query.split('#').next().unwrap_or(query);
    query.split('&').any(|pair| {
        pair.split_once('=')
            .is_some_and(|(key, value)| key == "code" && !value.is_empty())
    })
}

fn load_state(path: &std::path::Path) -> Option<PasteState> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}

fn save_state(path: &std::path::Path, state: &PasteState) -> Result<(), CliproxyError> {
    let contents =
        serde_json::to_vec_pretty(state).map_err(|err| CliproxyError::Http(err.to_string()))?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| CliproxyError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    ccs_provider::write_atomic(path, &contents).map_err(|source| CliproxyError::Io {
        path: path.to_path_buf(),
        source,
    })
}
