use std::path::PathBuf;
use std::time::Duration;

use ccs_accounts::AccountsError;
use ccs_provider::Provider;
use thiserror::Error;

use crate::management::ManagementError;

/// Errors from sidecar supervision and the OAuth flow driver.
#[derive(Debug, Error)]
pub enum CliproxyError {
    #[error("failed to install sidecar binary: {reason}")]
    BinaryInstallFailed { reason: String },
    #[error("`{value}` is not a valid sidecar version (expected X.Y.Z or X.Y.Z-N)")]
    VersionInvalid { value: String },
    #[error("sidecar version {version} needs explicit confirmation: {reason}")]
    VersionGated { version: String, reason: String },
    #[error("sidecar `{binary}` could not be spawned: {source}")]
    Spawn {
        binary: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("sidecar failed to become ready: {reason}")]
    ProxyStartFailed { reason: String },
    #[error("sidecar proxy is not running")]
    ProxyNotRunning,
    #[error("no valid {provider} credentials; run the login flow first")]
    AuthRequired { provider: Provider },
    #[error("{provider} authentication timed out after {timeout:?}")]
    AuthTimeout { provider: Provider, timeout: Duration },
    #[error("authentication was cancelled")]
    AuthCancelled,
    #[error("{provider} authentication failed: {reason}")]
    AuthFlowFailed { provider: Provider, reason: String },
    #[error("pre-flight check failed: {reason}")]
    PreflightFailed { reason: String },
    #[error("operation cancelled by user")]
    UserCancelled,
    #[error("the pasted URL has no `code` query parameter")]
    CallbackCodeMissing,
    #[error("a paste-callback flow for {provider} is already in progress")]
    PasteFlowInProgress { provider: Provider },
    #[error(transparent)]
    Management(#[from] ManagementError),
    #[error(transparent)]
    Accounts(#[from] AccountsError),
    #[error("failed to access `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("network request failed: {0}")]
    Http(String),
    #[error("failed to render sidecar config: {source}")]
    ConfigRender {
        #[source]
        source: serde_yaml::Error,
    },
}
