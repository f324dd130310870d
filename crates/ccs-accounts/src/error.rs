use std::path::PathBuf;

use ccs_provider::{NicknameError, Provider};
use thiserror::Error;

/// Errors surfaced by the account registry and token store.
#[derive(Debug, Error)]
pub enum AccountsError {
    #[error("failed to write `{path}`: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to serialize registry: {source}")]
    Serialize {
        #[source]
        source: serde_json::Error,
    },
    #[error("no {provider} account matching `{query}`")]
    AccountNotFound { provider: Provider, query: String },
    #[error(transparent)]
    Nickname(#[from] NicknameError),
    #[error("{provider} accounts require a nickname")]
    NicknameRequired { provider: Provider },
    #[error("a {provider} account named `{nickname}` already exists")]
    NicknameTaken { provider: Provider, nickname: String },
    #[error("weight must be between 0 and 99, got {weight}")]
    WeightOutOfRange { weight: u32 },
    #[error("token file `{path}` is missing")]
    TokenMissing { path: PathBuf },
    #[error("token file `{path}` is invalid: {reason}")]
    TokenInvalid { path: PathBuf, reason: String },
    #[error("token file name `{name}` must be a basename")]
    TokenFileNotBasename { name: String },
    #[error("refresh failed for {provider}: {reason}")]
    RefreshFailed { provider: Provider, reason: String },
    #[error("refresh cannot succeed for {provider}: {reason}")]
    RefreshUnrecoverable { provider: Provider, reason: String },
    #[error("failed to move `{from}` to `{to}`: {source}")]
    Relocate {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
