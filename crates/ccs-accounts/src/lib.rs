#![forbid(unsafe_code)]
//! Durable multi-account credential store and rotation logic for `ccs`.
//!
//! One registry file (`accounts.json`) records every account per provider
//! together with pause state, routing weight, and subscription tier. Token
//! files live next to it under `cliproxy/auth/` (active) and
//! `cliproxy/auth-paused/` (hidden from the sidecar's watcher). This crate
//! keeps the two in sync, refreshes the one token family we own locally,
//! probes provider quotas, and picks the account a new invocation should use.
//!
//! All registry writes are atomic (temp + rename); readers parse the whole
//! file so they always observe a consistent snapshot. Per-provider operations
//! that must not interleave (`solo`, weighted sync) serialize on in-process
//! async locks.

mod cooldown;
mod discover;
mod error;
mod quota;
mod refresh;
mod registry;
mod rotation;
mod token;
mod worker;

pub use cooldown::{CooldownEntry, CooldownStore, COOLDOWN_FALLBACK};
pub use discover::DiscoveryReport;
pub use error::AccountsError;
pub use quota::{
    BucketQuota, ModelQuota, QuotaClient, QuotaReport, QuotaStatus, UsageWindow,
    FAILOVER_THRESHOLD,
};
pub use refresh::{RefreshEngine, RefreshOutcome};
pub use registry::{Account, AccountStore, BulkOutcome, SoloOutcome};
pub use rotation::{RotationEngine, SharedProjectGroup};
pub use token::{
    TokenDocument, TokenStatus, EXPIRING_SOON, REFRESH_HORIZON, TOKEN_FILE_MAX_BYTES,
};
pub use worker::{RefreshWorker, RefreshWorkerHandle, WorkerCycleEntry};

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests;
