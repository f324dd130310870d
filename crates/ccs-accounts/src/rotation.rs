use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::sync::OnceLock;

use ccs_provider::{Provider, Tier, ALL_PROVIDERS};
use tracing::debug;

use crate::cooldown::CooldownStore;
use crate::error::AccountsError;
use crate::quota::{QuotaReport, FAILOVER_THRESHOLD};
use crate::registry::{
    is_weight_copy_of, weight_copy_name, Account, AccountStore, ProviderLocks,
};

/// Accounts sharing one GCP project; failover inside such a group is
/// pointless because the quota pool is shared.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SharedProjectGroup {
    pub project_id: String,
    pub account_ids: Vec<String>,
}

fn sync_locks() -> &'static ProviderLocks {
    static LOCKS: OnceLock<ProviderLocks> = OnceLock::new();
    LOCKS.get_or_init(ProviderLocks::default)
}

/// Account selection and weighted round-robin file sync.
///
/// Selection is advisory (it reads the registry, cooldowns, and the probes
/// recorded so far); the weighted sync manipulates `auth/` so the sidecar
/// realizes weights by file multiplicity, without any request-time
/// coordination from us.
#[derive(Debug)]
pub struct RotationEngine {
    store: AccountStore,
    probes: HashMap<(Provider, String), QuotaReport>,
}

impl RotationEngine {
    pub fn new(store: AccountStore) -> Self {
        Self {
            store,
            probes: HashMap::new(),
        }
    }

    pub fn store(&self) -> &AccountStore {
        &self.store
    }

    /// Remembers the latest probe for the report's account.
    pub fn record_probe(&mut self, report: QuotaReport) {
        self.probes
            .insert((report.provider, report.account_id.clone()), report);
    }

    pub fn latest_probe(&self, provider: Provider, account_id: &str) -> Option<&QuotaReport> {
        self.probes.get(&(provider, account_id.to_string()))
    }

    /// Picks the account an invocation should use.
    ///
    /// The explicit default wins unless it is paused, on cooldown, or its
    /// latest probe reports exhaustion. Otherwise active accounts are tried
    /// in registry order and the first with headroom above the failover
    /// threshold (or no probe yet) is returned. `None` means every account
    /// is exhausted and the caller should surface guidance.
    pub fn select_account(
        &self,
        cooldowns: &CooldownStore,
        provider: Provider,
    ) -> Option<Account> {
        let accounts = self.store.list(provider);
        if accounts.is_empty() {
            return None;
        }

        let eligible = |account: &Account| {
            account.is_active()
                && !cooldowns.is_on_cooldown(provider, &account.id)
                && !self
                    .latest_probe(provider, &account.id)
                    .is_some_and(QuotaReport::exhausted)
        };

        if let Some(default) = accounts.iter().find(|account| account.is_default) {
            if eligible(default) {
                return Some(default.clone());
            }
        }

        for account in &accounts {
            if account.is_default {
                continue;
            }
            if !eligible(account) {
                continue;
            }
            match self.latest_probe(provider, &account.id) {
                Some(probe) if !probe.any_remaining_above(FAILOVER_THRESHOLD) => continue,
                _ => return Some(account.clone()),
            }
        }
        None
    }

    /// Duplicates token files in `auth/` so the sidecar's round-robin sees
    /// each account `weight` times: weight 0 parks the canonical file in
    /// `auth-paused/`, weight k keeps the canonical plus k-1 derived copies.
    /// Copies that no longer match a current weight are deleted. Serialized
    /// per provider; idempotent modulo file mtimes.
    pub async fn sync_weights(&self, provider: Provider) -> Result<(), AccountsError> {
        let lock = sync_locks().lock_for(provider);
        let _guard = lock.lock().await;

        let auth_dir = self.store.config_root().auth_dir();
        for account in self.store.list(provider) {
            let canonical_active = self.store.auth_path(&account.token_file);
            let canonical_paused = self.store.paused_path(&account.token_file);

            let parked = account.paused || account.weight == 0;
            if parked {
                if canonical_active.exists() {
                    relocate_file(&canonical_active, &canonical_paused)?;
                }
            } else if !canonical_active.exists() && canonical_paused.exists() && !account.paused {
                relocate_file(&canonical_paused, &canonical_active)?;
            }

            let stem = account.token_file.trim_end_matches(".json").to_string();
            let wanted = if parked { 0 } else { account.weight };

            // Create missing duplicates 2..=weight.
            if wanted >= 2 && canonical_active.exists() {
                for index in 2..=wanted {
                    let copy = auth_dir.join(weight_copy_name(&account.token_file, index));
                    if !copy.exists() {
                        fs::copy(&canonical_active, &copy).map_err(|source| {
                            AccountsError::Write {
                                path: copy.clone(),
                                source,
                            }
                        })?;
                    }
                }
            }

            // Drop duplicates beyond the current weight.
            if let Ok(entries) = fs::read_dir(&auth_dir) {
                for entry in entries.flatten() {
                    let name = entry.file_name();
                    let Some(name) = name.to_str() else { continue };
                    if !is_weight_copy_of(&stem, name) {
                        continue;
                    }
                    let in_range = copy_index(&stem, name)
                        .is_some_and(|index| index >= 2 && index <= wanted);
                    if !in_range {
                        let _ = fs::remove_file(entry.path());
                    }
                }
            }
        }
        debug!(%provider, "weighted sync complete");
        Ok(())
    }

    /// Rewrites every account's weight from the `{tier -> weight}` map, then
    /// re-syncs files for each provider that changed.
    pub async fn apply_tier_defaults(
        &self,
        weights: &BTreeMap<Tier, u32>,
    ) -> Result<(), AccountsError> {
        for provider in ALL_PROVIDERS {
            let mut touched = false;
            for account in self.store.list(provider) {
                if let Some(&weight) = weights.get(&account.tier) {
                    if weight != account.weight {
                        self.store.set_weight(provider, &account.id, weight)?;
                        touched = true;
                    }
                }
            }
            if touched {
                self.sync_weights(provider).await?;
            }
        }
        Ok(())
    }

    /// Groups accounts by `projectId` and returns the groups with more than
    /// one member. The doctor workflow warns on each: failover cannot help
    /// when the pool is shared.
    pub fn shared_project_groups(&self, provider: Provider) -> Vec<SharedProjectGroup> {
        let mut by_project: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for account in self.store.list(provider) {
            if let Some(project) = account.project_id {
                by_project.entry(project).or_default().push(account.id);
            }
        }
        by_project
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .map(|(project_id, account_ids)| SharedProjectGroup {
                project_id,
                account_ids,
            })
            .collect()
    }
}

fn relocate_file(from: &std::path::Path, to: &std::path::Path) -> Result<(), AccountsError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|source| AccountsError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::rename(from, to).map_err(|source| AccountsError::Relocate {
        from: from.to_path_buf(),
        to: to.to_path_buf(),
        source,
    })
}

fn copy_index(stem: &str, name: &str) -> Option<u32> {
    name.strip_prefix(stem)?
        .strip_prefix(".w")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}
