use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, OnceLock};

use ccs_provider::{validate_nickname, ConfigRoot, Provider, Tier};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AccountsError;
use crate::now_ms;

const REGISTRY_VERSION: u32 = 1;

/// Weight range accepted by `setWeight` and tier defaults.
pub(crate) const WEIGHT_MAX: u32 = 99;

fn default_weight() -> u32 {
    1
}

/// One account as persisted under `providers.<tag>.accounts.<id>`.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct AccountRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    pub nickname: String,
    pub token_file: String,
    pub created_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub paused: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_at: Option<i64>,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_weight")]
    pub weight: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct ProviderEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default)]
    pub accounts: BTreeMap<String, AccountRecord>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub(crate) struct RegistryDoc {
    pub version: u32,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderEntry>,
}

impl Default for RegistryDoc {
    fn default() -> Self {
        Self {
            version: REGISTRY_VERSION,
            providers: BTreeMap::new(),
        }
    }
}

impl RegistryDoc {
    pub(crate) fn entry_mut(&mut self, provider: Provider) -> &mut ProviderEntry {
        self.providers.entry(provider.tag().to_string()).or_default()
    }

    pub(crate) fn entry(&self, provider: Provider) -> Option<&ProviderEntry> {
        self.providers.get(provider.tag())
    }
}

/// A registered account, with its identity and default flag resolved.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Account {
    pub id: String,
    pub is_default: bool,
    pub email: Option<String>,
    pub nickname: String,
    /// Basename of the token file under `auth/` (or `auth-paused/`).
    pub token_file: String,
    pub created_at: i64,
    pub last_used_at: Option<i64>,
    pub paused: bool,
    pub paused_at: Option<i64>,
    pub tier: Tier,
    pub weight: u32,
    pub project_id: Option<String>,
}

impl Account {
    fn from_record(id: &str, is_default: bool, record: &AccountRecord) -> Self {
        Self {
            id: id.to_string(),
            is_default,
            email: record.email.clone(),
            nickname: record.nickname.clone(),
            token_file: record.token_file.clone(),
            created_at: record.created_at,
            last_used_at: record.last_used_at,
            paused: record.paused,
            paused_at: record.paused_at,
            tier: record.tier,
            weight: record.weight,
            project_id: record.project_id.clone(),
        }
    }

    /// Active means eligible for routing: not paused and weighted in.
    pub fn is_active(&self) -> bool {
        !self.paused && self.weight > 0
    }
}

/// Result of a bulk pause/resume: no fail-fast, every id is reported.
#[derive(Clone, Debug, Default)]
pub struct BulkOutcome {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Result of `solo`: the activated account and everything that was paused to
/// make room for it.
#[derive(Clone, Debug)]
pub struct SoloOutcome {
    pub activated: String,
    pub paused: Vec<String>,
}

/// Serializes same-provider operations that read-modify-write both the
/// registry and the auth directories.
#[derive(Default)]
pub(crate) struct ProviderLocks {
    locks: StdMutex<HashMap<Provider, Arc<tokio::sync::Mutex<()>>>>,
}

impl ProviderLocks {
    pub(crate) fn lock_for(&self, provider: Provider) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        locks
            .entry(provider)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

fn solo_locks() -> &'static ProviderLocks {
    static LOCKS: OnceLock<ProviderLocks> = OnceLock::new();
    LOCKS.get_or_init(ProviderLocks::default)
}

/// Durable multi-account store rooted at a [`ConfigRoot`].
///
/// Every operation is atomic from the caller's viewpoint: mutations re-read
/// the registry, apply one change, and write the whole document back with a
/// temp-file rename. Read errors degrade to an empty registry (a missing or
/// corrupt file never breaks a command); write errors propagate.
#[derive(Clone, Debug)]
pub struct AccountStore {
    root: ConfigRoot,
}

impl AccountStore {
    pub fn new(root: ConfigRoot) -> Self {
        Self { root }
    }

    pub fn config_root(&self) -> &ConfigRoot {
        &self.root
    }

    pub(crate) fn auth_path(&self, token_file: &str) -> PathBuf {
        self.root.auth_dir().join(token_file)
    }

    pub(crate) fn paused_path(&self, token_file: &str) -> PathBuf {
        self.root.auth_paused_dir().join(token_file)
    }

    /// The on-disk location this account's token file is expected at.
    /// Paused and weighted-out accounts live in `auth-paused/` so the
    /// sidecar does not index them.
    pub fn expected_token_path(&self, account: &Account) -> PathBuf {
        if account.paused || account.weight == 0 {
            self.paused_path(&account.token_file)
        } else {
            self.auth_path(&account.token_file)
        }
    }

    /// Wherever the token file actually is right now, if anywhere.
    pub fn locate_token_file(&self, token_file: &str) -> Option<PathBuf> {
        let active = self.auth_path(token_file);
        if active.exists() {
            return Some(active);
        }
        let paused = self.paused_path(token_file);
        paused.exists().then_some(paused)
    }

    pub(crate) fn load_doc(&self) -> RegistryDoc {
        let path = self.root.accounts_path();
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(path = %path.display(), error = %err, "registry unreadable, starting empty");
                }
                return RegistryDoc::default();
            }
        };
        match serde_json::from_str(&contents) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "registry corrupt, starting empty");
                RegistryDoc::default()
            }
        }
    }

    pub(crate) fn save_doc(&self, doc: &RegistryDoc) -> Result<(), AccountsError> {
        let path = self.root.accounts_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| AccountsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let contents =
            serde_json::to_vec_pretty(doc).map_err(|source| AccountsError::Serialize { source })?;
        ccs_provider::write_secret_atomic(&path, &contents)
            .map_err(|source| AccountsError::Write { path, source })
    }

    /// Loads the registry and reconciles it against the auth directories:
    /// accounts whose token file is gone from both locations are dropped,
    /// a pause flag that disagrees with the file's actual location is healed,
    /// and the default is re-promoted when it dangles.
    pub(crate) fn load_synced(&self) -> RegistryDoc {
        let mut doc = self.load_doc();
        let changed = self.reconcile(&mut doc);
        if changed {
            if let Err(err) = self.save_doc(&doc) {
                debug!(error = %err, "registry reconcile writeback failed");
            }
        }
        doc
    }

    fn reconcile(&self, doc: &mut RegistryDoc) -> bool {
        let mut changed = false;
        for entry in doc.providers.values_mut() {
            let mut stale: Vec<String> = Vec::new();
            for (id, record) in entry.accounts.iter() {
                let active = self.auth_path(&record.token_file);
                let paused = self.paused_path(&record.token_file);
                let in_auth = active.exists();
                let in_paused = paused.exists();
                if !in_auth && !in_paused {
                    stale.push(id.clone());
                    continue;
                }
                // The registry is authoritative; a token file stranded in the
                // wrong directory (interrupted pause/resume, manual move) is
                // relocated to where the record says it belongs.
                let parked = record.paused || record.weight == 0;
                let (expected_here, move_from, move_to) = if parked {
                    (in_paused, &active, &paused)
                } else {
                    (in_auth, &paused, &active)
                };
                if !expected_here {
                    if let Err(err) = relocate(move_from, move_to) {
                        debug!(account = %id, error = %err, "stale token relocation failed");
                    }
                }
            }
            for id in stale {
                entry.accounts.remove(&id);
                changed = true;
            }
            let default_ok = entry
                .default
                .as_ref()
                .is_some_and(|id| entry.accounts.contains_key(id));
            if !default_ok {
                let promoted = entry.accounts.keys().next().cloned();
                if entry.default != promoted {
                    entry.default = promoted;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Lists all accounts for a provider, sync-on-load applied.
    pub fn list(&self, provider: Provider) -> Vec<Account> {
        let doc = self.load_synced();
        let Some(entry) = doc.entry(provider) else {
            return Vec::new();
        };
        entry
            .accounts
            .iter()
            .map(|(id, record)| {
                Account::from_record(id, entry.default.as_deref() == Some(id.as_str()), record)
            })
            .collect()
    }

    /// The account flagged default, else the first registered one.
    pub fn default_account(&self, provider: Provider) -> Option<Account> {
        let accounts = self.list(provider);
        accounts
            .iter()
            .find(|account| account.is_default)
            .or_else(|| accounts.first())
            .cloned()
    }

    /// Exact match on id/email/nickname, then case-insensitive prefix on
    /// nickname and email.
    pub fn find(&self, provider: Provider, query: &str) -> Option<Account> {
        let accounts = self.list(provider);
        if let Some(exact) = accounts.iter().find(|account| {
            account.id == query
                || account.email.as_deref() == Some(query)
                || account.nickname == query
        }) {
            return Some(exact.clone());
        }
        let lower = query.to_lowercase();
        accounts
            .iter()
            .find(|account| {
                account.nickname.to_lowercase().starts_with(&lower)
                    || account
                        .email
                        .as_deref()
                        .is_some_and(|email| email.to_lowercase().starts_with(&lower))
            })
            .cloned()
    }

    /// Registers (or re-registers) an account. Idempotent by id: a second
    /// call with the same identity updates the token file, merges the
    /// project id, and bumps `lastUsedAt`. The first account registered for
    /// a provider becomes its default.
    pub fn register(
        &self,
        provider: Provider,
        token_file: &str,
        email: Option<&str>,
        nickname: Option<&str>,
        project_id: Option<&str>,
    ) -> Result<Account, AccountsError> {
        if token_file.contains('/') || token_file.contains('\\') {
            return Err(AccountsError::TokenFileNotBasename {
                name: token_file.to_string(),
            });
        }

        let id = if provider.has_email() {
            match (email, nickname) {
                (Some(email), _) => email.to_string(),
                (None, Some(nickname)) => nickname.to_string(),
                (None, None) => token_file.trim_end_matches(".json").to_string(),
            }
        } else {
            let nickname = nickname.ok_or(AccountsError::NicknameRequired { provider })?;
            validate_nickname(nickname)?;
            nickname.to_string()
        };

        let nickname = nickname
            .map(str::to_string)
            .or_else(|| email.map(|email| email.split('@').next().unwrap_or(email).to_string()))
            .unwrap_or_else(|| id.clone());

        let mut doc = self.load_synced();
        let entry = doc.entry_mut(provider);

        let now = now_ms();
        match entry.accounts.get_mut(&id) {
            Some(record) => {
                record.token_file = token_file.to_string();
                record.last_used_at = Some(now);
                if record.email.is_none() {
                    record.email = email.map(str::to_string);
                }
                if let Some(project) = project_id {
                    record.project_id = Some(project.to_string());
                }
            }
            None => {
                entry.accounts.insert(
                    id.clone(),
                    AccountRecord {
                        email: email.map(str::to_string),
                        nickname,
                        token_file: token_file.to_string(),
                        created_at: now,
                        last_used_at: Some(now),
                        paused: false,
                        paused_at: None,
                        tier: Tier::Unknown,
                        weight: default_weight(),
                        project_id: project_id.map(str::to_string),
                    },
                );
            }
        }
        if entry.default.is_none() {
            entry.default = Some(id.clone());
        }

        let account = Account::from_record(
            &id,
            doc.entry(provider).and_then(|entry| entry.default.as_deref()) == Some(id.as_str()),
            doc.entry(provider)
                .and_then(|entry| entry.accounts.get(&id))
                .ok_or_else(|| AccountsError::AccountNotFound {
                    provider,
                    query: id.clone(),
                })?,
        );
        self.save_doc(&doc)?;
        Ok(account)
    }

    /// Marks `id` as the provider default.
    pub fn set_default(&self, provider: Provider, id: &str) -> Result<bool, AccountsError> {
        self.mutate(provider, id, |entry, id| {
            entry.default = Some(id.to_string());
        })
    }

    /// Pauses an account: relocates its token file to `auth-paused/` and
    /// flags it. Idempotent.
    pub fn pause(&self, provider: Provider, id: &str) -> Result<bool, AccountsError> {
        let mut doc = self.load_synced();
        let Some(entry) = doc.providers.get_mut(provider.tag()) else {
            return Ok(false);
        };
        let Some(record) = entry.accounts.get_mut(id) else {
            return Ok(false);
        };
        relocate(
            &self.auth_path(&record.token_file),
            &self.paused_path(&record.token_file),
        )?;
        remove_weight_copies(&self.root.auth_dir(), &record.token_file);
        if !record.paused {
            record.paused = true;
            record.paused_at = Some(now_ms());
        }
        self.save_doc(&doc)?;
        Ok(true)
    }

    /// Resumes a paused account: relocates the token file back and clears
    /// the flag. Idempotent.
    pub fn resume(&self, provider: Provider, id: &str) -> Result<bool, AccountsError> {
        let mut doc = self.load_synced();
        let Some(entry) = doc.providers.get_mut(provider.tag()) else {
            return Ok(false);
        };
        let Some(record) = entry.accounts.get_mut(id) else {
            return Ok(false);
        };
        relocate(
            &self.paused_path(&record.token_file),
            &self.auth_path(&record.token_file),
        )?;
        record.paused = false;
        record.paused_at = None;
        self.save_doc(&doc)?;
        Ok(true)
    }

    /// Removes an account and deletes its token file (and any weighted
    /// copies). Promotes a new default when the removed account held it.
    pub fn remove(&self, provider: Provider, id: &str) -> Result<bool, AccountsError> {
        let mut doc = self.load_synced();
        let Some(entry) = doc.providers.get_mut(provider.tag()) else {
            return Ok(false);
        };
        let Some(record) = entry.accounts.remove(id) else {
            return Ok(false);
        };
        for path in [
            self.auth_path(&record.token_file),
            self.paused_path(&record.token_file),
        ] {
            if let Err(err) = fs::remove_file(&path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "failed to delete token file");
                }
            }
        }
        remove_weight_copies(&self.root.auth_dir(), &record.token_file);
        if entry.default.as_deref() == Some(id) {
            entry.default = entry.accounts.keys().next().cloned();
        }
        self.save_doc(&doc)?;
        Ok(true)
    }

    /// Renames an account's nickname. For no-email providers the nickname is
    /// the id, so the registry key and the default reference move with it.
    pub fn rename(
        &self,
        provider: Provider,
        id: &str,
        new_nickname: &str,
    ) -> Result<bool, AccountsError> {
        validate_nickname(new_nickname)?;
        let mut doc = self.load_synced();
        let Some(entry) = doc.providers.get_mut(provider.tag()) else {
            return Ok(false);
        };
        if !entry.accounts.contains_key(id) {
            return Ok(false);
        }
        let taken = entry
            .accounts
            .iter()
            .any(|(existing, record)| existing != id && record.nickname == new_nickname);
        if taken {
            return Err(AccountsError::NicknameTaken {
                provider,
                nickname: new_nickname.to_string(),
            });
        }

        if provider.has_email() {
            if let Some(record) = entry.accounts.get_mut(id) {
                record.nickname = new_nickname.to_string();
            }
        } else if let Some(mut record) = entry.accounts.remove(id) {
            record.nickname = new_nickname.to_string();
            entry.accounts.insert(new_nickname.to_string(), record);
            if entry.default.as_deref() == Some(id) {
                entry.default = Some(new_nickname.to_string());
            }
        }
        self.save_doc(&doc)?;
        Ok(true)
    }

    /// Sets the routing weight (0..=99). Weight 0 takes the account out of
    /// rotation at the next weighted sync without pausing it.
    pub fn set_weight(&self, provider: Provider, id: &str, weight: u32) -> Result<bool, AccountsError> {
        if weight > WEIGHT_MAX {
            return Err(AccountsError::WeightOutOfRange { weight });
        }
        self.mutate(provider, id, |entry, id| {
            if let Some(record) = entry.accounts.get_mut(id) {
                record.weight = weight;
            }
        })
    }

    pub fn set_tier(&self, provider: Provider, id: &str, tier: Tier) -> Result<bool, AccountsError> {
        self.mutate(provider, id, |entry, id| {
            if let Some(record) = entry.accounts.get_mut(id) {
                record.tier = tier;
            }
        })
    }

    /// Bumps `lastUsedAt` to now.
    pub fn touch(&self, provider: Provider, id: &str) -> Result<bool, AccountsError> {
        self.mutate(provider, id, |entry, id| {
            if let Some(record) = entry.accounts.get_mut(id) {
                record.last_used_at = Some(now_ms());
            }
        })
    }

    fn mutate(
        &self,
        provider: Provider,
        id: &str,
        apply: impl FnOnce(&mut ProviderEntry, &str),
    ) -> Result<bool, AccountsError> {
        let mut doc = self.load_synced();
        let Some(entry) = doc.providers.get_mut(provider.tag()) else {
            return Ok(false);
        };
        if !entry.accounts.contains_key(id) {
            return Ok(false);
        }
        apply(entry, id);
        self.save_doc(&doc)?;
        Ok(true)
    }

    /// Pauses each id independently; failures are collected, not fatal.
    pub fn bulk_pause(&self, provider: Provider, ids: &[String]) -> BulkOutcome {
        self.bulk(provider, ids, Self::pause)
    }

    /// Resumes each id independently; failures are collected, not fatal.
    pub fn bulk_resume(&self, provider: Provider, ids: &[String]) -> BulkOutcome {
        self.bulk(provider, ids, Self::resume)
    }

    fn bulk(
        &self,
        provider: Provider,
        ids: &[String],
        op: impl Fn(&Self, Provider, &str) -> Result<bool, AccountsError>,
    ) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for id in ids {
            match op(self, provider, id) {
                Ok(true) => outcome.succeeded.push(id.clone()),
                Ok(false) => outcome
                    .failed
                    .push((id.clone(), "account not found".to_string())),
                Err(err) => outcome.failed.push((id.clone(), err.to_string())),
            }
        }
        outcome
    }

    /// Resumes `id` (if paused) and pauses every other active account of the
    /// provider. Serialized per provider so two concurrent `solo` calls
    /// cannot interleave their pause sets.
    pub async fn solo(&self, provider: Provider, id: &str) -> Result<SoloOutcome, AccountsError> {
        let lock = solo_locks().lock_for(provider);
        let _guard = lock.lock().await;

        let accounts = self.list(provider);
        let target = accounts
            .iter()
            .find(|account| account.id == id)
            .ok_or_else(|| AccountsError::AccountNotFound {
                provider,
                query: id.to_string(),
            })?;

        if target.paused {
            self.resume(provider, id)?;
        }
        let mut paused = Vec::new();
        for account in &accounts {
            if account.id != id && !account.paused {
                self.pause(provider, &account.id)?;
                paused.push(account.id.clone());
            }
        }
        Ok(SoloOutcome {
            activated: id.to_string(),
            paused,
        })
    }
}

/// Moves a token file between the active and paused directories. Treats
/// "already at destination" as success so pause/resume stay idempotent.
fn relocate(from: &Path, to: &Path) -> Result<(), AccountsError> {
    if !from.exists() {
        if to.exists() {
            return Ok(());
        }
        return Err(AccountsError::TokenMissing {
            path: from.to_path_buf(),
        });
    }
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

/// Deletes the derived `<stem>.w<N>.json` copies the weighted sync creates.
pub(crate) fn remove_weight_copies(auth_dir: &Path, token_file: &str) {
    let stem = token_file.trim_end_matches(".json");
    let Ok(entries) = fs::read_dir(auth_dir) else {
        return;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_weight_copy_of(stem, name) {
            let _ = fs::remove_file(entry.path());
        }
    }
}

/// `<stem>.w<N>.json` with N >= 2.
pub(crate) fn is_weight_copy_of(stem: &str, candidate: &str) -> bool {
    let Some(rest) = candidate.strip_prefix(stem) else {
        return false;
    };
    let Some(rest) = rest.strip_prefix(".w") else {
        return false;
    };
    let Some(number) = rest.strip_suffix(".json") else {
        return false;
    };
    !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit())
}

/// Deterministic name for the `index`-th duplicate (index >= 2).
pub(crate) fn weight_copy_name(token_file: &str, index: u32) -> String {
    let stem = token_file.trim_end_matches(".json");
    format!("{stem}.w{index}.json")
}
