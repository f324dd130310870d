use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use ccs_provider::{ConfigRoot, Provider};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AccountsError;
use crate::now_ms;

/// Cooldown window applied when the provider reports exhaustion without a
/// reset time.
pub const COOLDOWN_FALLBACK: Duration = Duration::from_secs(5 * 60);

/// One account's cooldown.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CooldownEntry {
    pub until_epoch_ms: i64,
    pub reason: String,
}

#[derive(Default, Serialize, Deserialize)]
struct CooldownDoc {
    #[serde(default)]
    entries: BTreeMap<String, CooldownEntry>,
}

/// Per-`(provider, account)` exhaustion cooldowns.
///
/// Held in memory and mirrored to a small JSON sidecar so the state survives
/// a restart. Expired entries are pruned on load. Read errors degrade to an
/// empty store; writes propagate.
#[derive(Debug)]
pub struct CooldownStore {
    path: PathBuf,
    entries: BTreeMap<String, CooldownEntry>,
}

impl CooldownStore {
    pub fn load(root: &ConfigRoot) -> Self {
        let path = root.cooldown_path();
        let mut entries = match std::fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str::<CooldownDoc>(&contents)
                .map(|doc| doc.entries)
                .unwrap_or_else(|err| {
                    debug!(path = %path.display(), error = %err, "cooldown sidecar corrupt, resetting");
                    BTreeMap::new()
                }),
            Err(_) => BTreeMap::new(),
        };
        let now = now_ms();
        entries.retain(|_, entry| entry.until_epoch_ms > now);
        Self { path, entries }
    }

    fn key(provider: Provider, account_id: &str) -> String {
        format!("{}:{account_id}", provider.tag())
    }

    /// Records exhaustion until `until_epoch_ms` (use
    /// [`Self::until_from_reset`] to derive it from an optional provider
    /// reset time).
    pub fn set(
        &mut self,
        provider: Provider,
        account_id: &str,
        until_epoch_ms: i64,
        reason: impl Into<String>,
    ) -> Result<(), AccountsError> {
        self.entries.insert(
            Self::key(provider, account_id),
            CooldownEntry {
                until_epoch_ms,
                reason: reason.into(),
            },
        );
        self.save()
    }

    /// The provider's reset time when known, else now plus the fallback
    /// window.
    pub fn until_from_reset(reset_time_ms: Option<i64>) -> i64 {
        reset_time_ms.unwrap_or_else(|| now_ms() + COOLDOWN_FALLBACK.as_millis() as i64)
    }

    pub fn is_on_cooldown(&self, provider: Provider, account_id: &str) -> bool {
        self.entries
            .get(&Self::key(provider, account_id))
            .is_some_and(|entry| entry.until_epoch_ms > now_ms())
    }

    pub fn get(&self, provider: Provider, account_id: &str) -> Option<&CooldownEntry> {
        self.entries.get(&Self::key(provider, account_id))
    }

    pub fn clear(&mut self, provider: Provider, account_id: &str) -> Result<(), AccountsError> {
        if self.entries.remove(&Self::key(provider, account_id)).is_some() {
            self.save()?;
        }
        Ok(())
    }

    fn save(&self) -> Result<(), AccountsError> {
        let doc = CooldownDoc {
            entries: self.entries.clone(),
        };
        let contents =
            serde_json::to_vec_pretty(&doc).map_err(|source| AccountsError::Serialize { source })?;
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| AccountsError::Write {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        ccs_provider::write_atomic(&self.path, &contents).map_err(|source| AccountsError::Write {
            path: self.path.clone(),
            source,
        })
    }
}
