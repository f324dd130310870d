use std::collections::BTreeSet;
use std::fs;
use std::time::UNIX_EPOCH;

use ccs_provider::{Provider, Tier, ALL_PROVIDERS};
use tracing::debug;

use crate::error::AccountsError;
use crate::registry::{is_weight_copy_of, AccountRecord, AccountStore};
use crate::token::TokenDocument;

/// What a discovery pass found and recorded.
#[derive(Clone, Debug, Default)]
pub struct DiscoveryReport {
    /// Newly synthesized accounts, as `(provider, id)`.
    pub added: Vec<(Provider, String)>,
    /// Token files scanned (registered or not).
    pub scanned: usize,
}

impl AccountStore {
    /// Scans `auth/` for token files that no registered account references
    /// and synthesizes registry entries for them.
    ///
    /// Provider identity comes from each file's `type` field. Email providers
    /// get their email as id and the email prefix as nickname; no-email
    /// providers get an id derived from a `<prov>-oauth-<profile>` filename,
    /// falling back to the first free `<prov>-N`. `createdAt` mirrors the
    /// file's birth time and `lastUsedAt` its mtime.
    ///
    /// Before writing, the registry is re-read and merged so a concurrent
    /// OAuth registration wins on id conflicts; a discovered `projectId` is
    /// still merged into the fresh entry when it has none.
    pub fn discover(&self) -> Result<DiscoveryReport, AccountsError> {
        let mut report = DiscoveryReport::default();
        let doc = self.load_synced();

        let mut referenced: BTreeSet<String> = BTreeSet::new();
        for entry in doc.providers.values() {
            for record in entry.accounts.values() {
                referenced.insert(record.token_file.clone());
            }
        }

        let auth_dir = self.config_root().auth_dir();
        let Ok(entries) = fs::read_dir(&auth_dir) else {
            return Ok(report);
        };

        struct Candidate {
            provider: Provider,
            id: String,
            record: AccountRecord,
        }
        let mut candidates: Vec<Candidate> = Vec::new();

        for dir_entry in entries.flatten() {
            let name = dir_entry.file_name();
            let Some(name) = name.to_str().map(str::to_string) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            report.scanned += 1;
            if referenced.contains(&name) {
                continue;
            }
            let stem_of = |file: &str| file.trim_end_matches(".json").to_string();
            if referenced
                .iter()
                .any(|existing| is_weight_copy_of(&stem_of(existing), &name))
            {
                continue;
            }

            let path = dir_entry.path();
            let token = match TokenDocument::load(&path) {
                Ok(token) => token,
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "skipping unreadable token file");
                    continue;
                }
            };
            let Some(provider) = token.auth_type().and_then(provider_for_type) else {
                continue;
            };

            let metadata = fs::metadata(&path).ok();
            let created_at = metadata
                .as_ref()
                .and_then(|meta| meta.created().or_else(|_| meta.modified()).ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|dur| dur.as_millis() as i64)
                .unwrap_or_else(crate::now_ms);
            let last_used_at = metadata
                .as_ref()
                .and_then(|meta| meta.modified().ok())
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|dur| dur.as_millis() as i64);

            let pending: Vec<String> = candidates
                .iter()
                .filter(|candidate| candidate.provider == provider)
                .map(|candidate| candidate.id.clone())
                .collect();
            let (id, nickname) = if provider.has_email() {
                match token.email() {
                    Some(email) => (
                        email.to_string(),
                        email.split('@').next().unwrap_or(email).to_string(),
                    ),
                    None => {
                        let id = derived_no_email_id(provider, &name, &doc, &pending);
                        (id.clone(), id)
                    }
                }
            } else {
                let id = derived_no_email_id(provider, &name, &doc, &pending);
                (id.clone(), id)
            };

            candidates.push(Candidate {
                provider,
                id,
                record: AccountRecord {
                    email: token.email().map(str::to_string),
                    nickname,
                    token_file: name.clone(),
                    created_at,
                    last_used_at,
                    paused: false,
                    paused_at: None,
                    tier: Tier::Unknown,
                    weight: 1,
                    project_id: token.project_id().map(str::to_string),
                },
            });
            referenced.insert(name);
        }

        if candidates.is_empty() {
            return Ok(report);
        }

        // Reload-merge: a concurrent OAuth registration may have written the
        // registry since we scanned. The fresh registry wins on id conflict;
        // a discovered projectId still fills a hole in the fresh entry.
        let mut fresh = self.load_doc();
        for candidate in candidates {
            let entry = fresh.entry_mut(candidate.provider);
            match entry.accounts.get_mut(&candidate.id) {
                Some(existing) => {
                    if existing.project_id.is_none() {
                        existing.project_id = candidate.record.project_id.clone();
                    }
                }
                None => {
                    entry.accounts.insert(candidate.id.clone(), candidate.record);
                    report.added.push((candidate.provider, candidate.id));
                }
            }
            if entry.default.is_none() {
                entry.default = entry.accounts.keys().next().cloned();
            }
        }
        self.save_doc(&fresh)?;
        Ok(report)
    }
}

/// Maps a token file `type` value to its provider.
fn provider_for_type(type_value: &str) -> Option<Provider> {
    ALL_PROVIDERS
        .into_iter()
        .find(|provider| provider.auth_type_values().contains(&type_value))
}

/// Id for an account with no email: `<prov>-<profile>` when the filename
/// follows `<prov>-oauth-<profile>.json`, else the first free `<prov>-N`.
fn derived_no_email_id(
    provider: Provider,
    file_name: &str,
    doc: &crate::registry::RegistryDoc,
    pending: &[String],
) -> String {
    let stem = file_name.trim_end_matches(".json");
    let oauth_prefix = format!("{}-oauth-", provider.tag());
    if let Some(profile) = stem.strip_prefix(&oauth_prefix) {
        if !profile.is_empty() {
            return format!("{}-{}", provider.tag(), profile);
        }
    }

    let taken = |id: &str| {
        pending.iter().any(|pending_id| pending_id == id)
            || doc
                .entry(provider)
                .is_some_and(|entry| entry.accounts.contains_key(id))
    };
    let mut n = 1u32;
    loop {
        let candidate = format!("{}-{}", provider.tag(), n);
        if !taken(&candidate) {
            return candidate;
        }
        n += 1;
    }
}
