use std::path::{Path, PathBuf};
use std::time::Duration;

use ccs_provider::read_to_string_bounded;
use chrono::DateTime;
use serde_json::Value;

use crate::error::AccountsError;
use crate::now_ms;

/// Token files larger than this are rejected outright.
pub const TOKEN_FILE_MAX_BYTES: u64 = 1024 * 1024;

/// A token whose remaining lifetime is below this is "expiring soon" and must
/// be refreshed before use.
pub const EXPIRING_SOON: Duration = Duration::from_secs(5 * 60);

/// Horizon the background worker uses for preemptive refresh.
pub const REFRESH_HORIZON: Duration = Duration::from_secs(45 * 60);

/// Fallback lifetime assumed when a token file carries no expiry at all:
/// its mtime plus this.
const MTIME_FALLBACK_LIFETIME: Duration = Duration::from_secs(50 * 60);

/// Validity of a token file at a point in time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TokenStatus {
    Valid,
    ExpiringSoon,
    Expired,
    Missing,
    Invalid,
}

/// A provider token file, held as untyped JSON so writes preserve every key
/// we do not explicitly modify.
///
/// The core only interprets a common subset: `type`, the access/refresh token
/// pair (either top-level or nested under `token`), one of the expiry
/// spellings, and optional `email` / `project_id`. Provider-specific fields
/// ride along untouched.
#[derive(Clone, Debug)]
pub struct TokenDocument {
    path: PathBuf,
    value: Value,
    mtime_ms: Option<i64>,
}

impl TokenDocument {
    /// Loads and validates a token file. Rejects files over
    /// [`TOKEN_FILE_MAX_BYTES`], malformed JSON, and non-object roots.
    pub fn load(path: &Path) -> Result<Self, AccountsError> {
        let contents =
            read_to_string_bounded(path, TOKEN_FILE_MAX_BYTES).map_err(|err| match err {
                ccs_provider::BoundedReadError::Io { ref source, .. }
                    if source.kind() == std::io::ErrorKind::NotFound =>
                {
                    AccountsError::TokenMissing {
                        path: path.to_path_buf(),
                    }
                }
                other => AccountsError::TokenInvalid {
                    path: path.to_path_buf(),
                    reason: other.to_string(),
                },
            })?;

        let value: Value =
            serde_json::from_str(&contents).map_err(|err| AccountsError::TokenInvalid {
                path: path.to_path_buf(),
                reason: err.to_string(),
            })?;
        if !value.is_object() {
            return Err(AccountsError::TokenInvalid {
                path: path.to_path_buf(),
                reason: "root is not a JSON object".to_string(),
            });
        }

        let mtime_ms = std::fs::metadata(path)
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|time| time.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|dur| dur.as_millis() as i64);

        Ok(Self {
            path: path.to_path_buf(),
            value,
            mtime_ms,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The `type` field identifying the owning provider.
    pub fn auth_type(&self) -> Option<&str> {
        self.value.get("type").and_then(Value::as_str)
    }

    pub fn email(&self) -> Option<&str> {
        self.value.get("email").and_then(Value::as_str)
    }

    pub fn project_id(&self) -> Option<&str> {
        self.value
            .get("project_id")
            .or_else(|| self.value.get("projectId"))
            .and_then(Value::as_str)
    }

    /// Access token, wherever the provider's shape puts it.
    pub fn access_token(&self) -> Option<&str> {
        self.token_field("access_token")
    }

    /// Refresh token. Absence makes the file unusable for refresh.
    pub fn refresh_token(&self) -> Option<&str> {
        self.token_field("refresh_token")
    }

    fn token_field(&self, key: &str) -> Option<&str> {
        if let Some(direct) = self.value.get(key).and_then(Value::as_str) {
            return Some(direct);
        }
        self.value
            .get("token")
            .and_then(|nested| nested.get(key))
            .and_then(Value::as_str)
    }

    /// Whether the access token lives nested under `token` (sidecar-native
    /// shape) rather than at the top level (Gemini-CLI-native shape). Writes
    /// go back into the same spot.
    fn uses_nested_token(&self) -> bool {
        self.value.get("access_token").and_then(Value::as_str).is_none()
            && self
                .value
                .get("token")
                .and_then(|nested| nested.get("access_token"))
                .is_some()
    }

    /// Expiry in epoch milliseconds.
    ///
    /// Order: numeric `expiry_date`, then `expiry` (epoch ms or ISO-8601),
    /// then ISO `expired`, then mtime plus a 50-minute assumed lifetime.
    pub fn expires_at_ms(&self) -> Option<i64> {
        if let Some(ms) = self.numeric_expiry("expiry_date") {
            return Some(ms);
        }
        if let Some(ms) = self.numeric_expiry("expiry") {
            return Some(ms);
        }
        for key in ["expiry", "expired"] {
            if let Some(text) = self.value.get(key).and_then(Value::as_str) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(text) {
                    return Some(parsed.timestamp_millis());
                }
            }
        }
        self.mtime_ms
            .map(|mtime| mtime + MTIME_FALLBACK_LIFETIME.as_millis() as i64)
    }

    fn numeric_expiry(&self, key: &str) -> Option<i64> {
        let number = self.value.get(key).and_then(Value::as_f64)?;
        (number.is_finite() && number > 0.0).then_some(number as i64)
    }

    /// Status relative to `now` (epoch ms).
    pub fn status_at(&self, now: i64) -> TokenStatus {
        if self.refresh_token().is_none() {
            return TokenStatus::Invalid;
        }
        match self.expires_at_ms() {
            Some(expires) if expires <= now => TokenStatus::Expired,
            Some(expires) if expires - now < EXPIRING_SOON.as_millis() as i64 => {
                TokenStatus::ExpiringSoon
            }
            Some(_) => TokenStatus::Valid,
            None => TokenStatus::Valid,
        }
    }

    pub fn status(&self) -> TokenStatus {
        self.status_at(now_ms())
    }

    /// Whether the token falls inside the background worker's preemptive
    /// refresh window.
    pub fn within_refresh_horizon(&self, now: i64) -> bool {
        match self.expires_at_ms() {
            Some(expires) => expires - now < REFRESH_HORIZON.as_millis() as i64,
            None => false,
        }
    }

    /// Installs a freshly-minted access token and its expiry, into whichever
    /// shape the file already uses. Every other key is left alone.
    pub fn apply_refreshed_access(&mut self, access_token: &str, expires_in_secs: i64) {
        let expiry_ms = now_ms() + expires_in_secs * 1000;
        let target = if self.uses_nested_token() {
            self.value.get_mut("token").and_then(Value::as_object_mut)
        } else {
            self.value.as_object_mut()
        };
        if let Some(object) = target {
            object.insert("access_token".to_string(), Value::String(access_token.to_string()));
            object.insert("expiry_date".to_string(), Value::from(expiry_ms));
        }
    }

    /// Writes the document back to its source path, atomically, owner-only.
    pub fn save(&self) -> Result<(), AccountsError> {
        let contents =
            serde_json::to_vec_pretty(&self.value).map_err(|source| AccountsError::Serialize { source })?;
        ccs_provider::write_secret_atomic(&self.path, &contents).map_err(|source| {
            AccountsError::Write {
                path: self.path.clone(),
                source,
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_token(dir: &Path, name: &str, contents: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn rejects_oversized_and_malformed() {
        let temp = TempDir::new().unwrap();
        let big = write_token(temp.path(), "big.json", &"x".repeat(2 * 1024 * 1024));
        assert!(matches!(
            TokenDocument::load(&big),
            Err(AccountsError::TokenInvalid { .. })
        ));

        let bad = write_token(temp.path(), "bad.json", "not json");
        assert!(matches!(
            TokenDocument::load(&bad),
            Err(AccountsError::TokenInvalid { .. })
        ));

        let missing = temp.path().join("absent.json");
        assert!(matches!(
            TokenDocument::load(&missing),
            Err(AccountsError::TokenMissing { .. })
        ));
    }

    #[test]
    fn reads_flat_and_nested_token_shapes() {
        let temp = TempDir::new().unwrap();
        let flat = write_token(
            temp.path(),
            "flat.json",
            r#"{"type":"gemini","access_token":"a1","refresh_token":"r1"}"#,
        );
        let doc = TokenDocument::load(&flat).unwrap();
        assert_eq!(doc.access_token(), Some("a1"));
        assert_eq!(doc.refresh_token(), Some("r1"));

        let nested = write_token(
            temp.path(),
            "nested.json",
            r#"{"type":"codex","token":{"access_token":"a2","refresh_token":"r2"}}"#,
        );
        let doc = TokenDocument::load(&nested).unwrap();
        assert_eq!(doc.access_token(), Some("a2"));
        assert_eq!(doc.refresh_token(), Some("r2"));
    }

    #[test]
    fn expiry_prefers_expiry_date_then_iso_then_mtime() {
        let temp = TempDir::new().unwrap();
        let explicit = write_token(
            temp.path(),
            "explicit.json",
            r#"{"refresh_token":"r","expiry_date":1700000000000}"#,
        );
        let doc = TokenDocument::load(&explicit).unwrap();
        assert_eq!(doc.expires_at_ms(), Some(1_700_000_000_000));

        let iso = write_token(
            temp.path(),
            "iso.json",
            r#"{"refresh_token":"r","expired":"2023-11-14T22:13:20Z"}"#,
        );
        let doc = TokenDocument::load(&iso).unwrap();
        assert_eq!(doc.expires_at_ms(), Some(1_700_000_000_000));

        let bare = write_token(temp.path(), "bare.json", r#"{"refresh_token":"r"}"#);
        let doc = TokenDocument::load(&bare).unwrap();
        let expires = doc.expires_at_ms().unwrap();
        let now = now_ms();
        assert!(expires > now + 45 * 60 * 1000, "mtime fallback ~50min out");
        assert!(expires < now + 55 * 60 * 1000);
    }

    #[test]
    fn status_thresholds() {
        let temp = TempDir::new().unwrap();
        let now = now_ms();
        let soon = write_token(
            temp.path(),
            "soon.json",
            &format!(r#"{{"refresh_token":"r","expiry_date":{}}}"#, now + 60_000),
        );
        let doc = TokenDocument::load(&soon).unwrap();
        assert_eq!(doc.status_at(now), TokenStatus::ExpiringSoon);
        assert!(doc.within_refresh_horizon(now));

        let healthy = write_token(
            temp.path(),
            "healthy.json",
            &format!(r#"{{"refresh_token":"r","expiry_date":{}}}"#, now + 3_600_000),
        );
        let doc = TokenDocument::load(&healthy).unwrap();
        assert_eq!(doc.status_at(now), TokenStatus::Valid);
        assert!(!doc.within_refresh_horizon(now));

        let dead = write_token(
            temp.path(),
            "dead.json",
            &format!(r#"{{"refresh_token":"r","expiry_date":{}}}"#, now - 1),
        );
        assert_eq!(TokenDocument::load(&dead).unwrap().status_at(now), TokenStatus::Expired);

        let no_refresh = write_token(temp.path(), "norefresh.json", r#"{"access_token":"a"}"#);
        assert_eq!(
            TokenDocument::load(&no_refresh).unwrap().status_at(now),
            TokenStatus::Invalid
        );
    }

    #[test]
    fn refreshed_access_preserves_unknown_keys_and_shape() {
        let temp = TempDir::new().unwrap();
        let path = write_token(
            temp.path(),
            "gemini.json",
            r#"{"type":"gemini","access_token":"old","refresh_token":"r","scope":"email","custom":{"a":1}}"#,
        );
        let mut doc = TokenDocument::load(&path).unwrap();
        doc.apply_refreshed_access("new-token", 3600);
        doc.save().unwrap();

        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reloaded["access_token"], "new-token");
        assert_eq!(reloaded["scope"], "email");
        assert_eq!(reloaded["custom"]["a"], 1);
        assert!(reloaded["expiry_date"].as_i64().unwrap() > now_ms());

        let nested_path = write_token(
            temp.path(),
            "codex.json",
            r#"{"type":"codex","token":{"access_token":"old","refresh_token":"r"},"meta":true}"#,
        );
        let mut doc = TokenDocument::load(&nested_path).unwrap();
        doc.apply_refreshed_access("new-token", 60);
        doc.save().unwrap();
        let reloaded: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&nested_path).unwrap()).unwrap();
        assert_eq!(reloaded["token"]["access_token"], "new-token");
        assert_eq!(reloaded["meta"], true);
    }
}
