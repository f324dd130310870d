use std::fs;
use std::path::PathBuf;

use ccs_provider::{ConfigRoot, Provider};
use tempfile::TempDir;

use crate::registry::AccountStore;

pub(super) struct StoreFixture {
    pub store: AccountStore,
    pub root: ConfigRoot,
    // Held for its Drop.
    _temp: TempDir,
}

pub(super) fn store_fixture() -> StoreFixture {
    let temp = TempDir::new().unwrap();
    let root = ConfigRoot::new(temp.path().join("ccs"));
    root.materialize().unwrap();
    StoreFixture {
        store: AccountStore::new(root.clone()),
        root,
        _temp: temp,
    }
}

/// Drops a minimal token file into `auth/` and returns its basename.
pub(super) fn write_token(
    root: &ConfigRoot,
    provider: Provider,
    basename: &str,
    email: Option<&str>,
) -> String {
    let mut body = serde_json::json!({
        "type": provider.auth_type_values()[0],
        "access_token": "at",
        "refresh_token": "rt",
    });
    if let Some(email) = email {
        body["email"] = serde_json::Value::String(email.to_string());
    }
    let path = root.auth_dir().join(basename);
    fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
    basename.to_string()
}

pub(super) fn auth_path(root: &ConfigRoot, basename: &str) -> PathBuf {
    root.auth_dir().join(basename)
}

pub(super) fn paused_path(root: &ConfigRoot, basename: &str) -> PathBuf {
    root.auth_paused_dir().join(basename)
}
