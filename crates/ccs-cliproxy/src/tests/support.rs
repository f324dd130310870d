use std::fs;
use std::path::PathBuf;

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use ccs_accounts::AccountStore;
use ccs_provider::ConfigRoot;
use tempfile::TempDir;

pub(super) struct Fixture {
    pub root: ConfigRoot,
    pub store: AccountStore,
    _temp: TempDir,
}

pub(super) fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let root = ConfigRoot::new(temp.path().join("ccs"));
    root.materialize().unwrap();
    Fixture {
        store: AccountStore::new(root.clone()),
        root,
        _temp: temp,
    }
}

/// Writes an executable shell script standing in for the sidecar binary.
pub(super) fn write_fake_sidecar(fx: &Fixture, script: &str) -> PathBuf {
    let path = fx.root.bin_dir().join("cli-proxy-api");
    fs::write(&path, script).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    #[cfg(unix)]
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

/// Drops a token file into `auth/` the way a completed login would.
pub(super) fn write_auth_token(fx: &Fixture, basename: &str, body: serde_json::Value) {
    let path = fx.root.auth_dir().join(basename);
    fs::write(&path, serde_json::to_vec_pretty(&body).unwrap()).unwrap();
}
