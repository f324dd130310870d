use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

const HOME_ENV: &str = "CCS_HOME";
const DOT_DIR: &str = ".ccs";

/// On-disk layout under the per-user config root.
///
/// Everything the launcher persists lives below this root: the accounts
/// registry, the managed sidecar binary and its auth directories, per-profile
/// settings envelopes, and isolated instance directories for account-kind
/// profiles. Path accessors never touch the filesystem; call
/// [`Self::materialize`] to create the directory tree.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ConfigRoot {
    root: PathBuf,
}

impl ConfigRoot {
    /// Layout rooted at an explicit directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The default root: `$CCS_HOME` when set, else `~/.ccs`.
    pub fn resolve() -> Option<Self> {
        if let Some(explicit) = env::var_os(HOME_ENV) {
            return Some(Self::new(PathBuf::from(explicit)));
        }
        dirs::home_dir().map(|home| Self::new(home.join(DOT_DIR)))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `accounts.json`, the multi-account registry.
    pub fn accounts_path(&self) -> PathBuf {
        self.root.join("accounts.json")
    }

    /// Directory holding everything owned by the sidecar integration.
    pub fn cliproxy_dir(&self) -> PathBuf {
        self.root.join("cliproxy")
    }

    /// Managed sidecar binaries.
    pub fn bin_dir(&self) -> PathBuf {
        self.cliproxy_dir().join("bin")
    }

    /// Active token files, indexed by the sidecar.
    pub fn auth_dir(&self) -> PathBuf {
        self.cliproxy_dir().join("auth")
    }

    /// Paused token files. A sibling of `auth/` so the sidecar's directory
    /// watcher never indexes them.
    pub fn auth_paused_dir(&self) -> PathBuf {
        self.cliproxy_dir().join("auth-paused")
    }

    /// Generated sidecar configuration.
    pub fn sidecar_config_path(&self) -> PathBuf {
        self.cliproxy_dir().join("config.yaml")
    }

    /// `{pid, port, startedAt, sessionCount}` record for the running sidecar.
    pub fn session_lock_path(&self) -> PathBuf {
        self.cliproxy_dir().join("session.lock")
    }

    /// Installed sidecar version stamp.
    pub fn version_file_path(&self) -> PathBuf {
        self.cliproxy_dir().join(".version")
    }

    /// Optional pinned sidecar version; presence overrides "latest".
    pub fn version_pin_path(&self) -> PathBuf {
        self.cliproxy_dir().join(".version-pin")
    }

    /// Timestamp of the last background update check.
    pub fn update_check_path(&self) -> PathBuf {
        self.cliproxy_dir().join(".last-update-check")
    }

    /// Persisted per-account cooldown state.
    pub fn cooldown_path(&self) -> PathBuf {
        self.cliproxy_dir().join("cooldowns.json")
    }

    /// Pending paste-callback flow state.
    pub fn paste_state_path(&self) -> PathBuf {
        self.cliproxy_dir().join("paste-flow.json")
    }

    /// Per-settings-profile envelope, legacy flat layout.
    pub fn settings_path(&self, profile: &str) -> PathBuf {
        self.root.join(format!("{profile}.settings.json"))
    }

    /// Isolated `CLAUDE_CONFIG_DIR` for an account-kind profile.
    pub fn instance_dir(&self, profile: &str) -> PathBuf {
        self.root.join("instances").join(profile)
    }

    /// Generated web-search hook script and its MCP companion config.
    pub fn hooks_dir(&self) -> PathBuf {
        self.root.join("hooks")
    }

    /// Creates the root and the directories shared by every strategy.
    /// Directories are owner-only; token directories hold secrets.
    pub fn materialize(&self) -> io::Result<()> {
        for dir in [
            self.root.clone(),
            self.cliproxy_dir(),
            self.bin_dir(),
            self.auth_dir(),
            self.auth_paused_dir(),
        ] {
            fs::create_dir_all(&dir)?;
            #[cfg(unix)]
            {
                let perms = fs::Permissions::from_mode(0o700);
                fs::set_permissions(&dir, perms)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_paths() {
        let root = ConfigRoot::new("/tmp/ccs-home");
        assert_eq!(
            root.accounts_path(),
            PathBuf::from("/tmp/ccs-home/accounts.json")
        );
        assert_eq!(
            root.auth_paused_dir(),
            PathBuf::from("/tmp/ccs-home/cliproxy/auth-paused")
        );
        assert_eq!(
            root.settings_path("glmt"),
            PathBuf::from("/tmp/ccs-home/glmt.settings.json")
        );
        assert_eq!(
            root.instance_dir("work"),
            PathBuf::from("/tmp/ccs-home/instances/work")
        );
    }

    #[cfg(unix)]
    #[test]
    fn materialize_creates_owner_only_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let temp = tempfile::TempDir::new().unwrap();
        let root = ConfigRoot::new(temp.path().join("ccs"));
        root.materialize().unwrap();

        for dir in [root.auth_dir(), root.auth_paused_dir(), root.bin_dir()] {
            let mode = fs::metadata(&dir).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o700, "{}", dir.display());
        }
    }
}
