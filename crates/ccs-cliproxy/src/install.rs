use std::fs;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ccs_provider::ConfigRoot;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::error::CliproxyError;
use crate::version::{install_gate, InstallGate, SidecarVersion};

const GITHUB_API_BASE: &str = "https://api.github.com";
const DOWNLOAD_BASE: &str = "https://github.com";
const REPO: &str = "router-for-me/CLIProxyAPI";
const BINARY_NAME: &str = "cli-proxy-api";
const USER_AGENT: &str = "ccs-launcher";
const UPDATE_CHECK_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// Installs and maintains the managed sidecar binary.
///
/// Resolution order for [`Self::ensure`]: a pinned version is authoritative
/// and installed on demand; otherwise any installed binary is used (with a
/// background freshness check); otherwise the latest stable release is
/// installed. Downloading a release and verifying its checksum is the only
/// network IO this type performs.
#[derive(Clone, Debug)]
pub struct Installer {
    root: ConfigRoot,
    http: reqwest::Client,
    api_base: String,
    download_base: String,
}

impl Installer {
    pub fn new(root: ConfigRoot) -> Self {
        Self {
            root,
            http: reqwest::Client::new(),
            api_base: GITHUB_API_BASE.to_string(),
            download_base: DOWNLOAD_BASE.to_string(),
        }
    }

    /// Overrides the release endpoints. Test hook.
    pub fn with_bases(mut self, api: impl Into<String>, download: impl Into<String>) -> Self {
        self.api_base = api.into();
        self.download_base = download.into();
        self
    }

    /// Path the managed binary lives at once installed.
    pub fn binary_path(&self) -> PathBuf {
        let name = if cfg!(windows) {
            format!("{BINARY_NAME}.exe")
        } else {
            BINARY_NAME.to_string()
        };
        self.root.bin_dir().join(name)
    }

    /// Currently installed version, from the `.version` stamp.
    pub fn installed_version(&self) -> Option<SidecarVersion> {
        let stamp = fs::read_to_string(self.root.version_file_path()).ok()?;
        SidecarVersion::parse(stamp.trim()).ok()
    }

    /// Pinned version, when `.version-pin` exists.
    pub fn pinned_version(&self) -> Result<Option<SidecarVersion>, CliproxyError> {
        match fs::read_to_string(self.root.version_pin_path()) {
            Ok(contents) => SidecarVersion::parse(contents.trim()).map(Some),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CliproxyError::Io {
                path: self.root.version_pin_path(),
                source,
            }),
        }
    }

    /// Returns the path to a usable sidecar binary, installing one if
    /// needed. `approve_gated` lets a faulty-range or beyond-max-stable
    /// version through; without it such installs fail with
    /// [`CliproxyError::VersionGated`].
    pub async fn ensure(&self, approve_gated: bool) -> Result<PathBuf, CliproxyError> {
        if let Some(pinned) = self.pinned_version()? {
            let matches = self.installed_version().as_ref() == Some(&pinned);
            if matches && self.binary_path().exists() {
                return Ok(self.binary_path());
            }
            info!(version = %pinned, "installing pinned sidecar version");
            self.install_version(&pinned, approve_gated).await?;
            return Ok(self.binary_path());
        }

        if self.binary_path().exists() {
            self.spawn_update_check();
            return Ok(self.binary_path());
        }

        let latest = self.latest_stable().await?.ok_or_else(|| {
            CliproxyError::BinaryInstallFailed {
                reason: "no stable release found".to_string(),
            }
        })?;
        info!(version = %latest, "installing latest sidecar release");
        self.install_version(&latest, approve_gated).await?;
        Ok(self.binary_path())
    }

    /// Downloads, verifies, and installs one specific version.
    pub async fn install_version(
        &self,
        version: &SidecarVersion,
        approve_gated: bool,
    ) -> Result<(), CliproxyError> {
        if let InstallGate::NeedsConfirmation { reason } = install_gate(version) {
            if !approve_gated {
                return Err(CliproxyError::VersionGated {
                    version: version.to_string(),
                    reason,
                });
            }
            warn!(%version, %reason, "installing gated sidecar version on explicit approval");
        }

        let asset = release_asset_name();
        let url = format!(
            "{}/{}/releases/download/v{}/{}",
            self.download_base, REPO, version, asset
        );
        let bytes = self.download(&url).await?;

        let checksum_url = format!("{url}.sha256");
        match self.download(&checksum_url).await {
            Ok(checksum) => {
                let expected = String::from_utf8_lossy(&checksum)
                    .split_whitespace()
                    .next()
                    .unwrap_or_default()
                    .to_lowercase();
                let actual = hex_digest(&bytes);
                if expected != actual {
                    return Err(CliproxyError::BinaryInstallFailed {
                        reason: format!(
                            "checksum mismatch for {asset}: expected {expected}, got {actual}"
                        ),
                    });
                }
            }
            Err(err) => {
                // A missing checksum asset is tolerated; a corrupt download
                // will fail the readiness handshake instead.
                debug!(error = %err, "no checksum asset for release, skipping verification");
            }
        }

        let target = self.binary_path();
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| CliproxyError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        ccs_provider::write_atomic(&target, &bytes).map_err(|source| CliproxyError::Io {
            path: target.clone(),
            source,
        })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(0o755)).map_err(|source| {
                CliproxyError::Io {
                    path: target.clone(),
                    source,
                }
            })?;
        }

        ccs_provider::write_atomic(
            &self.root.version_file_path(),
            version.to_string().as_bytes(),
        )
        .map_err(|source| CliproxyError::Io {
            path: self.root.version_file_path(),
            source,
        })?;
        Ok(())
    }

    /// Latest stable release tag, or `None` when the lookup was skipped
    /// (e.g. GitHub rate limit).
    pub async fn latest_stable(&self) -> Result<Option<SidecarVersion>, CliproxyError> {
        let url = format!("{}/repos/{}/releases/latest", self.api_base, REPO);
        let response = self
            .http
            .get(&url)
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|err| CliproxyError::Http(err.to_string()))?;

        let status = response.status();
        if status.as_u16() == 403 || status.as_u16() == 429 {
            debug!("GitHub API rate limited, skipping release lookup");
            return Ok(None);
        }
        if !status.is_success() {
            return Err(CliproxyError::Http(format!(
                "release lookup returned {status}"
            )));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|err| CliproxyError::Http(err.to_string()))?;
        let tag = body
            .get("tag_name")
            .and_then(Value::as_str)
            .ok_or_else(|| CliproxyError::Http("release has no tag_name".to_string()))?;
        SidecarVersion::parse(tag).map(Some)
    }

    async fn download(&self, url: &str) -> Result<Vec<u8>, CliproxyError> {
        let response = self
            .http
            .get(url)
            .header("User-Agent", USER_AGENT)
            .send()
            .await
            .map_err(|err| CliproxyError::Http(err.to_string()))?;
        if !response.status().is_success() {
            return Err(CliproxyError::BinaryInstallFailed {
                reason: format!("download of {url} returned {}", response.status()),
            });
        }
        response
            .bytes()
            .await
            .map(|bytes| bytes.to_vec())
            .map_err(|err| CliproxyError::Http(err.to_string()))
    }

    /// Background check for a newer release; rate-limit aware, at most once
    /// per day, never surfaces errors to the caller.
    fn spawn_update_check(&self) {
        let stamp_path = self.root.update_check_path();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let fresh = fs::read_to_string(&stamp_path)
            .ok()
            .and_then(|contents| contents.trim().parse::<u64>().ok())
            .is_some_and(|last| now.saturating_sub(last) < UPDATE_CHECK_INTERVAL.as_secs());
        if fresh {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            let _ = ccs_provider::write_atomic(&stamp_path, now.to_string().as_bytes());
            match this.latest_stable().await {
                Ok(Some(latest)) => {
                    if let Some(installed) = this.installed_version() {
                        if latest > installed {
                            info!(%installed, %latest, "a newer sidecar release is available");
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => debug!(error = %err, "background update check failed"),
            }
        });
    }
}

fn release_asset_name() -> String {
    let os = match std::env::consts::OS {
        "macos" => "darwin",
        other => other,
    };
    let arch = match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        other => other,
    };
    if cfg!(windows) {
        format!("{BINARY_NAME}-{os}-{arch}.exe")
    } else {
        format!("{BINARY_NAME}-{os}-{arch}")
    }
}

fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_lowercase_hex() {
        assert_eq!(
            hex_digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn asset_name_matches_platform() {
        let name = release_asset_name();
        assert!(name.starts_with("cli-proxy-api-"));
    }
}
