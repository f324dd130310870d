use std::collections::BTreeMap;
use std::fs;

use ccs_provider::ConfigRoot;
use serde::{Deserialize, Serialize};

use crate::error::CliproxyError;

/// One synthesized claude-api-key entry (from settings-profile sync).
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClaudeApiKeyEntry {
    pub name: String,
    pub api_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

/// Generated sidecar configuration (`cliproxy/config.yaml`).
///
/// The sidecar watches this file itself; the launcher never relies on that
/// watcher. Whenever [`Self::write`] reports a change while the sidecar is
/// running, the caller must restart it so it cannot observe conflicting
/// state.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SidecarConfig {
    #[serde(default)]
    pub port: u16,
    pub auth_dir: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub claude_api_keys: Vec<ClaudeApiKeyEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub providers: BTreeMap<String, bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_management_key: Option<String>,
}

impl SidecarConfig {
    /// The existing generated config, or a fresh one pointed at the managed
    /// auth directory.
    pub fn load(root: &ConfigRoot) -> Self {
        let path = root.sidecar_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => serde_yaml::from_str(&contents).unwrap_or_else(|_| Self::fresh(root)),
            Err(_) => Self::fresh(root),
        }
    }

    fn fresh(root: &ConfigRoot) -> Self {
        Self {
            auth_dir: root.auth_dir().display().to_string(),
            ..Self::default()
        }
    }

    /// Writes the config atomically. Returns `true` when the rendered YAML
    /// differs from what was on disk, meaning a running sidecar must be
    /// restarted.
    pub fn write(&self, root: &ConfigRoot) -> Result<bool, CliproxyError> {
        let path = root.sidecar_config_path();
        let rendered =
            serde_yaml::to_string(self).map_err(|source| CliproxyError::ConfigRender { source })?;
        let previous = fs::read_to_string(&path).ok();
        if previous.as_deref() == Some(rendered.as_str()) {
            return Ok(false);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|source| CliproxyError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        ccs_provider::write_atomic(&path, rendered.as_bytes()).map_err(|source| {
            CliproxyError::Io { path, source }
        })?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_reports_changes_and_round_trips() {
        let temp = TempDir::new().unwrap();
        let root = ConfigRoot::new(temp.path());
        let mut config = SidecarConfig::load(&root);
        config.port = 1317;
        config.claude_api_keys.push(ClaudeApiKeyEntry {
            name: "work".to_string(),
            api_key: "sk-test".to_string(),
            base_url: Some("https://api.example.com".to_string()),
        });
        config.providers.insert("kiro".to_string(), true);

        assert!(config.write(&root).unwrap(), "first write is a change");
        assert!(!config.write(&root).unwrap(), "rewrite of same config is not");

        let reloaded = SidecarConfig::load(&root);
        assert_eq!(reloaded, config);

        let raw = fs::read_to_string(root.sidecar_config_path()).unwrap();
        assert!(raw.contains("auth-dir:"), "kebab-case keys on the wire: {raw}");
        assert!(raw.contains("api-key: sk-test"));
    }
}
