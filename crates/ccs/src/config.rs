use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use ccs_provider::{ConfigRoot, Provider};
use serde::Deserialize;
use thiserror::Error;

/// The literal placeholder shipped in settings templates; never a real key.
const API_KEY_PLACEHOLDER: &str = "your-api-key-here";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("settings profile `{profile}` not found at {path}")]
    SettingsMissing { profile: String, path: PathBuf },
    #[error("settings profile `{profile}` is invalid: {reason}")]
    SettingsInvalid { profile: String, reason: String },
}

/// A user-defined profile in the unified config.
#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProfileSpec {
    /// Third-party API key profile, backed by a settings envelope.
    Settings {
        #[serde(default)]
        settings: Option<String>,
    },
    /// Isolated downstream-CLI instance.
    Account {},
    /// Variant pinning a reserved provider (and usually a model).
    Cliproxy {
        provider: Provider,
        #[serde(default)]
        model: Option<String>,
        #[serde(default)]
        settings: Option<String>,
    },
}

/// Remote sidecar configuration; presence switches the launcher into
/// remote mode for `cliproxy` strategies.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteProxy {
    pub host: String,
    #[serde(default = "default_protocol")]
    pub protocol: String,
    #[serde(default)]
    pub port: Option<u16>,
    pub management_key: String,
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

fn default_protocol() -> String {
    "http".to_string()
}

/// Local proxy knobs from the unified config.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxySettings {
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<String>,
}

/// Copilot handoff contract: where the copilot collaborator listens.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CopilotSettings {
    #[serde(default)]
    pub port: Option<u16>,
}

/// Read-only view of the unified config file. The file's shape is owned by
/// the config collaborator; this launcher only reads the slices it routes
/// on. A missing or unreadable config degrades to an empty view.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LauncherConfig {
    #[serde(default)]
    pub profiles: BTreeMap<String, ProfileSpec>,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub remote: Option<RemoteProxy>,
    #[serde(default)]
    pub copilot: CopilotSettings,
    #[serde(default)]
    pub upload_endpoint: Option<String>,
    #[serde(default)]
    pub upload_token: Option<String>,
}

impl LauncherConfig {
    /// Loads `config.json` or `config.yaml` under the root, whichever
    /// exists first.
    pub fn load(root: &ConfigRoot) -> Self {
        let json_path = root.root().join("config.json");
        if let Ok(contents) = fs::read_to_string(&json_path) {
            match serde_json::from_str(&contents) {
                Ok(config) => return config,
                Err(err) => {
                    tracing::warn!(path = %json_path.display(), error = %err, "unified config unreadable");
                }
            }
        }
        let yaml_path = root.root().join("config.yaml");
        if let Ok(contents) = fs::read_to_string(&yaml_path) {
            match serde_yaml::from_str(&contents) {
                Ok(config) => return config,
                Err(err) => {
                    tracing::warn!(path = %yaml_path.display(), error = %err, "unified config unreadable");
                }
            }
        }
        Self::default()
    }

    /// Every name the classifier may resolve: configured profiles plus
    /// legacy `<name>.settings.json` envelopes found on disk.
    pub fn profile_names(&self, root: &ConfigRoot) -> Vec<String> {
        let mut names: Vec<String> = self.profiles.keys().cloned().collect();
        if let Ok(entries) = fs::read_dir(root.root()) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some(profile) = name.strip_suffix(".settings.json") {
                    if !names.iter().any(|existing| existing == profile) {
                        names.push(profile.to_string());
                    }
                }
            }
        }
        names.sort();
        names
    }

    /// Resolves the settings envelope path for a settings-kind profile,
    /// falling back to the legacy flat layout.
    pub fn settings_path(&self, root: &ConfigRoot, profile: &str) -> PathBuf {
        if let Some(ProfileSpec::Settings {
            settings: Some(path),
        }) = self.profiles.get(profile)
        {
            let path = PathBuf::from(path);
            if path.is_absolute() {
                return path;
            }
            return root.root().join(path);
        }
        root.settings_path(profile)
    }
}

/// A settings envelope: base URL + API key + optional model pinning.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsProfile {
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub opus_model: Option<String>,
    #[serde(default)]
    pub sonnet_model: Option<String>,
    #[serde(default)]
    pub haiku_model: Option<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl SettingsProfile {
    pub fn load(path: &PathBuf, profile: &str) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|_| ConfigError::SettingsMissing {
            profile: profile.to_string(),
            path: path.clone(),
        })?;
        let parsed: Self =
            serde_json::from_str(&contents).map_err(|err| ConfigError::SettingsInvalid {
                profile: profile.to_string(),
                reason: err.to_string(),
            })?;
        parsed.validate(profile)?;
        Ok(parsed)
    }

    fn validate(&self, profile: &str) -> Result<(), ConfigError> {
        if self.api_key.trim().is_empty() || self.api_key == API_KEY_PLACEHOLDER {
            return Err(ConfigError::SettingsInvalid {
                profile: profile.to_string(),
                reason: "apiKey is empty or still the placeholder".to_string(),
            });
        }
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::SettingsInvalid {
                profile: profile.to_string(),
                reason: "baseUrl is empty".to_string(),
            });
        }
        Ok(())
    }
}

/// Local proxy port precedence: CLI flag, then `CCS_PROXY_PORT`, then the
/// unified config.
pub fn resolve_proxy_port(cli: Option<u16>, config: &LauncherConfig) -> Option<u16> {
    if cli.is_some() {
        return cli;
    }
    if let Some(env_port) = std::env::var("CCS_PROXY_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
    {
        return Some(env_port);
    }
    config.proxy.port
}

/// Proxy protocol precedence mirrors the port: CLI flag, then
/// `CCS_PROXY_PROTOCOL`, then the unified config, then plain http.
pub fn resolve_proxy_protocol(cli: Option<&str>, config: &LauncherConfig) -> String {
    if let Some(cli) = cli {
        return cli.to_string();
    }
    if let Ok(env_protocol) = std::env::var("CCS_PROXY_PROTOCOL") {
        if !env_protocol.is_empty() {
            return env_protocol;
        }
    }
    config
        .proxy
        .protocol
        .clone()
        .unwrap_or_else(|| "http".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn root_with(files: &[(&str, &str)]) -> (TempDir, ConfigRoot) {
        let temp = TempDir::new().unwrap();
        let root = ConfigRoot::new(temp.path());
        std::fs::create_dir_all(root.root()).unwrap();
        for (name, contents) in files {
            std::fs::write(root.root().join(name), contents).unwrap();
        }
        (temp, root)
    }

    #[test]
    fn profiles_parse_from_unified_json() {
        let (_temp, root) = root_with(&[(
            "config.json",
            r#"{"profiles": {
                "work": {"kind": "settings", "settings": "work.settings.json"},
                "sandbox": {"kind": "account"},
                "gpro": {"kind": "cliproxy", "provider": "gemini", "model": "gemini-2.5-pro"}
            }}"#,
        )]);
        let config = LauncherConfig::load(&root);
        assert_eq!(config.profiles.len(), 3);
        assert!(matches!(
            config.profiles.get("gpro"),
            Some(ProfileSpec::Cliproxy {
                provider: Provider::Gemini,
                ..
            })
        ));
    }

    #[test]
    fn legacy_envelopes_count_as_profiles() {
        let (_temp, root) = root_with(&[(
            "glmt.settings.json",
            r#"{"baseUrl": "https://api.z.ai", "apiKey": "sk-x"}"#,
        )]);
        let config = LauncherConfig::load(&root);
        assert_eq!(config.profile_names(&root), ["glmt"]);
        assert_eq!(
            config.settings_path(&root, "glmt"),
            root.settings_path("glmt")
        );
    }

    #[test]
    fn settings_envelope_validation() {
        let (_temp, root) = root_with(&[
            (
                "ok.settings.json",
                r#"{"baseUrl": "https://api.example.com", "apiKey": "sk-real", "model": "m"}"#,
            ),
            (
                "placeholder.settings.json",
                r#"{"baseUrl": "https://api.example.com", "apiKey": "your-api-key-here"}"#,
            ),
        ])
        ;
        assert!(SettingsProfile::load(&root.settings_path("ok"), "ok").is_ok());
        assert!(matches!(
            SettingsProfile::load(&root.settings_path("placeholder"), "placeholder"),
            Err(ConfigError::SettingsInvalid { .. })
        ));
        assert!(matches!(
            SettingsProfile::load(&root.settings_path("absent"), "absent"),
            Err(ConfigError::SettingsMissing { .. })
        ));
    }

    #[test]
    fn proxy_port_precedence_is_cli_env_yaml() {
        let config: LauncherConfig =
            serde_json::from_str(r#"{"proxy": {"port": 9000, "protocol": "https"}}"#).unwrap();

        assert_eq!(resolve_proxy_port(Some(7000), &config), Some(7000));

        std::env::set_var("CCS_PROXY_PORT", "8000");
        assert_eq!(resolve_proxy_port(None, &config), Some(8000));
        std::env::remove_var("CCS_PROXY_PORT");

        assert_eq!(resolve_proxy_port(None, &config), Some(9000));

        std::env::set_var("CCS_PROXY_PROTOCOL", "http");
        assert_eq!(resolve_proxy_protocol(Some("https"), &config), "https");
        assert_eq!(resolve_proxy_protocol(None, &config), "http");
        std::env::remove_var("CCS_PROXY_PROTOCOL");
        assert_eq!(resolve_proxy_protocol(None, &config), "https");
    }
}
