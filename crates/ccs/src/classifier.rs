use std::path::PathBuf;

use ccs_provider::{ConfigRoot, Provider};
use thiserror::Error;

use crate::config::{LauncherConfig, ProfileSpec};

/// Reserved top-level subcommands handled by collaborators outside this
/// core. They are intercepted before profile resolution; the table is
/// static by design.
pub const META_COMMANDS: &[&str] = &[
    "version",
    "--version",
    "-v",
    "help",
    "--help",
    "-h",
    "--install",
    "--uninstall",
    "--shell-completion",
    "-sc",
    "doctor",
    "sync",
    "cleanup",
    "migrate",
    "update",
    "auth",
    "api",
    "cliproxy",
    "config",
    "setup",
];

/// Copilot subcommands that belong to the copilot collaborator rather than
/// the copilot launch strategy.
const COPILOT_SUBCOMMANDS: &[&str] = &["login", "logout", "status", "config", "start", "stop"];

/// Execution strategy one invocation resolves to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Strategy {
    /// Native Claude defaults, no brokering.
    Default,
    /// Third-party API key via a settings envelope.
    Settings {
        profile: String,
        settings_path: PathBuf,
    },
    /// OAuth provider routed through the sidecar.
    Cliproxy {
        provider: Provider,
        /// Set for user-defined variants that pin a model.
        settings_path: Option<PathBuf>,
        model: Option<String>,
    },
    /// Subscription proxy collaborator.
    Copilot,
    /// Isolated downstream-CLI instance.
    Account { profile: String },
    /// Reserved subcommand delegated to a collaborator.
    Meta { command: String },
}

/// A classified invocation: the strategy plus the args that pass through to
/// the downstream CLI.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Classified {
    pub strategy: Strategy,
    pub passthrough: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("profile `{name}` not found")]
    ProfileNotFound {
        name: String,
        candidates: Vec<String>,
        suggestions: Vec<String>,
    },
}

/// Maps the raw argument vector to a strategy. First match wins:
/// flags/empty → default; reserved provider tag → cliproxy; `copilot`
/// (without a collaborator subcommand) → copilot; then user profiles by
/// kind; otherwise profile-not-found with suggestions.
pub fn classify(
    args: &[String],
    root: &ConfigRoot,
    config: &LauncherConfig,
) -> Result<Classified, ClassifyError> {
    let Some(first) = args.first() else {
        return Ok(Classified {
            strategy: Strategy::Default,
            passthrough: Vec::new(),
        });
    };

    if first.starts_with('-') && !META_COMMANDS.contains(&first.as_str()) {
        return Ok(Classified {
            strategy: Strategy::Default,
            passthrough: args.to_vec(),
        });
    }

    if META_COMMANDS.contains(&first.as_str()) {
        return Ok(Classified {
            strategy: Strategy::Meta {
                command: first.clone(),
            },
            passthrough: args[1..].to_vec(),
        });
    }

    let rest = args[1..].to_vec();

    if let Some(provider) = Provider::from_tag(first) {
        return Ok(Classified {
            strategy: Strategy::Cliproxy {
                provider,
                settings_path: None,
                model: None,
            },
            passthrough: rest,
        });
    }

    if first == "copilot" {
        let next_is_subcommand = rest
            .first()
            .is_some_and(|next| COPILOT_SUBCOMMANDS.contains(&next.as_str()));
        if next_is_subcommand {
            return Ok(Classified {
                strategy: Strategy::Meta {
                    command: format!("copilot {}", rest[0]),
                },
                passthrough: rest[1..].to_vec(),
            });
        }
        return Ok(Classified {
            strategy: Strategy::Copilot,
            passthrough: rest,
        });
    }

    match config.profiles.get(first.as_str()) {
        Some(ProfileSpec::Account {}) => {
            return Ok(Classified {
                strategy: Strategy::Account {
                    profile: first.clone(),
                },
                passthrough: rest,
            });
        }
        Some(ProfileSpec::Settings { .. }) => {
            return Ok(Classified {
                strategy: Strategy::Settings {
                    profile: first.clone(),
                    settings_path: config.settings_path(root, first),
                },
                passthrough: rest,
            });
        }
        Some(ProfileSpec::Cliproxy {
            provider,
            model,
            settings,
        }) => {
            let settings_path = settings
                .as_ref()
                .map(|path| {
                    let path = PathBuf::from(path);
                    if path.is_absolute() {
                        path
                    } else {
                        root.root().join(path)
                    }
                })
                .or_else(|| Some(root.settings_path(first)).filter(|path| path.exists()));
            return Ok(Classified {
                strategy: Strategy::Cliproxy {
                    provider: *provider,
                    settings_path,
                    model: model.clone(),
                },
                passthrough: rest,
            });
        }
        None => {}
    }

    // Legacy settings envelope with no config entry.
    let legacy = root.settings_path(first);
    if legacy.exists() {
        return Ok(Classified {
            strategy: Strategy::Settings {
                profile: first.clone(),
                settings_path: legacy,
            },
            passthrough: rest,
        });
    }

    let candidates = config.profile_names(root);
    let suggestions = suggest(first, &candidates);
    Err(ClassifyError::ProfileNotFound {
        name: first.clone(),
        candidates,
        suggestions,
    })
}

/// Candidate names within Levenshtein distance 2 of the input, closest
/// first.
fn suggest(input: &str, candidates: &[String]) -> Vec<String> {
    let mut scored: Vec<(usize, &String)> = candidates
        .iter()
        .map(|candidate| (strsim::levenshtein(input, candidate), candidate))
        .filter(|(distance, _)| *distance <= 2)
        .collect();
    scored.sort_by_key(|(distance, _)| *distance);
    scored
        .into_iter()
        .map(|(_, candidate)| candidate.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(config_json: &str) -> (TempDir, ConfigRoot, LauncherConfig) {
        let temp = TempDir::new().unwrap();
        let root = ConfigRoot::new(temp.path());
        std::fs::create_dir_all(root.root()).unwrap();
        let config: LauncherConfig = serde_json::from_str(config_json).unwrap();
        (temp, root, config)
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|arg| arg.to_string()).collect()
    }

    #[test]
    fn empty_or_leading_flag_is_default() {
        let (_temp, root, config) = fixture("{}");
        let classified = classify(&[], &root, &config).unwrap();
        assert_eq!(classified.strategy, Strategy::Default);

        let classified = classify(&args(&["--continue", "hi"]), &root, &config).unwrap();
        assert_eq!(classified.strategy, Strategy::Default);
        assert_eq!(classified.passthrough, args(&["--continue", "hi"]));
    }

    #[test]
    fn reserved_tags_win_over_everything() {
        let (_temp, root, config) =
            fixture(r#"{"profiles": {"gemini": {"kind": "account"}}}"#);
        let classified = classify(&args(&["gemini", "prompt"]), &root, &config).unwrap();
        assert!(matches!(
            classified.strategy,
            Strategy::Cliproxy {
                provider: Provider::Gemini,
                ..
            }
        ));
        assert_eq!(classified.passthrough, args(&["prompt"]));
    }

    #[test]
    fn copilot_split_between_strategy_and_collaborator() {
        let (_temp, root, config) = fixture("{}");
        let classified = classify(&args(&["copilot", "hi there"]), &root, &config).unwrap();
        assert_eq!(classified.strategy, Strategy::Copilot);

        let classified = classify(&args(&["copilot", "status"]), &root, &config).unwrap();
        assert_eq!(
            classified.strategy,
            Strategy::Meta {
                command: "copilot status".to_string()
            }
        );
    }

    #[test]
    fn profiles_resolve_by_kind() {
        let (_temp, root, config) = fixture(
            r#"{"profiles": {
                "work": {"kind": "settings"},
                "sandbox": {"kind": "account"},
                "gpro": {"kind": "cliproxy", "provider": "gemini", "model": "gemini-2.5-pro"}
            }}"#,
        );

        assert!(matches!(
            classify(&args(&["sandbox"]), &root, &config).unwrap().strategy,
            Strategy::Account { .. }
        ));
        assert!(matches!(
            classify(&args(&["work"]), &root, &config).unwrap().strategy,
            Strategy::Settings { .. }
        ));
        match classify(&args(&["gpro"]), &root, &config).unwrap().strategy {
            Strategy::Cliproxy {
                provider, model, ..
            } => {
                assert_eq!(provider, Provider::Gemini);
                assert_eq!(model.as_deref(), Some("gemini-2.5-pro"));
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn legacy_envelope_resolves_as_settings() {
        let (_temp, root, config) = fixture("{}");
        std::fs::write(
            root.settings_path("glmt"),
            r#"{"baseUrl": "https://api.z.ai", "apiKey": "sk"}"#,
        )
        .unwrap();
        assert!(matches!(
            classify(&args(&["glmt", "hi"]), &root, &config).unwrap().strategy,
            Strategy::Settings { .. }
        ));
    }

    #[test]
    fn unknown_profile_lists_candidates_and_suggestions() {
        let (_temp, root, config) = fixture(
            r#"{"profiles": {"work": {"kind": "settings"}, "personal": {"kind": "account"}}}"#,
        );
        match classify(&args(&["worj"]), &root, &config) {
            Err(ClassifyError::ProfileNotFound {
                name,
                candidates,
                suggestions,
            }) => {
                assert_eq!(name, "worj");
                assert_eq!(candidates, ["personal", "work"]);
                assert_eq!(suggestions, ["work"]);
            }
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn meta_commands_intercept() {
        let (_temp, root, config) = fixture("{}");
        for command in ["doctor", "--version", "auth"] {
            let classified = classify(&args(&[command, "x"]), &root, &config).unwrap();
            assert!(matches!(classified.strategy, Strategy::Meta { .. }), "{command}");
        }
    }
}
