#![forbid(unsafe_code)]
//! Provider facts and shared on-disk layout for the `ccs` launcher.
//!
//! This crate is the leaf of the workspace: it owns the fixed set of OAuth
//! providers, the identity rules for their accounts (email vs. nickname), and
//! the filesystem layout under the per-user config root. Both the account
//! registry and the profile classifier depend on it, so neither has to know
//! about the other.

mod fsio;
mod nickname;
mod paths;

pub use fsio::{read_to_string_bounded, write_atomic, write_secret_atomic, BoundedReadError};
pub use nickname::{validate_nickname, NicknameError, NICKNAME_MAX_LEN};
pub use paths::ConfigRoot;

use serde::{Deserialize, Serialize};
use std::fmt;

/// The fixed set of OAuth-capable model providers the launcher brokers for.
///
/// Profile names never collide with these tags unless the profile *is* the
/// provider; the classifier checks [`Provider::from_tag`] before any lookup
/// in user-defined profiles.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Gemini,
    Codex,
    Agy,
    Qwen,
    IFlow,
    Kiro,
    Ghcp,
}

/// All providers, in registry iteration order.
pub const ALL_PROVIDERS: [Provider; 7] = [
    Provider::Gemini,
    Provider::Codex,
    Provider::Agy,
    Provider::Qwen,
    Provider::IFlow,
    Provider::Kiro,
    Provider::Ghcp,
];

impl Provider {
    /// The reserved CLI tag, also the key under `providers` in the registry.
    pub fn tag(self) -> &'static str {
        match self {
            Provider::Gemini => "gemini",
            Provider::Codex => "codex",
            Provider::Agy => "agy",
            Provider::Qwen => "qwen",
            Provider::IFlow => "iflow",
            Provider::Kiro => "kiro",
            Provider::Ghcp => "ghcp",
        }
    }

    /// Parses a reserved provider tag. Tags are matched exactly; profile
    /// names are resolved elsewhere.
    pub fn from_tag(tag: &str) -> Option<Self> {
        ALL_PROVIDERS.into_iter().find(|p| p.tag() == tag)
    }

    /// Human-facing name used in prompts and troubleshooting output.
    pub fn display_name(self) -> &'static str {
        match self {
            Provider::Gemini => "Gemini CLI",
            Provider::Codex => "Codex",
            Provider::Agy => "Antigravity",
            Provider::Qwen => "Qwen Code",
            Provider::IFlow => "iFlow",
            Provider::Kiro => "Kiro",
            Provider::Ghcp => "GitHub Copilot",
        }
    }

    /// `type` values under which this provider's token files appear in
    /// `auth/`. The first entry is what we write; the rest are aliases the
    /// sidecar has used historically.
    pub fn auth_type_values(self) -> &'static [&'static str] {
        match self {
            Provider::Gemini => &["gemini"],
            Provider::Codex => &["codex"],
            Provider::Agy => &["agy", "antigravity"],
            Provider::Qwen => &["qwen"],
            Provider::IFlow => &["iflow"],
            Provider::Kiro => &["kiro"],
            Provider::Ghcp => &["ghcp", "github-copilot"],
        }
    }

    /// Whether accounts carry an email as their stable identifier. Providers
    /// without email identify accounts by a caller-supplied nickname, which
    /// is mandatory at registration.
    pub fn has_email(self) -> bool {
        !matches!(self, Provider::Kiro | Provider::Ghcp)
    }

    /// Whether token refresh is owned by the sidecar binary. Only Gemini CLI
    /// tokens are refreshed locally.
    pub fn refresh_delegated(self) -> bool {
        !matches!(self, Provider::Gemini)
    }

    /// Loopback port the provider's authorization-code callback server binds.
    pub fn callback_port(self) -> u16 {
        match self {
            Provider::Gemini => 8085,
            Provider::Codex => 1455,
            Provider::Agy => 51121,
            Provider::Qwen => 8086,
            Provider::IFlow => 11451,
            Provider::Kiro => 52120,
            Provider::Ghcp => 52121,
        }
    }

    /// Sidecar flag that starts this provider's login flow.
    pub fn login_flag(self) -> String {
        format!("--{}-login", self.tag())
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Subscription tier reported for an account. Used by the tier-defaults
/// weight map; `Unknown` until a quota probe or the user says otherwise.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Free,
    Pro,
    Ultra,
    #[default]
    Unknown,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Pro => "pro",
            Tier::Ultra => "ultra",
            Tier::Unknown => "unknown",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "free" => Some(Tier::Free),
            "pro" => Some(Tier::Pro),
            "ultra" => Some(Tier::Ultra),
            "unknown" => Some(Tier::Unknown),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_round_trip() {
        for provider in ALL_PROVIDERS {
            assert_eq!(Provider::from_tag(provider.tag()), Some(provider));
        }
        assert_eq!(Provider::from_tag("glmt"), None);
        assert_eq!(Provider::from_tag("GEMINI"), None);
    }

    #[test]
    fn no_email_providers_are_kiro_and_ghcp() {
        let no_email: Vec<_> = ALL_PROVIDERS.iter().filter(|p| !p.has_email()).collect();
        assert_eq!(no_email, [&Provider::Kiro, &Provider::Ghcp]);
    }

    #[test]
    fn only_gemini_refreshes_locally() {
        let local: Vec<_> = ALL_PROVIDERS
            .iter()
            .filter(|p| !p.refresh_delegated())
            .collect();
        assert_eq!(local, [&Provider::Gemini]);
    }

    #[test]
    fn login_flags_follow_sidecar_contract() {
        assert_eq!(Provider::Gemini.login_flag(), "--gemini-login");
        assert_eq!(Provider::Ghcp.login_flag(), "--ghcp-login");
    }

    #[test]
    fn serde_tags_match_registry_keys() {
        let json = serde_json::to_string(&Provider::IFlow).unwrap();
        assert_eq!(json, "\"iflow\"");
        let back: Provider = serde_json::from_str("\"kiro\"").unwrap();
        assert_eq!(back, Provider::Kiro);
    }
}
