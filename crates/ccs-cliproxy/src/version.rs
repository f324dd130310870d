use std::cmp::Ordering;
use std::fmt;

use semver::Version;

use crate::error::CliproxyError;

/// Sidecar versions are `X.Y.Z` or `X.Y.Z-N`, where `-N` is a packaging
/// counter layered on top of the same upstream release. Unlike a semver
/// prerelease, a build counter sorts *above* its base version, so the type
/// keeps the counter separate instead of leaning on `semver` ordering.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SidecarVersion {
    base: Version,
    build: Option<u32>,
}

impl SidecarVersion {
    pub fn parse(value: &str) -> Result<Self, CliproxyError> {
        let trimmed = value.trim().trim_start_matches('v');
        let invalid = || CliproxyError::VersionInvalid {
            value: value.to_string(),
        };

        if let Some((base, build)) = trimmed.split_once('-') {
            let build: u32 = build.parse().map_err(|_| invalid())?;
            let base = Version::parse(base).map_err(|_| invalid())?;
            if !base.pre.is_empty() || !base.build.is_empty() {
                return Err(invalid());
            }
            return Ok(Self {
                base,
                build: Some(build),
            });
        }

        let base = Version::parse(trimmed).map_err(|_| invalid())?;
        if !base.pre.is_empty() || !base.build.is_empty() {
            return Err(invalid());
        }
        Ok(Self { base, build: None })
    }

    pub fn triple(&self) -> (u64, u64, u64) {
        (self.base.major, self.base.minor, self.base.patch)
    }
}

impl fmt::Display for SidecarVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.build {
            Some(build) => write!(f, "{}-{build}", self.base),
            None => write!(f, "{}", self.base),
        }
    }
}

impl Ord for SidecarVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.base
            .cmp(&other.base)
            .then_with(|| self.build.unwrap_or(0).cmp(&other.build.unwrap_or(0)))
    }
}

impl PartialOrd for SidecarVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Releases in these inclusive `X.Y.Z` ranges shipped broken and are refused
/// without explicit confirmation.
const FAULTY_RANGES: &[((u64, u64, u64), (u64, u64, u64), &str)] = &[
    ((3, 2, 0), (3, 2, 2), "broken auth-directory watcher"),
    ((4, 0, 0), (4, 0, 0), "management API regression"),
];

/// Newest release line validated against this launcher. Anything above it
/// installs only with explicit confirmation.
pub const MAX_STABLE: (u64, u64, u64) = (5, 99, 99);

/// Whether installing `version` may proceed without asking the user.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum InstallGate {
    Allowed,
    NeedsConfirmation { reason: String },
}

pub fn install_gate(version: &SidecarVersion) -> InstallGate {
    let triple = version.triple();
    for (from, to, reason) in FAULTY_RANGES {
        if triple >= *from && triple <= *to {
            return InstallGate::NeedsConfirmation {
                reason: (*reason).to_string(),
            };
        }
    }
    if triple > MAX_STABLE {
        return InstallGate::NeedsConfirmation {
            reason: format!(
                "newer than the last validated release {}.{}.{}",
                MAX_STABLE.0, MAX_STABLE.1, MAX_STABLE.2
            ),
        };
    }
    InstallGate::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_build_forms() {
        let plain = SidecarVersion::parse("3.1.4").unwrap();
        assert_eq!(plain.to_string(), "3.1.4");
        let build = SidecarVersion::parse("v3.1.4-2").unwrap();
        assert_eq!(build.to_string(), "3.1.4-2");

        for bad in ["", "3.1", "3.1.4-beta", "3.1.4+5", "x.y.z"] {
            assert!(SidecarVersion::parse(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn build_counter_sorts_above_base() {
        let base = SidecarVersion::parse("3.1.4").unwrap();
        let build1 = SidecarVersion::parse("3.1.4-1").unwrap();
        let build2 = SidecarVersion::parse("3.1.4-2").unwrap();
        let next = SidecarVersion::parse("3.1.5").unwrap();
        assert!(base < build1);
        assert!(build1 < build2);
        assert!(build2 < next);
    }

    #[test]
    fn faulty_ranges_and_max_stable_gate() {
        assert_eq!(
            install_gate(&SidecarVersion::parse("3.1.9").unwrap()),
            InstallGate::Allowed
        );
        assert!(matches!(
            install_gate(&SidecarVersion::parse("3.2.1").unwrap()),
            InstallGate::NeedsConfirmation { .. }
        ));
        assert!(matches!(
            install_gate(&SidecarVersion::parse("6.0.0").unwrap()),
            InstallGate::NeedsConfirmation { .. }
        ));
    }
}
