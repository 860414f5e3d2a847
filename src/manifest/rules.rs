//! Platform rules attached to libraries.
//!
//! A library with no rules is always wanted. Otherwise the answer starts as
//! "no" and every rule whose `os` block matches the platform overwrites it;
//! the last match wins.

use serde::Deserialize;

/// Operating system family as named in version files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OsName {
    /// Microsoft Windows.
    Windows,
    /// macOS (called "osx" in version files).
    Osx,
    /// Linux and other Unix-likes.
    Linux,
}

impl OsName {
    /// Key used in `natives` maps.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Windows => "windows",
            Self::Osx => "osx",
            Self::Linux => "linux",
        }
    }
}

/// Target platform for rule evaluation and natives selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Platform {
    /// OS family.
    pub os: OsName,
    /// Architecture name as reported by the OS (e.g. "x86_64", "x86", "aarch64").
    pub arch: String,
}

impl Platform {
    /// The platform this binary was built for.
    #[must_use]
    pub fn current() -> Self {
        let os = match std::env::consts::OS {
            "windows" => OsName::Windows,
            "macos" => OsName::Osx,
            _ => OsName::Linux,
        };
        Self {
            os,
            arch: std::env::consts::ARCH.to_string(),
        }
    }

    /// Explicit platform, mostly for tests and cross-installs.
    pub fn new(os: OsName, arch: impl Into<String>) -> Self {
        Self {
            os,
            arch: arch.into(),
        }
    }

    /// Value substituted for `${arch}` in natives classifiers.
    #[must_use]
    pub fn arch_bits(&self) -> &'static str {
        if matches!(self.arch.as_str(), "x86" | "i386" | "i686" | "arm") {
            "32"
        } else {
            "64"
        }
    }
}

/// Whether a rule grants or withdraws the library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    /// Include when matched.
    Allow,
    /// Exclude when matched.
    Disallow,
}

/// OS constraint of a rule. Missing fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct OsRule {
    /// OS family.
    pub name: Option<OsName>,
    /// Architecture, compared against [`Platform::arch`].
    pub arch: Option<String>,
}

/// One allow/disallow rule.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rule {
    /// Effect when matched.
    pub action: RuleAction,
    /// Constraint; absent means "every platform".
    #[serde(default)]
    pub os: Option<OsRule>,
}

impl Rule {
    fn matches(&self, platform: &Platform) -> bool {
        let Some(os) = &self.os else {
            return true;
        };
        if let Some(name) = os.name
            && name != platform.os
        {
            return false;
        }
        if let Some(arch) = &os.arch
            && !arch_matches(arch, &platform.arch)
        {
            return false;
        }
        true
    }
}

fn arch_matches(rule_arch: &str, platform_arch: &str) -> bool {
    rule_arch == platform_arch
        || (rule_arch == "x86" && matches!(platform_arch, "i386" | "i686"))
        || (rule_arch == "x86_64" && platform_arch == "amd64")
}

/// Evaluates `rules` for `platform`.
#[must_use]
pub fn rules_allow(rules: &[Rule], platform: &Platform) -> bool {
    if rules.is_empty() {
        return true;
    }
    rules
        .iter()
        .filter(|rule| rule.matches(platform))
        .last()
        .is_some_and(|rule| rule.action == RuleAction::Allow)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn rules(json: &str) -> Vec<Rule> {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn test_no_rules_allows() {
        assert!(rules_allow(&[], &Platform::new(OsName::Linux, "x86_64")));
    }

    #[test]
    fn test_allow_all_except_osx() {
        let r = rules(
            r#"[{"action":"allow"},{"action":"disallow","os":{"name":"osx"}}]"#,
        );
        assert!(rules_allow(&r, &Platform::new(OsName::Windows, "x86_64")));
        assert!(rules_allow(&r, &Platform::new(OsName::Linux, "x86_64")));
        assert!(!rules_allow(&r, &Platform::new(OsName::Osx, "aarch64")));
    }

    #[test]
    fn test_only_osx_defaults_to_deny_elsewhere() {
        let r = rules(r#"[{"action":"allow","os":{"name":"osx"}}]"#);
        assert!(rules_allow(&r, &Platform::new(OsName::Osx, "x86_64")));
        assert!(!rules_allow(&r, &Platform::new(OsName::Linux, "x86_64")));
    }

    #[test]
    fn test_arch_constraint() {
        let r = rules(r#"[{"action":"allow","os":{"name":"windows","arch":"x86"}}]"#);
        assert!(rules_allow(&r, &Platform::new(OsName::Windows, "x86")));
        assert!(!rules_allow(&r, &Platform::new(OsName::Windows, "x86_64")));
    }

    #[test]
    fn test_arch_bits() {
        assert_eq!(Platform::new(OsName::Windows, "x86").arch_bits(), "32");
        assert_eq!(Platform::new(OsName::Linux, "x86_64").arch_bits(), "64");
    }
}
