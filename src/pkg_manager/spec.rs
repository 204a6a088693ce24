//! Requested and resolved package-manager identities.

use std::fmt;
use std::path::PathBuf;

use semver::Version;
use serde::Serialize;

use crate::error::InvalidDesiredPackageManager;

/// Literal used for "whatever is on PATH".
pub const SYSTEM: &str = "system";

/// Requested version: the `system` sentinel or a version/tag/range string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PkgVersion {
    System,
    Concrete(String),
}

impl PkgVersion {
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() || raw.eq_ignore_ascii_case(SYSTEM) {
            PkgVersion::System
        } else {
            PkgVersion::Concrete(raw.to_string())
        }
    }

    pub fn is_system(&self) -> bool {
        matches!(self, PkgVersion::System)
    }

    pub fn as_concrete(&self) -> Option<&str> {
        match self {
            PkgVersion::System => None,
            PkgVersion::Concrete(v) => Some(v),
        }
    }
}

impl fmt::Display for PkgVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PkgVersion::System => write!(f, "{}", SYSTEM),
            PkgVersion::Concrete(v) => write!(f, "{}", v),
        }
    }
}

/// Parsed form of a user token such as `npm@7`, `yarn` or `system`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartialSpec {
    pub name: Option<String>,
    pub version: PkgVersion,
    pub requested_as: String,
}

impl PartialSpec {
    pub fn parse(desired: &str) -> Result<Self, InvalidDesiredPackageManager> {
        let requested_as = desired.trim();
        let invalid = |reason| InvalidDesiredPackageManager {
            input: desired.to_string(),
            reason,
        };

        if requested_as.is_empty() {
            return Err(invalid("empty request"));
        }

        if requested_as.eq_ignore_ascii_case(SYSTEM) {
            return Ok(Self::system());
        }

        // Scoped names start with '@', so only an '@' after the first char
        // separates name from version.
        let skip = requested_as.chars().next().map_or(0, char::len_utf8);
        let (name, version) = match requested_as[skip..].rfind('@') {
            Some(idx) => {
                let (name, version) = requested_as.split_at(skip + idx);
                (name, Some(&version[1..]))
            }
            None => (requested_as, None),
        };

        if name.is_empty() || name == "@" {
            return Err(invalid("missing package manager name"));
        }
        if version.is_some_and(|v| v.trim().is_empty()) {
            return Err(invalid("empty version after '@'"));
        }

        Ok(Self {
            name: Some(name.to_string()),
            version: version.map(PkgVersion::parse).unwrap_or(PkgVersion::System),
            requested_as: requested_as.to_string(),
        })
    }

    /// The request used when the user asked for nothing in particular.
    pub fn system() -> Self {
        Self {
            name: None,
            version: PkgVersion::System,
            requested_as: SYSTEM.to_string(),
        }
    }

    /// Whether `candidate` (a definition's `bin` or `name`) matches the requested
    /// name. A request without a name matches everything.
    pub fn matches_name(&self, candidate: &str) -> bool {
        self.name
            .as_deref()
            .is_none_or(|name| name.eq_ignore_ascii_case(candidate))
    }

    /// Has both a name and a non-`system` version.
    pub fn is_well_formed(&self) -> bool {
        self.name.is_some() && !self.version.is_system()
    }
}

impl fmt::Display for PartialSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.requested_as)
    }
}

/// Concrete identity of a resolved package manager.
///
/// Immutable; use [`PackageManagerSpec::with_bin`] and friends to derive a
/// modified copy.
#[derive(Debug, Clone, Serialize)]
pub struct PackageManagerSpec {
    name: String,
    #[serde(serialize_with = "serialize_version")]
    version: Version,
    bin: PathBuf,
    label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    requested_as: Option<String>,
    is_system: bool,
}

fn serialize_version<S: serde::Serializer>(v: &Version, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(v)
}

impl PackageManagerSpec {
    pub fn new(name: impl Into<String>, version: Version, bin: impl Into<PathBuf>) -> Self {
        let name = name.into();
        let label = format!("{}@{}", name, version);
        Self {
            name,
            version,
            bin: bin.into(),
            label,
            requested_as: None,
            is_system: false,
        }
    }

    pub fn with_bin(&self, bin: impl Into<PathBuf>) -> Self {
        Self {
            bin: bin.into(),
            ..self.clone()
        }
    }

    pub fn with_requested_as(&self, requested_as: impl Into<String>) -> Self {
        Self {
            requested_as: Some(requested_as.into()),
            ..self.clone()
        }
    }

    pub fn with_system(&self, is_system: bool) -> Self {
        Self {
            is_system,
            ..self.clone()
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn bin(&self) -> &std::path::Path {
        &self.bin
    }

    /// `name@version`
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn requested_as(&self) -> Option<&str> {
        self.requested_as.as_deref()
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    /// Structural `{name, version}` equality; `bin` and `label` are ignored.
    pub fn same_identity(&self, other: &Self) -> bool {
        self.name == other.name && self.version == other.version
    }
}

impl fmt::Display for PackageManagerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_system {
            write!(f, "{} (system)", self.label)
        } else {
            write!(f, "{}", self.label)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_system() {
        let spec = PartialSpec::parse("system").unwrap();
        assert_eq!(spec.name, None);
        assert!(spec.version.is_system());
        assert_eq!(spec.requested_as, "system");
    }

    #[test]
    fn test_parse_bare_name_is_system_version() {
        let spec = PartialSpec::parse("yarn").unwrap();
        assert_eq!(spec.name.as_deref(), Some("yarn"));
        assert_eq!(spec.version, PkgVersion::System);
        assert!(!spec.is_well_formed());
    }

    #[test]
    fn test_parse_name_and_version() {
        let spec = PartialSpec::parse("npm@7").unwrap();
        assert_eq!(spec.name.as_deref(), Some("npm"));
        assert_eq!(spec.version, PkgVersion::Concrete("7".to_string()));
        assert!(spec.is_well_formed());

        let spec = PartialSpec::parse("yarn@berry").unwrap();
        assert_eq!(spec.version.as_concrete(), Some("berry"));

        let spec = PartialSpec::parse("npm@system").unwrap();
        assert!(spec.version.is_system());
    }

    #[test]
    fn test_parse_scoped_name() {
        let spec = PartialSpec::parse("@yarnpkg/cli@3.6.0").unwrap();
        assert_eq!(spec.name.as_deref(), Some("@yarnpkg/cli"));
        assert_eq!(spec.version.as_concrete(), Some("3.6.0"));

        let spec = PartialSpec::parse("@yarnpkg/cli").unwrap();
        assert_eq!(spec.name.as_deref(), Some("@yarnpkg/cli"));
        assert!(spec.version.is_system());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(PartialSpec::parse("").is_err());
        assert!(PartialSpec::parse("   ").is_err());
        assert!(PartialSpec::parse("npm@").is_err());
        assert!(PartialSpec::parse("@").is_err());
    }

    #[test]
    fn test_matches_name_case_insensitive() {
        let spec = PartialSpec::parse("NPM@9").unwrap();
        assert!(spec.matches_name("npm"));
        assert!(!spec.matches_name("pnpm"));
        assert!(PartialSpec::system().matches_name("anything"));
    }

    #[test]
    fn test_spec_clone_with_override() {
        let spec = PackageManagerSpec::new("npm", Version::new(9, 8, 1), "npm");
        let system = spec.with_bin("/usr/bin/npm").with_system(true);

        assert_eq!(spec.bin(), std::path::Path::new("npm"));
        assert!(!spec.is_system());
        assert_eq!(system.bin(), std::path::Path::new("/usr/bin/npm"));
        assert!(system.same_identity(&spec));
        assert_eq!(system.label(), "npm@9.8.1");
        assert_eq!(system.to_string(), "npm@9.8.1 (system)");
    }
}
