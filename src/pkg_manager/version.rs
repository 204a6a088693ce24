//! Version matching for package-manager definitions.
//!
//! Definitions declare their supported versions as npm-style ranges
//! (`^7.0.0 || ^8.0.0`, `>=1.22 <2`, `1.0.0 - 1.22.x`). These are translated
//! into one [`semver::VersionReq`] per `||` alternative.

use std::collections::HashMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use semver::{Version, VersionReq};
use thiserror::Error;

use super::definition::PackageManagerDefinition;

static REPORTED_VERSION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"v?(\d+\.\d+\.\d+(?:-[0-9A-Za-z.-]+)?(?:\+[0-9A-Za-z.-]+)?)")
        .expect("reported version regex is valid")
});

/// Versions and dist-tags a definition knows about.
#[derive(Debug, Clone, Default)]
pub struct KnownVersions {
    pub versions: Vec<Version>,
    pub tags: HashMap<String, Version>,
}

impl KnownVersions {
    /// Build from version strings, skipping anything that is not valid semver.
    pub fn new<'a>(versions: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            versions: versions
                .into_iter()
                .filter_map(|v| Version::parse(v).ok())
                .collect(),
            tags: HashMap::new(),
        }
    }

    pub fn with_tag(mut self, tag: &str, version: &str) -> Self {
        if let Ok(version) = Version::parse(version) {
            self.tags.insert(tag.to_string(), version);
        }
        self
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty() && self.tags.is_empty()
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid version range {range:?}: {message}")]
pub struct RangeParseError {
    pub range: String,
    pub message: String,
}

/// An npm-style version range.
#[derive(Debug, Clone)]
pub struct VersionRange {
    raw: String,
    alternatives: Vec<VersionReq>,
}

impl VersionRange {
    pub fn parse(raw: &str) -> Result<Self, RangeParseError> {
        let alternatives = raw
            .split("||")
            .map(|alt| {
                let translated = translate_alternative(alt.trim());
                VersionReq::parse(&translated).map_err(|e| RangeParseError {
                    range: raw.to_string(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: raw.to_string(),
            alternatives,
        })
    }

    pub fn matches(&self, version: &Version) -> bool {
        self.alternatives.iter().any(|req| req.matches(version))
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.raw)
    }
}

/// Translate one `||`-free npm range into `semver` crate syntax.
fn translate_alternative(alt: &str) -> String {
    if alt.is_empty() {
        return "*".to_string();
    }

    // Hyphen range: "a - b" means ">=a, <=b"
    if let Some((low, high)) = alt.split_once(" - ") {
        let low = trim_wildcards(strip_v(low.trim()));
        let high = trim_wildcards(strip_v(high.trim()));
        return match (low.is_empty(), high.is_empty()) {
            (true, true) => "*".to_string(),
            (false, true) => format!(">={}", low),
            (true, false) => format!("<={}", high),
            (false, false) => format!(">={}, <={}", low, high),
        };
    }

    // npm allows a space between operator and version (">= 1.2.3"), so glue
    // dangling operators onto the following token.
    let mut comparators: Vec<String> = Vec::new();
    let mut pending_op: Option<&str> = None;
    for token in alt.split_whitespace() {
        if is_operator(token) {
            pending_op = Some(token);
            continue;
        }
        let token = match pending_op.take() {
            Some(op) => format!("{}{}", op, token),
            None => token.to_string(),
        };
        comparators.push(translate_comparator(&token));
    }

    if comparators.is_empty() {
        "*".to_string()
    } else {
        comparators.join(", ")
    }
}

fn is_operator(token: &str) -> bool {
    matches!(token, ">=" | "<=" | ">" | "<" | "=" | "^" | "~")
}

fn translate_comparator(token: &str) -> String {
    let op_len = token
        .find(|c: char| c.is_ascii_alphanumeric() || c == '*')
        .unwrap_or(token.len());
    let (op, rest) = token.split_at(op_len);
    let rest = trim_wildcards(strip_v(rest));

    if rest.is_empty() {
        return "*".to_string();
    }

    if op.is_empty() {
        // npm treats a bare (possibly partial) version as an exact/partial
        // match, while the semver crate would default to caret.
        format!("={}", rest)
    } else {
        format!("{}{}", op, rest)
    }
}

/// `1.22.x` → `1.22`, `*` → empty. Partial versions in the semver crate
/// already mean "any value in the missing positions".
fn trim_wildcards(s: &str) -> String {
    s.split('.')
        .take_while(|part| !matches!(*part, "x" | "X" | "*"))
        .collect::<Vec<_>>()
        .join(".")
}

fn strip_v(s: &str) -> &str {
    s.strip_prefix('v')
        .or_else(|| s.strip_prefix('V'))
        .filter(|rest| rest.starts_with(|c: char| c.is_ascii_digit()))
        .unwrap_or(s)
}

/// Normalize a version, dist-tag or range against a known version table.
///
/// - dist-tag → the tagged version
/// - exact semver → itself
/// - range → highest known version satisfying it
pub fn normalize_version(known: &KnownVersions, alleged: &str) -> Option<Version> {
    let alleged = alleged.trim();
    if alleged.is_empty() {
        return None;
    }

    if let Some(version) = known.tags.get(alleged) {
        return Some(version.clone());
    }

    if let Ok(version) = Version::parse(strip_v(alleged)) {
        return Some(version);
    }

    let range = VersionRange::parse(alleged).ok()?;
    known
        .versions
        .iter()
        .filter(|v| range.matches(v))
        .max()
        .cloned()
}

/// The concrete version `definition` accepts for `alleged`, if any.
pub fn accepts(definition: &dyn PackageManagerDefinition, alleged: &str) -> Option<Version> {
    let range = match VersionRange::parse(definition.supported_version_range()) {
        Ok(range) => range,
        Err(err) => {
            crate::ui::debug(
                "pkg_manager.version.bad_range",
                &format!("{} has an unusable range: {}", definition.name(), err),
            );
            return None;
        }
    };

    let version = normalize_version(definition.known_versions(), alleged)?;
    range.matches(&version).then_some(version)
}

/// Pull the first semver-looking token out of `--version` output.
///
/// Handles `"10.2.3\n"`, `"v18.0.0"` and `"yarn 1.22.19"`.
pub fn extract_reported_version(output: &str) -> Option<String> {
    REPORTED_VERSION
        .captures(output)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    #[test]
    fn test_range_alternatives() {
        let range = VersionRange::parse("^7.0.0 || ^8.0.0").unwrap();
        assert!(range.matches(&v("7.24.0")));
        assert!(range.matches(&v("8.19.4")));
        assert!(!range.matches(&v("6.14.18")));
        assert!(!range.matches(&v("9.0.0")));
    }

    #[test]
    fn test_range_whitespace_comparators() {
        let range = VersionRange::parse(">=1.22 <2").unwrap();
        assert!(range.matches(&v("1.22.19")));
        assert!(!range.matches(&v("1.21.0")));
        assert!(!range.matches(&v("2.0.0")));

        let range = VersionRange::parse(">= 7.0.0").unwrap();
        assert!(range.matches(&v("7.0.0")));
    }

    #[test]
    fn test_range_hyphen_and_wildcards() {
        let range = VersionRange::parse("1.0.0 - 1.22.x").unwrap();
        assert!(range.matches(&v("1.22.19")));
        assert!(!range.matches(&v("1.23.0")));

        let range = VersionRange::parse("7.x").unwrap();
        assert!(range.matches(&v("7.1.0")));
        assert!(!range.matches(&v("8.0.0")));

        let range = VersionRange::parse("*").unwrap();
        assert!(range.matches(&v("0.0.1")));
    }

    #[test]
    fn test_bare_partial_is_not_caret() {
        let range = VersionRange::parse("7.24").unwrap();
        assert!(range.matches(&v("7.24.3")));
        assert!(!range.matches(&v("7.25.0")));
    }

    #[test]
    fn test_invalid_range() {
        let err = VersionRange::parse("definitely not a range").unwrap_err();
        assert_eq!(err.range, "definitely not a range");
        let boxed: Box<dyn std::error::Error> = Box::new(err);
        assert!(boxed.to_string().starts_with("invalid version range \"definitely not a range\": "));
    }

    #[test]
    fn test_normalize_tags_versions_ranges() {
        let known = KnownVersions::new(["7.0.0", "7.24.0", "7.24.2", "8.1.0"])
            .with_tag("latest-7", "7.24.2")
            .with_tag("latest", "8.1.0");

        assert_eq!(normalize_version(&known, "latest"), Some(v("8.1.0")));
        assert_eq!(normalize_version(&known, "latest-7"), Some(v("7.24.2")));
        assert_eq!(normalize_version(&known, "7.24.0"), Some(v("7.24.0")));
        assert_eq!(normalize_version(&known, "v7.24.0"), Some(v("7.24.0")));
        assert_eq!(normalize_version(&known, "7"), Some(v("7.24.2")));
        assert_eq!(normalize_version(&known, "^7.0.0 || ^8.0.0"), Some(v("8.1.0")));
        assert_eq!(normalize_version(&known, "9"), None);
        assert_eq!(normalize_version(&known, ""), None);
        assert_eq!(normalize_version(&known, "berry"), None);
    }

    #[test]
    fn test_normalize_exact_version_not_in_table() {
        let known = KnownVersions::default();
        assert_eq!(normalize_version(&known, "1.22.19"), Some(v("1.22.19")));
    }

    #[test]
    fn test_extract_reported_version() {
        assert_eq!(extract_reported_version("10.2.3\n").as_deref(), Some("10.2.3"));
        assert_eq!(extract_reported_version("v18.0.0").as_deref(), Some("18.0.0"));
        assert_eq!(
            extract_reported_version("yarn 1.22.19").as_deref(),
            Some("1.22.19")
        );
        assert_eq!(
            extract_reported_version("4.0.0-rc.53").as_deref(),
            Some("4.0.0-rc.53")
        );
        assert_eq!(extract_reported_version("command not found"), None);
    }
}
