//! Workspaces to pack, read from their `package.json`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{path} has no \"name\" field")]
    MissingName { path: PathBuf },
}

#[derive(Debug, Deserialize)]
struct PackageJson {
    name: Option<String>,
    #[serde(default)]
    private: bool,
    #[serde(default)]
    scripts: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceInfo {
    pub pkg_name: String,
    pub local_path: PathBuf,
    pub pkg_json_path: PathBuf,
    pub private: bool,
    pub scripts: BTreeMap<String, String>,
}

impl WorkspaceInfo {
    pub fn new(pkg_name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        let local_path = local_path.into();
        Self {
            pkg_name: pkg_name.into(),
            pkg_json_path: local_path.join("package.json"),
            local_path,
            private: false,
            scripts: BTreeMap::new(),
        }
    }

    /// Read `<dir>/package.json`.
    pub fn from_dir(dir: &Path) -> Result<Self, WorkspaceError> {
        let pkg_json_path = dir.join("package.json");
        let contents = std::fs::read_to_string(&pkg_json_path).map_err(|source| {
            WorkspaceError::Read {
                path: pkg_json_path.clone(),
                source,
            }
        })?;
        let pkg: PackageJson =
            serde_json::from_str(&contents).map_err(|source| WorkspaceError::Parse {
                path: pkg_json_path.clone(),
                source,
            })?;
        let pkg_name = pkg
            .name
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| WorkspaceError::MissingName {
                path: pkg_json_path.clone(),
            })?;

        Ok(Self {
            pkg_name,
            local_path: dir.to_path_buf(),
            pkg_json_path,
            private: pkg.private,
            scripts: pkg.scripts,
        })
    }

    pub fn has_script(&self, script: &str) -> bool {
        self.scripts.contains_key(script)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_dir_reads_package_json() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("package.json"),
            r#"{"name": "@acme/widget", "version": "1.0.0", "scripts": {"smoke": "node ."}}"#,
        )
        .unwrap();

        let ws = WorkspaceInfo::from_dir(dir.path()).unwrap();
        assert_eq!(ws.pkg_name, "@acme/widget");
        assert_eq!(ws.local_path, dir.path());
        assert!(ws.has_script("smoke"));
        assert!(!ws.private);
    }

    #[test]
    fn test_from_dir_missing_name() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("package.json"), r#"{"version": "1.0.0"}"#).unwrap();

        let err = WorkspaceInfo::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, WorkspaceError::MissingName { .. }));
    }

    #[test]
    fn test_from_dir_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = WorkspaceInfo::from_dir(dir.path()).unwrap_err();
        assert!(matches!(err, WorkspaceError::Read { .. }));
    }
}
