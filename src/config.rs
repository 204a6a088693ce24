use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::fs;

use crate::pkg_manager::service::DEFAULT_SYSTEM_BIN;

pub const CONFIG_FILE_NAME: &str = "smoker.toml";

fn default_system_bin() -> String {
    DEFAULT_SYSTEM_BIN.to_string()
}

fn default_resolve_timeout_secs() -> u64 {
    30
}

fn default_version_query_timeout_secs() -> u64 {
    10
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SmokerConfig {
    /// Desired package managers, e.g. `["npm@9", "yarn"]`. Empty means system.
    #[serde(default)]
    pub package_managers: Vec<String>,
    #[serde(default = "default_system_bin")]
    pub default_system_bin: String,
    #[serde(default)]
    pub linger: bool,
    #[serde(default)]
    pub loose: bool,
    #[serde(default)]
    pub verbose: bool,
    #[serde(default = "default_resolve_timeout_secs")]
    pub resolve_timeout_secs: u64,
    #[serde(default = "default_version_query_timeout_secs")]
    pub version_query_timeout_secs: u64,
    /// 0 disables the idle timeout.
    #[serde(default)]
    pub idle_timeout_secs: u64,
    /// Where temp directories go; the OS temp dir if unset.
    #[serde(default)]
    pub tmp_root: Option<PathBuf>,
}

impl Default for SmokerConfig {
    fn default() -> Self {
        SmokerConfig {
            package_managers: Vec::new(),
            default_system_bin: default_system_bin(),
            linger: false,
            loose: false,
            verbose: false,
            resolve_timeout_secs: default_resolve_timeout_secs(),
            version_query_timeout_secs: default_version_query_timeout_secs(),
            idle_timeout_secs: 0,
            tmp_root: None,
        }
    }
}

/// `<config_dir>/smoker/smoker.toml`
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("smoker").join(CONFIG_FILE_NAME))
}

impl SmokerConfig {
    /// Load `./smoker.toml`, else the user config file, else defaults.
    pub fn load() -> Result<SmokerConfig> {
        let local = PathBuf::from(CONFIG_FILE_NAME);
        if local.is_file() {
            return Self::load_from(&local);
        }
        match user_config_path() {
            Some(path) if path.is_file() => Self::load_from(&path),
            _ => Ok(SmokerConfig::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<SmokerConfig> {
        let s = fs::read_to_string(path).with_context(|| format!("reading config {}", path.display()))?;
        let c: SmokerConfig =
            toml::from_str(&s).with_context(|| format!("parsing config toml {}", path.display()))?;
        Ok(c)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("creating config directory")?;
        }
        let toml = toml::to_string_pretty(self).context("serializing config to toml")?;
        fs::write(path, toml).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    pub fn resolve_timeout(&self) -> Duration {
        Duration::from_secs(self.resolve_timeout_secs)
    }

    pub fn version_query_timeout(&self) -> Option<Duration> {
        (self.version_query_timeout_secs > 0).then(|| Duration::from_secs(self.version_query_timeout_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_when_fields_missing() {
        let c: SmokerConfig = toml::from_str("linger = true\n").unwrap();
        assert!(c.linger);
        assert_eq!(c.default_system_bin, "npm");
        assert_eq!(c.resolve_timeout_secs, 30);
        assert!(c.idle_timeout().is_none());
        assert_eq!(c.version_query_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE_NAME);
        let config = SmokerConfig {
            package_managers: vec!["npm@9".to_string(), "yarn".to_string()],
            idle_timeout_secs: 5,
            tmp_root: Some(dir.path().join("tmp")),
            ..Default::default()
        };
        config.save_to(&path).unwrap();

        let loaded = SmokerConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.idle_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_bad_toml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        fs::write(&path, "linger = \"sometimes\"").unwrap();
        let err = SmokerConfig::load_from(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("parsing config toml"));
    }
}
