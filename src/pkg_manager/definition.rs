//! Package-manager definition - the capability bundle a plugin supplies.

use std::path::PathBuf;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;

use super::abort::AbortSignal;
use super::context::ExecutionContext;
use super::version::KnownVersions;
use crate::workspace::WorkspaceInfo;

/// Output of packing one workspace: where the tarball went and where it should
/// be installed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallManifest {
    pub pkg_name: String,
    pub local_path: PathBuf,
    pub tarball: PathBuf,
    pub install_path: PathBuf,
}

impl InstallManifest {
    /// Directory of the installed package inside `install_path`.
    pub fn installed_package_dir(&self) -> PathBuf {
        self.install_path.join("node_modules").join(&self.pkg_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptResult {
    pub pkg_name: String,
    pub script: String,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ScriptResult {
    pub fn passed(&self) -> bool {
        self.exit_code == Some(0)
    }
}

pub struct PackRequest<'a> {
    pub ctx: &'a ExecutionContext,
    pub workspace: &'a WorkspaceInfo,
    pub signal: &'a AbortSignal,
}

pub struct InstallRequest<'a> {
    pub ctx: &'a ExecutionContext,
    pub manifest: &'a InstallManifest,
    pub signal: &'a AbortSignal,
}

pub struct RunScriptRequest<'a> {
    pub ctx: &'a ExecutionContext,
    pub manifest: &'a InstallManifest,
    pub script: &'a str,
    pub signal: &'a AbortSignal,
}

/// A package-manager family as supplied by a plugin.
///
/// Definitions are opaque to the engine: identity and ownership live in the
/// [`ComponentRegistry`](super::registry::ComponentRegistry), never on the
/// definition itself. `setup`/`teardown` are optional; a definition that
/// implements one should also return `true` from the matching `has_*`.
#[async_trait]
pub trait PackageManagerDefinition: Send + Sync {
    /// Executable name looked up on `PATH`, e.g. `npm`.
    fn bin(&self) -> &str;

    /// Declared name, e.g. `npm` or `yarn-classic`.
    fn name(&self) -> &str;

    /// npm-style range of versions this definition can drive.
    fn supported_version_range(&self) -> &str;

    fn known_versions(&self) -> &KnownVersions;

    async fn pack(&self, req: PackRequest<'_>) -> Result<InstallManifest>;

    async fn install(&self, req: InstallRequest<'_>) -> Result<()>;

    async fn run_script(&self, req: RunScriptRequest<'_>) -> Result<ScriptResult>;

    fn has_setup(&self) -> bool {
        false
    }

    async fn setup(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }

    fn has_teardown(&self) -> bool {
        false
    }

    async fn teardown(&self, _ctx: &ExecutionContext) -> Result<()> {
        Ok(())
    }
}

impl std::fmt::Debug for dyn PackageManagerDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageManagerDefinition")
            .field("name", &self.name())
            .field("bin", &self.bin())
            .field("range", &self.supported_version_range())
            .finish()
    }
}
