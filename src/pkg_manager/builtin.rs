//! Built-in definitions for npm, yarn classic and pnpm.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use async_trait::async_trait;

use super::context::ExecutionContext;
use super::definition::{
    InstallManifest, InstallRequest, PackRequest, PackageManagerDefinition, RunScriptRequest,
    ScriptResult,
};
use super::executor::{ExecOutput, ExecRequest};
use super::plugin::{Plugin, PluginMetadata};
use super::version::KnownVersions;

pub const PLUGIN_ID: &str = "builtin";

/// Package-manager family a [`BuiltinDefinition`] drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flavor {
    Npm,
    YarnClassic,
    Pnpm,
}

impl Flavor {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::YarnClassic => "yarn-classic",
            Self::Pnpm => "pnpm",
        }
    }

    pub fn bin(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::YarnClassic => "yarn",
            Self::Pnpm => "pnpm",
        }
    }

    pub fn supported_range(&self) -> &'static str {
        match self {
            Self::Npm => "^7.0.0 || ^8.0.0 || ^9.0.0 || ^10.0.0 || ^11.0.0",
            Self::YarnClassic => "^1.0.0",
            Self::Pnpm => "^8.0.0 || ^9.0.0 || ^10.0.0",
        }
    }

    fn known_versions(&self) -> KnownVersions {
        match self {
            Self::Npm => KnownVersions::new([
                "7.24.2", "8.19.4", "9.8.1", "9.9.3", "10.2.4", "10.8.2", "10.9.2", "11.0.0",
            ])
            .with_tag("latest-7", "7.24.2")
            .with_tag("latest-8", "8.19.4")
            .with_tag("latest-9", "9.9.3")
            .with_tag("latest-10", "10.9.2")
            .with_tag("latest", "11.0.0"),
            Self::YarnClassic => KnownVersions::new(["1.22.10", "1.22.19", "1.22.22"])
                .with_tag("latest", "1.22.22")
                .with_tag("classic", "1.22.22"),
            Self::Pnpm => KnownVersions::new(["8.15.9", "9.15.0", "10.0.0"])
                .with_tag("latest-8", "8.15.9")
                .with_tag("latest-9", "9.15.0")
                .with_tag("latest", "10.0.0"),
        }
    }

    /// Base arguments for packing into `dest`.
    fn pack_args(&self, dest: &Path, pkg_name: &str) -> Vec<String> {
        let dest = dest.display().to_string();
        match self {
            Self::Npm | Self::Pnpm => vec!["pack".into(), "--pack-destination".into(), dest],
            Self::YarnClassic => vec![
                "pack".into(),
                "--filename".into(),
                format!("{}/{}.tgz", dest, file_safe(pkg_name)),
            ],
        }
    }

    /// Base arguments for installing a tarball into the current directory.
    fn install_args(&self) -> &'static [&'static str] {
        match self {
            Self::Npm => &["install", "--no-save", "--no-package-lock", "--no-audit", "--no-fund"],
            Self::YarnClassic => &["add", "--no-lockfile", "--non-interactive"],
            Self::Pnpm => &["add", "--ignore-workspace"],
        }
    }
}

/// `@scope/name` → `scope-name`
fn file_safe(pkg_name: &str) -> String {
    pkg_name.trim_start_matches('@').replace('/', "-")
}

fn check(output: &ExecOutput, what: &str) -> Result<()> {
    if output.success() {
        return Ok(());
    }
    let detail = output.stderr.trim();
    bail!(
        "{} exited with {}{}",
        what,
        output
            .exit_code
            .map_or_else(|| "a signal".to_string(), |c| format!("code {}", c)),
        if detail.is_empty() {
            String::new()
        } else {
            format!(": {}", detail)
        }
    )
}

/// Tarball path from pack output: the last non-empty line, either absolute
/// (pnpm) or a file name inside `dest` (npm).
fn tarball_from_output(stdout: &str, dest: &Path) -> Option<PathBuf> {
    let line = stdout.lines().map(str::trim).rfind(|l| !l.is_empty())?;
    let path = Path::new(line);
    Some(if path.is_absolute() {
        path.to_path_buf()
    } else {
        dest.join(path)
    })
}

/// A command-template definition for one [`Flavor`].
#[derive(Debug)]
pub struct BuiltinDefinition {
    flavor: Flavor,
    known: KnownVersions,
}

impl BuiltinDefinition {
    pub fn new(flavor: Flavor) -> Self {
        Self {
            flavor,
            known: flavor.known_versions(),
        }
    }

    pub fn flavor(&self) -> Flavor {
        self.flavor
    }

    fn yarn_cache(ctx: &ExecutionContext) -> PathBuf {
        ctx.tmpdir().join("yarn-cache")
    }
}

#[async_trait]
impl PackageManagerDefinition for BuiltinDefinition {
    fn bin(&self) -> &str {
        self.flavor.bin()
    }

    fn name(&self) -> &str {
        self.flavor.name()
    }

    fn supported_version_range(&self) -> &str {
        self.flavor.supported_range()
    }

    fn known_versions(&self) -> &KnownVersions {
        &self.known
    }

    async fn pack(&self, req: PackRequest<'_>) -> Result<InstallManifest> {
        let ctx = req.ctx;
        let workspace = req.workspace;
        let dest = ctx.tmpdir().join("tarballs");
        tokio::fs::create_dir_all(&dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;

        let exec = ExecRequest::new(ctx.spec().bin())
            .args(self.flavor.pack_args(&dest, &workspace.pkg_name))
            .cwd(&workspace.local_path);
        let output = ctx
            .executor()
            .exec(&exec, req.signal)
            .await
            .with_context(|| format!("Failed to pack {}", workspace.pkg_name))?;
        check(&output, &format!("{} pack", self.flavor.bin()))?;

        let tarball = match self.flavor {
            Flavor::YarnClassic => dest.join(format!("{}.tgz", file_safe(&workspace.pkg_name))),
            _ => tarball_from_output(&output.stdout, &dest)
                .with_context(|| format!("{} pack printed no tarball name", self.flavor.bin()))?,
        };

        let install_path = ctx.tmpdir().join("installs").join(file_safe(&workspace.pkg_name));
        tokio::fs::create_dir_all(&install_path)
            .await
            .with_context(|| format!("Failed to create {}", install_path.display()))?;
        // Installing needs a project to install into
        let manifest = serde_json::json!({ "name": "smoke-install", "private": true });
        tokio::fs::write(install_path.join("package.json"), manifest.to_string())
            .await
            .context("Failed to write install package.json")?;

        Ok(InstallManifest {
            pkg_name: workspace.pkg_name.clone(),
            local_path: workspace.local_path.clone(),
            tarball,
            install_path,
        })
    }

    async fn install(&self, req: InstallRequest<'_>) -> Result<()> {
        let ctx = req.ctx;
        let manifest = req.manifest;

        let mut exec = ExecRequest::new(ctx.spec().bin())
            .args(self.flavor.install_args().iter().copied())
            .arg(manifest.tarball.display().to_string())
            .cwd(&manifest.install_path);
        if self.flavor == Flavor::YarnClassic {
            exec = exec
                .arg("--cache-folder")
                .arg(Self::yarn_cache(ctx).display().to_string());
        }
        if ctx.verbose() && self.flavor == Flavor::Npm {
            exec = exec.arg("--loglevel=verbose");
        }

        let output = ctx
            .executor()
            .exec(&exec, req.signal)
            .await
            .with_context(|| format!("Failed to install {}", manifest.pkg_name))?;
        check(&output, &format!("{} install", self.flavor.bin()))
    }

    async fn run_script(&self, req: RunScriptRequest<'_>) -> Result<ScriptResult> {
        let ctx = req.ctx;
        let exec = ExecRequest::new(ctx.spec().bin())
            .args(["run", req.script])
            .cwd(req.manifest.installed_package_dir());
        let output = ctx
            .executor()
            .exec(&exec, req.signal)
            .await
            .with_context(|| format!("Failed to run {} in {}", req.script, req.manifest.pkg_name))?;

        Ok(ScriptResult {
            pkg_name: req.manifest.pkg_name.clone(),
            script: req.script.to_string(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    fn has_setup(&self) -> bool {
        self.flavor == Flavor::YarnClassic
    }

    /// yarn classic gets a private cache so runs do not share state.
    async fn setup(&self, ctx: &ExecutionContext) -> Result<()> {
        if self.flavor != Flavor::YarnClassic {
            return Ok(());
        }
        let cache = Self::yarn_cache(ctx);
        tokio::fs::create_dir_all(&cache)
            .await
            .with_context(|| format!("Failed to create yarn cache {}", cache.display()))
    }
}

/// The plugin bundling every built-in definition, npm first.
pub fn plugin() -> Plugin {
    Plugin::new(PluginMetadata {
        id: PLUGIN_ID.to_string(),
        version: Some(env!("CARGO_PKG_VERSION").to_string()),
        description: Some("npm, yarn classic and pnpm".to_string()),
    })
    .with_definition(Arc::new(BuiltinDefinition::new(Flavor::Npm)))
    .with_definition(Arc::new(BuiltinDefinition::new(Flavor::YarnClassic)))
    .with_definition(Arc::new(BuiltinDefinition::new(Flavor::Pnpm)))
}
