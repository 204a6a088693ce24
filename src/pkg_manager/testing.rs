//! In-memory doubles for definitions, `PATH` lookup, subprocesses and the
//! file manager. Used by the unit and integration tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use semver::Version;
use tempfile::TempDir;

use super::abort::AbortSignal;
use super::context::{self, ContextOptions, ExecutionContext};
use super::definition::{
    InstallManifest, InstallRequest, PackRequest, PackageManagerDefinition, RunScriptRequest,
    ScriptResult,
};
use super::envelope::PackageManagerEnvelope;
use super::executor::{ExecOutput, ExecRequest, Executor};
use super::fs::{FileManager, TempFileManager};
use super::locator::BinLocator;
use super::plugin::PluginMetadata;
use super::registry::ComponentRegistry;
use super::spec::PackageManagerSpec;
use super::version::KnownVersions;
use crate::error::ExecError;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Behaviour of an optional hook on a [`StubDefinition`].
#[derive(Debug, Clone)]
enum Hook {
    Absent,
    Succeeds,
    Fails(String),
}

/// Configurable [`PackageManagerDefinition`] that records every call.
#[derive(Debug)]
pub struct StubDefinition {
    name: String,
    bin: String,
    range: String,
    known: KnownVersions,
    setup: Hook,
    teardown: Hook,
    pack_delay: Option<Duration>,
    failing_packs: Vec<String>,
    failing_installs: Vec<String>,
    setup_calls: AtomicUsize,
    teardown_calls: AtomicUsize,
    packed: Mutex<Vec<String>>,
    installed: Mutex<Vec<String>>,
    scripts: Mutex<Vec<(String, String)>>,
}

impl StubDefinition {
    pub fn new(name: &str, bin: &str, range: &str) -> Self {
        Self {
            name: name.to_string(),
            bin: bin.to_string(),
            range: range.to_string(),
            known: KnownVersions::default(),
            setup: Hook::Absent,
            teardown: Hook::Absent,
            pack_delay: None,
            failing_packs: Vec::new(),
            failing_installs: Vec::new(),
            setup_calls: AtomicUsize::new(0),
            teardown_calls: AtomicUsize::new(0),
            packed: Mutex::new(Vec::new()),
            installed: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_known(mut self, versions: &[&str]) -> Self {
        self.known = KnownVersions::new(versions.iter().copied());
        self
    }

    pub fn with_tag(mut self, tag: &str, version: &str) -> Self {
        self.known = self.known.with_tag(tag, version);
        self
    }

    /// Give the definition a setup hook; `Some(msg)` makes it fail with `msg`.
    pub fn with_setup(mut self, failure: Option<&str>) -> Self {
        self.setup = failure.map_or(Hook::Succeeds, |msg| Hook::Fails(msg.to_string()));
        self
    }

    /// Give the definition a teardown hook; `Some(msg)` makes it fail.
    pub fn with_teardown(mut self, failure: Option<&str>) -> Self {
        self.teardown = failure.map_or(Hook::Succeeds, |msg| Hook::Fails(msg.to_string()));
        self
    }

    /// Every pack takes `delay` unless aborted first.
    pub fn with_pack_delay(mut self, delay: Duration) -> Self {
        self.pack_delay = Some(delay);
        self
    }

    pub fn failing_pack(mut self, pkg_name: &str) -> Self {
        self.failing_packs.push(pkg_name.to_string());
        self
    }

    pub fn failing_install(mut self, pkg_name: &str) -> Self {
        self.failing_installs.push(pkg_name.to_string());
        self
    }

    pub fn setup_calls(&self) -> usize {
        self.setup_calls.load(Ordering::SeqCst)
    }

    pub fn teardown_calls(&self) -> usize {
        self.teardown_calls.load(Ordering::SeqCst)
    }

    pub fn packed(&self) -> Vec<String> {
        lock(&self.packed).clone()
    }

    pub fn installed(&self) -> Vec<String> {
        lock(&self.installed).clone()
    }

    pub fn scripts_run(&self) -> Vec<(String, String)> {
        lock(&self.scripts).clone()
    }

    async fn run_hook(hook: &Hook, calls: &AtomicUsize) -> Result<()> {
        calls.fetch_add(1, Ordering::SeqCst);
        match hook {
            Hook::Fails(msg) => bail!("{}", msg),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl PackageManagerDefinition for StubDefinition {
    fn bin(&self) -> &str {
        &self.bin
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn supported_version_range(&self) -> &str {
        &self.range
    }

    fn known_versions(&self) -> &KnownVersions {
        &self.known
    }

    async fn pack(&self, req: PackRequest<'_>) -> Result<InstallManifest> {
        if let Some(delay) = self.pack_delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = req.signal.aborted() => bail!("pack aborted"),
            }
        }
        let pkg_name = req.workspace.pkg_name.clone();
        if self.failing_packs.contains(&pkg_name) {
            bail!("cannot pack {}", pkg_name);
        }
        lock(&self.packed).push(pkg_name.clone());
        Ok(InstallManifest {
            tarball: req.ctx.tmpdir().join(format!("{}.tgz", pkg_name)),
            install_path: req.ctx.tmpdir().join("install").join(&pkg_name),
            local_path: req.workspace.local_path.clone(),
            pkg_name,
        })
    }

    async fn install(&self, req: InstallRequest<'_>) -> Result<()> {
        let pkg_name = &req.manifest.pkg_name;
        if self.failing_installs.contains(pkg_name) {
            bail!("cannot install {}", pkg_name);
        }
        lock(&self.installed).push(pkg_name.clone());
        Ok(())
    }

    async fn run_script(&self, req: RunScriptRequest<'_>) -> Result<ScriptResult> {
        lock(&self.scripts).push((req.manifest.pkg_name.clone(), req.script.to_string()));
        Ok(ScriptResult {
            pkg_name: req.manifest.pkg_name.clone(),
            script: req.script.to_string(),
            exit_code: Some(0),
            stdout: String::new(),
            stderr: String::new(),
        })
    }

    fn has_setup(&self) -> bool {
        !matches!(self.setup, Hook::Absent)
    }

    async fn setup(&self, _ctx: &ExecutionContext) -> Result<()> {
        Self::run_hook(&self.setup, &self.setup_calls).await
    }

    fn has_teardown(&self) -> bool {
        !matches!(self.teardown, Hook::Absent)
    }

    async fn teardown(&self, _ctx: &ExecutionContext) -> Result<()> {
        Self::run_hook(&self.teardown, &self.teardown_calls).await
    }
}

/// `PATH` as a map from bin name to path.
#[derive(Debug, Default)]
pub struct FakeBinLocator {
    bins: Mutex<HashMap<String, PathBuf>>,
}

impl FakeBinLocator {
    pub fn add(&self, bin: &str, path: impl AsRef<Path>) {
        lock(&self.bins).insert(bin.to_string(), path.as_ref().to_path_buf());
    }
}

impl BinLocator for FakeBinLocator {
    fn locate(&self, bin: &str) -> Option<PathBuf> {
        lock(&self.bins).get(bin).cloned()
    }
}

/// Executor answering from a table keyed by program path.
///
/// Unknown programs fail to spawn, like a missing binary would.
#[derive(Debug, Default)]
pub struct FakeExecutor {
    responses: Mutex<HashMap<PathBuf, ExecOutput>>,
    calls: Mutex<Vec<PathBuf>>,
    delay: Mutex<Option<Duration>>,
    finished: AtomicUsize,
}

impl FakeExecutor {
    pub fn respond(&self, program: impl AsRef<Path>, stdout: &str, exit_code: i32) {
        lock(&self.responses).insert(
            program.as_ref().to_path_buf(),
            ExecOutput {
                stdout: stdout.to_string(),
                stderr: String::new(),
                exit_code: Some(exit_code),
            },
        );
    }

    pub fn calls(&self) -> Vec<PathBuf> {
        lock(&self.calls).clone()
    }

    /// Make every call take `delay` before answering.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Calls that ran to completion, i.e. were not dropped midway.
    pub fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn exec(&self, req: &ExecRequest, signal: &AbortSignal) -> Result<ExecOutput, ExecError> {
        let program = req.program.display().to_string();
        if signal.is_aborted() {
            return Err(ExecError::Aborted { program });
        }
        lock(&self.calls).push(req.program.clone());
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = signal.aborted() => return Err(ExecError::Aborted { program }),
            }
        }
        self.finished.fetch_add(1, Ordering::SeqCst);
        lock(&self.responses)
            .get(&req.program)
            .cloned()
            .ok_or_else(|| ExecError::Spawn {
                program,
                source: io::Error::new(io::ErrorKind::NotFound, "no such program"),
            })
    }
}

/// Real temp directories under a private root, with a log of what was
/// created and pruned. Pruning can be made to fail.
#[derive(Debug)]
pub struct RecordingFileManager {
    inner: TempFileManager,
    _root: TempDir,
    created: Mutex<Vec<PathBuf>>,
    pruned: Mutex<Vec<PathBuf>>,
    fail_create: bool,
    fail_prune: bool,
}

impl RecordingFileManager {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap_or_else(|e| panic!("temp root: {}", e));
        Self {
            inner: TempFileManager::with_root(root.path()),
            _root: root,
            created: Mutex::new(Vec::new()),
            pruned: Mutex::new(Vec::new()),
            fail_create: false,
            fail_prune: false,
        }
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_prune(mut self) -> Self {
        self.fail_prune = true;
        self
    }

    pub fn created(&self) -> Vec<PathBuf> {
        lock(&self.created).clone()
    }

    pub fn pruned(&self) -> Vec<PathBuf> {
        lock(&self.pruned).clone()
    }
}

impl Default for RecordingFileManager {
    fn default() -> Self {
        Self::new()
    }
}

impl FileManager for RecordingFileManager {
    fn create_temp_dir(&self, prefix: &str) -> io::Result<PathBuf> {
        if self.fail_create {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
        }
        let dir = self.inner.create_temp_dir(prefix)?;
        lock(&self.created).push(dir.clone());
        Ok(dir)
    }

    fn prune_temp_dir(&self, path: &Path) -> io::Result<()> {
        lock(&self.pruned).push(path.to_path_buf());
        if self.fail_prune {
            return Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"));
        }
        self.inner.prune_temp_dir(path)
    }
}

/// Register `definition` under a `test` plugin and bind it to `version`.
pub fn envelope_for(definition: Arc<StubDefinition>, version: &str) -> PackageManagerEnvelope {
    let definition: Arc<dyn PackageManagerDefinition> = definition;
    let plugin = Arc::new(PluginMetadata::new("test"));
    let registry = ComponentRegistry::new();
    let id = registry
        .register(&definition, &plugin)
        .unwrap_or_else(|e| panic!("register: {}", e));
    let version = Version::parse(version).unwrap_or_else(|e| panic!("version: {}", e));
    let spec = PackageManagerSpec::new(definition.name(), version, definition.bin());
    PackageManagerEnvelope::new(id, definition, plugin, spec)
}

/// A context for `envelope` in a fresh temp root. Keep the returned
/// [`TempDir`] alive for as long as the context is used.
pub async fn test_context(envelope: &PackageManagerEnvelope) -> (ExecutionContext, TempDir) {
    let root = tempfile::tempdir().unwrap_or_else(|e| panic!("temp root: {}", e));
    let ctx = context::create(
        Arc::clone(&envelope.spec),
        Arc::new(FakeExecutor::default()),
        Arc::new(TempFileManager::with_root(root.path())),
        Vec::new(),
        ContextOptions::default(),
        &AbortSignal::never(),
    )
    .await
    .unwrap_or_else(|e| panic!("context: {}", e));
    (ctx, root)
}
