//! Execution context lifecycle: one temp directory per orchestrator run.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::abort::AbortSignal;
use super::executor::Executor;
use super::fs::FileManager;
use super::spec::PackageManagerSpec;
use crate::error::ContextError;
use crate::ui::prelude::*;
use crate::workspace::WorkspaceInfo;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextOptions {
    /// Keep the temp directory after the run.
    pub linger: bool,
    pub loose: bool,
    pub verbose: bool,
}

/// Immutable state handed to hooks and workers for one orchestrator run.
#[derive(Clone)]
pub struct ExecutionContext {
    executor: Arc<dyn Executor>,
    tmpdir: PathBuf,
    workspaces: Vec<WorkspaceInfo>,
    spec: Arc<PackageManagerSpec>,
    options: ContextOptions,
}

impl ExecutionContext {
    pub fn executor(&self) -> &dyn Executor {
        self.executor.as_ref()
    }

    pub fn tmpdir(&self) -> &Path {
        &self.tmpdir
    }

    pub fn workspaces(&self) -> &[WorkspaceInfo] {
        &self.workspaces
    }

    pub fn spec(&self) -> &PackageManagerSpec {
        &self.spec
    }

    pub fn linger(&self) -> bool {
        self.options.linger
    }

    pub fn loose(&self) -> bool {
        self.options.loose
    }

    pub fn verbose(&self) -> bool {
        self.options.verbose
    }

    /// Same directory and spec, different workspace batch.
    pub fn with_workspaces(&self, workspaces: Vec<WorkspaceInfo>) -> Self {
        Self {
            workspaces,
            ..self.clone()
        }
    }
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("spec", &self.spec.label())
            .field("tmpdir", &self.tmpdir)
            .field("workspaces", &self.workspaces.len())
            .field("options", &self.options)
            .finish()
    }
}

/// `<name>-<version>-`, with anything path-hostile replaced.
fn tmpdir_prefix(spec: &PackageManagerSpec) -> String {
    let raw = format!("{}-{}-", spec.name(), spec.version());
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Allocate the temp directory and assemble the context.
///
/// If `signal` fires while the directory is being created, the directory is
/// removed again before returning [`ContextError::Aborted`]. A directory that
/// cannot be removed then is reported as [`ContextError::Remove`] instead.
pub async fn create(
    spec: Arc<PackageManagerSpec>,
    executor: Arc<dyn Executor>,
    file_manager: Arc<dyn FileManager>,
    workspaces: Vec<WorkspaceInfo>,
    options: ContextOptions,
    signal: &AbortSignal,
) -> Result<ExecutionContext, ContextError> {
    if signal.is_aborted() {
        return Err(ContextError::Aborted);
    }

    let prefix = tmpdir_prefix(&spec);
    let fm = Arc::clone(&file_manager);
    let alloc_prefix = prefix.clone();
    let tmpdir = tokio::task::spawn_blocking(move || fm.create_temp_dir(&alloc_prefix))
        .await?
        .map_err(|source| ContextError::Allocate { prefix, source })?;

    if signal.is_aborted() {
        let fm = Arc::clone(&file_manager);
        let prune_path = tmpdir.clone();
        tokio::task::spawn_blocking(move || fm.prune_temp_dir(&prune_path))
            .await?
            .map_err(|source| ContextError::Remove {
                path: tmpdir.clone(),
                source,
            })?;
        return Err(ContextError::Aborted);
    }

    debug(
        "pkg_manager.context.create",
        &format!("Created {} for {}", tmpdir.display(), spec.label()),
    );

    Ok(ExecutionContext {
        executor,
        tmpdir,
        workspaces,
        spec,
        options,
    })
}

/// Remove the context's temp directory unless it lingers.
///
/// Returns the lingering path when the directory was kept.
pub async fn destroy(
    ctx: &ExecutionContext,
    file_manager: Arc<dyn FileManager>,
) -> Result<Option<PathBuf>, ContextError> {
    if ctx.linger() {
        emit(
            Level::Info,
            "pkg_manager.context.linger",
            &format!(
                "Leaving temp directory for {} at {}",
                ctx.spec().label(),
                ctx.tmpdir().display()
            ),
            Some(serde_json::json!({ "path": ctx.tmpdir() })),
        );
        return Ok(Some(ctx.tmpdir().to_path_buf()));
    }

    let path = ctx.tmpdir().to_path_buf();
    let prune_path = path.clone();
    tokio::task::spawn_blocking(move || file_manager.prune_temp_dir(&prune_path))
        .await?
        .map_err(|source| ContextError::Remove {
            path: path.clone(),
            source,
        })?;

    debug(
        "pkg_manager.context.destroy",
        &format!("Removed {}", path.display()),
    );
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg_manager::abort::AbortController;
    use crate::pkg_manager::fs::TempFileManager;
    use crate::pkg_manager::testing::{FakeExecutor, RecordingFileManager};
    use semver::Version;

    fn spec() -> Arc<PackageManagerSpec> {
        Arc::new(PackageManagerSpec::new("npm", Version::new(9, 8, 1), "npm"))
    }

    #[tokio::test]
    async fn test_create_then_destroy() {
        let root = tempfile::tempdir().unwrap();
        let fm: Arc<dyn FileManager> = Arc::new(TempFileManager::with_root(root.path()));
        let ws = vec![WorkspaceInfo::new("widget", "/src/widget")];

        let ctx = create(
            spec(),
            Arc::new(FakeExecutor::default()),
            Arc::clone(&fm),
            ws,
            ContextOptions::default(),
            &AbortSignal::never(),
        )
        .await
        .unwrap();

        assert!(ctx.tmpdir().is_dir());
        let dir_name = ctx.tmpdir().file_name().unwrap().to_string_lossy().to_string();
        assert!(dir_name.starts_with("npm-9.8.1-"));
        assert_eq!(ctx.workspaces().len(), 1);
        assert_eq!(ctx.spec().name(), "npm");

        let lingering = destroy(&ctx, Arc::clone(&fm)).await.unwrap();
        assert!(lingering.is_none());
        assert!(!ctx.tmpdir().exists());

        // Already gone: still fine.
        destroy(&ctx, fm).await.unwrap();
    }

    #[tokio::test]
    async fn test_linger_keeps_directory() {
        let root = tempfile::tempdir().unwrap();
        let fm: Arc<dyn FileManager> = Arc::new(TempFileManager::with_root(root.path()));
        let ctx = create(
            spec(),
            Arc::new(FakeExecutor::default()),
            Arc::clone(&fm),
            Vec::new(),
            ContextOptions {
                linger: true,
                ..Default::default()
            },
            &AbortSignal::never(),
        )
        .await
        .unwrap();

        let lingering = destroy(&ctx, fm).await.unwrap();
        assert_eq!(lingering.as_deref(), Some(ctx.tmpdir()));
        assert!(ctx.tmpdir().is_dir());
    }

    #[tokio::test]
    async fn test_create_aborted_before_allocation() {
        let fm = Arc::new(RecordingFileManager::new());
        let controller = AbortController::new();
        controller.abort();

        let err = create(
            spec(),
            Arc::new(FakeExecutor::default()),
            fm.clone(),
            Vec::new(),
            ContextOptions::default(),
            &controller.signal(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ContextError::Aborted));
        assert_eq!(fm.created().len(), 0);
    }

    /// Fires `controller` while the directory is being allocated.
    struct AbortingFileManager {
        inner: RecordingFileManager,
        controller: AbortController,
    }

    impl FileManager for AbortingFileManager {
        fn create_temp_dir(&self, prefix: &str) -> std::io::Result<PathBuf> {
            let dir = self.inner.create_temp_dir(prefix)?;
            self.controller.abort();
            Ok(dir)
        }

        fn prune_temp_dir(&self, path: &Path) -> std::io::Result<()> {
            self.inner.prune_temp_dir(path)
        }
    }

    async fn create_with(fm: &Arc<AbortingFileManager>) -> Result<ExecutionContext, ContextError> {
        let fm_dyn: Arc<dyn FileManager> = fm.clone();
        create(
            spec(),
            Arc::new(FakeExecutor::default()),
            fm_dyn,
            Vec::new(),
            ContextOptions::default(),
            &fm.controller.signal(),
        )
        .await
    }

    #[tokio::test]
    async fn test_abort_during_allocation_removes_directory() {
        let fm = Arc::new(AbortingFileManager {
            inner: RecordingFileManager::new(),
            controller: AbortController::new(),
        });

        let err = create_with(&fm).await.unwrap_err();
        assert!(matches!(err, ContextError::Aborted));

        let created = fm.inner.created();
        assert_eq!(created.len(), 1);
        assert_eq!(fm.inner.pruned(), created);
        assert!(!created[0].exists());
    }

    #[tokio::test]
    async fn test_abort_during_allocation_reports_unremovable_directory() {
        let fm = Arc::new(AbortingFileManager {
            inner: RecordingFileManager::new().failing_prune(),
            controller: AbortController::new(),
        });

        let err = create_with(&fm).await.unwrap_err();
        let created = fm.inner.created();
        match err {
            ContextError::Remove { path, .. } => assert_eq!(path, created[0]),
            other => panic!("expected a remove error, got {:?}", other),
        }
        assert!(created[0].exists());
    }

    #[test]
    fn test_prefix_sanitized_for_scoped_names() {
        let spec = PackageManagerSpec::new("@yarnpkg/cli", Version::new(3, 6, 0), "yarn");
        assert_eq!(tmpdir_prefix(&spec), "_yarnpkg_cli-3.6.0-");
    }

    #[test]
    fn test_with_workspaces_keeps_tmpdir() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let fm = Arc::new(RecordingFileManager::new());
        let ctx = rt
            .block_on(create(
                spec(),
                Arc::new(FakeExecutor::default()),
                fm,
                Vec::new(),
                ContextOptions::default(),
                &AbortSignal::never(),
            ))
            .unwrap();
        let next = ctx.with_workspaces(vec![WorkspaceInfo::new("a", "/a")]);
        assert_eq!(next.tmpdir(), ctx.tmpdir());
        assert_eq!(next.workspaces().len(), 1);
    }
}
