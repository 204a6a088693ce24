//! Entry point tying plugins, resolution and orchestration together.

use std::sync::Arc;
use std::time::Duration;

use super::abort::AbortSignal;
use super::definition::PackageManagerDefinition;
use super::envelope::PackageManagerEnvelope;
use super::executor::{Executor, SystemExecutor};
use super::fs::FileManager;
use super::locator::{BinLocator, DefaultSystemTracker, WhichLocator};
use super::orchestrator::{self, OrchestratorHandle, OrchestratorOptions};
use super::plugin::{Plugin, PluginLoadError, load_plugins};
use super::registry::ComponentRegistry;
use super::resolver::{ResolveOutput, ResolverSettings, SpecResolver};
use super::spec::SYSTEM;
use crate::error::ResolveError;
use crate::ui::debug;

pub const DEFAULT_SYSTEM_BIN: &str = "npm";

pub struct PkgManagerServiceBuilder {
    plugins: Vec<Plugin>,
    bin_locator: Arc<dyn BinLocator>,
    executor: Arc<dyn Executor>,
    default_system_bin: String,
    settings: ResolverSettings,
}

impl PkgManagerServiceBuilder {
    pub fn bin_locator(mut self, bin_locator: Arc<dyn BinLocator>) -> Self {
        self.bin_locator = bin_locator;
        self
    }

    pub fn executor(mut self, executor: Arc<dyn Executor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn default_system_bin(mut self, bin: impl Into<String>) -> Self {
        self.default_system_bin = bin.into();
        self
    }

    pub fn version_query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.settings.version_query_timeout = timeout;
        self
    }

    /// Load every plugin into a fresh registry.
    ///
    /// Fails on the first invalid definition or collision, before anything
    /// can be resolved.
    pub fn build(self) -> Result<PkgManagerService, PluginLoadError> {
        let registry = Arc::new(ComponentRegistry::new());
        load_plugins(&self.plugins, &registry)?;

        let candidates: Vec<Arc<dyn PackageManagerDefinition>> = self
            .plugins
            .iter()
            .flat_map(|plugin| plugin.definitions.iter().cloned())
            .collect();
        debug(
            "pkg_manager.service.loaded",
            &format!(
                "Loaded {} package manager definition(s) from {} plugin(s)",
                candidates.len(),
                self.plugins.len()
            ),
        );

        let tracker = Arc::new(DefaultSystemTracker::new(self.default_system_bin));
        Ok(PkgManagerService {
            resolver: SpecResolver::new(
                registry,
                candidates,
                self.bin_locator,
                Arc::clone(&self.executor),
                tracker,
                self.settings,
            ),
            executor: self.executor,
        })
    }
}

/// Resolves desired package managers and spawns orchestrators for them.
pub struct PkgManagerService {
    resolver: SpecResolver,
    executor: Arc<dyn Executor>,
}

impl PkgManagerService {
    pub fn builder(plugins: Vec<Plugin>) -> PkgManagerServiceBuilder {
        PkgManagerServiceBuilder {
            plugins,
            bin_locator: Arc::new(WhichLocator),
            executor: Arc::new(SystemExecutor),
            default_system_bin: DEFAULT_SYSTEM_BIN.to_string(),
            settings: ResolverSettings::default(),
        }
    }

    pub fn registry(&self) -> &ComponentRegistry {
        &self.resolver.registry
    }

    pub fn executor(&self) -> Arc<dyn Executor> {
        Arc::clone(&self.executor)
    }

    /// The default system package manager found so far, if any.
    pub fn default_system(&self) -> Option<PackageManagerEnvelope> {
        self.resolver.tracker.get()
    }

    pub async fn resolve_one(&self, desired: &str, signal: &AbortSignal) -> ResolveOutput {
        self.resolver.resolve(desired, signal).await
    }

    /// Resolve every desired package manager, `system` when none are given.
    ///
    /// Unresolvable requests do not stop the others; they are collected into
    /// one [`ResolveError`]. Requests resolving to the same `{name, version}`
    /// yield a single envelope.
    pub async fn resolve_all(
        &self,
        desired: &[String],
        signal: &AbortSignal,
    ) -> Result<Vec<PackageManagerEnvelope>, ResolveError> {
        let system = [SYSTEM.to_string()];
        let desired = if desired.is_empty() { &system[..] } else { desired };

        let mut envelopes: Vec<PackageManagerEnvelope> = Vec::new();
        let mut errors = ResolveError::default();

        for request in desired {
            let output = self.resolve_one(request, signal).await;
            if let Some(error) = output.error {
                errors.failed.push(error);
                continue;
            }
            match output.envelope {
                Some(envelope) => {
                    if envelopes.iter().any(|e| e.same_identity(&envelope)) {
                        debug(
                            "pkg_manager.service.duplicate",
                            &format!("{} already resolved, skipping", envelope.spec.label()),
                        );
                    } else {
                        envelopes.push(envelope);
                    }
                }
                None => errors.unsupported.push(output.unsupported()),
            }
        }

        if errors.is_empty() {
            Ok(envelopes)
        } else {
            Err(errors)
        }
    }

    /// Spawn an orchestrator for `envelope`, using this service's executor.
    pub fn create_orchestrator(
        &self,
        envelope: PackageManagerEnvelope,
        file_manager: Arc<dyn FileManager>,
        options: OrchestratorOptions,
    ) -> OrchestratorHandle {
        orchestrator::spawn(envelope, self.executor(), file_manager, options)
    }
}
