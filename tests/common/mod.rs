#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use smoker::pkg_manager::testing::{FakeBinLocator, FakeExecutor, StubDefinition};
use smoker::pkg_manager::{
    OrchestratorHandle, OrchestratorPhase, PkgManagerService, Plugin, PluginMetadata,
};
use smoker::workspace::WorkspaceInfo;

/// A service wired to fakes instead of `PATH` and real subprocesses.
pub struct TestEnvironment {
    pub service: PkgManagerService,
    pub bins: Arc<FakeBinLocator>,
    pub exec: Arc<FakeExecutor>,
}

impl TestEnvironment {
    /// One `test` plugin providing `definitions` in order.
    pub fn new(definitions: Vec<Arc<StubDefinition>>) -> Self {
        let mut plugin = Plugin::new(PluginMetadata::new("test"));
        for definition in definitions {
            plugin = plugin.with_definition(definition);
        }
        Self::with_plugins(vec![plugin])
    }

    pub fn with_plugins(plugins: Vec<Plugin>) -> Self {
        let bins = Arc::new(FakeBinLocator::default());
        let exec = Arc::new(FakeExecutor::default());
        let service = PkgManagerService::builder(plugins)
            .bin_locator(bins.clone())
            .executor(exec.clone())
            .build()
            .expect("plugins should load");
        Self { service, bins, exec }
    }

    /// Put `bin` on the fake `PATH`, reporting `version` for `--version`.
    pub fn install(&self, bin: &str, version: &str) -> String {
        let path = format!("/usr/local/bin/{}", bin);
        self.bins.add(bin, &path);
        self.exec.respond(&path, version, 0);
        path
    }
}

pub fn stub(name: &str, bin: &str, range: &str) -> Arc<StubDefinition> {
    Arc::new(StubDefinition::new(name, bin, range))
}

pub fn known(name: &str, bin: &str, range: &str, versions: &[&str]) -> Arc<StubDefinition> {
    Arc::new(StubDefinition::new(name, bin, range).with_known(versions))
}

pub fn workspace(name: &str) -> WorkspaceInfo {
    WorkspaceInfo::new(name, format!("/work/{}", name))
}

/// Poll until the orchestrator reports `phase`, failing after a few seconds.
pub async fn wait_for_phase(handle: &OrchestratorHandle, phase: fn(OrchestratorPhase) -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !phase(handle.state()) {
        assert!(
            tokio::time::Instant::now() < deadline,
            "orchestrator stuck in {}",
            handle.state()
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
