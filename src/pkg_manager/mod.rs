//! Package-manager resolution and lifecycle orchestration.
//!
//! A desired package manager (`npm@7`, `yarn`, `system`) is resolved against
//! the definitions supplied by plugins into a [`PackageManagerEnvelope`].
//! An orchestrator then drives that envelope through context creation,
//! setup, packing and installing workspaces, teardown and cleanup.

pub mod abort;
pub mod builtin;
pub mod context;
pub mod definition;
pub mod envelope;
pub mod executor;
pub mod fs;
pub mod hooks;
pub mod locator;
pub mod orchestrator;
pub mod plugin;
pub mod registry;
pub mod resolver;
pub mod service;
pub mod spec;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod version;
pub mod worker;

pub use abort::{AbortController, AbortSignal};
pub use context::{ContextOptions, ExecutionContext};
pub use definition::{InstallManifest, PackageManagerDefinition, ScriptResult};
pub use envelope::PackageManagerEnvelope;
pub use executor::{ExecOutput, ExecRequest, Executor, SystemExecutor};
pub use fs::{FileManager, TempFileManager};
pub use locator::{BinLocator, DefaultSystemTracker, WhichLocator};
pub use orchestrator::{
    BatchTicket, OrchestratorHandle, OrchestratorOptions, OrchestratorOutcome, OrchestratorPhase,
};
pub use plugin::{Plugin, PluginLoadError, PluginMetadata};
pub use registry::{ComponentId, ComponentRegistry};
pub use resolver::{ResolveOutput, ResolverState};
pub use service::PkgManagerService;
pub use spec::{PackageManagerSpec, PartialSpec, PkgVersion};
pub use worker::{BatchReport, OrchestratorEvent};
