//! Turns one desired package manager into at most one envelope.
//!
//! ```text
//! MatchingDefault ──► MatchingKnown ──► MatchingSystem ──► Done
//!        │                 │                                 ▲
//!        └─────────────────┴──────────(match)────────────────┘
//! any unexpected failure ──► Errored
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::abort::AbortSignal;
use super::definition::PackageManagerDefinition;
use super::envelope::PackageManagerEnvelope;
use super::executor::Executor;
use super::locator::{BinLocator, DefaultSystemTracker, SystemLocator};
use super::registry::ComponentRegistry;
use super::spec::{PackageManagerSpec, PartialSpec, PkgVersion};
use super::version::{accepts, normalize_version};
use crate::error::{MachineError, MachineFailure, UnsupportedPackageManagerError};
use crate::ui::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolverState {
    MatchingDefault,
    MatchingKnown,
    MatchingSystem,
    Done,
    Errored,
}

impl ResolverState {
    pub fn can_transition_to(self, next: ResolverState) -> bool {
        use ResolverState::*;
        matches!(
            (self, next),
            (MatchingDefault, MatchingKnown | MatchingSystem | Done | Errored)
                | (MatchingKnown, MatchingSystem | Done | Errored)
                | (MatchingSystem, Done | Errored)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ResolverState::Done | ResolverState::Errored)
    }
}

impl fmt::Display for ResolverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolverState::MatchingDefault => "matchingDefault",
            ResolverState::MatchingKnown => "matchingKnown",
            ResolverState::MatchingSystem => "matchingSystem",
            ResolverState::Done => "done",
            ResolverState::Errored => "errored",
        };
        write!(f, "{}", s)
    }
}

/// Result of resolving one desired package manager.
///
/// A missing envelope without an error means nothing matched; turning that
/// into [`UnsupportedPackageManagerError`] is up to the caller.
#[derive(Debug)]
pub struct ResolveOutput {
    pub desired: String,
    pub partial: Option<PartialSpec>,
    pub envelope: Option<PackageManagerEnvelope>,
    pub default_envelope: Option<PackageManagerEnvelope>,
    pub error: Option<MachineError>,
    pub state: ResolverState,
}

impl ResolveOutput {
    pub fn unsupported(&self) -> UnsupportedPackageManagerError {
        let (name, version) = match &self.partial {
            Some(p) => (p.name.clone(), p.version.as_concrete().map(str::to_string)),
            None => (None, None),
        };
        UnsupportedPackageManagerError {
            name,
            version,
            requested_as: self.desired.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolverSettings {
    pub version_query_timeout: Option<Duration>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            version_query_timeout: Some(Duration::from_secs(10)),
        }
    }
}

/// Aborts the matching task when the caller stops waiting for it, so no
/// `--version` query or default update outlives the resolution.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Everything a resolution needs, shared cheaply across tasks.
#[derive(Clone)]
pub struct SpecResolver {
    pub(crate) registry: Arc<ComponentRegistry>,
    pub(crate) candidates: Arc<[Arc<dyn PackageManagerDefinition>]>,
    pub(crate) bin_locator: Arc<dyn BinLocator>,
    pub(crate) executor: Arc<dyn Executor>,
    pub(crate) tracker: Arc<DefaultSystemTracker>,
    pub(crate) settings: ResolverSettings,
}

struct Run {
    machine_id: String,
    state: ResolverState,
}

impl Run {
    fn transition(&mut self, next: ResolverState) -> Result<(), MachineFailure> {
        if !self.state.can_transition_to(next) {
            return Err(MachineFailure::IllegalTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        debug(
            "pkg_manager.resolver.transition",
            &format!("{}: {} -> {}", self.machine_id, self.state, next),
        );
        self.state = next;
        Ok(())
    }
}

impl SpecResolver {
    pub fn new(
        registry: Arc<ComponentRegistry>,
        candidates: Vec<Arc<dyn PackageManagerDefinition>>,
        bin_locator: Arc<dyn BinLocator>,
        executor: Arc<dyn Executor>,
        tracker: Arc<DefaultSystemTracker>,
        settings: ResolverSettings,
    ) -> Self {
        Self {
            registry,
            candidates: candidates.into(),
            bin_locator,
            executor,
            tracker,
            settings,
        }
    }

    /// Resolve `desired`. Never fails outright: problems land in
    /// [`ResolveOutput::error`].
    pub async fn resolve(&self, desired: &str, signal: &AbortSignal) -> ResolveOutput {
        let machine_id = format!("resolver-{}", desired.trim());
        let mut output = ResolveOutput {
            desired: desired.to_string(),
            partial: None,
            envelope: None,
            default_envelope: self.tracker.get(),
            error: None,
            state: ResolverState::MatchingDefault,
        };

        let partial = match PartialSpec::parse(desired) {
            Ok(partial) => partial,
            Err(err) => {
                output.error = Some(MachineError::with_failure(
                    machine_id,
                    MachineFailure::Other(Box::new(err)),
                ));
                output.state = ResolverState::Errored;
                return output;
            }
        };
        output.partial = Some(partial.clone());

        // Run the matching phases in their own task so a misbehaving
        // definition cannot take the caller down with it.
        let this = self.clone();
        let signal = signal.clone();
        let task_id = machine_id.clone();
        let mut phases = AbortOnDrop(tokio::spawn(async move {
            this.run_phases(task_id, partial, signal).await
        }));
        let joined = (&mut phases.0).await;

        match joined {
            Ok(Ok((envelope, state))) => {
                output.envelope = envelope;
                output.state = state;
            }
            Ok(Err(failure)) => {
                output.error = Some(MachineError::with_failure(&machine_id, failure));
                output.state = ResolverState::Errored;
            }
            Err(join) => {
                output.error = Some(MachineError::with_failure(
                    &machine_id,
                    MachineFailure::Other(Box::new(join)),
                ));
                output.state = ResolverState::Errored;
            }
        }
        output.default_envelope = self.tracker.get();
        output
    }

    async fn run_phases(
        &self,
        machine_id: String,
        partial: PartialSpec,
        signal: AbortSignal,
    ) -> Result<(Option<PackageManagerEnvelope>, ResolverState), MachineFailure> {
        let mut run = Run {
            machine_id,
            state: ResolverState::MatchingDefault,
        };

        if let Some(default) = self.tracker.get() {
            if default_matches(&partial, &default) {
                run.transition(ResolverState::Done)?;
                return Ok((Some(default), run.state));
            }
        }

        if partial.is_well_formed() && self.is_static_binding(&partial) {
            run.transition(ResolverState::MatchingKnown)?;
            if let Some(envelope) = self.match_known(&partial) {
                run.transition(ResolverState::Done)?;
                return Ok((Some(envelope), run.state));
            }
        }

        run.transition(ResolverState::MatchingSystem)?;
        let locator = SystemLocator {
            registry: &self.registry,
            bin_locator: self.bin_locator.as_ref(),
            executor: self.executor.as_ref(),
            default_system_bin: self.tracker.default_system_bin(),
            query_timeout: self.settings.version_query_timeout,
        };
        let found = locator
            .locate(&partial, &self.candidates, self.tracker.get().as_ref(), &signal)
            .await;

        // The tracker re-checks under its write lock; another resolver may
        // have moved the default since the scan started.
        if let Some(candidate) = &found.default_envelope {
            self.tracker.offer(candidate);
        }

        run.transition(ResolverState::Done)?;
        Ok((found.envelope, run.state))
    }

    fn is_static_binding(&self, partial: &PartialSpec) -> bool {
        self.candidates
            .iter()
            .any(|def| partial.matches_name(def.name()) || partial.matches_name(def.bin()))
    }

    /// First candidate that accepts the requested version outright.
    fn match_known(&self, partial: &PartialSpec) -> Option<PackageManagerEnvelope> {
        let requested = partial.version.as_concrete()?;
        for definition in self.candidates.iter() {
            if !(partial.matches_name(definition.name()) || partial.matches_name(definition.bin())) {
                continue;
            }
            let Some(version) = accepts(definition.as_ref(), requested) else {
                continue;
            };
            let Some(entry) = self.registry.lookup(definition) else {
                debug(
                    "pkg_manager.resolver.unregistered",
                    &format!("{} accepted {} but is not registered", definition.name(), requested),
                );
                continue;
            };
            let spec = PackageManagerSpec::new(definition.name(), version, definition.bin())
                .with_requested_as(partial.requested_as.clone());
            return Some(PackageManagerEnvelope::new(
                entry.id,
                Arc::clone(definition),
                entry.plugin,
                spec,
            ));
        }
        None
    }
}

/// Does the known default satisfy `partial` without probing again?
fn default_matches(partial: &PartialSpec, default: &PackageManagerEnvelope) -> bool {
    let name_ok = partial.matches_name(default.spec.name())
        || partial.matches_name(default.definition.bin());
    if !name_ok {
        return false;
    }
    match &partial.version {
        PkgVersion::System => true,
        PkgVersion::Concrete(requested) => {
            normalize_version(default.definition.known_versions(), requested).as_ref()
                == Some(default.spec.version())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg_manager::plugin::{Plugin, PluginMetadata, load_plugins};
    use crate::pkg_manager::testing::{FakeBinLocator, FakeExecutor, StubDefinition};
    use std::path::PathBuf;

    struct Fixture {
        resolver: SpecResolver,
        bins: Arc<FakeBinLocator>,
        exec: Arc<FakeExecutor>,
    }

    fn fixture(defs: Vec<StubDefinition>) -> Fixture {
        let mut plugin = Plugin::new(PluginMetadata::new("test"));
        for def in defs {
            plugin = plugin.with_definition(Arc::new(def));
        }
        let registry = Arc::new(ComponentRegistry::new());
        load_plugins(std::slice::from_ref(&plugin), &registry).unwrap();
        let bins = Arc::new(FakeBinLocator::default());
        let exec = Arc::new(FakeExecutor::default());
        let resolver = SpecResolver::new(
            registry,
            plugin.definitions,
            bins.clone(),
            exec.clone(),
            Arc::new(DefaultSystemTracker::new("npm")),
            ResolverSettings::default(),
        );
        Fixture { resolver, bins, exec }
    }

    fn install(fx: &Fixture, bin: &str, version: &str) {
        let path = PathBuf::from(format!("/usr/bin/{}", bin));
        fx.bins.add(bin, &path);
        fx.exec.respond(&path, version, 0);
    }

    #[test]
    fn test_transition_table() {
        use ResolverState::*;
        assert!(MatchingDefault.can_transition_to(MatchingKnown));
        assert!(MatchingKnown.can_transition_to(MatchingSystem));
        assert!(MatchingSystem.can_transition_to(Done));
        assert!(!MatchingSystem.can_transition_to(MatchingKnown));
        assert!(!Done.can_transition_to(MatchingDefault));
        assert!(!Errored.can_transition_to(Done));
        assert!(Done.is_terminal());
    }

    #[tokio::test]
    async fn test_known_match_without_subprocess() {
        let fx = fixture(vec![
            StubDefinition::new("npm7", "npm", "^7.0.0 || ^8.0.0").with_known(&["7.24.0"]),
        ]);
        let out = fx.resolver.resolve("npm@7.24.0", &AbortSignal::never()).await;
        assert_eq!(out.state, ResolverState::Done);
        let envelope = out.envelope.unwrap();
        assert_eq!(envelope.spec.name(), "npm7");
        assert_eq!(envelope.spec.version().to_string(), "7.24.0");
        assert!(!envelope.spec.is_system());
        assert!(fx.exec.calls().is_empty());
    }

    #[tokio::test]
    async fn test_known_miss_falls_through_to_system() {
        let fx = fixture(vec![StubDefinition::new("npm", "npm", "^9.0.0")]);
        install(&fx, "npm", "9.8.1");
        let out = fx.resolver.resolve("npm@9.8.1", &AbortSignal::never()).await;
        // Exact semver is accepted directly by the known matcher
        assert!(!out.envelope.unwrap().spec.is_system());

        let out = fx.resolver.resolve("npm@latest", &AbortSignal::never()).await;
        assert!(out.envelope.is_none());
        assert_eq!(fx.exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_name_has_no_envelope() {
        let fx = fixture(vec![StubDefinition::new("npm", "npm", "*")]);
        install(&fx, "npm", "9.8.1");
        let out = fx.resolver.resolve("pnpm@10", &AbortSignal::never()).await;
        assert!(out.envelope.is_none());
        assert!(out.error.is_none());

        let err = out.unsupported();
        assert_eq!(err.name.as_deref(), Some("pnpm"));
        assert_eq!(err.version.as_deref(), Some("10"));
    }

    #[tokio::test]
    async fn test_default_short_circuits_second_probe() {
        let fx = fixture(vec![StubDefinition::new("npm", "npm", "*")]);
        install(&fx, "npm", "9.8.1");

        let first = fx.resolver.resolve("system", &AbortSignal::never()).await;
        assert!(first.envelope.is_some());
        assert_eq!(first.default_envelope.unwrap().spec.name(), "npm");

        let second = fx.resolver.resolve("npm", &AbortSignal::never()).await;
        assert_eq!(second.envelope.unwrap().spec.name(), "npm");
        assert_eq!(fx.exec.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_request_errors() {
        let fx = fixture(vec![]);
        let out = fx.resolver.resolve("  ", &AbortSignal::never()).await;
        assert_eq!(out.state, ResolverState::Errored);
        assert_eq!(out.error.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic() {
        let fx = fixture(vec![
            StubDefinition::new("npm-a", "npm", "*").with_known(&["9.8.1"]),
            StubDefinition::new("npm-b", "npm", "*").with_known(&["9.8.1"]),
        ]);
        for _ in 0..5 {
            let out = fx.resolver.resolve("npm@9", &AbortSignal::never()).await;
            assert_eq!(out.envelope.unwrap().spec.name(), "npm-a");
        }
    }

    #[tokio::test]
    async fn test_dropped_resolution_stops_scanning() {
        let fx = fixture(vec![StubDefinition::new("npm", "npm", "*")]);
        install(&fx, "npm", "9.8.1");
        fx.exec.set_delay(Duration::from_millis(300));

        let timed_out = tokio::time::timeout(
            Duration::from_millis(50),
            fx.resolver.resolve("system", &AbortSignal::never()),
        )
        .await;
        assert!(timed_out.is_err());

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(fx.exec.calls().len() <= 1);
        assert_eq!(fx.exec.finished(), 0);
        assert!(fx.resolver.tracker.get().is_none());
    }

}
