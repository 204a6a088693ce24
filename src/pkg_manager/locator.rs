//! Discovery of package managers installed on `PATH`.

use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use super::abort::AbortSignal;
use super::definition::PackageManagerDefinition;
use super::envelope::PackageManagerEnvelope;
use super::executor::{ExecRequest, Executor};
use super::registry::ComponentRegistry;
use super::spec::{PackageManagerSpec, PartialSpec, PkgVersion};
use super::version::{accepts, extract_reported_version, normalize_version};
use crate::ui::debug;

/// Finds executables by name.
pub trait BinLocator: Send + Sync {
    fn locate(&self, bin: &str) -> Option<PathBuf>;
}

/// [`BinLocator`] backed by `which`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WhichLocator;

impl BinLocator for WhichLocator {
    fn locate(&self, bin: &str) -> Option<PathBuf> {
        match which::which(bin) {
            Ok(path) => Some(path),
            Err(err) => {
                debug(
                    "pkg_manager.locator.which",
                    &format!("{} not on PATH: {}", bin, err),
                );
                None
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LocatorResult {
    /// The default system package manager after this scan.
    pub default_envelope: Option<PackageManagerEnvelope>,
    pub envelope: Option<PackageManagerEnvelope>,
}

/// Whether `candidate` should replace `current` as the default system
/// package manager.
pub fn should_replace_default(
    current: Option<&PackageManagerEnvelope>,
    candidate: &PackageManagerEnvelope,
    default_system_bin: &str,
) -> bool {
    let default_named = |env: &PackageManagerEnvelope| {
        env.spec.name() == default_system_bin || env.definition.bin() == default_system_bin
    };
    match current {
        None => true,
        Some(current) => default_named(candidate) && !default_named(current),
    }
}

/// Process-wide "default system package manager".
///
/// Many readers, one writer at a time; replacement follows
/// [`should_replace_default`].
#[derive(Debug)]
pub struct DefaultSystemTracker {
    default_system_bin: String,
    current: RwLock<Option<PackageManagerEnvelope>>,
}

impl DefaultSystemTracker {
    pub fn new(default_system_bin: impl Into<String>) -> Self {
        Self {
            default_system_bin: default_system_bin.into(),
            current: RwLock::new(None),
        }
    }

    pub fn default_system_bin(&self) -> &str {
        &self.default_system_bin
    }

    pub fn get(&self) -> Option<PackageManagerEnvelope> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Offer a newly discovered system envelope. Returns true if it became
    /// the default.
    pub fn offer(&self, candidate: &PackageManagerEnvelope) -> bool {
        let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
        if should_replace_default(current.as_ref(), candidate, &self.default_system_bin) {
            debug(
                "pkg_manager.locator.default",
                &format!("Default system package manager is now {}", candidate.spec),
            );
            *current = Some(candidate.clone());
            true
        } else {
            false
        }
    }
}

/// Scans candidate definitions for one installed on `PATH`.
pub struct SystemLocator<'a> {
    pub registry: &'a ComponentRegistry,
    pub bin_locator: &'a dyn BinLocator,
    pub executor: &'a dyn Executor,
    pub default_system_bin: &'a str,
    pub query_timeout: Option<Duration>,
}

impl SystemLocator<'_> {
    /// Walk `candidates` in order and bind the first acceptable one.
    ///
    /// Every per-candidate problem just skips that candidate; an empty
    /// result means nothing on `PATH` fits.
    pub async fn locate(
        &self,
        spec: &PartialSpec,
        candidates: &[Arc<dyn PackageManagerDefinition>],
        previous_default: Option<&PackageManagerEnvelope>,
        signal: &AbortSignal,
    ) -> LocatorResult {
        let mut result = LocatorResult {
            default_envelope: previous_default.cloned(),
            envelope: None,
        };

        let matching = candidates
            .iter()
            .filter(|def| spec.matches_name(def.bin()) || spec.matches_name(def.name()));

        for definition in matching {
            if signal.is_aborted() {
                debug("pkg_manager.locator.abort", "Scan aborted");
                break;
            }

            let Some(envelope) = self.try_candidate(spec, definition, signal).await else {
                continue;
            };

            if should_replace_default(
                result.default_envelope.as_ref(),
                &envelope,
                self.default_system_bin,
            ) {
                result.default_envelope = Some(envelope.clone());
            }
            result.envelope = Some(envelope);
            break;
        }

        result
    }

    async fn try_candidate(
        &self,
        spec: &PartialSpec,
        definition: &Arc<dyn PackageManagerDefinition>,
        signal: &AbortSignal,
    ) -> Option<PackageManagerEnvelope> {
        let skip = |why: String| {
            debug(
                "pkg_manager.locator.skip",
                &format!("Skipping {}: {}", definition.name(), why),
            );
        };

        let path = self.bin_locator.locate(definition.bin())?;

        let mut req = ExecRequest::new(&path).arg("--version");
        if let Some(timeout) = self.query_timeout {
            req = req.timeout(timeout);
        }
        let output = match self.executor.exec(&req, signal).await {
            Ok(output) => output,
            Err(err) => {
                skip(err.to_string());
                return None;
            }
        };
        if !output.success() {
            skip(format!(
                "{} --version exited with {:?}",
                path.display(),
                output.exit_code
            ));
            return None;
        }

        let reported = extract_reported_version(&output.stdout)
            .unwrap_or_else(|| output.stdout.trim().to_string());
        let Some(accepted) = accepts(definition.as_ref(), &reported) else {
            skip(format!("reported version {:?} not accepted", reported));
            return None;
        };

        if let PkgVersion::Concrete(requested) = &spec.version {
            let normalized = normalize_version(definition.known_versions(), requested);
            if normalized.as_ref() != Some(&accepted) {
                skip(format!(
                    "found {} but {} was requested",
                    accepted, requested
                ));
                return None;
            }
        }

        let Some(entry) = self.registry.lookup(definition) else {
            skip("definition is not registered".to_string());
            return None;
        };

        let pm_spec = PackageManagerSpec::new(definition.name(), accepted, &path)
            .with_requested_as(spec.requested_as.clone())
            .with_system(true);

        debug(
            "pkg_manager.locator.found",
            &format!("Found {} at {}", pm_spec.label(), path.display()),
        );

        Some(PackageManagerEnvelope::new(
            entry.id,
            Arc::clone(definition),
            entry.plugin,
            pm_spec,
        ))
    }
}
