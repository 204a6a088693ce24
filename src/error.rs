use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Boxed cause carried by lifecycle and machine failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid package manager request {input:?}: {reason}")]
pub struct InvalidDesiredPackageManager {
    pub input: String,
    pub reason: &'static str,
}

/// No loaded definition accepted a requested name/version.
///
/// Raised by callers of the resolver; the resolver itself reports "no
/// envelope" as data.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("No package manager found matching {requested_as:?} (name: {}, version: {})",
    .name.as_deref().unwrap_or("any"),
    .version.as_deref().unwrap_or("system"))]
pub struct UnsupportedPackageManagerError {
    pub name: Option<String>,
    pub version: Option<String>,
    pub requested_as: String,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Component {name:?} registered twice by plugin {plugin_id:?}")]
pub struct ComponentCollisionError {
    pub plugin_id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleStage {
    Setup,
    Teardown,
}

impl fmt::Display for LifecycleStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleStage::Setup => write!(f, "setup"),
            LifecycleStage::Teardown => write!(f, "teardown"),
        }
    }
}

/// A setup/teardown step failed for a package manager.
#[derive(Error, Debug)]
#[error("{stage} failed for package manager {name} (plugin {plugin_id}): {source}")]
pub struct LifecycleError {
    pub stage: LifecycleStage,
    pub name: String,
    pub plugin_id: String,
    #[source]
    pub source: BoxError,
}

impl LifecycleError {
    /// Component kind, always a package manager for this crate.
    pub const COMPONENT: &'static str = "pkg-manager";

    pub fn new(
        stage: LifecycleStage,
        name: impl Into<String>,
        plugin_id: impl Into<String>,
        source: impl Into<BoxError>,
    ) -> Self {
        Self {
            stage,
            name: name.into(),
            plugin_id: plugin_id.into(),
            source: source.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum ContextError {
    #[error("Context creation aborted")]
    Aborted,

    #[error("Failed to allocate temp directory {prefix}*: {source}")]
    Allocate {
        prefix: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove temp directory {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Temp directory task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was aborted")]
    Aborted { program: String },

    #[error("{program} timed out after {after:?}")]
    TimedOut { program: String, after: Duration },
}

/// One entry in a [`MachineError`].
#[derive(Error, Debug)]
pub enum MachineFailure {
    #[error(transparent)]
    Lifecycle(#[from] LifecycleError),

    #[error("No workspaces received within {after:?}")]
    IdleTimeout { after: Duration },

    #[error("Illegal transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error(transparent)]
    Other(BoxError),
}

/// Aggregate error owned by a state machine; failures only accumulate.
#[derive(Debug)]
pub struct MachineError {
    pub machine_id: String,
    pub errors: Vec<MachineFailure>,
}

impl MachineError {
    pub fn new(machine_id: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            errors: Vec::new(),
        }
    }

    pub fn with_failure(machine_id: impl Into<String>, failure: impl Into<MachineFailure>) -> Self {
        let mut err = Self::new(machine_id);
        err.push(failure);
        err
    }

    pub fn push(&mut self, failure: impl Into<MachineFailure>) {
        self.errors.push(failure.into());
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn lifecycle_errors(&self) -> impl Iterator<Item = &LifecycleError> {
        self.errors.iter().filter_map(|e| match e {
            MachineFailure::Lifecycle(err) => Some(err),
            _ => None,
        })
    }
}

impl fmt::Display for MachineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed with {} error{}",
            self.machine_id,
            self.errors.len(),
            if self.errors.len() == 1 { "" } else { "s" }
        )?;
        for err in &self.errors {
            write!(f, "\n  - {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MachineError {}

/// Aggregate returned when resolving a list of desired package managers.
#[derive(Debug, Default)]
pub struct ResolveError {
    pub unsupported: Vec<UnsupportedPackageManagerError>,
    pub failed: Vec<MachineError>,
}

impl ResolveError {
    pub fn is_empty(&self) -> bool {
        self.unsupported.is_empty() && self.failed.is_empty()
    }

    /// True when every problem is an unsupported request, i.e. nothing blew up
    /// but no matching package manager was found.
    pub fn is_all_unsupported(&self) -> bool {
        !self.unsupported.is_empty() && self.failed.is_empty()
    }
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all_unsupported() {
            write!(f, "No matching package manager found")?;
        } else {
            write!(f, "Package manager resolution failed")?;
        }
        for err in &self.unsupported {
            write!(f, "\n  - {}", err)?;
        }
        for err in &self.failed {
            write!(f, "\n  - {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for ResolveError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_error_accumulates() {
        let mut err = MachineError::new("orchestrator-npm@9.0.0");
        err.push(LifecycleError::new(
            LifecycleStage::Setup,
            "npm@9.0.0",
            "builtin",
            "disk full",
        ));
        err.push(LifecycleError::new(
            LifecycleStage::Teardown,
            "npm@9.0.0",
            "builtin",
            "still full",
        ));

        assert_eq!(err.len(), 2);
        let stages: Vec<_> = err.lifecycle_errors().map(|e| e.stage).collect();
        assert_eq!(stages, vec![LifecycleStage::Setup, LifecycleStage::Teardown]);

        let rendered = err.to_string();
        assert!(rendered.contains("2 errors"));
        assert!(rendered.contains("disk full"));
        assert!(rendered.contains("still full"));
    }

    #[test]
    fn test_unsupported_display() {
        let err = UnsupportedPackageManagerError {
            name: Some("pnpm".to_string()),
            version: Some("10".to_string()),
            requested_as: "pnpm@10".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("pnpm@10"));
        assert!(msg.contains("name: pnpm"));
        assert!(msg.contains("version: 10"));
    }

    #[test]
    fn test_resolve_error_all_unsupported() {
        let mut err = ResolveError::default();
        assert!(!err.is_all_unsupported());
        err.unsupported.push(UnsupportedPackageManagerError {
            name: None,
            version: None,
            requested_as: "system".to_string(),
        });
        assert!(err.is_all_unsupported());
        assert!(err.to_string().starts_with("No matching package manager found"));

        err.failed.push(MachineError::new("resolver"));
        assert!(!err.is_all_unsupported());
    }
}
