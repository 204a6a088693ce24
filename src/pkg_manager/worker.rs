//! Packing and installing workers supervised by an orchestrator.
//!
//! Packing walks the batch in order and hands each [`InstallManifest`] to
//! the installing worker over a channel, so installs start while later
//! workspaces are still being packed.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;

use super::abort::AbortSignal;
use super::context::ExecutionContext;
use super::definition::{InstallManifest, InstallRequest, PackRequest, RunScriptRequest, ScriptResult};
use super::envelope::PackageManagerEnvelope;
use crate::ui::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkStage {
    Pack,
    Install,
    Script,
}

/// Per-workspace progress reported while an orchestrator is working.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    PackOk {
        pm: String,
        pkg_name: String,
        tarball: PathBuf,
    },
    PackFailed {
        pm: String,
        pkg_name: String,
        error: String,
    },
    InstallOk {
        pm: String,
        pkg_name: String,
        install_path: PathBuf,
    },
    InstallFailed {
        pm: String,
        pkg_name: String,
        error: String,
    },
    ScriptOk {
        pm: String,
        result: ScriptResult,
    },
    ScriptFailed {
        pm: String,
        pkg_name: String,
        script: String,
        exit_code: Option<i32>,
        error: String,
    },
    BatchComplete {
        pm: String,
        report: BatchReport,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkspaceFailure {
    pub pkg_name: String,
    pub stage: WorkStage,
    pub error: String,
}

/// Summary of one `start` batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub packed: Vec<String>,
    pub installed: Vec<String>,
    pub scripts: Vec<ScriptResult>,
    pub failures: Vec<WorkspaceFailure>,
    /// The batch was cut short by a halt or abort.
    pub interrupted: bool,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        !self.interrupted && self.failures.is_empty()
    }

    pub(crate) fn merge(&mut self, other: BatchReport) {
        self.packed.extend(other.packed);
        self.installed.extend(other.installed);
        self.scripts.extend(other.scripts);
        self.failures.extend(other.failures);
        self.interrupted |= other.interrupted;
    }
}

/// What both workers of one batch share.
pub(crate) struct WorkerShared {
    pub envelope: PackageManagerEnvelope,
    pub ctx: ExecutionContext,
    pub signal: AbortSignal,
    pub events: Option<mpsc::UnboundedSender<OrchestratorEvent>>,
    pub scripts: Vec<String>,
}

impl WorkerShared {
    fn pm(&self) -> String {
        self.envelope.spec.label().to_string()
    }

    fn send(&self, event: OrchestratorEvent) {
        if let Some(tx) = &self.events {
            // Nobody listening is fine
            let _ = tx.send(event);
        }
    }

    fn fail(&self, report: &mut BatchReport, pkg_name: &str, stage: WorkStage, error: String) {
        debug(
            "pkg_manager.worker.failed",
            &format!("{} {:?} failed for {}: {}", self.pm(), stage, pkg_name, error),
        );
        report.failures.push(WorkspaceFailure {
            pkg_name: pkg_name.to_string(),
            stage,
            error,
        });
    }
}

pub(crate) async fn pack_all(
    shared: Arc<WorkerShared>,
    manifests: mpsc::Sender<InstallManifest>,
) -> BatchReport {
    let mut report = BatchReport::default();

    for workspace in shared.ctx.workspaces() {
        if shared.signal.is_aborted() {
            report.interrupted = true;
            break;
        }

        let req = PackRequest {
            ctx: &shared.ctx,
            workspace,
            signal: &shared.signal,
        };
        let result = tokio::select! {
            biased;
            _ = shared.signal.aborted() => {
                report.interrupted = true;
                break;
            }
            res = shared.envelope.definition.pack(req) => res,
        };

        match result {
            Ok(manifest) => {
                report.packed.push(manifest.pkg_name.clone());
                shared.send(OrchestratorEvent::PackOk {
                    pm: shared.pm(),
                    pkg_name: manifest.pkg_name.clone(),
                    tarball: manifest.tarball.clone(),
                });
                if manifests.send(manifest).await.is_err() {
                    // Installer is gone; it only stops early on abort
                    report.interrupted = true;
                    break;
                }
            }
            Err(err) => {
                let error = format!("{:#}", err);
                shared.fail(&mut report, &workspace.pkg_name, WorkStage::Pack, error.clone());
                shared.send(OrchestratorEvent::PackFailed {
                    pm: shared.pm(),
                    pkg_name: workspace.pkg_name.clone(),
                    error,
                });
            }
        }
    }

    report
}

pub(crate) async fn install_all(
    shared: Arc<WorkerShared>,
    mut manifests: mpsc::Receiver<InstallManifest>,
) -> BatchReport {
    let mut report = BatchReport::default();

    loop {
        let manifest = tokio::select! {
            biased;
            _ = shared.signal.aborted() => {
                report.interrupted = true;
                break;
            }
            next = manifests.recv() => match next {
                Some(manifest) => manifest,
                None => break,
            },
        };

        let req = InstallRequest {
            ctx: &shared.ctx,
            manifest: &manifest,
            signal: &shared.signal,
        };
        let result = tokio::select! {
            biased;
            _ = shared.signal.aborted() => {
                report.interrupted = true;
                break;
            }
            res = shared.envelope.definition.install(req) => res,
        };

        if let Err(err) = result {
            let error = format!("{:#}", err);
            shared.fail(&mut report, &manifest.pkg_name, WorkStage::Install, error.clone());
            shared.send(OrchestratorEvent::InstallFailed {
                pm: shared.pm(),
                pkg_name: manifest.pkg_name.clone(),
                error,
            });
            continue;
        }

        report.installed.push(manifest.pkg_name.clone());
        shared.send(OrchestratorEvent::InstallOk {
            pm: shared.pm(),
            pkg_name: manifest.pkg_name.clone(),
            install_path: manifest.install_path.clone(),
        });

        if !run_scripts(&shared, &manifest, &mut report).await {
            report.interrupted = true;
            break;
        }
    }

    report
}

/// Returns false when aborted part way.
async fn run_scripts(shared: &WorkerShared, manifest: &InstallManifest, report: &mut BatchReport) -> bool {
    for script in &shared.scripts {
        let req = RunScriptRequest {
            ctx: &shared.ctx,
            manifest,
            script,
            signal: &shared.signal,
        };
        let result = tokio::select! {
            biased;
            _ = shared.signal.aborted() => return false,
            res = shared.envelope.definition.run_script(req) => res,
        };

        match result {
            Ok(result) if result.passed() => {
                report.scripts.push(result.clone());
                shared.send(OrchestratorEvent::ScriptOk {
                    pm: shared.pm(),
                    result,
                });
            }
            Ok(result) => {
                let error = format!("script exited with {:?}", result.exit_code);
                shared.fail(report, &manifest.pkg_name, WorkStage::Script, error.clone());
                shared.send(OrchestratorEvent::ScriptFailed {
                    pm: shared.pm(),
                    pkg_name: manifest.pkg_name.clone(),
                    script: script.clone(),
                    exit_code: result.exit_code,
                    error,
                });
                report.scripts.push(result);
            }
            Err(err) => {
                let error = format!("{:#}", err);
                shared.fail(report, &manifest.pkg_name, WorkStage::Script, error.clone());
                shared.send(OrchestratorEvent::ScriptFailed {
                    pm: shared.pm(),
                    pkg_name: manifest.pkg_name.clone(),
                    script: script.clone(),
                    exit_code: None,
                    error,
                });
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pkg_manager::abort::AbortController;
    use crate::pkg_manager::testing::{StubDefinition, envelope_for, test_context};
    use crate::workspace::WorkspaceInfo;
    use std::time::Duration;

    async fn run_batch(
        def: Arc<StubDefinition>,
        names: &[&str],
        scripts: &[&str],
        signal: AbortSignal,
    ) -> (BatchReport, Vec<OrchestratorEvent>) {
        let envelope = envelope_for(def, "9.0.0");
        let (ctx, _root) = test_context(&envelope).await;
        let workspaces = names
            .iter()
            .map(|n| WorkspaceInfo::new(*n, format!("/src/{}", n)))
            .collect();
        let (event_tx, mut event_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(WorkerShared {
            envelope,
            ctx: ctx.with_workspaces(workspaces),
            signal,
            events: Some(event_tx),
            scripts: scripts.iter().map(|s| s.to_string()).collect(),
        });

        let (tx, rx) = mpsc::channel(4);
        let packing = tokio::spawn(pack_all(shared.clone(), tx));
        let installing = tokio::spawn(install_all(shared.clone(), rx));
        let mut report = packing.await.unwrap();
        report.merge(installing.await.unwrap());
        drop(shared);

        let mut events = Vec::new();
        while let Ok(event) = event_rx.try_recv() {
            events.push(event);
        }
        (report, events)
    }

    #[tokio::test]
    async fn test_pack_install_and_scripts() {
        let def = Arc::new(StubDefinition::new("npm", "npm", "*"));
        let (report, events) = run_batch(def.clone(), &["a", "b"], &["test"], AbortSignal::never()).await;

        assert!(report.is_success());
        assert_eq!(report.packed, vec!["a", "b"]);
        assert_eq!(report.installed, vec!["a", "b"]);
        assert_eq!(report.scripts.len(), 2);
        assert_eq!(
            def.scripts_run(),
            vec![("a".to_string(), "test".to_string()), ("b".to_string(), "test".to_string())]
        );
        assert_eq!(events.len(), 6);
    }

    #[tokio::test]
    async fn test_failures_do_not_stop_the_batch() {
        let def = Arc::new(
            StubDefinition::new("npm", "npm", "*")
                .failing_pack("a")
                .failing_install("b"),
        );
        let (report, events) = run_batch(def, &["a", "b", "c"], &[], AbortSignal::never()).await;

        assert_eq!(report.packed, vec!["b", "c"]);
        assert_eq!(report.installed, vec!["c"]);
        let stages: Vec<_> = report.failures.iter().map(|f| f.stage).collect();
        assert_eq!(stages, vec![WorkStage::Pack, WorkStage::Install]);
        assert!(!report.is_success());
        assert!(events.iter().any(|e| matches!(e, OrchestratorEvent::PackFailed { pkg_name, .. } if pkg_name == "a")));
    }

    #[tokio::test]
    async fn test_abort_stops_slow_pack() {
        let def = Arc::new(StubDefinition::new("npm", "npm", "*").with_pack_delay(Duration::from_secs(30)));
        let controller = AbortController::new();
        let signal = controller.signal();

        let handle = tokio::spawn(async move { run_batch(def, &["a"], &[], signal).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        controller.abort();

        let (report, _) = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert!(report.interrupted);
        assert!(report.packed.is_empty());
    }
}
