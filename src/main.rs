use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL};
use futures_util::future::join_all;
use tokio::sync::mpsc;

use smoker::config::SmokerConfig;
use smoker::error::ResolveError;
use smoker::pkg_manager::{
    AbortController, AbortSignal, BatchReport, ContextOptions, FileManager, OrchestratorEvent,
    OrchestratorOptions, OrchestratorOutcome, PackageManagerEnvelope, PkgManagerService,
    TempFileManager, builtin,
};
use smoker::ui::{self, prelude::*};
use smoker::workspace::WorkspaceInfo;

/// Pack workspaces and install them with real package managers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Activate debug mode
    #[arg(short, long, global = true)]
    debug: bool,

    /// Emit JSON events instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Use this config file instead of smoker.toml
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Resolve package managers and show what would be used
    Resolve {
        /// Desired package managers, e.g. npm@9, yarn, system
        pms: Vec<String>,
    },

    /// Pack and install workspaces with each package manager
    Smoke {
        /// Desired package manager (repeatable)
        #[arg(long = "pm")]
        pms: Vec<String>,
        /// Script to run in each installed package (repeatable)
        #[arg(long = "script")]
        scripts: Vec<String>,
        /// Keep temp directories after the run
        #[arg(long)]
        linger: bool,
        #[arg(long)]
        loose: bool,
        #[arg(short, long)]
        verbose: bool,
        /// Workspace directories; defaults to the current directory
        workspaces: Vec<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    ui::set_debug_mode(cli.debug);
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };
    ui::init(format, !cli.json);

    if let Err(e) = run(cli).await {
        emit(Level::Error, "smoker.error", &format!("{:#}", e), None);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => SmokerConfig::load_from(path)?,
        None => SmokerConfig::load()?,
    };

    let service = PkgManagerService::builder(vec![builtin::plugin()])
        .default_system_bin(config.default_system_bin.clone())
        .version_query_timeout(config.version_query_timeout())
        .build()
        .context("loading package manager plugins")?;

    let controller = Arc::new(AbortController::new());
    let ctrl_c = Arc::clone(&controller);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c.abort();
        }
    });
    let signal = controller.signal();

    match cli.command {
        Commands::Resolve { pms } => {
            let desired = if pms.is_empty() {
                config.package_managers.clone()
            } else {
                pms
            };
            let envelopes = resolve(&service, &config, &desired, &signal).await?;
            print_envelopes(&envelopes);
            Ok(())
        }
        Commands::Smoke {
            pms,
            scripts,
            linger,
            loose,
            verbose,
            workspaces,
        } => {
            let desired = if pms.is_empty() {
                config.package_managers.clone()
            } else {
                pms
            };
            let options = ContextOptions {
                linger: linger || config.linger,
                loose: loose || config.loose,
                verbose: verbose || config.verbose,
            };
            let workspaces = read_workspaces(&workspaces)?;
            let envelopes = resolve(&service, &config, &desired, &signal).await?;
            smoke(&service, &config, envelopes, workspaces, scripts, options, signal).await
        }
    }
}

async fn resolve(
    service: &PkgManagerService,
    config: &SmokerConfig,
    desired: &[String],
    signal: &AbortSignal,
) -> Result<Vec<PackageManagerEnvelope>> {
    let timeout = config.resolve_timeout();
    let resolved = tokio::time::timeout(timeout, service.resolve_all(desired, signal))
        .await
        .with_context(|| format!("resolving package managers timed out after {:?}", timeout))?;

    resolved.map_err(|err: ResolveError| {
        if err.is_all_unsupported() {
            emit(
                Level::Error,
                "smoker.resolve.unsupported",
                "No matching package manager found",
                Some(serde_json::json!({
                    "requested": err.unsupported.iter().map(|u| &u.requested_as).collect::<Vec<_>>(),
                })),
            );
        }
        anyhow::Error::new(err)
    })
}

fn read_workspaces(dirs: &[PathBuf]) -> Result<Vec<WorkspaceInfo>> {
    if dirs.is_empty() {
        return Ok(vec![WorkspaceInfo::from_dir(&PathBuf::from("."))?]);
    }
    dirs.iter()
        .map(|dir| WorkspaceInfo::from_dir(dir).map_err(anyhow::Error::from))
        .collect()
}

fn print_envelopes(envelopes: &[PackageManagerEnvelope]) {
    if matches!(get_output_format(), OutputFormat::Json) {
        for envelope in envelopes {
            emit(
                Level::Info,
                "smoker.resolve.envelope",
                &envelope.to_string(),
                serde_json::to_value(envelope).ok(),
            );
        }
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Requested", "Package manager", "Version", "Binary", "Component"]);
    for envelope in envelopes {
        table.add_row(vec![
            envelope.spec.requested_as().unwrap_or("-").to_string(),
            envelope.spec.name().to_string(),
            envelope.spec.version().to_string(),
            envelope.spec.bin().display().to_string(),
            envelope.id.to_string(),
        ]);
    }
    println!("{table}");
}

fn print_event(event: &OrchestratorEvent) {
    let (level, code, message) = match event {
        OrchestratorEvent::PackOk { pm, pkg_name, .. } => {
            (Level::Info, "smoker.pack.ok", format!("[{}] packed {}", pm, pkg_name))
        }
        OrchestratorEvent::PackFailed { pm, pkg_name, error } => (
            Level::Warn,
            "smoker.pack.failed",
            format!("[{}] failed to pack {}: {}", pm, pkg_name, error),
        ),
        OrchestratorEvent::InstallOk { pm, pkg_name, .. } => (
            Level::Success,
            "smoker.install.ok",
            format!("[{}] installed {}", pm, pkg_name),
        ),
        OrchestratorEvent::InstallFailed { pm, pkg_name, error } => (
            Level::Warn,
            "smoker.install.failed",
            format!("[{}] failed to install {}: {}", pm, pkg_name, error),
        ),
        OrchestratorEvent::ScriptOk { pm, result } => (
            Level::Success,
            "smoker.script.ok",
            format!("[{}] {} passed in {}", pm, result.script, result.pkg_name),
        ),
        OrchestratorEvent::ScriptFailed {
            pm,
            pkg_name,
            script,
            error,
            ..
        } => (
            Level::Warn,
            "smoker.script.failed",
            format!("[{}] {} failed in {}: {}", pm, script, pkg_name, error),
        ),
        // Summarized in the final table
        OrchestratorEvent::BatchComplete { .. } => return,
    };
    emit(level, code, &message, serde_json::to_value(event).ok());
}

async fn smoke(
    service: &PkgManagerService,
    config: &SmokerConfig,
    envelopes: Vec<PackageManagerEnvelope>,
    workspaces: Vec<WorkspaceInfo>,
    scripts: Vec<String>,
    options: ContextOptions,
    signal: AbortSignal,
) -> Result<()> {
    let file_manager: Arc<dyn FileManager> = Arc::new(match &config.tmp_root {
        Some(root) => TempFileManager::with_root(root),
        None => TempFileManager::new(),
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            print_event(&event);
        }
    });

    let runs = envelopes.into_iter().map(|envelope| {
        let label = envelope.spec.to_string();
        let handle = service.create_orchestrator(
            envelope,
            Arc::clone(&file_manager),
            OrchestratorOptions {
                context: options,
                idle_timeout: config.idle_timeout(),
                signal: signal.clone(),
                events: Some(events_tx.clone()),
                ..Default::default()
            },
        );
        let ticket = handle.start_with_scripts(workspaces.clone(), scripts.clone());
        async move {
            let report = ticket.wait().await;
            let outcome = handle.outcome().await;
            (label, report, outcome)
        }
    });
    let results: Vec<(String, Option<BatchReport>, OrchestratorOutcome)> = join_all(runs).await;

    drop(events_tx);
    let _ = printer.await;

    print_summary(&results);

    let failed = results.iter().any(|(_, report, outcome)| {
        outcome.aborted || outcome.error.is_some() || !report.as_ref().is_some_and(BatchReport::is_success)
    });
    if failed {
        anyhow::bail!("smoke test failed");
    }
    emit(Level::Success, "smoker.done", "All package managers passed", None);
    Ok(())
}

fn print_summary(results: &[(String, Option<BatchReport>, OrchestratorOutcome)]) {
    if matches!(get_output_format(), OutputFormat::Json) {
        for (label, report, outcome) in results {
            emit(
                Level::Info,
                "smoker.summary",
                label,
                Some(serde_json::json!({
                    "report": report,
                    "aborted": outcome.aborted,
                    "noop": outcome.noop,
                    "error": outcome.error.as_ref().map(|e| e.to_string()),
                    "lingering": outcome.lingering,
                })),
            );
        }
        return;
    }

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Package manager", "Packed", "Installed", "Scripts", "Status"]);
    for (label, report, outcome) in results {
        let report = report.clone().unwrap_or_default();
        let scripts_ok = report.scripts.iter().filter(|s| s.passed()).count();
        let status = if outcome.aborted {
            "aborted".yellow().to_string()
        } else if outcome.error.is_some() || !report.is_success() {
            "failed".red().to_string()
        } else {
            "ok".green().to_string()
        };
        table.add_row(vec![
            label.clone(),
            report.packed.len().to_string(),
            report.installed.len().to_string(),
            format!("{}/{}", scripts_ok, report.scripts.len()),
            status,
        ]);
    }
    println!("{table}");

    for (_, _, outcome) in results {
        if let Some(error) = &outcome.error {
            emit(Level::Error, "smoker.orchestrator.error", &error.to_string(), None);
        }
    }
    separator();
}
