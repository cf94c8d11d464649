mod render;

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use riftpatch_engine::{
    default_data_dir, logging, AppLayout, EngineConfig, InstallStateStore, Manifest,
    Orchestrator, RunMode, TransactionLog, UpdateController, UpdateError, UpdateProgress,
};

use crate::render::{format_summary_lines, render_status_line, OutputStyle, TerminalRenderer};

const EXIT_FAILURE: u8 = 1;
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser, Debug)]
#[command(name = "riftpatch", version, about = "Keeps a game installation in sync with its signed manifest")]
struct Cli {
    /// Launcher data directory (settings, caches, backups, logs).
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Console log filter, e.g. `warn` or `riftpatch_engine=debug`.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bring the installation up to date with the published manifest.
    Update,
    /// Re-hash every file and remove files the manifest does not list.
    Repair,
    /// Roll back an interrupted update, if one is pending.
    Recover,
    /// Show the installed version and any pending transaction.
    Status,
    /// Start the game.
    Launch,
    /// Open the installation folder in the system file browser.
    OpenFolder,
    /// Print a shell completion script.
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let renderer = TerminalRenderer::current();
    match run_cli(cli, renderer) {
        Ok(code) => code,
        Err(err) => {
            eprintln!(
                "{}",
                render_status_line(renderer.style(), "err", &format!("{err:#}"))
            );
            ExitCode::from(EXIT_FAILURE)
        }
    }
}

fn run_cli(cli: Cli, renderer: TerminalRenderer) -> Result<ExitCode> {
    if let Commands::Completions { shell } = cli.command {
        write_completions(shell, &mut io::stdout())?;
        return Ok(ExitCode::SUCCESS);
    }

    let layout = resolve_layout(cli.data_dir)?;
    layout.ensure_base_dirs()?;
    logging::init(&layout, &cli.log_level)?;

    match cli.command {
        Commands::Update => Ok(run_update(layout, RunMode::Normal, renderer)),
        Commands::Repair => Ok(run_update(layout, RunMode::Repair, renderer)),
        Commands::Recover => {
            let config = EngineConfig::resolve(&layout);
            let orchestrator = Orchestrator::new(layout, config);
            Ok(finish(renderer, orchestrator.recover().map(|recovered| {
                let message = if recovered {
                    "rolled back the interrupted update"
                } else {
                    "nothing to recover"
                };
                renderer.print_status("ok", message);
            })))
        }
        Commands::Status => {
            let config = EngineConfig::resolve(&layout);
            let report = collect_status(&layout, &config)?;
            renderer.print_section("status");
            renderer.print_lines(&format_status_lines(&report, renderer.style()));
            Ok(ExitCode::SUCCESS)
        }
        Commands::Launch => {
            let controller = UpdateController::new(layout);
            Ok(finish(renderer, controller.launch().map(|pid| {
                renderer.print_status("ok", &format!("game started (pid {pid})"));
            })))
        }
        Commands::OpenFolder => {
            let controller = UpdateController::new(layout);
            Ok(finish(renderer, controller.open_install_folder().map(|path| {
                renderer.print_status("ok", &format!("opened {}", path.display()));
            })))
        }
        Commands::Completions { .. } => Ok(ExitCode::SUCCESS),
    }
}

fn resolve_layout(data_dir: Option<PathBuf>) -> Result<AppLayout> {
    let root = match data_dir {
        Some(path) => path,
        None => default_data_dir().context("failed to resolve launcher data directory")?,
    };
    Ok(AppLayout::new(root))
}

fn run_update(layout: AppLayout, mode: RunMode, renderer: TerminalRenderer) -> ExitCode {
    renderer.print_section(mode.as_str());
    let controller = UpdateController::new(layout);

    let progress = Arc::new(Mutex::new(Some(renderer.start_progress())));
    let sink_progress = Arc::clone(&progress);
    let sink = Arc::new(move |update: &UpdateProgress| {
        let mut guard = sink_progress.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(view) = guard.as_mut() {
            view.observe(update);
        }
    });

    let outcome = controller
        .start_update(mode, sink)
        .and_then(|handle| handle.join());

    let view = progress
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take();
    match outcome {
        Ok(summary) => {
            if let Some(view) = view {
                view.finish_success();
            }
            renderer.print_lines(&format_summary_lines(&summary, renderer.style()));
            ExitCode::SUCCESS
        }
        Err(err) => {
            if let Some(view) = view {
                view.finish_abandon();
            }
            renderer.print_error(&err);
            exit_code_for(&err)
        }
    }
}

fn finish(renderer: TerminalRenderer, outcome: Result<(), UpdateError>) -> ExitCode {
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            renderer.print_error(&err);
            exit_code_for(&err)
        }
    }
}

fn exit_code_for(err: &UpdateError) -> ExitCode {
    if err.is_cancelled() {
        ExitCode::from(EXIT_CANCELLED)
    } else {
        ExitCode::from(EXIT_FAILURE)
    }
}

fn write_completions<W: io::Write>(shell: Shell, out: &mut W) -> Result<()> {
    let mut command = Cli::command();
    clap_complete::generate(shell, &mut command, "riftpatch", out);
    out.flush().context("failed to write completion script")?;
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct StatusReport {
    data_dir: PathBuf,
    install_dir: PathBuf,
    manifest_source: String,
    installed_version: Option<String>,
    verified_at: Option<String>,
    cached_version: Option<String>,
    pending_version: Option<(String, usize)>,
}

fn collect_status(layout: &AppLayout, config: &EngineConfig) -> Result<StatusReport> {
    let state = InstallStateStore::new(layout).load();
    let cached_version = std::fs::read_to_string(layout.manifest_cache_path())
        .ok()
        .and_then(|raw| Manifest::from_json_str(&raw).ok())
        .map(|manifest| manifest.version);
    let pending_version = TransactionLog::new(layout)
        .pending()?
        .map(|transaction| (transaction.version, transaction.applied_files.len()));

    Ok(StatusReport {
        data_dir: layout.root().to_path_buf(),
        install_dir: config.install_dir.clone(),
        manifest_source: config.manifest_source.describe(),
        installed_version: state.as_ref().map(|state| state.manifest_version.clone()),
        verified_at: state.map(|state| state.verified_at_utc.to_rfc3339()),
        cached_version,
        pending_version,
    })
}

fn format_status_lines(report: &StatusReport, style: OutputStyle) -> Vec<String> {
    let mut lines = vec![
        format!("data dir: {}", report.data_dir.display()),
        format!("install dir: {}", report.install_dir.display()),
        format!("manifest: {}", report.manifest_source),
    ];
    match (&report.installed_version, &report.verified_at) {
        (Some(version), Some(verified_at)) => lines.push(render_status_line(
            style,
            "ok",
            &format!("installed {version} (verified {verified_at})"),
        )),
        _ => lines.push(render_status_line(style, "warn", "no verified installation")),
    }
    if let Some(version) = &report.cached_version {
        lines.push(format!("cached manifest: {version}"));
    }
    if let Some((version, applied)) = &report.pending_version {
        lines.push(render_status_line(
            style,
            "warn",
            &format!(
                "interrupted update to {version} pending ({applied} file(s) applied); run `riftpatch recover`"
            ),
        ));
    }
    lines
}
