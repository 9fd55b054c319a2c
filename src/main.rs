//! `conductor`: run goal sets in parallel and inspect or steer a running
//! coordinator from another terminal.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

use ralph_conductor::goal::load_goals;
use ralph_conductor::layout::StateLayout;
use ralph_conductor::status::{ControlDir, StatusStore};
use ralph_conductor::ui::RunDisplay;
use ralph_conductor::{
    CommandAgent, ConductorConfig, ConductorError, ConductorResult, Coordinator,
    CoordinatorConfig,
};

/// Exit code for errors that stop the run before or outside goal execution.
const EXIT_FATAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "conductor", version, about = "Run coding-agent goals in parallel waves")]
struct Cli {
    /// Repository root
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Configuration file (defaults to .ralph/conductor.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Disable colored output
    #[arg(long, global = true)]
    no_color: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every goal in a goals file
    Run {
        /// Goals file (.json or .toml)
        goals: PathBuf,

        #[arg(long)]
        max_workers: Option<usize>,

        #[arg(long)]
        max_inference: Option<usize>,

        /// Print the wave schedule and exit
        #[arg(long)]
        dry_run: bool,

        /// Only print the final summary
        #[arg(short, long)]
        quiet: bool,
    },
    /// Pause a running worker at its next checkpoint
    Pause { worker_id: String },
    /// Resume a paused worker
    Resume { worker_id: String },
    /// Show the status of the current or last run
    Status {
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            tracing::debug!(error = ?err, "Command failed");
            eprintln!("{} {}", "error:".red().bold(), err);
            ExitCode::from(EXIT_FATAL)
        }
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "ralph_conductor=debug,conductor=debug",
        _ => "trace",
    };
    let filter = if verbose > 0 {
        EnvFilter::new(default)
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

async fn dispatch(cli: Cli) -> ConductorResult<ExitCode> {
    let root = std::fs::canonicalize(&cli.root)?;
    let display = RunDisplay::new().with_colors(!cli.no_color);

    match cli.command {
        Commands::Run {
            goals,
            max_workers,
            max_inference,
            dry_run,
            quiet,
        } => {
            let display = display.with_quiet(quiet);
            let options = RunOptions {
                goals_file: goals,
                config_file: cli.config,
                max_workers,
                max_inference,
                dry_run,
            };
            run(&root, options, display).await
        }
        Commands::Pause { worker_id } => {
            ensure_live_worker(&root, &worker_id)?;
            ControlDir::new(StateLayout::new(&root).control_dir()).request_pause(&worker_id)?;
            println!("Pause requested for {}", worker_id);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Resume { worker_id } => {
            ensure_live_worker(&root, &worker_id)?;
            let cleared =
                ControlDir::new(StateLayout::new(&root).control_dir()).clear_pause(&worker_id)?;
            if cleared {
                println!("Resume requested for {}", worker_id);
            } else {
                println!("{} has no pending pause request", worker_id);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Status { json } => {
            let snapshot = StatusStore::new(StateLayout::new(&root).status_file()).load()?;
            match (snapshot, json) {
                (Some(snapshot), true) => println!("{}", serde_json::to_string_pretty(&snapshot)?),
                (Some(snapshot), false) => print!("{}", display.render_status(&snapshot)),
                (None, true) => println!("null"),
                (None, false) => println!("No conductor run recorded in {}", root.display()),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

struct RunOptions {
    goals_file: PathBuf,
    config_file: Option<PathBuf>,
    max_workers: Option<usize>,
    max_inference: Option<usize>,
    dry_run: bool,
}

async fn run(root: &Path, options: RunOptions, display: RunDisplay) -> ConductorResult<ExitCode> {
    let goals = load_goals(&options.goals_file)?;
    let schedule = Coordinator::plan(&goals)?;
    if options.dry_run {
        print!("{}", display.render_schedule(&goals, &schedule));
        return Ok(ExitCode::SUCCESS);
    }

    let settings = ConductorConfig::load(root, options.config_file.as_deref())?;
    let agent = CommandAgent::from_settings(&settings.agent).ok_or(ConductorError::NoAgentConfigured)?;
    let mut config = CoordinatorConfig::from_settings(&settings);
    if let Some(max_workers) = options.max_workers {
        config = config.with_max_workers(max_workers);
    }
    if let Some(max_inference) = options.max_inference {
        config = config.with_max_inference(max_inference);
    }

    let coordinator = Coordinator::new(root, config, Arc::new(agent));
    let shutdown = coordinator.shutdown_handle();
    if let Err(err) = ctrlc::set_handler(move || shutdown.trigger()) {
        tracing::warn!(error = %err, "Could not install Ctrl-C handler");
    }

    let mut events = coordinator.subscribe();
    let printer_display = display.clone();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(line) = printer_display.render_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress output fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let result = coordinator.execute(goals).await;
    drop(coordinator);
    if let Err(err) = printer.await {
        tracing::debug!(error = %err, "Progress printer stopped");
    }

    let result = result?;
    print!("{}", display.render_result(&result));
    if result.all_clean() {
        Ok(ExitCode::SUCCESS)
    } else {
        Ok(ExitCode::from(1))
    }
}

/// A worker id must name a live worker in the last persisted status.
fn ensure_live_worker(root: &Path, worker_id: &str) -> ConductorResult<()> {
    let snapshot = StatusStore::new(StateLayout::new(root).status_file()).load()?;
    let live = snapshot
        .as_ref()
        .and_then(|snapshot| snapshot.worker(worker_id))
        .is_some_and(|worker| !worker.status.is_terminal());
    if live {
        Ok(())
    } else {
        Err(ConductorError::UnknownWorker(worker_id.to_string()))
    }
}
