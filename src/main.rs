//! Mend - Autonomous Test-Repair Agent
//!
//! Binary entry point: CLI parsing, logging setup, and wiring of the
//! rotation manager and repair loop from project configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::debug;

use mend::backend::rotation::ClientFactory;
use mend::{
    BackendClient, BackendSpec, CliBackendClient, GitCli, MendConfig, MendError, RegexSummarizer,
    RepairLoop, RepairLoopConfig, RotationManager, RotationStateStore, ScriptTestRunner,
};

/// Exit code for a repair run that ended without success.
const EXIT_FAILURE: i32 = 1;
/// Exit code for an unrecoverable push failure after a commit.
const EXIT_PUSH_FAILURE: i32 = 3;

#[derive(Parser)]
#[command(name = "mend")]
#[command(version)]
#[command(about = "Repairs a failing test suite with rotating LLM backends", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Project directory (defaults to current directory)
    #[arg(short, long, global = true, default_value = ".")]
    project: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the test-repair loop
    Run {
        /// Analyze and report without requesting fixes or committing
        #[arg(long)]
        dry_run: bool,

        /// Override the attempt budget ("inf" for unbounded)
        #[arg(long, value_name = "N")]
        max_attempts: Option<f64>,

        /// Start focused on a single test file
        #[arg(long, value_name = "FILE")]
        test_file: Option<String>,
    },

    /// Show or reset the persisted backend rotation state
    State {
        /// Delete the persisted state
        #[arg(long)]
        reset: bool,
    },

    /// Check that required tools and configuration are in place
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Run {
            dry_run,
            max_attempts,
            test_file,
        } => run_repair(&cli.project, dry_run, max_attempts, test_file).await,
        Commands::State { reset } => show_state(&cli.project, reset),
        Commands::Check => run_check(&cli.project),
    }
}

fn init_tracing(verbose: bool) {
    let default_filter = if verbose { "mend=debug" } else { "mend=info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run_repair(
    project: &Path,
    dry_run: bool,
    max_attempts: Option<f64>,
    test_file: Option<String>,
) -> anyhow::Result<()> {
    let mut config = MendConfig::load(project)?;
    if let Some(attempts) = max_attempts {
        config.max_fix_attempts = attempts;
        config.validate()?;
    }

    let rotation = build_rotation_manager(&config, project)?;
    let loop_config = RepairLoopConfig::from_config(&config, project, dry_run);

    let mut repair = RepairLoop::new(
        rotation,
        Arc::new(ScriptTestRunner::new(project, config.test_command.clone())),
        Arc::new(build_git(&config, project)),
        Arc::new(RegexSummarizer::new()),
        loop_config,
    )
    .with_focus(test_file);

    repair
        .rotation_mut()
        .maybe_reset_stale(config.backend_stale_after_seconds);

    let result = repair.run().await;
    repair.shutdown().await;

    match result {
        Ok(outcome) => {
            println!();
            for message in &outcome.messages {
                println!("  {message}");
            }
            println!();
            if outcome.success {
                println!(
                    "{} suite repaired after {} attempt(s)",
                    "✓".green().bold(),
                    outcome.attempts
                );
                Ok(())
            } else {
                println!(
                    "{} suite still failing after {} attempt(s)",
                    "✗".red().bold(),
                    outcome.attempts
                );
                std::process::exit(EXIT_FAILURE);
            }
        }
        Err(e) if e.is_process_fatal() => {
            eprintln!("{} {e}", "fatal:".red().bold());
            std::process::exit(EXIT_PUSH_FAILURE);
        }
        Err(e) => Err(e.into()),
    }
}

/// Build the rotation manager from configuration: the default backend's
/// client is constructed eagerly, every other backend gets a lazy
/// factory.
fn build_rotation_manager(config: &MendConfig, project: &Path) -> anyhow::Result<RotationManager> {
    let default_spec = config.default_backend_spec().ok_or_else(|| {
        MendError::invalid_config(
            "default_backend",
            format!("backend '{}' is not defined in [[backends]]", config.default_backend),
        )
    })?;

    let default_client: Arc<dyn BackendClient> =
        Arc::new(CliBackendClient::from_spec(default_spec, project).map_err(|e| {
            MendError::backend_factory(&default_spec.name, e.to_string())
        })?);

    let mut factories: HashMap<String, ClientFactory> = HashMap::new();
    for spec in &config.backends {
        if spec.name == config.default_backend {
            continue;
        }
        let spec = spec.clone();
        let project = project.to_path_buf();
        factories.insert(
            spec.name.clone(),
            Box::new(move || {
                let client = CliBackendClient::from_spec(&spec, &project)?;
                Ok(Arc::new(client) as Arc<dyn BackendClient>)
            }),
        );
    }

    debug!(
        "configured backends: {:?} (default '{}')",
        config.backends.iter().map(|b| &b.name).collect::<Vec<_>>(),
        config.default_backend
    );

    let store = RotationStateStore::new(config.state_file_path(project));
    Ok(RotationManager::new(
        &config.default_backend,
        default_client,
        config.backends.clone(),
        factories,
    )
    .with_state_store(store))
}

fn build_git(config: &MendConfig, project: &Path) -> GitCli {
    let git = GitCli::new(project).with_commit_retries(config.commit_retries);
    match (&config.push_remote, &config.push_branch) {
        (Some(remote), Some(branch)) => git.with_push_target(remote, branch),
        _ => git,
    }
}

fn show_state(project: &Path, reset: bool) -> anyhow::Result<()> {
    let config = MendConfig::load(project)?;
    let store = RotationStateStore::new(config.state_file_path(project));

    if reset {
        if store.clear() {
            println!("{} rotation state cleared", "✓".green());
        } else {
            println!("{} failed to clear rotation state", "✗".red());
        }
        return Ok(());
    }

    match store.load() {
        Some(state) => {
            println!("current backend:  {}", state.current_backend.bold());
            println!("last switch:      {}", state.last_switch_timestamp);
        }
        None => println!("no rotation state recorded"),
    }
    Ok(())
}

fn run_check(project: &Path) -> anyhow::Result<()> {
    let mut ok = true;

    match MendConfig::load(project) {
        Ok(config) => {
            println!("{} configuration valid", "✓".green());

            if config.default_backend_spec().is_none() {
                println!(
                    "{} default backend '{}' missing from [[backends]]",
                    "✗".red(),
                    config.default_backend
                );
                ok = false;
            }

            for spec in &config.backends {
                match spec.command.first() {
                    Some(program) if which::which(program).is_ok() => {
                        println!("{} backend '{}' ({program})", "✓".green(), spec.name);
                    }
                    Some(program) => {
                        println!(
                            "{} backend '{}': {program} not found on PATH",
                            "✗".red(),
                            spec.name
                        );
                        ok = false;
                    }
                    None => {
                        println!("{} backend '{}' has no command", "✗".red(), spec.name);
                        ok = false;
                    }
                }
            }

            match config.test_command.first() {
                Some(program) if which::which(program).is_ok() => {
                    println!("{} test command ({program})", "✓".green());
                }
                Some(program) => {
                    println!("{} test command: {program} not found on PATH", "✗".red());
                    ok = false;
                }
                None => {
                    println!("{} no test command configured", "✗".red());
                    ok = false;
                }
            }
        }
        Err(e) => {
            println!("{} {e}", "✗".red());
            ok = false;
        }
    }

    if which::which("git").is_ok() {
        println!("{} git", "✓".green());
    } else {
        println!("{} git not found on PATH", "✗".red());
        ok = false;
    }

    if !ok {
        std::process::exit(EXIT_FAILURE);
    }
    Ok(())
}
