use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use remote_runs::backend::{Backend, RemoteBackend};
use remote_runs::config::RemoteRunsConfig;
use remote_runs::confirm::{AutoApprove, Confirmer, TerminalConfirmer};
use remote_runs::credentials::{ChainedCredentials, EnvCredentials};
use remote_runs::discovery::Disco;
use remote_runs::run::{ConfigurationSnapshot, Operation, RunOutcome, RunReport};
use remote_runs::shutdown::ShutdownCoordinator;
use remote_runs::telemetry::{init_telemetry, shutdown_telemetry};
use remote_runs::workspace::DEFAULT_ENVIRONMENT;
use remote_runs::TokioSleeper;

#[derive(Parser)]
#[command(name = "remote-runs")]
#[command(about = "Drive plan and apply runs against a remote execution service")]
#[command(long_about = "remote-runs uploads a configuration directory to a remote execution service, \
                       waits for the remote plan and its policy checks, asks for confirmation and \
                       applies it. Settings come from remote-runs.toml, .remote-runs-rc and \
                       REMOTE_RUNS_* environment variables.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Clone)]
struct RunArgs {
    /// Configuration directory to upload
    #[arg(long, default_value = ".")]
    dir: PathBuf,
    /// Environment (workspace) to run against
    #[arg(long, short = 'w', default_value = DEFAULT_ENVIRONMENT)]
    workspace: String,
    /// Plan the destruction of all managed resources
    #[arg(long)]
    destroy: bool,
    /// Message attached to the remote run
    #[arg(long, short = 'm')]
    message: Option<String>,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a speculative run and show its plan
    Plan {
        #[command(flatten)]
        run: RunArgs,
    },
    /// Plan, confirm and apply
    Apply {
        #[command(flatten)]
        run: RunArgs,
        /// Skip interactive approval of the plan and of overridable policy failures
        #[arg(long)]
        auto_approve: bool,
        /// Apply even when the plan reports no changes
        #[arg(long)]
        apply_if_no_changes: bool,
    },
    /// List the environments available to the configured backend
    Workspaces,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    RemoteRunsConfig::load_env_file()?;
    let config = RemoteRunsConfig::load().context("failed to load configuration")?;
    init_telemetry(&config.observability)?;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        match cli.command {
            Commands::Plan { run } => {
                let op = build_operation(&run, false)?;
                run_command(&config, op, &run, Arc::new(TerminalConfirmer)).await
            }
            Commands::Apply {
                run,
                auto_approve,
                apply_if_no_changes,
            } => {
                let op = build_operation(&run, true)?
                    .auto_approve(auto_approve)
                    .apply_if_no_changes(apply_if_no_changes);
                let confirmer: Arc<dyn Confirmer> = if auto_approve {
                    Arc::new(AutoApprove)
                } else {
                    Arc::new(TerminalConfirmer)
                };
                run_command(&config, op, &run, confirmer).await
            }
            Commands::Workspaces => workspaces_command(&config).await,
        }
    });

    shutdown_telemetry();
    result
}

fn build_operation(args: &RunArgs, apply: bool) -> Result<Operation> {
    let snapshot = ConfigurationSnapshot::from_dir(&args.dir)
        .with_context(|| format!("failed to read configuration from {}", args.dir.display()))?;
    let op = if apply {
        Operation::apply(snapshot)
    } else {
        Operation::plan(snapshot)
    };
    let op = op.destroy(args.destroy);
    Ok(match &args.message {
        Some(message) => op.message(message.clone()),
        None => op,
    })
}

async fn connect(config: &RemoteRunsConfig, confirmer: Arc<dyn Confirmer>) -> Result<Backend> {
    if !config.is_remote() {
        bail!(
            "no organization is configured (backend.organization); local execution needs a \
             LocalExecutor and is only available when embedding the remote_runs library"
        );
    }
    let credentials = ChainedCredentials::new().push(Arc::new(EnvCredentials));
    let remote = RemoteBackend::connect(
        config,
        &Disco::new(),
        &credentials,
        confirmer,
        Arc::new(TokioSleeper),
    )
    .await?;
    Ok(Backend::Remote(remote))
}

async fn run_command(
    config: &RemoteRunsConfig,
    op: Operation,
    args: &RunArgs,
    confirmer: Arc<dyn Confirmer>,
) -> Result<()> {
    let backend = connect(config, confirmer).await?;

    let shutdown = ShutdownCoordinator::new();
    shutdown.install_signal_handlers();

    let result = backend.operation(&op, &args.workspace, &shutdown.token()).await;
    if let Backend::Remote(remote) = &backend {
        if config.observability.metrics_enabled {
            remote.metrics().log_stats();
        }
    }

    let report = match result {
        Ok(report) => report,
        Err(err) => {
            if let Some(hint) = err.hint() {
                eprintln!("hint: {hint}");
            }
            return Err(err.into());
        }
    };
    print_report(&report, args.json)?;

    match report.outcome {
        RunOutcome::Discarded { .. } | RunOutcome::Canceled => std::process::exit(2),
        _ => Ok(()),
    }
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if let Some(run_id) = &report.run_id {
        println!("Run {run_id} in workspace {}", report.workspace);
    }
    println!("{}", report.outcome.summary());
    Ok(())
}

async fn workspaces_command(config: &RemoteRunsConfig) -> Result<()> {
    let backend = connect(config, Arc::new(TerminalConfirmer)).await?;
    for name in backend.workspaces().await? {
        println!("{name}");
    }
    Ok(())
}
