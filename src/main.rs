//! Provision Pilot CLI entrypoint.
//!
//! This is the main entrypoint for the provision-pilot command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use provision_pilot::cli::{Cli, Commands, LeaseCommands, OutputFormatter};
use provision_pilot::config::{
    ConfigParser, ConfigValidator, PilotConfig, StateBackend, config_dir, find_config_file,
};
use provision_pilot::driver::{DriverRegistry, ProvisioningClient};
use provision_pilot::error::{PilotError, Result};
use provision_pilot::notify::{ChatNotifier, DEFAULT_NOTIFY_TIMEOUT_SECS};
use provision_pilot::reconciler::Reconciler;
use provision_pilot::state::{LocalStateStore, MemoryStateStore, S3StateStore, STATE_DIR, StateStore};
use provision_pilot::trigger::DeploymentTrigger;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag.
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<ExitCode> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Validate => cmd_validate(config_path, &formatter),
        Commands::Plan {
            project,
            repository_ref,
            commit,
        } => cmd_plan(config_path, &project, &repository_ref, &commit, &formatter).await,
        Commands::Deploy {
            project,
            repository_ref,
            commit,
        } => cmd_deploy(config_path, &project, &repository_ref, &commit, &formatter).await,
        Commands::Status { project } => cmd_status(config_path, &project, &formatter).await,
        Commands::Drift { project } => cmd_drift(config_path, &project, &formatter).await,
        Commands::History { project, limit } => cmd_history(config_path, &project, limit, &formatter).await,
        Commands::Lease { command } => cmd_lease(config_path, command, &formatter).await,
    }
}

/// Validate configuration.
fn cmd_validate(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<ExitCode> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = load_config(&config_file)?;
    let result = ConfigValidator::new().check(&config);

    println!("{}", formatter.format_validation(&config, &result));

    Ok(if result.is_valid() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// Show the plan a deploy would execute.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    project: &str,
    repository_ref: &str,
    commit: &str,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    let trigger = context.trigger(CancellationToken::new())?;

    let plan = trigger.preview(project, repository_ref, commit).await;
    context.close().await;

    println!("{}", formatter.format_plan(&plan?));
    Ok(ExitCode::SUCCESS)
}

/// Reconcile a project to a commit.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    project: &str,
    repository_ref: &str,
    commit: &str,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing the current operation and stopping");
            on_interrupt.cancel();
        }
    });

    let trigger = context.trigger(cancel)?;
    let summary = trigger.reconcile(project, repository_ref, commit).await;
    context.close().await;
    let summary = summary?;

    println!("{}", formatter.format_summary(&summary));

    Ok(if summary.status == provision_pilot::reconciler::RunStatus::Succeeded {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

/// List applied records.
async fn cmd_status(config_path: Option<&PathBuf>, project: &str, formatter: &OutputFormatter) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    context.require_project(project)?;

    let records = context.store.list(project).await;
    context.close().await;

    println!("{}", formatter.format_records(project, &records?));
    Ok(ExitCode::SUCCESS)
}

/// Compare applied records with live state.
async fn cmd_drift(config_path: Option<&PathBuf>, project: &str, formatter: &OutputFormatter) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    context.require_project(project)?;
    let trigger = context.trigger(CancellationToken::new())?;

    let report = trigger.reconciler().inspect_drift(project).await;
    context.close().await;
    let report = report?;

    println!("{}", formatter.format_drift(&report));

    Ok(if report.has_drift() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Show recent runs.
async fn cmd_history(
    config_path: Option<&PathBuf>,
    project: &str,
    limit: usize,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;
    context.require_project(project)?;

    let runs = context.store.recent_runs(project, limit).await;
    context.close().await;

    println!("{}", formatter.format_history(project, &runs?));
    Ok(ExitCode::SUCCESS)
}

/// Lease management commands.
async fn cmd_lease(
    config_path: Option<&PathBuf>,
    command: LeaseCommands,
    formatter: &OutputFormatter,
) -> Result<ExitCode> {
    let context = Context::load(config_path).await?;

    let output = match command {
        LeaseCommands::Show { project } => {
            context.require_project(&project)?;
            let lease = context.store.current_lease(&project).await?;
            formatter.format_lease(&project, lease.as_ref())
        }
        LeaseCommands::Release { project } => {
            context.require_project(&project)?;
            let released = context.store.force_release_lease(&project).await?;
            if released {
                warn!("Forcefully released lease on {project}");
            }
            formatter.format_lease_release(&project, released)
        }
    };
    context.close().await;

    println!("{output}");
    Ok(ExitCode::SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Loaded configuration plus the state store it selects.
struct Context {
    config: PilotConfig,
    store: Arc<dyn StateStore>,
}

impl Context {
    /// Loads and validates configuration, then opens the state store.
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        debug!("Loading configuration from: {}", config_file.display());

        let config = load_config(&config_file)?;
        ConfigValidator::new().validate(&config)?;

        let store = open_state_store(&config, &config_file).await?;
        info!("Using {} state backend", store.backend_type());

        Ok(Self { config, store })
    }

    /// Fails unless the configuration declares `project`.
    fn require_project(&self, project: &str) -> Result<()> {
        if self.config.project(project).is_some() {
            Ok(())
        } else {
            Err(provision_pilot::error::ConfigError::UnknownProject {
                project: project.to_string(),
            }
            .into())
        }
    }

    /// Wires the gateway client, drivers and reconciler into a trigger.
    fn trigger(&self, cancel: CancellationToken) -> Result<DeploymentTrigger> {
        let provider = &self.config.provider;
        let token = match ConfigParser::api_token(&provider.token_env) {
            Ok(token) => Some(token),
            Err(_) => {
                debug!("{} not set, calling the gateway without a token", provider.token_env);
                None
            }
        };

        let client = ProvisioningClient::new(&provider.base_url, token, provider.timeout())?;
        let drivers = DriverRegistry::http(&client);

        let mut reconciler = Reconciler::new(Arc::clone(&self.store), drivers)
            .with_retry(self.config.retry.policy())
            .with_lease_ttl(self.config.lease.ttl())
            .with_cancellation(cancel);
        if let Some(secs) = self.config.lease.run_timeout_secs {
            reconciler = reconciler.with_run_timeout(Duration::from_secs(secs));
        }

        let trigger = DeploymentTrigger::new(self.config.clone(), reconciler);
        if self.config.projects.iter().any(|p| p.notification.is_some()) {
            let notifier = ChatNotifier::new(Duration::from_secs(DEFAULT_NOTIFY_TIMEOUT_SECS))?;
            return Ok(trigger.with_notifier(notifier));
        }
        Ok(trigger)
    }

    /// Flushes the state store, logging failures.
    async fn close(&self) {
        if let Err(e) = self.store.close().await {
            warn!("Failed to close state store: {e}");
        }
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads `.env`, the configuration file and environment overrides.
fn load_config(config_file: &Path) -> Result<PilotConfig> {
    ConfigParser::new().load(config_file)
}

/// Creates the state store selected by the configuration.
async fn open_state_store(config: &PilotConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Memory => Arc::new(MemoryStateStore::new()),
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| PilotError::internal("S3 bucket not configured"))?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Arc::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };

    Ok(store)
}
