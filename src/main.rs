//! Clusterforge CLI entrypoint.
//!
//! This is the main entrypoint for the clusterforge command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clusterforge::cli::{Cli, Commands, DistroArgs, OutputFormat, OutputFormatter, StateCommands};
use clusterforge::config::{ClusterConfig, ConfigParser, ConfigValidator, find_config_file};
use clusterforge::error::{ForgeError, Result};
use clusterforge::phase::{ClusterPaths, PhaseContext, render_config};
use clusterforge::planner::{Checker, RulesManifest, rules_path};
use clusterforge::reconciler::{ApplyOptions, ClusterReconciler};
use clusterforge::runner::ToolPaths;
use clusterforge::state::{ClusterStateStore, open_store};

use clap::Parser;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose, cli.output);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let formatter = OutputFormatter::new(cli.output);
    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) if e.is_aborted_by_user() => {
            eprintln!("{e}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            if let Some(violations) = e.violations() {
                eprintln!("{}", formatter.format_violations(violations));
            }
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` takes precedence over the verbosity flag. Logs go to stderr,
/// as JSON lines when the output format is JSON.
fn init_logging(verbose: bool, output: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match output {
        OutputFormat::Text => builder.init(),
        OutputFormat::Json => builder.json().init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Diff { distro } => cmd_diff(cli.config.as_ref(), &distro, &formatter).await,
        Commands::Apply {
            distro,
            phase,
            start_from,
            skip_phase,
            dry_run,
            upgrade,
            force,
            kubeconfig,
            bin_path,
        } => {
            let loaded = load_cluster(cli.config.as_ref(), &distro).await?;
            let paths = kubeconfig
                .into_iter()
                .fold(ClusterPaths::new(&loaded.workdir, loaded.config.name()), |p, k| {
                    p.with_kubeconfig(k)
                });
            let ctx = PhaseContext {
                tools: ToolPaths::discover(&bin_dir(bin_path)),
                config: loaded.config,
                defaults: loaded.defaults,
                rendered: loaded.rendered,
                distro_dir: distro.distro_location,
                paths,
                store: loaded.store,
                dry_run,
                upgrade,
                force,
            };
            let options = ApplyOptions {
                phase,
                start_from,
                skip_phases: skip_phase,
            };
            cmd_apply(ctx, options, &formatter).await
        }
        Commands::State { distro, command } => {
            cmd_state(cli.config.as_ref(), &distro, command, &formatter).await
        }
    }
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_file(&config_file)?;

    let result = ConfigValidator::new().check(&config);
    println!("{}", formatter.format_validation(&config, &result, show_warnings));

    if result.errors.is_empty() {
        Ok(())
    } else {
        Err(ForgeError::internal(format!(
            "configuration has {} error(s)",
            result.errors.len()
        )))
    }
}

/// Show the changes since the last successful run.
async fn cmd_diff(
    config_path: Option<&PathBuf>,
    distro: &DistroArgs,
    formatter: &OutputFormatter,
) -> Result<()> {
    let loaded = load_cluster(config_path, distro).await?;

    let Some(stored) = loaded.store.get_config().await? else {
        eprintln!("No configuration applied yet for {}.", loaded.config.name());
        return Ok(());
    };

    let checker = match loaded.store.get_rendered_config().await? {
        Some(rendered) => Checker::from_stored_bytes(&rendered, loaded.rendered.clone())?,
        None => Checker::from_stored_bytes(&stored, loaded.config.tree.clone())?,
    };
    let changelog = checker.generate_diff();
    let manifest = RulesManifest::load(&rules_path(&distro.distro_location, loaded.config.kind()))?;
    let report = manifest
        .map(|m| Checker::evaluate(&changelog, &m))
        .unwrap_or_default();

    println!("{}", formatter.format_diff(&changelog, &report));
    Ok(())
}

/// Reconcile the cluster.
///
/// Ctrl-C stops every running tool; the run then fails with the tools'
/// errors and the lock is released.
async fn cmd_apply(ctx: PhaseContext, options: ApplyOptions, formatter: &OutputFormatter) -> Result<()> {
    let reconciler = Arc::new(ClusterReconciler::new(ctx, options));

    let mut task = {
        let reconciler = Arc::clone(&reconciler);
        tokio::spawn(async move { reconciler.run().await })
    };

    let joined = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, stopping running tools");
            if let Err(e) = reconciler.stop().await {
                error!("Failed to stop tools: {}", e);
            }
            task.await
        }
    };

    let result = joined.map_err(|e| ForgeError::internal(format!("apply task failed: {e}")))??;
    println!("{}", formatter.format_reconciliation(&result));
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    distro: &DistroArgs,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let config = load_config(&config_file)?;
    let store = open_store(&config, &workdir(distro, &config_file)).await?;

    match command {
        StateCommands::Show => {
            let state = store.load_upgrade_state().await?;
            let lock = store.get_lock_info().await?;
            println!(
                "{}",
                formatter.format_state(store.backend_type(), state.as_ref(), lock.as_ref())
            );
        }
        StateCommands::Unlock { force } => match store.get_lock_info().await? {
            None => eprintln!("State is not locked."),
            Some(_) if force => {
                store.force_unlock().await?;
                eprintln!("State forcefully unlocked.");
            }
            Some(lock) if lock.is_expired() => {
                store.release_lock(&lock.lock_id).await?;
                eprintln!("Expired lock of {} removed.", lock.holder);
            }
            Some(lock) => {
                eprintln!(
                    "State is locked by {} ({}) until {}. Use --force to remove the lock.",
                    lock.holder,
                    lock.operation,
                    lock.expires_at.format("%Y-%m-%d %H:%M")
                );
            }
        },
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// A cluster configuration with everything derived from it.
struct LoadedCluster {
    config: ClusterConfig,
    defaults: serde_json::Value,
    rendered: serde_json::Value,
    workdir: PathBuf,
    store: Arc<dyn ClusterStateStore>,
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

fn workdir(distro: &DistroArgs, config_file: &Path) -> PathBuf {
    distro
        .workdir
        .clone()
        .unwrap_or_else(|| config_dir(config_file))
}

/// Prefers `--bin-path`, then `~/.clusterforge/bin`.
fn bin_dir(bin_path: Option<PathBuf>) -> PathBuf {
    bin_path.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".clusterforge")
            .join("bin")
    })
}

/// Loads, overrides from the environment and validates the configuration.
fn load_config(config_file: &Path) -> Result<ClusterConfig> {
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{}", warning);
    }
    Ok(config)
}

/// Loads the configuration, renders it with the distribution defaults and
/// opens its state store.
async fn load_cluster(config_path: Option<&PathBuf>, distro: &DistroArgs) -> Result<LoadedCluster> {
    let config_file = resolve_config_path(config_path)?;
    let config = load_config(&config_file)?;

    let defaults = ConfigParser::load_defaults(&distro.distro_location, config.kind())?;
    let rendered = render_config(&config, &defaults)?;

    let workdir = workdir(distro, &config_file);
    let store: Arc<dyn ClusterStateStore> = Arc::from(open_store(&config, &workdir).await?);

    Ok(LoadedCluster {
        config,
        defaults,
        rendered,
        workdir,
        store,
    })
}
