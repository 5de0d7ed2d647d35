#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! CLI entry point for the energy usage job.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use chrono::Utc;
use clap::{Parser, Subcommand};
use energy_usage_cli_utils::{IndicatifProgress, LogFormat, MultiProgress, init_logger};
use energy_usage_config::parameters::{
    EnvParameters, LayeredParameters, ParameterName, ParameterSource as _, TomlParameters,
};
use energy_usage_config::{DEFAULT_SERVICE_NAME, RunConfiguration, environment, resolve};
use energy_usage_ingest::{Coordinator, RunError, deliver, skip_disabled};
use energy_usage_models::{Commodity, RunResult};
use energy_usage_notify::{LogNotifier, Notify, WebhookNotifier};
use energy_usage_source::fetch::HttpFetcher;
use energy_usage_warehouse::DuckDbWarehouse;
use tokio_util::sync::CancellationToken;

/// Exit code for fatal errors (bad configuration, warehouse unavailable).
const FATAL_EXIT_CODE: u8 = 3;

/// Environment name used when neither `--env` nor the environment sets one.
const DEFAULT_ENVIRONMENT: &str = "local";

#[derive(Parser)]
#[command(name = "energy_usage_ingest", about = "Energy usage ELT job")]
struct Cli {
    /// Parameter file with one `[environments.<name>]` table per environment.
    /// Environment variables take precedence over values in the file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Environment to run as (overrides `CRUK_ENVIRONMENT_NAME`)
    #[arg(long, global = true)]
    env: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, parse, and load every configured file (default)
    Run,
    /// Print the resolved configuration as JSON, with secrets masked
    Config,
    /// Print the number of stored records per commodity
    Count,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let format = if environment::is_running_in_container() {
        LogFormat::Json {
            log_name: EnvParameters
                .get(ParameterName::ServiceName)
                .unwrap_or_else(|| DEFAULT_SERVICE_NAME.to_owned()),
        }
    } else {
        LogFormat::Pretty
    };
    let multi = init_logger(&format);
    environment::log_environment();

    match dispatch(cli, &multi).await {
        Ok(code) => code,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

async fn dispatch(cli: Cli, multi: &MultiProgress) -> Result<ExitCode, RunError> {
    let environment_name = cli
        .env
        .or_else(|| EnvParameters.get(ParameterName::EnvironmentName))
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_owned());
    let params = parameters(cli.config.as_deref(), &environment_name)?;
    let config = resolve(&environment_name, &params)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => Ok(run(config, multi).await),
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config.redacted())?);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Count => {
            let warehouse = DuckDbWarehouse::open(&config.warehouse)?;
            for commodity in Commodity::ALL {
                println!(
                    "{commodity}: {}",
                    warehouse.record_count(Some(commodity))?
                );
            }
            println!("total: {}", warehouse.record_count(None)?);
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Environment variables first, then the parameter file if one was given.
fn parameters(
    config_file: Option<&Path>,
    environment_name: &str,
) -> Result<LayeredParameters, RunError> {
    let mut params = LayeredParameters::new().then(EnvParameters);
    if let Some(path) = config_file {
        params = params.then(TomlParameters::from_path(path, environment_name)?);
        log::info!("Loaded parameters for {environment_name} from {}", path.display());
    }
    Ok(params)
}

fn notifier(config: &RunConfiguration) -> Arc<dyn Notify> {
    let Some(url) = &config.notification_url else {
        return Arc::new(LogNotifier);
    };
    match WebhookNotifier::new(url) {
        Ok(notifier) => Arc::new(notifier),
        Err(e) => {
            log::warn!("Notification webhook unavailable, logging the summary instead: {e}");
            Arc::new(LogNotifier)
        }
    }
}

async fn run(config: RunConfiguration, multi: &MultiProgress) -> ExitCode {
    let started_at = Utc::now();
    let config = Arc::new(config);
    let notifier = notifier(&config);

    if !config.enabled {
        let result = skip_disabled(&config, notifier.as_ref()).await;
        return ExitCode::from(result.status.exit_code());
    }

    let identity = config.warehouse.clone();
    let opened = tokio::task::spawn_blocking(move || DuckDbWarehouse::open(&identity)).await;
    let warehouse = match opened {
        Ok(Ok(warehouse)) => warehouse,
        Ok(Err(e)) => return abort(&config, notifier.as_ref(), &RunError::from(e), started_at).await,
        Err(e) => {
            let error = RunError::Warehouse(energy_usage_warehouse::LoadError::Join {
                message: e.to_string(),
            });
            return abort(&config, notifier.as_ref(), &error, started_at).await;
        }
    };

    let fetcher = match HttpFetcher::new(config.fetch) {
        Ok(fetcher) => fetcher,
        Err(e) => return abort(&config, notifier.as_ref(), &RunError::from(e), started_at).await,
    };

    let cancel = CancellationToken::new();
    tokio::spawn(cancel_on_shutdown(cancel.clone()));

    let result = Coordinator::new(config, Arc::new(fetcher), Arc::new(warehouse), notifier)
        .with_progress(IndicatifProgress::files_bar(multi, "Loading"))
        .with_cancellation(cancel)
        .run()
        .await;

    ExitCode::from(result.status.exit_code())
}

/// Reports a run that could not start and returns the fatal exit code.
async fn abort(
    config: &RunConfiguration,
    notifier: &dyn Notify,
    error: &RunError,
    started_at: chrono::DateTime<Utc>,
) -> ExitCode {
    log::error!("Run aborted: {error}");
    let result = RunResult::aborted(&config.environment_name, error.to_string(), started_at);
    deliver(notifier, &result).await;
    ExitCode::from(FATAL_EXIT_CODE)
}

/// Cancels `token` on Ctrl-C or SIGTERM.
async fn cancel_on_shutdown(token: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let Ok(mut terminate) = signal(SignalKind::terminate()) else {
            log::warn!("Could not install SIGTERM handler");
            return;
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
    }

    log::warn!("Shutdown requested; finishing in-flight loads and skipping the rest");
    token.cancel();
}
