use anyhow::Context;
use clap::Parser;
use std::path::Path;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{Builder as RollingBuilder, Rotation};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};
use vigil::cli::{self, Cli, Commands};
use vigil::config::{LoggingConfig, SupervisorConfig};
use vigil::coordination::install_signal_handlers;
use vigil::error::VigilError;
use vigil::supervisor::{Supervisor, SupervisorOptions};

const STARTUP_FAILURE: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("vigil: {:#}", e);
            ExitCode::from(STARTUP_FAILURE)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = SupervisorConfig::load(cli.config.as_deref()).with_context(|| {
        match &cli.config {
            Some(path) => format!("failed to load config from {}", path.display()),
            None => "failed to load config from environment".to_string(),
        }
    })?;
    cli.apply_modes(&mut config);

    if let Err(errors) = config.validate() {
        return Err(VigilError::InvalidConfig(errors.join("; ")).into());
    }

    let base_dir = cli.resolve_base_dir();

    if let Commands::Status { json } = cli.command() {
        init_logging_simple();
        cli::show_status(&base_dir, &config, json)?;
        return Ok(ExitCode::SUCCESS);
    }

    std::fs::create_dir_all(&base_dir)
        .with_context(|| format!("cannot create base directory {}", base_dir.display()))?;
    let _guard = init_logging(&base_dir, &config.logging);

    if cli.emergency_mode {
        info!("Emergency mode: thresholds tightened");
    }
    if cli.recovery_mode {
        info!("Recovery mode: max_retries={}, degradation reset", config.restart.max_retries);
    }

    let options = SupervisorOptions {
        base_dir,
        reset_degradation: cli.recovery_mode,
        force_exit_on_emergency: true,
    };
    let supervisor = Supervisor::new(config, options).context("supervisor initialization failed")?;
    install_signal_handlers(supervisor.shutdown_handle()).context("cannot install signal handlers")?;

    let outcome = supervisor.run().await?;
    info!("Supervisor exited: {:?}", outcome);
    Ok(ExitCode::from(outcome.exit_code()))
}

/// Console plus daily-rolling file logging. The returned guard flushes the
/// file writer and must live until exit.
fn init_logging(base_dir: &Path, logging: &LoggingConfig) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let log_dir = base_dir.join(&logging.directory);
    let appender = std::fs::create_dir_all(&log_dir)
        .map_err(|e| e.to_string())
        .and_then(|_| {
            RollingBuilder::new()
                .rotation(Rotation::DAILY)
                .filename_prefix("vigil")
                .filename_suffix("log")
                .max_log_files(logging.retention_days.max(1))
                .build(&log_dir)
                .map_err(|e| e.to_string())
        });

    let (file_layer, guard) = match appender {
        Ok(appender) => {
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = if logging.json {
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(writer)
                    .with_ansi(false)
                    .boxed()
            } else {
                tracing_subscriber::fmt::layer()
                    .with_writer(writer)
                    .with_ansi(false)
                    .with_target(true)
                    .boxed()
            };
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!(
                "Warning: Could not open log directory {} ({}), file logging disabled",
                log_dir.display(),
                e
            );
            (None, None)
        }
    };

    let console_layer = if logging.json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    if guard.is_some() {
        eprintln!("Logging to: {}", log_dir.display());
    }
    guard
}

fn init_logging_simple() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}
