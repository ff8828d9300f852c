use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::persistence::retention::RetentionPolicy;
use crate::persistence::state_store::{StatePayload, StateStore};

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(version)]
#[command(about = "Long-running process supervisor with self-healing and crash-safe state", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// JSON config file path
    #[arg(short, long, global = true, env = "VIGIL_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for state, backups and logs
    #[arg(long, global = true, env = "VIGIL_BASE_DIR")]
    pub base_dir: Option<PathBuf>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, global = true, value_enum)]
    pub log_level: Option<LogLevel>,

    /// Tighten thresholds at startup
    #[arg(long, global = true)]
    pub emergency_mode: bool,

    /// Raise the restart budget, force self-healing and reset degradation
    #[arg(long, global = true)]
    pub recovery_mode: bool,

    /// Emit JSON formatted logs
    #[arg(long, global = true)]
    pub json_logs: bool,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Commands {
    /// Start the supervisor (default)
    Run,
    /// Show the persisted supervisor state
    Status {
        /// Print the raw payload as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
#[value(rename_all = "UPPER")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// Directive understood by `EnvFilter`
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Run)
    }

    /// `--base-dir`, else the platform data directory, else `./.vigil`
    pub fn resolve_base_dir(&self) -> PathBuf {
        self.base_dir
            .clone()
            .or_else(|| dirs::data_local_dir().map(|d| d.join("vigil")))
            .unwrap_or_else(|| PathBuf::from(".vigil"))
    }

    /// Apply the startup mode flags to a loaded config
    pub fn apply_modes(&self, config: &mut SupervisorConfig) {
        if self.emergency_mode {
            config.apply_emergency_mode();
        }
        if self.recovery_mode {
            config.apply_recovery_mode();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        if let Some(level) = self.log_level {
            config.logging.level = level.as_filter().to_string();
        }
    }
}

#[derive(Debug, Serialize, Tabled)]
struct SummaryRow {
    #[tabled(rename = "Field")]
    field: &'static str,
    #[tabled(rename = "Value")]
    value: String,
}

#[derive(Debug, Serialize, Tabled)]
struct ProcessRow {
    #[tabled(rename = "Process")]
    name: String,
    #[tabled(rename = "PID")]
    pid: String,
    #[tabled(rename = "Status")]
    status: String,
    #[tabled(rename = "Restarts")]
    restarts: u32,
}

fn summary_rows(state: &StatePayload, source: String) -> Vec<SummaryRow> {
    let mut rows = vec![
        SummaryRow { field: "source", value: source },
        SummaryRow { field: "was_running", value: state.was_running.to_string() },
        SummaryRow { field: "health_state", value: state.health_state.to_string() },
        SummaryRow { field: "health_score", value: format!("{:.3}", state.health_score) },
        SummaryRow { field: "degradation_level", value: state.degradation_level.to_string() },
        SummaryRow { field: "uptime_secs", value: state.uptime_secs.to_string() },
        SummaryRow { field: "restart_count", value: state.restart_count.to_string() },
        SummaryRow { field: "error_count", value: state.error_count.to_string() },
        SummaryRow { field: "unclean_shutdowns", value: state.unclean_shutdowns.to_string() },
    ];
    if let Some(marker) = &state.emergency {
        rows.push(SummaryRow {
            field: "emergency",
            value: format!("{} ({})", marker.reason, marker.triggered_at.to_rfc3339()),
        });
    }
    rows
}

/// Print the persisted state found under `base_dir`
pub fn show_status(base_dir: &Path, config: &SupervisorConfig, json: bool) -> Result<()> {
    let store = StateStore::from_config(
        base_dir,
        &config.persistence,
        RetentionPolicy::new(config.intervals.health_check(), config.persistence.retention_days),
    );
    let (state, source) = store.load_with_source();

    if json {
        println!("{}", serde_json::to_string_pretty(&state)?);
        return Ok(());
    }

    println!("State file: {}", store.state_path().display());
    println!("{}", Table::new(summary_rows(&state, source.to_string())));

    if state.managed_processes.is_empty() {
        println!("No managed processes recorded");
    } else {
        let rows: Vec<ProcessRow> = state
            .managed_processes
            .iter()
            .map(|p| ProcessRow {
                name: p.name.clone(),
                pid: p.pid.map(|pid| pid.to_string()).unwrap_or_else(|| "-".to_string()),
                status: p.status.to_string(),
                restarts: p.restart_count,
            })
            .collect();
        println!("{}", Table::new(rows));
    }
    Ok(())
}
