use crate::supervisor::process_manager::ProcessSpec;
use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub intervals: IntervalConfig,
    pub thresholds: ThresholdConfig,
    pub monitoring: MonitoringConfig,
    pub restart: RestartConfig,
    pub features: FeatureConfig,
    pub webhook: WebhookConfig,
    pub persistence: PersistenceConfig,
    pub logging: LoggingConfig,
    pub shutdown: ShutdownConfig,
    /// Processes started and kept alive by the supervisor
    pub processes: Vec<ProcessSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntervalConfig {
    /// Base interval of the health-check loop
    pub health_check_secs: u64,
    /// Base interval of the managed-process resource loop
    pub resource_check_secs: u64,
    /// Base interval of the adaptive optimizer loop
    pub optimization_secs: u64,
    /// How often old state backups are thinned out
    pub backup_cleanup_secs: u64,
    /// Lower bound for any adapted interval
    pub min_interval_secs: u64,
    /// Upper bound for any adapted interval
    pub max_interval_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            health_check_secs: 30,
            resource_check_secs: 15,
            optimization_secs: 300,
            backup_cleanup_secs: 3600,
            min_interval_secs: 5,
            max_interval_secs: 300,
        }
    }
}

impl IntervalConfig {
    pub fn health_check(&self) -> Duration {
        Duration::from_secs(self.health_check_secs)
    }

    pub fn resource_check(&self) -> Duration {
        Duration::from_secs(self.resource_check_secs)
    }

    pub fn optimization(&self) -> Duration {
        Duration::from_secs(self.optimization_secs)
    }

    pub fn backup_cleanup(&self) -> Duration {
        Duration::from_secs(self.backup_cleanup_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    /// Above this the supervisor runs an emergency reclamation pass
    pub memory_emergency_percent: f64,
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    /// Above this managed processes are de-prioritized
    pub cpu_emergency_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    /// Thread count above which the health score is penalized
    pub max_threads: usize,
    /// Explicit memory limit for the supervisor; system memory when unset
    pub memory_limit_mb: Option<u64>,
    /// Resident growth above this rate is treated as a leak
    pub max_memory_growth_rate_mb_per_hour: f64,
    /// Open-handle growth between two samples treated as a leak
    pub object_growth_threshold: u64,
    /// Relative CPU/memory increase over baseline treated as degradation
    pub performance_degradation_percent: f64,
    /// Per managed process memory limit
    pub process_memory_limit_mb: u64,
    /// Per managed process CPU limit
    pub process_cpu_limit_percent: f64,
    /// Health score below which an emergency restart is scheduled
    pub emergency_restart_score: f64,
    /// Health score below which cycles count towards emergency shutdown
    pub fatal_score: f64,
    /// Consecutive fatal cycles before emergency shutdown
    pub fatal_cycles: u32,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            memory_warning_percent: 75.0,
            memory_critical_percent: 90.0,
            memory_emergency_percent: 95.0,
            cpu_warning_percent: 70.0,
            cpu_critical_percent: 90.0,
            cpu_emergency_percent: 98.0,
            disk_warning_percent: 80.0,
            disk_critical_percent: 95.0,
            max_threads: 50,
            memory_limit_mb: None,
            max_memory_growth_rate_mb_per_hour: 10.0,
            object_growth_threshold: 500,
            performance_degradation_percent: 50.0,
            process_memory_limit_mb: 1024,
            process_cpu_limit_percent: 90.0,
            emergency_restart_score: 0.1,
            fatal_score: 0.05,
            fatal_cycles: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub memory_history: usize,
    pub performance_history: usize,
    pub snapshot_history: usize,
    pub process_history: usize,
    /// Samples considered by leak detection
    pub leak_window: usize,
    /// Samples averaged into the performance baseline
    pub baseline_samples: usize,
    /// Recent samples compared against the baseline
    pub degradation_window: usize,
    /// Minimum seconds between routine reclamation passes
    pub gc_frequency_secs: u64,
    /// Timeout for per-process health checks
    pub health_check_timeout_secs: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            memory_history: 1000,
            performance_history: 2000,
            snapshot_history: 1000,
            process_history: 100,
            leak_window: 30,
            baseline_samples: 50,
            degradation_window: 10,
            gc_frequency_secs: 300,
            health_check_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Restarts allowed per process before it is marked failed
    pub max_retries: u32,
    /// Base restart delay
    pub retry_delay_secs: u64,
    /// Default strategy for processes that don't name one
    pub exponential_backoff: bool,
    pub max_retry_delay_secs: u64,
    /// Wait after SIGTERM before force-killing
    pub termination_timeout_secs: u64,
    /// Delay before an emergency restart of all processes
    pub emergency_restart_delay_secs: u64,
    /// Niceness increment applied under CPU emergency
    pub priority_penalty: i32,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay_secs: 5,
            exponential_backoff: true,
            max_retry_delay_secs: 300,
            termination_timeout_secs: 10,
            emergency_restart_delay_secs: 60,
            priority_penalty: 10,
        }
    }
}

impl RestartConfig {
    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::from_secs(self.max_retry_delay_secs)
    }

    pub fn termination_timeout(&self) -> Duration {
        Duration::from_secs(self.termination_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureConfig {
    pub enable_auto_restart: bool,
    pub enable_self_healing: bool,
    pub enable_graceful_degradation: bool,
    pub enable_predictive_alerts: bool,
    /// Collect disk/network/CPU topology alongside the samplers
    pub enable_system_metrics: bool,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            enable_auto_restart: true,
            enable_self_healing: true,
            enable_graceful_degradation: true,
            enable_predictive_alerts: true,
            enable_system_metrics: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    /// Snapshots are POSTed here when set
    pub url: Option<String>,
    pub timeout_secs: u64,
    pub failure_threshold: u32,
    pub recovery_timeout_secs: u64,
    pub half_open_max_calls: u32,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_secs: 10,
            failure_threshold: 5,
            recovery_timeout_secs: 60,
            half_open_max_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// State file name, relative to the base directory
    pub state_file: String,
    /// Backup directory, relative to the base directory
    pub backup_dir: String,
    /// Backups older than this are always removed
    pub retention_days: u32,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_file: "supervisor_state.json".to_string(),
            backup_dir: "backups".to_string(),
            retention_days: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Enable JSON formatted logs
    pub json: bool,
    /// Log directory, relative to the base directory
    pub directory: String,
    /// Daily log files kept on disk
    pub retention_days: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: "logs".to_string(),
            retention_days: 14,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Per-process wait before force-kill during graceful shutdown
    pub graceful_timeout_secs: u64,
    /// Hard deadline for the emergency path before the process force-exits
    pub emergency_exit_timeout_secs: u64,
    /// Accumulated loop errors that trigger emergency shutdown
    pub max_loop_errors: u32,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_timeout_secs: 30,
            emergency_exit_timeout_secs: 5,
            max_loop_errors: 50,
        }
    }
}

impl SupervisorConfig {
    /// Load configuration from an optional JSON file plus `VIGIL__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Json).required(true));
        }

        builder = builder.add_source(
            Environment::with_prefix("VIGIL")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Tighten thresholds for a host that is already under pressure
    pub fn apply_emergency_mode(&mut self) {
        let t = &mut self.thresholds;
        t.memory_warning_percent = (t.memory_warning_percent - 15.0).max(40.0);
        t.memory_critical_percent = (t.memory_critical_percent - 10.0).max(t.memory_warning_percent + 5.0);
        t.memory_emergency_percent = (t.memory_emergency_percent - 5.0).max(t.memory_critical_percent);
        t.cpu_warning_percent = (t.cpu_warning_percent - 15.0).max(40.0);
        t.cpu_critical_percent = (t.cpu_critical_percent - 10.0).max(t.cpu_warning_percent + 5.0);
        t.cpu_emergency_percent = (t.cpu_emergency_percent - 5.0).max(t.cpu_critical_percent);
        t.max_memory_growth_rate_mb_per_hour /= 2.0;

        self.intervals.health_check_secs =
            (self.intervals.health_check_secs / 2).max(self.intervals.min_interval_secs.max(1));
    }

    /// Favour keeping processes alive after a crash
    pub fn apply_recovery_mode(&mut self) {
        self.restart.max_retries = (self.restart.max_retries.saturating_mul(2)).max(10);
        self.features.enable_auto_restart = true;
        self.features.enable_self_healing = true;
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let t = &self.thresholds;

        if t.memory_warning_percent >= t.memory_critical_percent {
            errors.push("memory_warning_percent must be below memory_critical_percent".to_string());
        }
        if t.memory_critical_percent > t.memory_emergency_percent {
            errors.push("memory_critical_percent must not exceed memory_emergency_percent".to_string());
        }
        if t.cpu_warning_percent >= t.cpu_critical_percent {
            errors.push("cpu_warning_percent must be below cpu_critical_percent".to_string());
        }
        if t.cpu_critical_percent > t.cpu_emergency_percent {
            errors.push("cpu_critical_percent must not exceed cpu_emergency_percent".to_string());
        }
        if t.disk_warning_percent >= t.disk_critical_percent {
            errors.push("disk_warning_percent must be below disk_critical_percent".to_string());
        }

        let i = &self.intervals;
        if i.health_check_secs == 0 || i.resource_check_secs == 0 || i.optimization_secs == 0 {
            errors.push("check intervals must be positive".to_string());
        }
        if i.min_interval_secs > i.max_interval_secs {
            errors.push("min_interval_secs must not exceed max_interval_secs".to_string());
        }

        if self.restart.max_retry_delay_secs < self.restart.retry_delay_secs {
            errors.push("max_retry_delay_secs must be at least retry_delay_secs".to_string());
        }

        if self.monitoring.leak_window < 2 {
            errors.push("leak_window must cover at least two samples".to_string());
        }

        let mut names = HashSet::new();
        for spec in &self.processes {
            if spec.command.trim().is_empty() {
                errors.push(format!("process {} has an empty command", spec.name));
            }
            if !names.insert(spec.name.as_str()) {
                errors.push(format!("duplicate process name: {}", spec.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
