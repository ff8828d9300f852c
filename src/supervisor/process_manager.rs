//! Managed child processes
//!
//! Owns one entry per configured process. Lifecycle transitions on an entry
//! run under that entry's lock, so two restarts of the same process never
//! overlap while different processes restart concurrently. Restart backoff
//! sleeps outside the lock; a pending restart is visible as `Restarting`.

use super::health_check::{HealthCheck, HealthCheckResult};
use crate::config::SupervisorConfig;
use crate::error::{Result, VigilError};
use crate::monitoring::probe::{open_handle_count, socket_count, thread_count};
use crate::monitoring::ring_buffer::RingBuffer;
use crate::persistence::state_store::ProcessRecord;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Restarting,
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Starting => write!(f, "starting"),
            ProcessStatus::Running => write!(f, "running"),
            ProcessStatus::Stopping => write!(f, "stopping"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Failed => write!(f, "failed"),
            ProcessStatus::Restarting => write!(f, "restarting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestartStrategy {
    Immediate,
    Linear,
    ExponentialBackoff,
}

impl RestartStrategy {
    /// Delay before restart attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32, base: Duration, max: Duration) -> Duration {
        let attempt = attempt.max(1);
        match self {
            RestartStrategy::Immediate => Duration::ZERO,
            RestartStrategy::Linear => base.saturating_mul(attempt).min(max),
            RestartStrategy::ExponentialBackoff => {
                let factor = 2u32.saturating_pow(attempt - 1);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

impl std::fmt::Display for RestartStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RestartStrategy::Immediate => write!(f, "immediate"),
            RestartStrategy::Linear => write!(f, "linear"),
            RestartStrategy::ExponentialBackoff => write!(f, "exponential_backoff"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub url: String,
    #[serde(default = "default_health_timeout")]
    pub timeout_secs: u64,
}

fn default_health_timeout() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

/// One supervised process as described in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// `KEY=VALUE` pairs added to the inherited environment
    #[serde(default)]
    pub env: Vec<String>,
    /// Falls back to the `restart.exponential_backoff` default when unset
    #[serde(default)]
    pub restart_strategy: Option<RestartStrategy>,
    /// Non-essential processes are stopped first when the supervisor degrades
    #[serde(default = "default_true")]
    pub essential: bool,
    #[serde(default)]
    pub cpu_affinity: Option<Vec<usize>>,
    #[serde(default)]
    pub nice: Option<i32>,
    #[serde(default)]
    pub health_check: Option<HealthCheckSpec>,
}

impl ProcessSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            restart_strategy: None,
            essential: true,
            cpu_affinity: None,
            nice: None,
            health_check: None,
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn strategy(mut self, strategy: RestartStrategy) -> Self {
        self.restart_strategy = Some(strategy);
        self
    }

    pub fn non_essential(mut self) -> Self {
        self.essential = false;
        self
    }
}

/// Per-process resource reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMetrics {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub memory_percent: f64,
    pub threads: usize,
    pub connections: usize,
    pub open_files: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ProcessIssue {
    HighMemory { memory_mb: f64 },
    HighCpu { cpu_percent: f64 },
    CustomHealthCheckFailed { detail: Option<String> },
    Exited { code: Option<i32> },
}

impl ProcessIssue {
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessIssue::HighMemory { .. } => "high_memory",
            ProcessIssue::HighCpu { .. } => "high_cpu",
            ProcessIssue::CustomHealthCheckFailed { .. } => "custom_health_check_failed",
            ProcessIssue::Exited { .. } => "exited",
        }
    }
}

/// Result of one `monitor()` pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessReport {
    pub name: String,
    pub status: ProcessStatus,
    pub metrics: Option<ProcessMetrics>,
    pub issues: Vec<ProcessIssue>,
}

impl ProcessReport {
    pub fn has(&self, kind: &str) -> bool {
        self.issues.iter().any(|i| i.kind() == kind)
    }
}

pub struct ManagedProcess {
    pub spec: ProcessSpec,
    pub strategy: RestartStrategy,
    pub start_time: Option<DateTime<Utc>>,
    pub status: ProcessStatus,
    pub restart_count: u32,
    pub last_restart_time: Option<DateTime<Utc>>,
    pub health_check: Option<Arc<dyn HealthCheck>>,
    pub performance_history: RingBuffer<ProcessMetrics>,
    pub error_count: u32,
    pub niceness: i32,
    /// A restart has terminated the process and is waiting out its backoff
    restart_pending: bool,
    child: Option<Child>,
}

impl ManagedProcess {
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    pub fn is_live(&self) -> bool {
        self.child.is_some()
    }
}

struct ProcessSlot {
    /// Mirrors the live child's pid (0 when none) for lock-free emergency kills
    pid: AtomicU32,
    /// Mirrors `restart_count` so records never block on a busy entry
    restarts: AtomicU32,
    process: Mutex<ManagedProcess>,
}

impl ProcessSlot {
    fn record_restart(&self, process: &mut ManagedProcess) -> u32 {
        process.restart_count += 1;
        process.last_restart_time = Some(Utc::now());
        self.restarts.store(process.restart_count, Ordering::SeqCst);
        process.restart_count
    }
}

#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub default_strategy: RestartStrategy,
    pub termination_timeout: Duration,
    pub history_capacity: usize,
    pub memory_limit_mb: f64,
    pub cpu_limit_percent: f64,
    pub health_check_timeout: Duration,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            retry_delay: Duration::from_secs(5),
            max_retry_delay: Duration::from_secs(300),
            default_strategy: RestartStrategy::ExponentialBackoff,
            termination_timeout: Duration::from_secs(10),
            history_capacity: 100,
            memory_limit_mb: 1024.0,
            cpu_limit_percent: 90.0,
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

impl ProcessManagerConfig {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            max_retries: config.restart.max_retries,
            retry_delay: config.restart.retry_delay(),
            max_retry_delay: config.restart.max_retry_delay(),
            default_strategy: if config.restart.exponential_backoff {
                RestartStrategy::ExponentialBackoff
            } else {
                RestartStrategy::Linear
            },
            termination_timeout: config.restart.termination_timeout(),
            history_capacity: config.monitoring.process_history,
            memory_limit_mb: config.thresholds.process_memory_limit_mb as f64,
            cpu_limit_percent: config.thresholds.process_cpu_limit_percent,
            health_check_timeout: Duration::from_secs(config.monitoring.health_check_timeout_secs),
        }
    }
}

pub struct ProcessManager {
    config: ProcessManagerConfig,
    processes: RwLock<HashMap<String, Arc<ProcessSlot>>>,
    system: std::sync::Mutex<System>,
    total_restarts: AtomicU64,
}

impl ProcessManager {
    pub fn new(config: ProcessManagerConfig) -> Self {
        Self {
            config,
            processes: RwLock::new(HashMap::new()),
            system: std::sync::Mutex::new(System::new()),
            total_restarts: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(ProcessManagerConfig::default())
    }

    pub fn config(&self) -> &ProcessManagerConfig {
        &self.config
    }

    /// Register and launch a process. Returns false when the spawn failed;
    /// a failed spawn leaves the entry `Stopped`.
    pub async fn start(
        &self,
        spec: ProcessSpec,
        health_check: Option<Arc<dyn HealthCheck>>,
    ) -> Result<bool> {
        self.launch(spec, health_check, None).await
    }

    /// Like `start`, but carry over the restart count and failure status
    /// recorded by a previous supervisor run. A process recorded as `Failed`
    /// is registered without being spawned.
    pub async fn resume(
        &self,
        spec: ProcessSpec,
        health_check: Option<Arc<dyn HealthCheck>>,
        record: &ProcessRecord,
    ) -> Result<bool> {
        self.launch(spec, health_check, Some(record)).await
    }

    async fn launch(
        &self,
        spec: ProcessSpec,
        health_check: Option<Arc<dyn HealthCheck>>,
        prior: Option<&ProcessRecord>,
    ) -> Result<bool> {
        let name = spec.name.clone();
        let restart_count = prior.map(|r| r.restart_count).unwrap_or(0);
        let failed = prior.is_some_and(|r| r.status == ProcessStatus::Failed);

        let slot = {
            let mut processes = self.processes.write().await;
            if processes.contains_key(&name) {
                return Err(VigilError::DuplicateProcess(name));
            }

            let strategy = spec.restart_strategy.unwrap_or(self.config.default_strategy);
            let niceness = spec.nice.unwrap_or(0);
            let slot = Arc::new(ProcessSlot {
                pid: AtomicU32::new(0),
                restarts: AtomicU32::new(restart_count),
                process: Mutex::new(ManagedProcess {
                    spec,
                    strategy,
                    start_time: None,
                    status: ProcessStatus::Starting,
                    restart_count,
                    last_restart_time: None,
                    health_check,
                    performance_history: RingBuffer::labeled(
                        "process_history",
                        self.config.history_capacity,
                    ),
                    error_count: 0,
                    niceness,
                    restart_pending: false,
                    child: None,
                }),
            });
            processes.insert(name.clone(), slot.clone());
            slot
        };

        let mut process = slot.process.lock().await;
        if failed {
            process.status = ProcessStatus::Failed;
            warn!(
                process = %name,
                restart_count,
                "Process failed in a previous run, not starting"
            );
            return Ok(false);
        }

        match spawn_into(&slot, &mut process) {
            Ok(pid) => {
                info!(process = %name, pid, restart_count, "Process started");
                Ok(true)
            }
            Err(e) => {
                process.status = ProcessStatus::Stopped;
                process.error_count += 1;
                error!(process = %name, "Failed to start process: {}", e);
                Ok(false)
            }
        }
    }

    /// Terminate processes left running by a previous supervisor run.
    ///
    /// Only pids that still exist and whose executable name matches the
    /// configured command are signalled, so a recycled pid is left alone.
    pub async fn reap_orphans(&self, records: &[ProcessRecord], specs: &[ProcessSpec]) -> usize {
        let mut reaped = 0;
        for record in records {
            let Some(pid) = record.pid else { continue };
            let Some(spec) = specs.iter().find(|s| s.name == record.name) else {
                continue;
            };
            if !self.is_orphan(pid, &spec.command) {
                debug!(process = %record.name, pid, "Recorded pid is gone or reused");
                continue;
            }

            warn!(process = %record.name, pid, "Terminating process left by previous run");
            request_termination(pid);
            let deadline = tokio::time::Instant::now() + self.config.termination_timeout;
            while self.is_orphan(pid, &spec.command) {
                if tokio::time::Instant::now() >= deadline {
                    warn!(process = %record.name, pid, "Orphan ignored SIGTERM, killing");
                    force_kill(pid);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            reaped += 1;
        }
        reaped
    }

    fn is_orphan(&self, pid: u32, command: &str) -> bool {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sys_pid = Pid::from_u32(pid);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new(),
        );
        let Some(process) = system.process(sys_pid) else {
            return false;
        };
        if process.status() == sysinfo::ProcessStatus::Zombie {
            return false;
        }

        let name = process.name().to_string_lossy();
        let expected = Path::new(command)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.to_string());
        // Linux truncates process names to 15 bytes
        !name.is_empty() && expected.starts_with(name.as_ref())
    }

    async fn slot(&self, name: &str) -> Result<Arc<ProcessSlot>> {
        self.processes
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| VigilError::ProcessNotFound(name.to_string()))
    }

    async fn slots(&self) -> Vec<(String, Arc<ProcessSlot>)> {
        let processes = self.processes.read().await;
        let mut slots: Vec<_> = processes
            .iter()
            .map(|(name, slot)| (name.clone(), slot.clone()))
            .collect();
        slots.sort_by(|a, b| a.0.cmp(&b.0));
        slots
    }

    pub async fn names(&self) -> Vec<String> {
        self.slots().await.into_iter().map(|(name, _)| name).collect()
    }

    pub async fn status(&self, name: &str) -> Result<ProcessStatus> {
        Ok(self.slot(name).await?.process.lock().await.status)
    }

    pub async fn restart_count(&self, name: &str) -> Result<u32> {
        Ok(self.slot(name).await?.process.lock().await.restart_count)
    }

    pub async fn is_essential(&self, name: &str) -> Result<bool> {
        Ok(self.slot(name).await?.process.lock().await.spec.essential)
    }

    /// Restarts performed across all processes since the supervisor started
    pub fn total_restarts(&self) -> u64 {
        self.total_restarts.load(Ordering::SeqCst)
    }

    /// Check liveness, sample resources and run the custom health check
    pub async fn monitor(&self, name: &str) -> Result<ProcessReport> {
        let slot = self.slot(name).await?;
        let mut process = slot.process.lock().await;
        let mut issues = Vec::new();

        let exit = match process.child.as_mut() {
            Some(child) => child.try_wait()?,
            None => None,
        };
        if let Some(exit) = exit {
            process.child = None;
            slot.pid.store(0, Ordering::SeqCst);
            process.status = ProcessStatus::Stopped;
            warn!(process = %name, "Process exited with {}", exit);
            issues.push(ProcessIssue::Exited { code: exit.code() });
        }

        let Some(pid) = process.pid() else {
            return Ok(ProcessReport {
                name: name.to_string(),
                status: process.status,
                metrics: None,
                issues,
            });
        };

        let metrics = self.sample(pid);
        if let Some(metrics) = &metrics {
            if metrics.memory_mb > self.config.memory_limit_mb {
                issues.push(ProcessIssue::HighMemory {
                    memory_mb: metrics.memory_mb,
                });
            }
            if metrics.cpu_percent > self.config.cpu_limit_percent {
                issues.push(ProcessIssue::HighCpu {
                    cpu_percent: metrics.cpu_percent,
                });
            }
            process.performance_history.push(metrics.clone());
        }

        let health_check = process.health_check.clone();
        let status = process.status;
        drop(process);

        if let Some(check) = health_check {
            let result = match tokio::time::timeout(self.config.health_check_timeout, check.check()).await {
                Ok(result) => result,
                Err(_) => HealthCheckResult::unhealthy("health check timed out"),
            };
            if !result.healthy {
                warn!(process = %name, "Health check failed: {:?}", result.detail);
                issues.push(ProcessIssue::CustomHealthCheckFailed {
                    detail: result.detail,
                });
            }
        }

        for issue in &issues {
            debug!(process = %name, issue = issue.kind(), "Process issue detected");
        }

        Ok(ProcessReport {
            name: name.to_string(),
            status,
            metrics,
            issues,
        })
    }

    fn sample(&self, pid: u32) -> Option<ProcessMetrics> {
        let mut system = self.system.lock().unwrap_or_else(|p| p.into_inner());
        let sys_pid = Pid::from_u32(pid);
        system.refresh_memory();
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[sys_pid]),
            true,
            ProcessRefreshKind::new().with_cpu().with_memory(),
        );

        let total = system.total_memory().max(1) as f64;
        let process = system.process(sys_pid)?;
        let memory = process.memory() as f64;

        Some(ProcessMetrics {
            timestamp: Utc::now(),
            cpu_percent: process.cpu_usage() as f64,
            memory_mb: memory / (1024.0 * 1024.0),
            memory_percent: memory / total * 100.0,
            threads: thread_count(&system, sys_pid),
            connections: socket_count(pid),
            open_files: open_handle_count(pid),
        })
    }

    /// Terminate and relaunch `name` according to its restart strategy.
    ///
    /// Returns false when the restart budget is exhausted (the process is
    /// then `Failed`), another restart is already pending, the process was
    /// stopped during the backoff delay, or the new process could not be
    /// spawned.
    pub async fn restart(&self, name: &str, reason: &str) -> bool {
        let slot = match self.slot(name).await {
            Ok(slot) => slot,
            Err(e) => {
                warn!("Cannot restart: {}", e);
                return false;
            }
        };

        let delay = {
            let mut process = slot.process.lock().await;

            if process.status == ProcessStatus::Failed {
                debug!(process = %name, "Process is failed, not restarting");
                return false;
            }
            if process.restart_pending {
                debug!(process = %name, "Restart already pending");
                return false;
            }

            let attempt = slot.record_restart(&mut process);
            if attempt > self.config.max_retries {
                terminate(&slot, &mut process, self.config.termination_timeout).await;
                process.status = ProcessStatus::Failed;
                error!(
                    process = %name,
                    "Restart budget exhausted after {} attempts, marking failed",
                    self.config.max_retries
                );
                return false;
            }

            let delay = process
                .strategy
                .delay(attempt, self.config.retry_delay, self.config.max_retry_delay);
            info!(
                process = %name,
                attempt,
                "Restarting ({}), {} strategy, delay {:?}",
                reason,
                process.strategy,
                delay
            );

            terminate(&slot, &mut process, self.config.termination_timeout).await;
            process.status = ProcessStatus::Restarting;
            process.restart_pending = true;
            delay
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut process = slot.process.lock().await;
        process.restart_pending = false;
        if process.status != ProcessStatus::Restarting || process.is_live() {
            info!(process = %name, status = %process.status, "Restart abandoned during backoff");
            return false;
        }

        self.total_restarts.fetch_add(1, Ordering::SeqCst);
        match spawn_into(&slot, &mut process) {
            Ok(pid) => {
                info!(process = %name, pid, "Process restarted");
                true
            }
            Err(e) => {
                process.status = ProcessStatus::Stopped;
                process.error_count += 1;
                error!(process = %name, "Restart spawn failed: {}", e);
                false
            }
        }
    }

    /// Gracefully stop one process
    pub async fn stop(&self, name: &str) -> Result<()> {
        let slot = self.slot(name).await?;
        let mut process = slot.process.lock().await;
        terminate(&slot, &mut process, self.config.termination_timeout).await;
        Ok(())
    }

    /// Gracefully stop every process concurrently, each bounded by `timeout`
    pub async fn stop_all(&self, timeout: Duration) -> usize {
        let slots = self.slots().await;
        let stops = slots.iter().map(|(_, slot)| async move {
            let mut process = slot.process.lock().await;
            let live = process.is_live();
            terminate(slot, &mut process, timeout).await;
            live
        });
        let stopped = join_all(stops).await.into_iter().filter(|live| *live).count();
        info!("Stopped {} managed processes", stopped);
        stopped
    }

    /// Force-kill every live process without waiting on locks or exits
    pub async fn kill_all(&self) -> usize {
        let mut killed = 0;
        for (name, slot) in self.slots().await {
            let pid = slot.pid.swap(0, Ordering::SeqCst);
            if pid != 0 && force_kill(pid) {
                killed += 1;
                warn!(process = %name, pid, "Process killed");
            }
            if let Ok(mut process) = slot.process.try_lock() {
                if let Some(child) = process.child.as_mut() {
                    let _ = child.start_kill();
                }
                process.child = None;
                if process.status != ProcessStatus::Failed {
                    process.status = ProcessStatus::Stopped;
                }
            }
        }
        killed
    }

    /// Raise the niceness of every live process by `penalty`
    pub async fn lower_priority_all(&self, penalty: i32) -> usize {
        let mut lowered = 0;
        for (name, slot) in self.slots().await {
            let mut process = slot.process.lock().await;
            let Some(pid) = process.pid() else { continue };
            let niceness = (process.niceness + penalty).min(19);
            if niceness == process.niceness {
                continue;
            }
            match set_niceness(pid, niceness) {
                Ok(()) => {
                    process.niceness = niceness;
                    lowered += 1;
                    info!(process = %name, niceness, "Lowered process priority");
                }
                Err(e) => warn!(process = %name, "Failed to lower priority: {}", e),
            }
        }
        lowered
    }

    /// Stop every non-essential process, returning how many were stopped
    pub async fn stop_non_essential(&self) -> usize {
        let mut stopped = 0;
        for (name, slot) in self.slots().await {
            let mut process = slot.process.lock().await;
            let pending = process.status == ProcessStatus::Restarting;
            if process.spec.essential || !(process.is_live() || pending) {
                continue;
            }
            terminate(&slot, &mut process, self.config.termination_timeout).await;
            info!(process = %name, "Stopped non-essential process");
            stopped += 1;
        }
        stopped
    }

    /// Restart every process that has not failed permanently
    pub async fn restart_all(&self, reason: &str) -> usize {
        let names = self.names().await;
        let restarts = names.iter().map(|name| self.restart(name, reason));
        join_all(restarts).await.into_iter().filter(|ok| *ok).count()
    }

    /// Processes that are stopped but still within their restart budget
    pub async fn stopped_processes(&self) -> Vec<String> {
        let mut names = Vec::new();
        for (name, slot) in self.slots().await {
            if slot.process.lock().await.status == ProcessStatus::Stopped {
                names.push(name);
            }
        }
        names
    }

    pub async fn records(&self) -> Vec<ProcessRecord> {
        let mut records = Vec::new();
        for (name, slot) in self.slots().await {
            match slot.process.try_lock() {
                Ok(process) => records.push(ProcessRecord {
                    name,
                    pid: process.pid(),
                    restart_count: process.restart_count,
                    status: process.status,
                }),
                // Busy entries are being terminated or respawned
                Err(_) => records.push(ProcessRecord {
                    name,
                    pid: Some(slot.pid.load(Ordering::SeqCst)).filter(|pid| *pid != 0),
                    restart_count: slot.restarts.load(Ordering::SeqCst),
                    status: ProcessStatus::Restarting,
                }),
            }
        }
        records
    }
}

fn spawn_into(slot: &ProcessSlot, process: &mut ManagedProcess) -> Result<u32> {
    let spec = &process.spec;
    process.status = ProcessStatus::Starting;

    let mut command = Command::new(&spec.command);
    command
        .args(&spec.args)
        .stdin(Stdio::null())
        .kill_on_drop(true);
    if let Some(cwd) = &spec.cwd {
        command.current_dir(cwd);
    }
    for pair in &spec.env {
        match pair.split_once('=') {
            Some((key, value)) => {
                command.env(key, value);
            }
            None => warn!(process = %spec.name, "Ignoring malformed env entry {}", pair),
        }
    }

    let child = command.spawn().map_err(|e| VigilError::Spawn {
        name: spec.name.clone(),
        reason: e.to_string(),
    })?;
    let pid = child.id().unwrap_or(0);

    if let Some(cpus) = &spec.cpu_affinity {
        if let Err(e) = set_affinity(pid, cpus) {
            warn!(process = %spec.name, "Failed to set CPU affinity: {}", e);
        }
    }
    if process.niceness != 0 {
        if let Err(e) = set_niceness(pid, process.niceness) {
            warn!(process = %spec.name, "Failed to set niceness: {}", e);
        }
    }

    process.child = Some(child);
    process.start_time = Some(Utc::now());
    process.status = ProcessStatus::Running;
    slot.pid.store(pid, Ordering::SeqCst);
    Ok(pid)
}

/// SIGTERM, bounded wait, then SIGKILL
async fn terminate(slot: &ProcessSlot, process: &mut ManagedProcess, timeout: Duration) {
    slot.pid.store(0, Ordering::SeqCst);
    let Some(mut child) = process.child.take() else {
        if process.status != ProcessStatus::Failed {
            process.status = ProcessStatus::Stopped;
        }
        return;
    };

    let name = process.spec.name.clone();
    process.status = ProcessStatus::Stopping;

    if let Some(pid) = child.id() {
        request_termination(pid);
    }

    match tokio::time::timeout(timeout, child.wait()).await {
        Ok(Ok(status)) => debug!(process = %name, "Exited with {}", status),
        Ok(Err(e)) => warn!(process = %name, "Error waiting for exit: {}", e),
        Err(_) => {
            warn!(process = %name, "Did not exit within {:?}, killing", timeout);
            if let Err(e) = child.kill().await {
                error!(process = %name, "Force kill failed: {}", e);
            }
        }
    }

    process.status = ProcessStatus::Stopped;
}

#[cfg(unix)]
fn request_termination(pid: u32) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    if let Err(e) = kill(NixPid::from_raw(pid as i32), Signal::SIGTERM) {
        debug!(pid, "SIGTERM failed: {}", e);
    }
}

#[cfg(not(unix))]
fn request_termination(_pid: u32) {}

#[cfg(unix)]
fn force_kill(pid: u32) -> bool {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid as NixPid;

    kill(NixPid::from_raw(pid as i32), Signal::SIGKILL).is_ok()
}

#[cfg(not(unix))]
fn force_kill(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn set_niceness(pid: u32, niceness: i32) -> Result<()> {
    // SAFETY: setpriority has no memory-safety preconditions.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, niceness) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error().into())
    }
}

#[cfg(not(unix))]
fn set_niceness(_pid: u32, _niceness: i32) -> Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_affinity(pid: u32, cpus: &[usize]) -> Result<()> {
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid as NixPid;

    let mut set = CpuSet::new();
    for cpu in cpus {
        set.set(*cpu)
            .map_err(|e| VigilError::Internal(format!("invalid cpu {}: {}", cpu, e)))?;
    }
    sched_setaffinity(NixPid::from_raw(pid as i32), &set)
        .map_err(|e| VigilError::Internal(format!("sched_setaffinity: {}", e)))
}

#[cfg(not(target_os = "linux"))]
fn set_affinity(_pid: u32, _cpus: &[usize]) -> Result<()> {
    debug!("CPU affinity is only supported on Linux");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::health_check::MockHealthCheck;

    fn fast_config() -> ProcessManagerConfig {
        ProcessManagerConfig {
            max_retries: 2,
            retry_delay: Duration::from_millis(10),
            max_retry_delay: Duration::from_millis(50),
            termination_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_restart_delay_growth() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);

        for n in 1..12 {
            let exp = RestartStrategy::ExponentialBackoff;
            assert_eq!(exp.delay(n + 1, base, max), (exp.delay(n, base, max) * 2).min(max));
            assert_eq!(
                RestartStrategy::Linear.delay(n, base, max),
                (base * n).min(max)
            );
            assert_eq!(RestartStrategy::Immediate.delay(n, base, max), Duration::ZERO);
        }
        assert_eq!(RestartStrategy::ExponentialBackoff.delay(1, base, max), base);
        assert_eq!(RestartStrategy::ExponentialBackoff.delay(64, base, max), max);
    }

    #[test]
    fn test_spec_defaults() {
        let spec: ProcessSpec =
            serde_json::from_str(r#"{"name": "worker", "command": "sleep"}"#).unwrap();
        assert!(spec.essential);
        assert!(spec.restart_strategy.is_none());

        let spec: ProcessSpec = serde_json::from_str(
            r#"{"name": "w", "command": "x", "restart_strategy": "linear", "essential": false}"#,
        )
        .unwrap();
        assert_eq!(spec.restart_strategy, Some(RestartStrategy::Linear));
        assert!(!spec.essential);
    }

    #[tokio::test]
    async fn test_spawn_failure_leaves_process_stopped() {
        let manager = ProcessManager::new(fast_config());
        let started = manager
            .start(ProcessSpec::new("ghost", "/nonexistent/vigil-binary"), None)
            .await
            .unwrap();

        assert!(!started);
        assert_eq!(manager.status("ghost").await.unwrap(), ProcessStatus::Stopped);
        assert_eq!(manager.stopped_processes().await, vec!["ghost".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_process() {
        let manager = ProcessManager::with_defaults();
        assert!(matches!(
            manager.monitor("nope").await,
            Err(VigilError::ProcessNotFound(_))
        ));
        assert!(!manager.restart("nope", "test").await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_duplicate_start_rejected() {
        let manager = ProcessManager::new(fast_config());
        assert!(manager.start(ProcessSpec::new("s", "sleep").args(["30"]), None).await.unwrap());
        assert!(matches!(
            manager.start(ProcessSpec::new("s", "sleep").args(["30"]), None).await,
            Err(VigilError::DuplicateProcess(name)) if name == "s"
        ));
        manager.stop_all(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_failed_health_check_is_an_issue() {
        let manager = ProcessManager::new(fast_config());
        let mut check = MockHealthCheck::new();
        check
            .expect_check()
            .returning(|| HealthCheckResult::unhealthy("503"));

        assert!(
            manager
                .start(ProcessSpec::new("api", "sleep").args(["30"]), Some(Arc::new(check)))
                .await
                .unwrap()
        );

        let report = manager.monitor("api").await.unwrap();
        assert_eq!(report.status, ProcessStatus::Running);
        assert!(report.has("custom_health_check_failed"));
        manager.stop_all(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_detected_by_monitor() {
        let manager = ProcessManager::new(fast_config());
        assert!(manager.start(ProcessSpec::new("once", "true"), None).await.unwrap());

        tokio::time::sleep(Duration::from_millis(300)).await;
        let report = manager.monitor("once").await.unwrap();
        assert_eq!(report.status, ProcessStatus::Stopped);
        assert!(report.has("exited"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_backoff_does_not_hold_the_entry() {
        let manager = Arc::new(ProcessManager::new(ProcessManagerConfig {
            retry_delay: Duration::from_secs(3),
            max_retry_delay: Duration::from_secs(3),
            ..fast_config()
        }));
        let spec = ProcessSpec::new("a", "sleep")
            .args(["30"])
            .strategy(RestartStrategy::Linear);
        assert!(manager.start(spec, None).await.unwrap());

        let restarting = manager.clone();
        let restart = tokio::spawn(async move { restarting.restart("a", "test").await });
        tokio::time::sleep(Duration::from_millis(300)).await;

        let report = tokio::time::timeout(Duration::from_secs(1), manager.monitor("a"))
            .await
            .expect("monitor blocked by restart backoff")
            .unwrap();
        assert_eq!(report.status, ProcessStatus::Restarting);
        assert!(report.issues.is_empty());

        tokio::time::timeout(Duration::from_secs(1), manager.lower_priority_all(5))
            .await
            .expect("priority change blocked by restart backoff");

        let records = manager.records().await;
        assert_eq!(records[0].restart_count, 1);
        assert_eq!(records[0].status, ProcessStatus::Restarting);

        // A second restart while one is pending is refused without using budget
        assert!(!manager.restart("a", "duplicate").await);
        assert_eq!(manager.restart_count("a").await.unwrap(), 1);

        assert!(restart.await.unwrap());
        assert_eq!(manager.status("a").await.unwrap(), ProcessStatus::Running);
        manager.stop_all(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stop_during_backoff_abandons_restart() {
        let manager = Arc::new(ProcessManager::new(ProcessManagerConfig {
            retry_delay: Duration::from_secs(1),
            max_retry_delay: Duration::from_secs(1),
            ..fast_config()
        }));
        let spec = ProcessSpec::new("a", "sleep")
            .args(["30"])
            .strategy(RestartStrategy::Linear);
        assert!(manager.start(spec, None).await.unwrap());

        let restarting = manager.clone();
        let restart = tokio::spawn(async move { restarting.restart("a", "test").await });
        tokio::time::sleep(Duration::from_millis(200)).await;
        manager.stop_all(Duration::from_secs(2)).await;

        assert!(!restart.await.unwrap());
        assert_eq!(manager.status("a").await.unwrap(), ProcessStatus::Stopped);
        assert!(manager.records().await[0].pid.is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_resume_carries_history() {
        let manager = ProcessManager::new(fast_config());
        let failed = ProcessRecord {
            name: "broken".into(),
            pid: None,
            restart_count: 3,
            status: ProcessStatus::Failed,
        };
        let running = ProcessRecord {
            name: "ok".into(),
            pid: None,
            restart_count: 1,
            status: ProcessStatus::Running,
        };

        assert!(!manager
            .resume(ProcessSpec::new("broken", "sleep").args(["30"]), None, &failed)
            .await
            .unwrap());
        assert!(manager
            .resume(ProcessSpec::new("ok", "sleep").args(["30"]), None, &running)
            .await
            .unwrap());

        assert_eq!(manager.status("broken").await.unwrap(), ProcessStatus::Failed);
        assert!(!manager.restart("broken", "test").await);
        assert_eq!(manager.restart_count("ok").await.unwrap(), 1);

        // fast_config allows two restarts; the carried-over one counts
        assert!(manager.restart("ok", "test").await);
        assert!(!manager.restart("ok", "test").await);
        assert_eq!(manager.status("ok").await.unwrap(), ProcessStatus::Failed);
        manager.stop_all(Duration::from_secs(2)).await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_reap_orphans_terminates_leftover_process() {
        use std::os::unix::process::ExitStatusExt;

        let mut orphan = Command::new("sleep").arg("30").spawn().unwrap();
        let pid = orphan.id().unwrap();
        let record = ProcessRecord {
            name: "worker".into(),
            pid: Some(pid),
            restart_count: 0,
            status: ProcessStatus::Running,
        };
        let manager = ProcessManager::new(fast_config());

        // A record whose command does not match is left alone
        let other = [ProcessSpec::new("worker", "/usr/bin/python3")];
        assert_eq!(manager.reap_orphans(std::slice::from_ref(&record), &other).await, 0);

        let specs = [ProcessSpec::new("worker", "sleep")];
        assert_eq!(manager.reap_orphans(&[record], &specs).await, 1);
        let status = tokio::time::timeout(Duration::from_secs(5), orphan.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }
}
