//! Supervisor orchestrator
//!
//! Runs three independent loops until shutdown is requested:
//! - health loop: sample, score, execute playbook actions, checkpoint, report
//! - resource loop: monitor managed processes and auto-restart exited ones
//! - optimizer loop: routine memory reclamation and backup retention
//!
//! The health loop exclusively owns the `HealthMonitor`; other loops reach it
//! through a maintenance channel. Loops share only counters and the latest
//! cycle report.

use super::degradation::{DegradationLadder, DegradationStep};
use super::health_check::{HealthCheck, HttpHealthCheck};
use super::playbook::{RecoveryAction, RecoveryPlaybook};
use super::process_manager::{ProcessManager, ProcessManagerConfig, ProcessReport, ProcessStatus};
use crate::adapters::webhook::WebhookReporter;
use crate::config::SupervisorConfig;
use crate::coordination::shutdown::{ShutdownController, ShutdownSignal, ShutdownToken};
use crate::error::Result;
use crate::monitoring::health::{HealthMonitor, HealthSnapshot, HealthState};
use crate::monitoring::memory::{MemorySampler, MemorySamplerConfig};
use crate::monitoring::performance::{
    PerformanceBaseline, PerformanceSampler, PerformanceSamplerConfig,
};
use crate::monitoring::probe::HostProbe;
use crate::monitoring::ring_buffer::ReclaimLevel;
use crate::persistence::retention::RetentionPolicy;
use crate::persistence::state_store::{EmergencyMarker, ProcessRecord, StatePayload, StateStore};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    /// Directory holding the state file, backups and logs
    pub base_dir: PathBuf,
    /// Start from degradation level 0 regardless of persisted state
    pub reset_degradation: bool,
    /// Exit the process if emergency shutdown overruns its deadline
    pub force_exit_on_emergency: bool,
}

impl SupervisorOptions {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            reset_degradation: false,
            force_exit_on_emergency: false,
        }
    }
}

/// Summary of one completed health cycle
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    pub timestamp: DateTime<Utc>,
    pub health_state: HealthState,
    pub health_score: f64,
    pub degradation: DegradationStep,
    pub actions: Vec<RecoveryAction>,
    pub persisted: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    Graceful,
    Emergency { reason: String },
}

impl ShutdownOutcome {
    pub fn exit_code(&self) -> u8 {
        match self {
            ShutdownOutcome::Graceful => 0,
            ShutdownOutcome::Emergency { .. } => 1,
        }
    }
}

#[derive(Debug)]
enum MaintenanceCommand {
    Reclaim(ReclaimLevel),
}

/// Exit code used when emergency shutdown overruns its deadline
pub const FORCE_EXIT_CODE: i32 = 3;

struct Shared {
    config: SupervisorConfig,
    config_snapshot: Value,
    processes: Arc<ProcessManager>,
    store: StateStore,
    webhook: Option<WebhookReporter>,
    shutdown: Arc<ShutdownController>,
    started: Instant,
    ladder: std::sync::Mutex<DegradationLadder>,
    loop_errors: AtomicU32,
    error_count: AtomicU64,
    restart_base: u64,
    unclean_shutdowns: u64,
    emergency_restart_pending: AtomicBool,
    restarting: std::sync::Mutex<HashSet<String>>,
    reports: RwLock<HashMap<String, ProcessReport>>,
    cycle_tx: watch::Sender<Option<CycleReport>>,
    last_payload: std::sync::Mutex<StatePayload>,
}

impl Shared {
    fn ladder(&self) -> DegradationLadder {
        self.ladder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    fn advance_ladder(&self) -> Option<DegradationStep> {
        self.ladder
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .advance()
    }

    fn current_state(&self) -> HealthState {
        self.cycle_tx
            .borrow()
            .as_ref()
            .map(|r| r.health_state)
            .unwrap_or(HealthState::Recovering)
    }

    fn interval(&self, base: Duration) -> Duration {
        adaptive_interval(
            base,
            self.current_state(),
            &self.ladder(),
            self.config.intervals.min_interval_secs,
            self.config.intervals.max_interval_secs,
        )
    }

    fn record_loop_error(&self, context: &str, err: impl std::fmt::Display) {
        let errors = self.loop_errors.fetch_add(1, Ordering::SeqCst) + 1;
        self.error_count.fetch_add(1, Ordering::SeqCst);
        warn!(errors, "{} failed: {}", context, err);

        if errors > self.config.shutdown.max_loop_errors {
            error!(
                "Loop errors exceeded ceiling of {}",
                self.config.shutdown.max_loop_errors
            );
            self.shutdown.request(
                ShutdownSignal::Emergency,
                format!("{} accumulated monitoring-loop errors", errors),
            );
        }
    }

    fn record_clean_cycle(&self) {
        let _ = self
            .loop_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    fn spawn_restart(self: &Arc<Self>, name: String, reason: &'static str) {
        {
            let mut restarting = self.restarting.lock().unwrap_or_else(|p| p.into_inner());
            if !restarting.insert(name.clone()) {
                debug!(process = %name, "Restart already in flight");
                return;
            }
        }

        let shared = self.clone();
        tokio::spawn(async move {
            shared.processes.restart(&name, reason).await;
            shared
                .restarting
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .remove(&name);
        });
    }

    async fn payload(
        &self,
        snapshot: &HealthSnapshot,
        baseline: Option<PerformanceBaseline>,
    ) -> StatePayload {
        StatePayload {
            restart_count: self.restart_base + self.processes.total_restarts(),
            error_count: self.error_count.load(Ordering::SeqCst),
            degradation_level: self.ladder().level(),
            was_running: true,
            uptime_secs: self.started.elapsed().as_secs(),
            health_state: snapshot.health_state,
            health_score: snapshot.health_score,
            performance_baseline: baseline,
            managed_processes: self.processes.records().await,
            config_snapshot: self.config_snapshot.clone(),
            unclean_shutdowns: self.unclean_shutdowns,
            emergency: None,
        }
    }

    async fn persist(&self, payload: StatePayload) -> bool {
        *self.last_payload.lock().unwrap_or_else(|p| p.into_inner()) = payload.clone();

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.save(&payload)).await {
            Ok(saved) => saved,
            Err(e) => {
                error!("State save task failed: {}", e);
                false
            }
        }
    }
}

/// Loop sleep for the current health state and degradation level
pub fn adaptive_interval(
    base: Duration,
    state: HealthState,
    ladder: &DegradationLadder,
    min_secs: u64,
    max_secs: u64,
) -> Duration {
    let secs = base.as_secs_f64() * state.interval_factor() * ladder.interval_factor();
    let min = min_secs as f64;
    let max = (max_secs as f64).max(min);
    Duration::from_secs_f64(secs.clamp(min, max))
}

/// Build a health monitor sampling the supervisor's own process
pub fn host_health_monitor(config: &SupervisorConfig) -> Result<HealthMonitor> {
    let memory = MemorySampler::new(
        MemorySamplerConfig {
            history_capacity: config.monitoring.memory_history,
            leak_window: config.monitoring.leak_window,
            max_growth_rate_mb_per_hour: config.thresholds.max_memory_growth_rate_mb_per_hour,
            object_growth_threshold: config.thresholds.object_growth_threshold,
            gc_frequency: Duration::from_secs(config.monitoring.gc_frequency_secs),
            memory_limit_bytes: config.thresholds.memory_limit_mb.map(|mb| mb * 1024 * 1024),
        },
        Box::new(HostProbe::current()?),
    );
    let performance = PerformanceSampler::new(
        PerformanceSamplerConfig {
            history_capacity: config.monitoring.performance_history,
            baseline_samples: config.monitoring.baseline_samples,
            recent_window: config.monitoring.degradation_window,
            degradation_threshold_percent: config.thresholds.performance_degradation_percent,
        },
        Box::new(HostProbe::current()?),
    );

    let mut monitor = HealthMonitor::new(
        config.thresholds.clone(),
        memory,
        performance,
        config.monitoring.snapshot_history,
    )
    .with_predictive_alerts(config.features.enable_predictive_alerts);

    if config.features.enable_system_metrics {
        monitor = monitor.with_system_probe(Box::new(HostProbe::current()?));
    }
    Ok(monitor)
}

pub struct Supervisor {
    shared: Arc<Shared>,
    monitor: HealthMonitor,
    options: SupervisorOptions,
    /// Process records left by a run that did not shut down cleanly
    leftover: Vec<ProcessRecord>,
}

impl Supervisor {
    /// Supervisor sampling its own process through sysinfo
    pub fn new(config: SupervisorConfig, options: SupervisorOptions) -> Result<Self> {
        let monitor = host_health_monitor(&config)?;
        Self::with_monitor(config, options, monitor)
    }

    /// Supervisor using a caller-built health monitor
    pub fn with_monitor(
        config: SupervisorConfig,
        options: SupervisorOptions,
        mut monitor: HealthMonitor,
    ) -> Result<Self> {
        let store = StateStore::from_config(
            &options.base_dir,
            &config.persistence,
            RetentionPolicy::new(config.intervals.health_check(), config.persistence.retention_days),
        );

        let (mut state, source) = store.load_with_source();
        info!("Loaded supervisor state from {}", source);

        let unclean_shutdowns = if state.was_running {
            warn!(
                "Previous run did not shut down cleanly (uptime {}s), recovering",
                state.uptime_secs
            );
            state.unclean_shutdowns + 1
        } else {
            state.unclean_shutdowns
        };
        if let Some(marker) = &state.emergency {
            warn!(
                "Previous run ended in emergency shutdown at {}: {}",
                marker.triggered_at, marker.reason
            );
        }

        if let Some(baseline) = state.performance_baseline.clone() {
            info!("Restored performance baseline from {}", baseline.established_at);
            monitor.performance_mut().restore_baseline(baseline);
        }

        let ladder = if options.reset_degradation {
            if state.degradation_level > 0 {
                info!("Recovery mode: degradation level {} reset", state.degradation_level);
            }
            DegradationLadder::new()
        } else {
            DegradationLadder::from_level(state.degradation_level)
        };
        if ladder.is_at_least(DegradationStep::NonEssentialFeaturesDisabled) {
            monitor.disable_optional_checks();
        }
        if ladder.is_at_least(DegradationStep::EmergencyMode) {
            monitor.set_emergency(true);
        }

        let webhook = WebhookReporter::from_config(&config.webhook)?;
        let processes = Arc::new(ProcessManager::new(ProcessManagerConfig::from_config(&config)));
        let (cycle_tx, _) = watch::channel(None);

        let leftover = if state.was_running {
            std::mem::take(&mut state.managed_processes)
        } else {
            Vec::new()
        };

        state.unclean_shutdowns = unclean_shutdowns;
        state.degradation_level = ladder.level();
        state.emergency = None;

        let shared = Arc::new(Shared {
            config_snapshot: serde_json::to_value(&config)?,
            config,
            processes,
            store,
            webhook,
            shutdown: Arc::new(ShutdownController::new()),
            started: Instant::now(),
            ladder: std::sync::Mutex::new(ladder),
            loop_errors: AtomicU32::new(0),
            error_count: AtomicU64::new(state.error_count),
            restart_base: state.restart_count,
            unclean_shutdowns,
            emergency_restart_pending: AtomicBool::new(false),
            restarting: std::sync::Mutex::new(HashSet::new()),
            reports: RwLock::new(HashMap::new()),
            cycle_tx,
            last_payload: std::sync::Mutex::new(state),
        });

        Ok(Self {
            shared,
            monitor,
            options,
            leftover,
        })
    }

    pub fn shutdown_handle(&self) -> Arc<ShutdownController> {
        self.shared.shutdown.clone()
    }

    pub fn process_manager(&self) -> Arc<ProcessManager> {
        self.shared.processes.clone()
    }

    /// Receives a report after every health cycle
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleReport>> {
        self.shared.cycle_tx.subscribe()
    }

    pub fn degradation(&self) -> DegradationStep {
        self.shared.ladder().current()
    }

    /// Start configured processes and run until shutdown is requested
    pub async fn run(self) -> Result<ShutdownOutcome> {
        let Supervisor {
            shared,
            monitor,
            options,
            leftover,
        } = self;

        info!(
            "Supervisor starting in {} ({} configured processes, degradation {})",
            options.base_dir.display(),
            shared.config.processes.len(),
            shared.ladder().current()
        );

        // Recovery mode starts every process with a fresh restart budget
        let resume = !options.reset_degradation;
        start_processes(&shared, &leftover, resume).await;

        let (commands_tx, commands_rx) = mpsc::channel(8);
        let handles = vec![
            tokio::spawn(health_loop(
                shared.clone(),
                monitor,
                commands_rx,
                shared.shutdown.token(),
            )),
            tokio::spawn(resource_loop(shared.clone(), shared.shutdown.token())),
            tokio::spawn(optimizer_loop(
                shared.clone(),
                commands_tx,
                shared.shutdown.token(),
            )),
        ];

        let aborts: Vec<AbortHandle> = handles.iter().map(|h| h.abort_handle()).collect();
        let mut token = shared.shutdown.token();
        let request = token.wait().await;
        info!("Shutting down ({}): {}", request.signal, request.reason);

        let force_exit = options.force_exit_on_emergency;
        let outcome = match request.signal {
            ShutdownSignal::Graceful => {
                tokio::select! {
                    outcome = graceful_shutdown(&shared, handles) => outcome,
                    escalation = token.wait_for(ShutdownSignal::Emergency) => {
                        warn!("Graceful shutdown escalated: {}", escalation.reason);
                        emergency_shutdown(&shared, &aborts, &escalation.reason, force_exit).await
                    }
                }
            }
            ShutdownSignal::Emergency => {
                emergency_shutdown(&shared, &aborts, &request.reason, force_exit).await
            }
        };
        Ok(outcome)
    }
}

async fn start_processes(shared: &Arc<Shared>, leftover: &[ProcessRecord], resume: bool) {
    if !leftover.is_empty() {
        let reaped = shared
            .processes
            .reap_orphans(leftover, &shared.config.processes)
            .await;
        if reaped > 0 {
            warn!("Terminated {} processes left running by the previous run", reaped);
        }
    }

    let reduced = shared
        .ladder()
        .is_at_least(DegradationStep::ReducedProcessCount);

    for spec in &shared.config.processes {
        if reduced && !spec.essential {
            info!(process = %spec.name, "Degraded: not starting non-essential process");
            continue;
        }

        let health_check: Option<Arc<dyn HealthCheck>> = match &spec.health_check {
            Some(check) => {
                match HttpHealthCheck::new(&check.url, Duration::from_secs(check.timeout_secs)) {
                    Ok(check) => Some(Arc::new(check)),
                    Err(e) => {
                        warn!(process = %spec.name, "Health check disabled: {}", e);
                        None
                    }
                }
            }
            None => None,
        };

        let previous = leftover
            .iter()
            .find(|r| r.name == spec.name)
            .filter(|_| resume);
        let started = match previous {
            Some(record) => shared.processes.resume(spec.clone(), health_check, record).await,
            None => shared.processes.start(spec.clone(), health_check).await,
        };
        match started {
            Ok(true) => {}
            Ok(false) => {
                warn!(process = %spec.name, "Process not running, auto-restart may retry it")
            }
            Err(e) => error!(process = %spec.name, "Process not registered: {}", e),
        }
    }
}

async fn health_loop(
    shared: Arc<Shared>,
    mut monitor: HealthMonitor,
    mut commands: mpsc::Receiver<MaintenanceCommand>,
    mut token: ShutdownToken,
) {
    let config = &shared.config;
    let playbook = RecoveryPlaybook::new(&config.thresholds, &config.restart, &config.features);
    let mut cycle = 0u64;
    let mut fatal_streak = 0u32;

    info!("Health loop started");
    while !token.is_requested() {
        while let Ok(command) = commands.try_recv() {
            match command {
                MaintenanceCommand::Reclaim(level) => {
                    monitor.optimize_memory(level);
                }
            }
        }

        cycle += 1;
        let snapshot = monitor.check();
        let actions = playbook.actions_for(&snapshot);
        for action in &actions {
            info!(cycle, "Recovery action: {}", action);
            execute_action(&shared, &mut monitor, action).await;
        }

        if snapshot.health_score < config.thresholds.fatal_score {
            fatal_streak += 1;
            warn!(
                "Health score {:.3} below fatal threshold ({}/{})",
                snapshot.health_score, fatal_streak, config.thresholds.fatal_cycles
            );
            if fatal_streak >= config.thresholds.fatal_cycles.max(1) {
                shared.shutdown.request(
                    ShutdownSignal::Emergency,
                    format!(
                        "health score below {} for {} cycles",
                        config.thresholds.fatal_score, fatal_streak
                    ),
                );
            }
        } else {
            fatal_streak = 0;
        }

        let baseline = monitor.performance().baseline().cloned();
        let payload = shared.payload(&snapshot, baseline).await;
        let persisted = shared.persist(payload).await;
        if persisted {
            shared.record_clean_cycle();
        } else {
            shared.record_loop_error("state checkpoint", "save returned false");
        }

        let ladder = shared.ladder();
        if let Some(webhook) = &shared.webhook {
            if !ladder.is_at_least(DegradationStep::NonEssentialFeaturesDisabled) {
                if let Err(e) = webhook.report(&snapshot).await {
                    debug!("Snapshot not reported: {}", e);
                }
            }
        }

        shared.cycle_tx.send_replace(Some(CycleReport {
            cycle,
            timestamp: snapshot.timestamp,
            health_state: snapshot.health_state,
            health_score: snapshot.health_score,
            degradation: ladder.current(),
            actions,
            persisted,
        }));

        let interval = shared.interval(config.intervals.health_check());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.wait() => break,
        }
    }
    info!("Health loop stopped after {} cycles", cycle);
}

async fn execute_action(shared: &Arc<Shared>, monitor: &mut HealthMonitor, action: &RecoveryAction) {
    match action {
        RecoveryAction::ReclaimMemory { level } => {
            monitor.optimize_memory(*level);
        }
        RecoveryAction::LowerPriority { penalty } => {
            let lowered = shared.processes.lower_priority_all(*penalty).await;
            debug!("Lowered priority of {} processes", lowered);
        }
        RecoveryAction::ScheduleEmergencyRestart { delay_secs } => {
            schedule_emergency_restart(shared, Duration::from_secs(*delay_secs));
        }
        RecoveryAction::AdvanceDegradation => match shared.advance_ladder() {
            Some(DegradationStep::NonEssentialFeaturesDisabled) => monitor.disable_optional_checks(),
            Some(DegradationStep::ReducedProcessCount) => {
                let stopped = shared.processes.stop_non_essential().await;
                info!("Reduced process count, {} non-essential processes stopped", stopped);
            }
            Some(DegradationStep::EmergencyMode) => monitor.set_emergency(true),
            Some(_) => {}
            None => debug!("Degradation ladder already at its last step"),
        },
        RecoveryAction::RestartHighMemoryProcesses => {
            let names: Vec<String> = shared
                .reports
                .read()
                .await
                .values()
                .filter(|r| r.has("high_memory"))
                .map(|r| r.name.clone())
                .collect();
            for name in names {
                shared.spawn_restart(name, "high memory");
            }
        }
    }
}

fn schedule_emergency_restart(shared: &Arc<Shared>, delay: Duration) {
    if shared.emergency_restart_pending.swap(true, Ordering::SeqCst) {
        debug!("Emergency restart already scheduled");
        return;
    }
    warn!("Emergency restart of all processes scheduled in {:?}", delay);

    let shared = shared.clone();
    tokio::spawn(async move {
        let mut token = shared.shutdown.token();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let restarted = shared.processes.restart_all("emergency restart").await;
                warn!("Emergency restart completed, {} processes restarted", restarted);
            }
            _ = token.wait() => debug!("Emergency restart cancelled by shutdown"),
        }
        shared.emergency_restart_pending.store(false, Ordering::SeqCst);
    });
}

async fn resource_loop(shared: Arc<Shared>, mut token: ShutdownToken) {
    info!("Resource loop started");
    while !token.is_requested() {
        for name in shared.processes.names().await {
            let report = match shared.processes.monitor(&name).await {
                Ok(report) => report,
                Err(e) => {
                    shared.record_loop_error("process monitor", e);
                    continue;
                }
            };

            if report.status == ProcessStatus::Stopped && should_auto_restart(&shared, &name).await {
                shared.spawn_restart(name.clone(), "process exited");
            }
            shared.reports.write().await.insert(name, report);
        }

        let interval = shared.interval(shared.config.intervals.resource_check());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.wait() => break,
        }
    }
    info!("Resource loop stopped");
}

async fn should_auto_restart(shared: &Shared, name: &str) -> bool {
    if !shared.config.features.enable_auto_restart || shared.shutdown.is_requested() {
        return false;
    }
    let essential = shared.processes.is_essential(name).await.unwrap_or(false);
    essential
        || !shared
            .ladder()
            .is_at_least(DegradationStep::ReducedProcessCount)
}

async fn optimizer_loop(
    shared: Arc<Shared>,
    commands: mpsc::Sender<MaintenanceCommand>,
    mut token: ShutdownToken,
) {
    let mut last_cleanup: Option<Instant> = None;

    info!("Optimizer loop started");
    while !token.is_requested() {
        if !shared
            .ladder()
            .is_at_least(DegradationStep::NonEssentialFeaturesDisabled)
        {
            if let Err(e) = commands.try_send(MaintenanceCommand::Reclaim(ReclaimLevel::Routine)) {
                debug!("Routine reclamation not queued: {}", e);
            }
        }

        let cleanup_due = last_cleanup
            .map(|at| at.elapsed() >= shared.config.intervals.backup_cleanup())
            .unwrap_or(true);
        if cleanup_due {
            let store = shared.store.clone();
            match tokio::task::spawn_blocking(move || store.cleanup_backups()).await {
                Ok(Ok(removed)) => debug!("Backup cleanup removed {} files", removed),
                Ok(Err(e)) => shared.record_loop_error("backup cleanup", e),
                Err(e) => shared.record_loop_error("backup cleanup task", e),
            }
            last_cleanup = Some(Instant::now());
        }

        let interval = shared.interval(shared.config.intervals.optimization());
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = token.wait() => break,
        }
    }
    info!("Optimizer loop stopped");
}

async fn graceful_shutdown(shared: &Arc<Shared>, handles: Vec<JoinHandle<()>>) -> ShutdownOutcome {
    let timeout = Duration::from_secs(shared.config.shutdown.graceful_timeout_secs);

    for handle in handles {
        let abort = handle.abort_handle();
        match tokio::time::timeout(timeout, handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Loop task ended abnormally: {}", e),
            Err(_) => {
                warn!("Loop did not stop within {:?}, aborting", timeout);
                abort.abort();
            }
        }
    }

    let stopped = shared.processes.stop_all(timeout).await;
    info!("Graceful shutdown stopped {} processes", stopped);

    let mut payload = shared
        .last_payload
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    payload.was_running = false;
    payload.uptime_secs = shared.started.elapsed().as_secs();
    payload.restart_count = shared.restart_base + shared.processes.total_restarts();
    payload.error_count = shared.error_count.load(Ordering::SeqCst);
    payload.degradation_level = shared.ladder().level();
    payload.managed_processes = shared.processes.records().await;
    payload.config_snapshot = shared.config_snapshot.clone();

    if save_final(shared, payload).await {
        info!("Final state persisted");
    } else {
        error!("Final state could not be persisted");
    }
    ShutdownOutcome::Graceful
}

async fn emergency_shutdown(
    shared: &Arc<Shared>,
    loops: &[AbortHandle],
    reason: &str,
    force_exit: bool,
) -> ShutdownOutcome {
    error!("EMERGENCY SHUTDOWN: {}", reason);

    if force_exit {
        let deadline = Duration::from_secs(shared.config.shutdown.emergency_exit_timeout_secs);
        std::thread::spawn(move || {
            std::thread::sleep(deadline);
            error!("Emergency shutdown overran {:?}, forcing exit", deadline);
            std::process::exit(FORCE_EXIT_CODE);
        });
    }

    for handle in loops {
        handle.abort();
    }

    let killed = shared.processes.kill_all().await;
    warn!("Killed {} managed processes", killed);

    let mut payload = shared
        .last_payload
        .lock()
        .unwrap_or_else(|p| p.into_inner())
        .clone();
    payload.was_running = false;
    payload.health_state = HealthState::Emergency;
    payload.uptime_secs = shared.started.elapsed().as_secs();
    payload.restart_count = shared.restart_base + shared.processes.total_restarts();
    payload.error_count = shared.error_count.load(Ordering::SeqCst);
    payload.managed_processes = shared.processes.records().await;
    payload.config_snapshot = shared.config_snapshot.clone();
    payload.emergency = Some(EmergencyMarker {
        reason: reason.to_string(),
        triggered_at: Utc::now(),
    });

    if !save_final(shared, payload).await {
        error!("Emergency marker could not be persisted");
    }
    ShutdownOutcome::Emergency {
        reason: reason.to_string(),
    }
}

/// Write the closing state on the blocking pool and seal the store
async fn save_final(shared: &Shared, payload: StatePayload) -> bool {
    let store = shared.store.clone();
    match tokio::task::spawn_blocking(move || store.save_final(&payload)).await {
        Ok(saved) => saved,
        Err(e) => {
            error!("Final state save task failed: {}", e);
            false
        }
    }
}
