#![cfg(unix)]

use std::time::Duration;
use tempfile::TempDir;
use vigil::config::SupervisorConfig;
use vigil::coordination::ShutdownSignal;
use vigil::error::Result;
use vigil::monitoring::probe::{MemoryReading, PerformanceReading};
use vigil::monitoring::{
    HealthMonitor, HealthState, MemoryProbe, MemorySampler, MemorySamplerConfig, PerformanceProbe,
    PerformanceSampler, PerformanceSamplerConfig,
};
use vigil::persistence::{ProcessRecord, RetentionPolicy, StatePayload, StateStore};
use vigil::supervisor::{
    ProcessSpec, ProcessStatus, RestartStrategy, ShutdownOutcome, Supervisor, SupervisorOptions,
};

#[derive(Clone, Copy)]
struct Calm;

impl MemoryProbe for Calm {
    fn read_memory(&mut self) -> Result<MemoryReading> {
        Ok(MemoryReading {
            resident_bytes: 32 * 1024 * 1024,
            virtual_bytes: 64 * 1024 * 1024,
            system_total_bytes: 4 * 1024 * 1024 * 1024,
            system_available_bytes: 3 * 1024 * 1024 * 1024,
            open_handles: 12,
        })
    }
}

impl PerformanceProbe for Calm {
    fn read_performance(&mut self) -> Result<PerformanceReading> {
        Ok(PerformanceReading {
            cpu_percent: 5.0,
            memory_percent: 25.0,
            thread_count: 3,
            ..Default::default()
        })
    }
}

fn config() -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.intervals.health_check_secs = 1;
    config.intervals.resource_check_secs = 1;
    config.intervals.min_interval_secs = 0;
    config.shutdown.graceful_timeout_secs = 3;
    config.processes = vec![
        ProcessSpec::new("sleeper", "sleep")
            .args(["30"])
            .strategy(RestartStrategy::Immediate),
        ProcessSpec::new("helper", "sleep")
            .args(["30"])
            .non_essential(),
    ];
    config
}

fn supervisor(dir: &TempDir, config: &SupervisorConfig) -> Supervisor {
    let monitor = HealthMonitor::new(
        config.thresholds.clone(),
        MemorySampler::new(MemorySamplerConfig::default(), Box::new(Calm)),
        PerformanceSampler::new(PerformanceSamplerConfig::default(), Box::new(Calm)),
        50,
    );
    Supervisor::with_monitor(config.clone(), SupervisorOptions::new(dir.path()), monitor).unwrap()
}

fn store(dir: &TempDir, config: &SupervisorConfig) -> StateStore {
    StateStore::from_config(
        dir.path(),
        &config.persistence,
        RetentionPolicy::new(config.intervals.health_check(), config.persistence.retention_days),
    )
}

#[tokio::test]
async fn graceful_shutdown_stops_processes_and_marks_clean() {
    let dir = TempDir::new().unwrap();
    let config = config();
    let supervisor = supervisor(&dir, &config);
    let shutdown = supervisor.shutdown_handle();
    let processes = supervisor.process_manager();
    let mut cycles = supervisor.subscribe();

    let run = tokio::spawn(supervisor.run());
    tokio::time::timeout(Duration::from_secs(5), cycles.changed())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(processes.status("sleeper").await.unwrap(), ProcessStatus::Running);
    let running = store(&dir, &config).load();
    assert!(running.was_running);
    assert_eq!(running.managed_processes.len(), 2);

    assert!(shutdown.request(ShutdownSignal::Graceful, "integration test"));
    let outcome = tokio::time::timeout(Duration::from_secs(15), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(outcome, ShutdownOutcome::Graceful);
    assert_eq!(outcome.exit_code(), 0);

    for name in ["sleeper", "helper"] {
        assert_eq!(processes.status(name).await.unwrap(), ProcessStatus::Stopped);
    }
    let state = store(&dir, &config).load();
    assert!(!state.was_running);
    assert!(state.emergency.is_none());
    assert!(state.managed_processes.iter().all(|p| p.pid.is_none()));
}

#[tokio::test]
async fn emergency_shutdown_kills_processes_and_persists_marker() {
    let dir = TempDir::new().unwrap();
    let config = config();
    let supervisor = supervisor(&dir, &config);
    let shutdown = supervisor.shutdown_handle();
    let processes = supervisor.process_manager();
    let mut cycles = supervisor.subscribe();

    let run = tokio::spawn(supervisor.run());
    tokio::time::timeout(Duration::from_secs(5), cycles.changed())
        .await
        .unwrap()
        .unwrap();

    shutdown.request(ShutdownSignal::Emergency, "operator abort");
    let outcome = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        outcome,
        ShutdownOutcome::Emergency {
            reason: "operator abort".to_string()
        }
    );
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(processes.status("sleeper").await.unwrap(), ProcessStatus::Stopped);

    let state = store(&dir, &config).load();
    assert_eq!(state.health_state, HealthState::Emergency);
    assert_eq!(state.emergency.map(|m| m.reason), Some("operator abort".to_string()));
    assert!(!state.was_running);
}

#[tokio::test]
async fn restart_after_unclean_exit_counts_it() {
    let dir = TempDir::new().unwrap();
    let mut config = config();
    config.processes.clear();

    let first = supervisor(&dir, &config);
    let first_shutdown = first.shutdown_handle();
    let mut cycles = first.subscribe();
    let run = tokio::spawn(first.run());
    tokio::time::timeout(Duration::from_secs(5), cycles.changed())
        .await
        .unwrap()
        .unwrap();
    // Simulate a crash: the run never reaches its shutdown path, then its
    // detached loops are told to stop without persisting anything further
    run.abort();
    let _ = run.await;
    first_shutdown.request(ShutdownSignal::Graceful, "crash simulation");
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store(&dir, &config).load().was_running);

    let second = supervisor(&dir, &config);
    let shutdown = second.shutdown_handle();
    let mut cycles = second.subscribe();
    let run = tokio::spawn(second.run());
    tokio::time::timeout(Duration::from_secs(5), cycles.changed())
        .await
        .unwrap()
        .unwrap();
    shutdown.request(ShutdownSignal::Graceful, "done");
    run.await.unwrap().unwrap();

    assert_eq!(store(&dir, &config).load().unclean_shutdowns, 1);
}

#[tokio::test]
async fn unclean_restart_reaps_leftovers_and_keeps_failed_processes() {
    let dir = TempDir::new().unwrap();
    let config = config();

    let mut leftover = tokio::process::Command::new("sleep").arg("30").spawn().unwrap();
    let leftover_pid = leftover.id().unwrap();
    assert!(store(&dir, &config).save(&StatePayload {
        was_running: true,
        managed_processes: vec![
            ProcessRecord {
                name: "sleeper".to_string(),
                pid: None,
                restart_count: 6,
                status: ProcessStatus::Failed,
            },
            ProcessRecord {
                name: "helper".to_string(),
                pid: Some(leftover_pid),
                restart_count: 2,
                status: ProcessStatus::Running,
            },
        ],
        ..Default::default()
    }));

    let supervisor = supervisor(&dir, &config);
    let shutdown = supervisor.shutdown_handle();
    let processes = supervisor.process_manager();
    let mut cycles = supervisor.subscribe();
    let run = tokio::spawn(supervisor.run());
    tokio::time::timeout(Duration::from_secs(10), cycles.changed())
        .await
        .unwrap()
        .unwrap();

    let exit = tokio::time::timeout(Duration::from_secs(5), leftover.wait())
        .await
        .unwrap()
        .unwrap();
    assert!(!exit.success());

    assert_eq!(processes.status("sleeper").await.unwrap(), ProcessStatus::Failed);
    assert_eq!(processes.restart_count("sleeper").await.unwrap(), 6);
    assert_eq!(processes.status("helper").await.unwrap(), ProcessStatus::Running);
    assert_eq!(processes.restart_count("helper").await.unwrap(), 2);

    shutdown.request(ShutdownSignal::Graceful, "done");
    run.await.unwrap().unwrap();

    let state = store(&dir, &config).load();
    let sleeper = state
        .managed_processes
        .iter()
        .find(|p| p.name == "sleeper")
        .unwrap();
    assert_eq!(sleeper.status, ProcessStatus::Failed);
    assert_eq!(sleeper.restart_count, 6);
}
