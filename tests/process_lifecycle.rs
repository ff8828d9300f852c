#![cfg(unix)]

use std::time::Duration;
use vigil::supervisor::{
    ProcessManager, ProcessManagerConfig, ProcessSpec, ProcessStatus, RestartStrategy,
};

fn manager(max_retries: u32) -> ProcessManager {
    ProcessManager::new(ProcessManagerConfig {
        max_retries,
        retry_delay: Duration::from_millis(10),
        max_retry_delay: Duration::from_millis(50),
        termination_timeout: Duration::from_secs(2),
        ..Default::default()
    })
}

fn sleeper(name: &str) -> ProcessSpec {
    ProcessSpec::new(name, "sleep")
        .args(["30"])
        .strategy(RestartStrategy::Immediate)
}

#[tokio::test]
async fn restart_budget_exhaustion_marks_failed() {
    let manager = manager(2);
    assert!(manager.start(sleeper("worker"), None).await.unwrap());
    assert_eq!(manager.status("worker").await.unwrap(), ProcessStatus::Running);

    assert!(manager.restart("worker", "test").await);
    assert!(manager.restart("worker", "test").await);
    assert_eq!(manager.restart_count("worker").await.unwrap(), 2);
    assert_eq!(manager.total_restarts(), 2);

    assert!(!manager.restart("worker", "test").await);
    assert_eq!(manager.status("worker").await.unwrap(), ProcessStatus::Failed);

    let records = manager.records().await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].pid, None);
    assert_eq!(records[0].status, ProcessStatus::Failed);

    assert!(!manager.restart("worker", "test").await);
    assert_eq!(manager.restart_count("worker").await.unwrap(), 3);
}

#[tokio::test]
async fn exited_process_reported_and_restartable() {
    let manager = manager(3);
    let spec = ProcessSpec::new("short", "sh")
        .args(["-c", "exit 3"])
        .strategy(RestartStrategy::Immediate);
    assert!(manager.start(spec, None).await.unwrap());

    tokio::time::sleep(Duration::from_millis(300)).await;
    let report = manager.monitor("short").await.unwrap();
    assert_eq!(report.status, ProcessStatus::Stopped);
    assert!(report.has("exited"));
    assert_eq!(manager.stopped_processes().await, vec!["short".to_string()]);

    assert!(manager.restart("short", "process exited").await);
    assert_eq!(manager.restart_count("short").await.unwrap(), 1);
}

#[tokio::test]
async fn running_process_reports_metrics() {
    let manager = manager(3);
    assert!(manager.start(sleeper("metrics"), None).await.unwrap());

    let report = manager.monitor("metrics").await.unwrap();
    assert_eq!(report.status, ProcessStatus::Running);
    assert!(report.metrics.is_some());
    assert!(report.issues.is_empty());

    assert_eq!(manager.stop_all(Duration::from_secs(2)).await, 1);
    assert_eq!(manager.status("metrics").await.unwrap(), ProcessStatus::Stopped);
}

#[tokio::test]
async fn non_essential_processes_stop_first() {
    let manager = manager(3);
    assert!(manager.start(sleeper("core"), None).await.unwrap());
    assert!(manager.start(sleeper("extra").non_essential(), None).await.unwrap());

    assert_eq!(manager.stop_non_essential().await, 1);
    assert_eq!(manager.status("extra").await.unwrap(), ProcessStatus::Stopped);
    assert_eq!(manager.status("core").await.unwrap(), ProcessStatus::Running);

    assert_eq!(manager.kill_all().await, 1);
    assert_eq!(manager.status("core").await.unwrap(), ProcessStatus::Stopped);
}
