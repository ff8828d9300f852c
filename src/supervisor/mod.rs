//! Supervisor Layer for Process Management and Recovery
//!
//! This module provides the supervision runtime:
//! - Process manager for spawning, monitoring and restarting children
//! - Playbook mapping health snapshots to recovery actions
//! - Degradation ladder for load shedding
//! - Orchestrator running the health, resource and optimizer loops

pub mod degradation;
pub mod health_check;
pub mod orchestrator;
pub mod playbook;
pub mod process_manager;

pub use degradation::{DegradationLadder, DegradationStep};
pub use health_check::{HealthCheck, HealthCheckResult, HttpHealthCheck};
pub use orchestrator::{
    adaptive_interval, host_health_monitor, CycleReport, ShutdownOutcome, Supervisor,
    SupervisorOptions,
};
pub use playbook::{RecoveryAction, RecoveryPlaybook};
pub use process_manager::{
    HealthCheckSpec, ManagedProcess, ProcessIssue, ProcessManager, ProcessManagerConfig,
    ProcessMetrics, ProcessReport, ProcessSpec, ProcessStatus, RestartStrategy,
};
