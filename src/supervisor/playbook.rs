//! Recovery Playbook
//!
//! Maps each health snapshot to the ordered list of recovery actions the
//! orchestrator should execute. Pure: no I/O, no state.

use crate::config::{FeatureConfig, RestartConfig, ThresholdConfig};
use crate::monitoring::health::{HealthSnapshot, HealthState};
use crate::monitoring::ring_buffer::ReclaimLevel;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Recovery actions that can be taken
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    /// Run a memory reclamation pass
    ReclaimMemory { level: ReclaimLevel },
    /// Raise the niceness of every managed process
    LowerPriority { penalty: i32 },
    /// Restart all managed processes after a delay
    ScheduleEmergencyRestart { delay_secs: u64 },
    /// Move one step down the degradation ladder
    AdvanceDegradation,
    /// Restart processes whose last report flagged high memory
    RestartHighMemoryProcesses,
}

impl std::fmt::Display for RecoveryAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecoveryAction::ReclaimMemory { level } => write!(f, "reclaim memory ({})", level),
            RecoveryAction::LowerPriority { penalty } => {
                write!(f, "lower process priority (+{})", penalty)
            }
            RecoveryAction::ScheduleEmergencyRestart { delay_secs } => {
                write!(f, "emergency restart in {}s", delay_secs)
            }
            RecoveryAction::AdvanceDegradation => write!(f, "advance degradation"),
            RecoveryAction::RestartHighMemoryProcesses => write!(f, "restart high-memory processes"),
        }
    }
}

/// Recovery playbook with predefined responses
#[derive(Debug, Clone)]
pub struct RecoveryPlaybook {
    pub memory_emergency_percent: f64,
    pub cpu_emergency_percent: f64,
    /// Scores below this schedule an emergency restart
    pub emergency_restart_score: f64,
    pub emergency_restart_delay: Duration,
    pub priority_penalty: i32,
    pub self_healing: bool,
    pub graceful_degradation: bool,
    pub auto_restart: bool,
}

impl Default for RecoveryPlaybook {
    fn default() -> Self {
        Self::new(
            &ThresholdConfig::default(),
            &RestartConfig::default(),
            &FeatureConfig::default(),
        )
    }
}

impl RecoveryPlaybook {
    pub fn new(thresholds: &ThresholdConfig, restart: &RestartConfig, features: &FeatureConfig) -> Self {
        Self {
            memory_emergency_percent: thresholds.memory_emergency_percent,
            cpu_emergency_percent: thresholds.cpu_emergency_percent,
            emergency_restart_score: thresholds.emergency_restart_score,
            emergency_restart_delay: Duration::from_secs(restart.emergency_restart_delay_secs),
            priority_penalty: restart.priority_penalty,
            self_healing: features.enable_self_healing,
            graceful_degradation: features.enable_graceful_degradation,
            auto_restart: features.enable_auto_restart,
        }
    }

    /// Determine recovery actions for a snapshot.
    ///
    /// Emergency mode keeps the Critical reactions; each one is still gated
    /// on the pressure it addresses.
    pub fn actions_for(&self, snapshot: &HealthSnapshot) -> Vec<RecoveryAction> {
        match snapshot.health_state {
            HealthState::Critical | HealthState::Emergency => self.handle_critical(snapshot),
            HealthState::Degraded => self.handle_degraded(),
            HealthState::Healthy | HealthState::Recovering => Vec::new(),
        }
    }

    fn handle_critical(&self, snapshot: &HealthSnapshot) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();
        if !self.self_healing {
            return actions;
        }

        if snapshot
            .memory_pressure()
            .is_some_and(|m| m > self.memory_emergency_percent)
        {
            actions.push(RecoveryAction::ReclaimMemory {
                level: ReclaimLevel::Emergency,
            });
        }

        if snapshot
            .cpu_pressure()
            .is_some_and(|c| c > self.cpu_emergency_percent)
        {
            actions.push(RecoveryAction::LowerPriority {
                penalty: self.priority_penalty,
            });
        }

        if snapshot.health_score < self.emergency_restart_score {
            actions.push(RecoveryAction::ScheduleEmergencyRestart {
                delay_secs: self.emergency_restart_delay.as_secs(),
            });
        }

        actions
    }

    fn handle_degraded(&self) -> Vec<RecoveryAction> {
        let mut actions = Vec::new();
        if self.graceful_degradation {
            actions.push(RecoveryAction::AdvanceDegradation);
        }
        if self.auto_restart {
            actions.push(RecoveryAction::RestartHighMemoryProcesses);
        }
        actions
    }
}
