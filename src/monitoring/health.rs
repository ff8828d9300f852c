//! Composite health scoring
//!
//! Combines the memory and performance samplers (plus optional host metrics)
//! into one immutable `HealthSnapshot` per cycle.

use super::memory::{MemorySample, MemorySampler, OptimizationReport, MB};
use super::performance::{PerformanceSample, PerformanceSampler};
use super::probe::{SystemMetrics, SystemMetricsProbe};
use super::ring_buffer::{ReclaimLevel, Reclaimable, RingBuffer};
use crate::config::ThresholdConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Categorical health bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
    Recovering,
    Emergency,
}

impl HealthState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Critical => "critical",
            HealthState::Recovering => "recovering",
            HealthState::Emergency => "emergency",
        }
    }

    /// Multiplier applied to loop intervals while in this state
    pub fn interval_factor(&self) -> f64 {
        match self {
            HealthState::Critical | HealthState::Emergency => 0.5,
            HealthState::Degraded => 0.75,
            HealthState::Recovering => 1.0,
            HealthState::Healthy => 1.5,
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetectedIssues {
    pub memory_leak: bool,
    pub performance_degradation: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    MemoryLimitApproaching,
    HighCpuSustained,
}

/// Forward-looking warning derived from a resource trend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictiveAlert {
    pub kind: AlertKind,
    pub message: String,
    /// Seconds until the limit is expected to be hit
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_seconds: Option<u64>,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub timestamp: DateTime<Utc>,
    pub health_score: f64,
    pub health_state: HealthState,
    pub memory_sample: Option<MemorySample>,
    pub performance_sample: Option<PerformanceSample>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_metrics: Option<SystemMetrics>,
    pub detected_issues: DetectedIssues,
    pub predictive_alerts: Vec<PredictiveAlert>,
    pub recommendations: Vec<String>,
}

impl HealthSnapshot {
    /// Highest of the process-limit and system memory percentages
    pub fn memory_pressure(&self) -> Option<f64> {
        memory_pressure(self.memory_sample.as_ref(), self.performance_sample.as_ref())
    }

    pub fn cpu_pressure(&self) -> Option<f64> {
        self.performance_sample.as_ref().map(|p| p.cpu_percent)
    }

    pub fn disk_pressure(&self) -> Option<f64> {
        self.system_metrics.as_ref().map(|s| s.disk_usage_percent)
    }
}

fn memory_pressure(memory: Option<&MemorySample>, perf: Option<&PerformanceSample>) -> Option<f64> {
    match (memory.map(|m| m.percent_of_limit), perf.map(|p| p.memory_percent)) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Score in [0, 1] from the latest readings; 1.0 means no pressure.
pub fn compute_health_score(
    thresholds: &ThresholdConfig,
    memory_percent: Option<f64>,
    cpu_percent: Option<f64>,
    disk_percent: Option<f64>,
    thread_count: Option<usize>,
) -> f64 {
    let mut score = 1.0_f64;

    if let Some(memory) = memory_percent {
        if memory > thresholds.memory_critical_percent {
            score *= 0.3;
        } else if memory > thresholds.memory_warning_percent {
            score *= 0.7;
        }
    }

    if let Some(cpu) = cpu_percent {
        if cpu > thresholds.cpu_critical_percent {
            score *= 0.4;
        } else if cpu > thresholds.cpu_warning_percent {
            score *= 0.8;
        }
    }

    if let Some(disk) = disk_percent {
        if disk > thresholds.disk_critical_percent {
            score *= 0.5;
        }
    }

    if let Some(threads) = thread_count {
        if threads > thresholds.max_threads {
            score *= 0.9;
        }
    }

    if score.is_nan() {
        return 0.0;
    }
    score.clamp(0.0, 1.0)
}

/// Bucket a score plus detector flags into a state
pub fn derive_state(score: f64, issues: DetectedIssues) -> HealthState {
    if score < 0.3 || issues.memory_leak {
        HealthState::Critical
    } else if score < 0.5 || issues.performance_degradation {
        HealthState::Degraded
    } else if score < 0.7 {
        HealthState::Recovering
    } else {
        HealthState::Healthy
    }
}

pub struct HealthMonitor {
    thresholds: ThresholdConfig,
    memory: MemorySampler,
    performance: PerformanceSampler,
    system_probe: Option<Box<dyn SystemMetricsProbe>>,
    history: RingBuffer<HealthSnapshot>,
    predictive_alerts: bool,
    system_metrics: bool,
    emergency: bool,
}

impl HealthMonitor {
    pub fn new(
        thresholds: ThresholdConfig,
        memory: MemorySampler,
        performance: PerformanceSampler,
        history_capacity: usize,
    ) -> Self {
        Self {
            thresholds,
            memory,
            performance,
            system_probe: None,
            history: RingBuffer::labeled("snapshot_history", history_capacity),
            predictive_alerts: true,
            system_metrics: true,
            emergency: false,
        }
    }

    /// Also collect disk/network/topology metrics each cycle
    pub fn with_system_probe(mut self, probe: Box<dyn SystemMetricsProbe>) -> Self {
        self.system_probe = Some(probe);
        self
    }

    pub fn with_predictive_alerts(mut self, enabled: bool) -> Self {
        self.predictive_alerts = enabled;
        self
    }

    /// Turn off the non-essential parts of a check (alerts, host metrics)
    pub fn disable_optional_checks(&mut self) {
        if self.predictive_alerts || self.system_metrics {
            info!("Predictive alerts and system metrics disabled");
        }
        self.predictive_alerts = false;
        self.system_metrics = false;
    }

    /// Force every following snapshot into the Emergency state
    pub fn set_emergency(&mut self, emergency: bool) {
        if self.emergency != emergency {
            warn!("Health monitor emergency mode: {}", emergency);
        }
        self.emergency = emergency;
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency
    }

    pub fn memory(&self) -> &MemorySampler {
        &self.memory
    }

    pub fn memory_mut(&mut self) -> &mut MemorySampler {
        &mut self.memory
    }

    pub fn performance(&self) -> &PerformanceSampler {
        &self.performance
    }

    pub fn performance_mut(&mut self) -> &mut PerformanceSampler {
        &mut self.performance
    }

    pub fn history(&self) -> &RingBuffer<HealthSnapshot> {
        &self.history
    }

    pub fn latest(&self) -> Option<&HealthSnapshot> {
        self.history.latest()
    }

    /// Sample everything and produce this cycle's snapshot
    pub fn check(&mut self) -> HealthSnapshot {
        self.memory.sample();
        self.performance.sample();

        let enabled = self.system_metrics;
        let system_metrics = match self.system_probe.as_mut().filter(|_| enabled) {
            Some(probe) => match probe.read_system() {
                Ok(metrics) => Some(metrics),
                Err(e) => {
                    warn!("System metrics unavailable this cycle: {}", e);
                    None
                }
            },
            None => None,
        };

        self.evaluate(system_metrics)
    }

    /// Score the latest samples without taking new ones
    pub fn evaluate(&mut self, system_metrics: Option<SystemMetrics>) -> HealthSnapshot {
        let memory_sample = self.memory.latest().cloned();
        let performance_sample = self.performance.latest().cloned();

        let health_score = compute_health_score(
            &self.thresholds,
            memory_pressure(memory_sample.as_ref(), performance_sample.as_ref()),
            performance_sample.as_ref().map(|p| p.cpu_percent),
            system_metrics.as_ref().map(|s| s.disk_usage_percent),
            performance_sample.as_ref().map(|p| p.thread_count),
        );

        let detected_issues = DetectedIssues {
            memory_leak: self.memory.detect_leak(),
            performance_degradation: self.performance.detect_degradation(),
        };

        let health_state = if self.emergency {
            HealthState::Emergency
        } else {
            derive_state(health_score, detected_issues)
        };

        let predictive_alerts = if self.predictive_alerts {
            self.predictive_alerts(memory_sample.as_ref())
        } else {
            Vec::new()
        };
        let recommendations = recommendations(health_state, detected_issues, &predictive_alerts);

        let snapshot = HealthSnapshot {
            timestamp: Utc::now(),
            health_score,
            health_state,
            memory_sample,
            performance_sample,
            system_metrics,
            detected_issues,
            predictive_alerts,
            recommendations,
        };

        match health_state {
            HealthState::Healthy | HealthState::Recovering => debug!(
                score = health_score,
                state = %health_state,
                "Health check complete"
            ),
            _ => warn!(
                score = health_score,
                state = %health_state,
                leak = detected_issues.memory_leak,
                degradation = detected_issues.performance_degradation,
                "Health check complete"
            ),
        }

        self.history.push(snapshot.clone());
        snapshot
    }

    fn predictive_alerts(&self, memory_sample: Option<&MemorySample>) -> Vec<PredictiveAlert> {
        let mut alerts = Vec::new();

        if let (Some(sample), Some(rate), Some(limit)) = (
            memory_sample,
            self.memory.growth_rate_bytes_per_sec(),
            self.memory.limit_bytes(),
        ) {
            if rate > 0.0 {
                let remaining = limit.saturating_sub(sample.resident_bytes) as f64;
                let eta = remaining / rate;
                if eta < 3600.0 {
                    alerts.push(PredictiveAlert {
                        kind: AlertKind::MemoryLimitApproaching,
                        message: format!(
                            "memory limit reached in ~{:.0} minutes at {:.1} MB/hour",
                            eta / 60.0,
                            rate * 3600.0 / MB
                        ),
                        eta_seconds: Some(eta as u64),
                        value: sample.percent_of_limit,
                    });
                }
            }
        }

        if let Some(avg) = self.performance.recent_average(10) {
            if avg.cpu_percent > self.thresholds.cpu_warning_percent {
                alerts.push(PredictiveAlert {
                    kind: AlertKind::HighCpuSustained,
                    message: format!(
                        "CPU averaged {:.1}% over recent samples (warning at {:.1}%)",
                        avg.cpu_percent, self.thresholds.cpu_warning_percent
                    ),
                    eta_seconds: None,
                    value: avg.cpu_percent,
                });
            }
        }

        alerts
    }

    /// Reclaim memory from the samplers and the snapshot history
    pub fn optimize_memory(&mut self, level: ReclaimLevel) -> OptimizationReport {
        let mut extra: [&mut dyn Reclaimable; 2] =
            [&mut self.history, self.performance.history_mut()];
        let report = self.memory.optimize(level, &mut extra);
        if !report.skipped {
            info!(
                "Reclaimed {} bytes ({} level)",
                report.bytes_saved, level
            );
        }
        report
    }
}

fn recommendations(
    state: HealthState,
    issues: DetectedIssues,
    alerts: &[PredictiveAlert],
) -> Vec<String> {
    let mut out = Vec::new();

    match state {
        HealthState::Emergency => {
            out.push("emergency mode active - only essential processes are kept".to_string());
            out.push("investigate host resources before resetting the degradation ladder".to_string());
        }
        HealthState::Critical => {
            out.push("restart recommended - resource pressure is critical".to_string());
        }
        HealthState::Degraded => {
            out.push("reduce load - supervisor is degrading non-essential features".to_string());
        }
        HealthState::Recovering => {
            out.push("monitor closely - resources are recovering".to_string());
        }
        HealthState::Healthy => {}
    }

    if issues.memory_leak {
        out.push("memory leak - restart affected processes".to_string());
    }
    if issues.performance_degradation {
        out.push("performance degraded against baseline - check recent deployments".to_string());
    }

    for alert in alerts {
        match alert.kind {
            AlertKind::MemoryLimitApproaching => {
                out.push("memory limit approaching - schedule a restart before the limit".to_string())
            }
            AlertKind::HighCpuSustained => {
                out.push("sustained high CPU - consider lowering process priority".to_string())
            }
        }
    }

    out
}
