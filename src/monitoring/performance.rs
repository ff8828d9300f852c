//! CPU / IO / network sampling and degradation detection

use super::probe::PerformanceProbe;
use super::ring_buffer::RingBuffer;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSample {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_cpu_percent: f64,
    pub process_memory_percent: f64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub net_sent_bytes: u64,
    pub net_recv_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub load_avg: Option<[f64; 3]>,
    pub thread_count: usize,
}

/// Mean resource usage over the first samples after start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceBaseline {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_cpu_percent: f64,
    pub process_memory_percent: f64,
    pub established_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerformanceAverages {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_cpu_percent: f64,
    pub process_memory_percent: f64,
}

#[derive(Debug, Clone)]
pub struct PerformanceSamplerConfig {
    pub history_capacity: usize,
    pub baseline_samples: usize,
    pub recent_window: usize,
    /// Relative increase over baseline, in percent, that counts as degradation
    pub degradation_threshold_percent: f64,
}

impl Default for PerformanceSamplerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 2000,
            baseline_samples: 50,
            recent_window: 10,
            degradation_threshold_percent: 50.0,
        }
    }
}

pub struct PerformanceSampler {
    config: PerformanceSamplerConfig,
    probe: Box<dyn PerformanceProbe>,
    history: RingBuffer<PerformanceSample>,
    baseline: Option<PerformanceBaseline>,
}

impl PerformanceSampler {
    pub fn new(config: PerformanceSamplerConfig, probe: Box<dyn PerformanceProbe>) -> Self {
        Self {
            history: RingBuffer::labeled("performance_history", config.history_capacity),
            config,
            probe,
            baseline: None,
        }
    }

    /// Capture current performance metrics; failures are logged and skipped
    pub fn sample(&mut self) -> Option<PerformanceSample> {
        let reading = match self.probe.read_performance() {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Performance sampling failed, keeping previous sample: {}", e);
                return None;
            }
        };

        let sample = PerformanceSample {
            timestamp: Utc::now(),
            cpu_percent: reading.cpu_percent,
            memory_percent: reading.memory_percent,
            process_cpu_percent: reading.process_cpu_percent,
            process_memory_percent: reading.process_memory_percent,
            io_read_bytes: reading.io_read_bytes,
            io_write_bytes: reading.io_write_bytes,
            net_sent_bytes: reading.net_sent_bytes,
            net_recv_bytes: reading.net_recv_bytes,
            load_avg: reading.load_avg,
            thread_count: reading.thread_count,
        };

        self.record(sample.clone());
        Some(sample)
    }

    /// Append a sample, establishing the baseline once enough data exists
    pub fn record(&mut self, sample: PerformanceSample) {
        self.history.push(sample);

        if self.baseline.is_none() && self.history.len() >= self.config.baseline_samples.max(1) {
            let n = self.config.baseline_samples.max(1);
            let avg = average(self.history.iter().take(n));
            let baseline = PerformanceBaseline {
                cpu_percent: avg.cpu_percent,
                memory_percent: avg.memory_percent,
                process_cpu_percent: avg.process_cpu_percent,
                process_memory_percent: avg.process_memory_percent,
                established_at: Utc::now(),
            };
            info!(
                "Performance baseline established: cpu {:.1}%, memory {:.1}%",
                baseline.cpu_percent, baseline.memory_percent
            );
            self.baseline = Some(baseline);
        }
    }

    pub fn latest(&self) -> Option<&PerformanceSample> {
        self.history.latest()
    }

    pub fn history(&self) -> &RingBuffer<PerformanceSample> {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut RingBuffer<PerformanceSample> {
        &mut self.history
    }

    pub fn baseline(&self) -> Option<&PerformanceBaseline> {
        self.baseline.as_ref()
    }

    /// Reuse a baseline persisted by a previous run
    pub fn restore_baseline(&mut self, baseline: PerformanceBaseline) {
        self.baseline = Some(baseline);
    }

    /// Mean of the newest `n` samples
    pub fn recent_average(&self, n: usize) -> Option<PerformanceAverages> {
        if self.history.is_empty() || n == 0 {
            return None;
        }
        Some(average(self.history.last_n(n)))
    }

    /// True when recent CPU or memory usage rose more than the configured
    /// percentage above the baseline.
    pub fn detect_degradation(&self) -> bool {
        let Some(baseline) = &self.baseline else {
            return false;
        };
        if self.history.len() < self.config.recent_window {
            return false;
        }
        let Some(recent) = self.recent_average(self.config.recent_window) else {
            return false;
        };

        let cpu_increase = relative_increase(recent.cpu_percent, baseline.cpu_percent);
        let memory_increase = relative_increase(recent.memory_percent, baseline.memory_percent);
        let threshold = self.config.degradation_threshold_percent;

        if cpu_increase > threshold || memory_increase > threshold {
            warn!(
                "Performance degradation: cpu +{:.1}%, memory +{:.1}% over baseline",
                cpu_increase, memory_increase
            );
            return true;
        }
        false
    }
}

fn relative_increase(current: f64, baseline: f64) -> f64 {
    (current - baseline) / baseline.max(1.0) * 100.0
}

fn average<'a>(samples: impl Iterator<Item = &'a PerformanceSample>) -> PerformanceAverages {
    let mut count = 0usize;
    let mut sum = PerformanceAverages {
        cpu_percent: 0.0,
        memory_percent: 0.0,
        process_cpu_percent: 0.0,
        process_memory_percent: 0.0,
    };

    for s in samples {
        count += 1;
        sum.cpu_percent += s.cpu_percent;
        sum.memory_percent += s.memory_percent;
        sum.process_cpu_percent += s.process_cpu_percent;
        sum.process_memory_percent += s.process_memory_percent;
    }

    let n = count.max(1) as f64;
    PerformanceAverages {
        cpu_percent: sum.cpu_percent / n,
        memory_percent: sum.memory_percent / n,
        process_cpu_percent: sum.process_cpu_percent / n,
        process_memory_percent: sum.process_memory_percent / n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Result, VigilError};
    use crate::monitoring::probe::PerformanceReading;

    struct FailingProbe;

    impl PerformanceProbe for FailingProbe {
        fn read_performance(&mut self) -> Result<PerformanceReading> {
            Err(VigilError::Sampling("no data".into()))
        }
    }

    fn sample(cpu: f64, memory: f64) -> PerformanceSample {
        PerformanceSample {
            timestamp: Utc::now(),
            cpu_percent: cpu,
            memory_percent: memory,
            process_cpu_percent: cpu / 2.0,
            process_memory_percent: 1.0,
            io_read_bytes: 0,
            io_write_bytes: 0,
            net_sent_bytes: 0,
            net_recv_bytes: 0,
            load_avg: None,
            thread_count: 4,
        }
    }

    fn sampler() -> PerformanceSampler {
        PerformanceSampler::new(PerformanceSamplerConfig::default(), Box::new(FailingProbe))
    }

    #[test]
    fn test_sampling_failure_is_skipped() {
        let mut sampler = sampler();
        assert!(sampler.sample().is_none());
        assert!(sampler.history().is_empty());
    }

    #[test]
    fn test_baseline_from_first_fifty_samples() {
        let mut sampler = sampler();
        for _ in 0..49 {
            sampler.record(sample(20.0, 40.0));
        }
        assert!(sampler.baseline().is_none());

        sampler.record(sample(20.0, 40.0));
        let baseline = sampler.baseline().unwrap();
        assert!((baseline.cpu_percent - 20.0).abs() < 1e-9);
        assert!((baseline.memory_percent - 40.0).abs() < 1e-9);

        // Later samples never move an established baseline
        sampler.record(sample(90.0, 90.0));
        assert!((sampler.baseline().unwrap().cpu_percent - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_degradation_on_cpu_increase() {
        let mut sampler = sampler();
        for _ in 0..50 {
            sampler.record(sample(20.0, 40.0));
        }
        assert!(!sampler.detect_degradation());

        for _ in 0..10 {
            sampler.record(sample(29.0, 40.0));
        }
        assert!(!sampler.detect_degradation());

        for _ in 0..10 {
            sampler.record(sample(31.0, 40.0));
        }
        assert!(sampler.detect_degradation());
    }

    #[test]
    fn test_degradation_on_memory_increase() {
        let mut sampler = sampler();
        for _ in 0..50 {
            sampler.record(sample(10.0, 30.0));
        }
        for _ in 0..10 {
            sampler.record(sample(10.0, 50.0));
        }
        assert!(sampler.detect_degradation());
    }

    #[test]
    fn test_idle_baseline_does_not_divide_by_zero() {
        let mut sampler = sampler();
        for _ in 0..50 {
            sampler.record(sample(0.0, 30.0));
        }
        for _ in 0..10 {
            sampler.record(sample(0.4, 30.0));
        }
        assert!(!sampler.detect_degradation());
    }
}
