//! Memory sampling and leak detection

use super::probe::MemoryProbe;
use super::ring_buffer::{ReclaimLevel, Reclaimable, RingBuffer};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const MB: f64 = 1024.0 * 1024.0;

/// One memory observation of the supervised host process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    /// Resident size relative to the memory limit, 0-100+
    pub percent_of_limit: f64,
    pub system_available_bytes: u64,
    /// Open handles held by the process
    pub live_object_count: u64,
    /// Reclamation passes run so far, by level (routine, aggressive, emergency)
    pub collector_counts: [u64; 3],
}

#[derive(Debug, Clone)]
pub struct MemorySamplerConfig {
    pub history_capacity: usize,
    pub leak_window: usize,
    pub max_growth_rate_mb_per_hour: f64,
    pub object_growth_threshold: u64,
    pub gc_frequency: Duration,
    /// Explicit limit; the host's total memory when unset
    pub memory_limit_bytes: Option<u64>,
}

impl Default for MemorySamplerConfig {
    fn default() -> Self {
        Self {
            history_capacity: 1000,
            leak_window: 30,
            max_growth_rate_mb_per_hour: 10.0,
            object_growth_threshold: 500,
            gc_frequency: Duration::from_secs(300),
            memory_limit_bytes: None,
        }
    }
}

/// Outcome of a reclamation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimizationReport {
    pub actions: Vec<String>,
    pub bytes_saved: u64,
    /// The pass was throttled by `gc_frequency`
    pub skipped: bool,
}

pub struct MemorySampler {
    config: MemorySamplerConfig,
    probe: Box<dyn MemoryProbe>,
    history: RingBuffer<MemorySample>,
    limit_bytes: Option<u64>,
    reclaim_passes: [u64; 3],
    last_optimization: Option<Instant>,
}

impl MemorySampler {
    pub fn new(config: MemorySamplerConfig, probe: Box<dyn MemoryProbe>) -> Self {
        Self {
            history: RingBuffer::labeled("memory_history", config.history_capacity),
            limit_bytes: config.memory_limit_bytes,
            config,
            probe,
            reclaim_passes: [0; 3],
            last_optimization: None,
        }
    }

    /// Capture current memory metrics and append them to the history.
    ///
    /// A failed read is logged and skipped; the previous sample stays latest.
    pub fn sample(&mut self) -> Option<MemorySample> {
        let reading = match self.probe.read_memory() {
            Ok(reading) => reading,
            Err(e) => {
                warn!("Memory sampling failed, keeping previous sample: {}", e);
                return None;
            }
        };

        let limit = self
            .config
            .memory_limit_bytes
            .unwrap_or(reading.system_total_bytes)
            .max(1);
        self.limit_bytes = Some(limit);

        let sample = MemorySample {
            timestamp: Utc::now(),
            resident_bytes: reading.resident_bytes,
            virtual_bytes: reading.virtual_bytes,
            percent_of_limit: reading.resident_bytes as f64 / limit as f64 * 100.0,
            system_available_bytes: reading.system_available_bytes,
            live_object_count: reading.open_handles,
            collector_counts: self.reclaim_passes,
        };

        self.record(sample.clone());
        Some(sample)
    }

    /// Append an externally produced sample
    pub fn record(&mut self, sample: MemorySample) {
        self.history.push(sample);
    }

    pub fn latest(&self) -> Option<&MemorySample> {
        self.history.latest()
    }

    pub fn history(&self) -> &RingBuffer<MemorySample> {
        &self.history
    }

    /// Limit used for `percent_of_limit`, known after the first sample
    pub fn limit_bytes(&self) -> Option<u64> {
        self.limit_bytes
    }

    pub fn set_limit_bytes(&mut self, limit: u64) {
        self.limit_bytes = Some(limit.max(1));
    }

    /// Resident growth over the leak window, in bytes per second
    pub fn growth_rate_bytes_per_sec(&self) -> Option<f64> {
        let window = self.config.leak_window.max(2);
        if self.history.len() < window {
            return None;
        }

        let oldest = self.history.nth_back(window - 1)?;
        let newest = self.history.latest()?;
        let elapsed = (newest.timestamp - oldest.timestamp).num_milliseconds() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }

        let delta = newest.resident_bytes as f64 - oldest.resident_bytes as f64;
        Some(delta / elapsed)
    }

    pub fn growth_rate_mb_per_hour(&self) -> Option<f64> {
        self.growth_rate_bytes_per_sec()
            .map(|rate| rate * 3600.0 / MB)
    }

    /// True when resident memory grows faster than allowed or open handles
    /// jumped between the two most recent samples.
    pub fn detect_leak(&self) -> bool {
        let Some(rate) = self.growth_rate_mb_per_hour() else {
            return false;
        };

        if rate > self.config.max_growth_rate_mb_per_hour {
            warn!(
                "Memory leak suspected: {:.2} MB/hour exceeds {:.2} MB/hour",
                rate, self.config.max_growth_rate_mb_per_hour
            );
            return true;
        }

        if let (Some(newest), Some(previous)) = (self.history.nth_back(0), self.history.nth_back(1)) {
            let growth = newest
                .live_object_count
                .saturating_sub(previous.live_object_count);
            if growth > self.config.object_growth_threshold {
                warn!(
                    "Handle leak suspected: {} new handles since last sample",
                    growth
                );
                return true;
            }
        }

        false
    }

    /// Run a reclamation pass over the sampler's own history and `extra`
    /// buffers, reporting the resident-size delta.
    ///
    /// Routine and aggressive passes run at most once per `gc_frequency`.
    pub fn optimize(
        &mut self,
        level: ReclaimLevel,
        extra: &mut [&mut dyn Reclaimable],
    ) -> OptimizationReport {
        if level != ReclaimLevel::Emergency {
            if let Some(last) = self.last_optimization {
                if last.elapsed() < self.config.gc_frequency {
                    debug!(
                        "Skipping {} reclamation, last pass {:?} ago",
                        level,
                        last.elapsed()
                    );
                    return OptimizationReport {
                        skipped: true,
                        ..Default::default()
                    };
                }
            }
        }

        let before = self.current_resident();
        let mut actions = Vec::new();
        let mut estimated = self.history.reclaim(level);
        actions.push(format!("{} reclamation of {}", level, self.history.label()));

        for buffer in extra.iter_mut() {
            estimated += buffer.reclaim(level);
            actions.push(format!("{} reclamation of {}", level, buffer.label()));
        }

        if release_heap() {
            actions.push("returned free heap pages to the OS".to_string());
        }

        let after = self.current_resident();
        let bytes_saved = match (before, after) {
            (Some(before), Some(after)) => before.saturating_sub(after),
            _ => estimated,
        };

        self.reclaim_passes[level.index()] += 1;
        self.last_optimization = Some(Instant::now());

        info!(
            "{} memory optimization finished: {} actions, {} bytes reclaimed",
            level,
            actions.len(),
            bytes_saved
        );

        OptimizationReport {
            actions,
            bytes_saved,
            skipped: false,
        }
    }

    pub fn reclaim_passes(&self) -> [u64; 3] {
        self.reclaim_passes
    }

    fn current_resident(&mut self) -> Option<u64> {
        self.probe.read_memory().ok().map(|r| r.resident_bytes)
    }
}

#[cfg(all(target_os = "linux", target_env = "gnu"))]
fn release_heap() -> bool {
    // SAFETY: malloc_trim only walks the allocator's own free lists.
    unsafe { libc::malloc_trim(0) == 1 }
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
fn release_heap() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VigilError;
    use crate::monitoring::probe::MemoryReading;
    use chrono::Duration as ChronoDuration;
    use std::collections::VecDeque;

    struct ScriptedProbe {
        readings: VecDeque<crate::error::Result<MemoryReading>>,
    }

    impl MemoryProbe for ScriptedProbe {
        fn read_memory(&mut self) -> crate::error::Result<MemoryReading> {
            self.readings
                .pop_front()
                .unwrap_or_else(|| Err(VigilError::Sampling("exhausted".into())))
        }
    }

    fn reading(resident_mb: u64) -> MemoryReading {
        MemoryReading {
            resident_bytes: resident_mb * 1024 * 1024,
            virtual_bytes: resident_mb * 2 * 1024 * 1024,
            system_total_bytes: 16 * 1024 * 1024 * 1024,
            system_available_bytes: 8 * 1024 * 1024 * 1024,
            open_handles: 10,
        }
    }

    fn sampler_with(readings: Vec<crate::error::Result<MemoryReading>>) -> MemorySampler {
        MemorySampler::new(
            MemorySamplerConfig::default(),
            Box::new(ScriptedProbe {
                readings: readings.into(),
            }),
        )
    }

    fn synthetic(start: DateTime<Utc>, minute: i64, resident_mb: f64, handles: u64) -> MemorySample {
        MemorySample {
            timestamp: start + ChronoDuration::minutes(minute),
            resident_bytes: (resident_mb * MB) as u64,
            virtual_bytes: 0,
            percent_of_limit: 0.0,
            system_available_bytes: 0,
            live_object_count: handles,
            collector_counts: [0; 3],
        }
    }

    #[test]
    fn test_failed_sample_keeps_previous() {
        let mut sampler = sampler_with(vec![
            Ok(reading(100)),
            Err(VigilError::Sampling("boom".into())),
        ]);

        let first = sampler.sample().unwrap();
        assert!(sampler.sample().is_none());
        assert_eq!(sampler.latest(), Some(&first));
        assert_eq!(sampler.history().len(), 1);
    }

    #[test]
    fn test_percent_of_limit_uses_configured_limit() {
        let mut sampler = MemorySampler::new(
            MemorySamplerConfig {
                memory_limit_bytes: Some(400 * 1024 * 1024),
                ..Default::default()
            },
            Box::new(ScriptedProbe {
                readings: vec![Ok(reading(100))].into(),
            }),
        );

        let sample = sampler.sample().unwrap();
        assert!((sample.percent_of_limit - 25.0).abs() < 1e-9);
    }

    #[test]
    fn test_leak_requires_full_window() {
        let mut sampler = sampler_with(vec![]);
        let start = Utc::now();
        for i in 0..29 {
            sampler.record(synthetic(start, i, 1000.0 + 100.0 * i as f64, 10));
        }
        assert!(!sampler.detect_leak());
    }

    #[test]
    fn test_leak_threshold_is_strict() {
        let start = Utc::now();

        for (rate_per_hour, expected) in [(5.0, false), (10.0, false), (12.0, true), (600.0, true)] {
            let mut sampler = sampler_with(vec![]);
            let step = rate_per_hour / 60.0;
            for i in 0..30 {
                sampler.record(synthetic(start, i, 1000.0 + step * i as f64, 10));
            }
            assert_eq!(sampler.detect_leak(), expected, "rate {}", rate_per_hour);
        }
    }

    #[test]
    fn test_handle_growth_flags_leak() {
        let mut sampler = sampler_with(vec![]);
        let start = Utc::now();
        for i in 0..30 {
            let handles = if i == 29 { 900 } else { 10 };
            sampler.record(synthetic(start, i, 1000.0, handles));
        }
        assert!(sampler.detect_leak());
    }

    #[test]
    fn test_optimize_is_throttled() {
        let mut sampler = sampler_with(vec![
            Ok(reading(200)),
            Ok(reading(150)),
            Ok(reading(150)),
            Ok(reading(140)),
        ]);

        let first = sampler.optimize(ReclaimLevel::Routine, &mut []);
        assert!(!first.skipped);
        assert_eq!(first.bytes_saved, 50 * 1024 * 1024);

        let second = sampler.optimize(ReclaimLevel::Aggressive, &mut []);
        assert!(second.skipped);

        let emergency = sampler.optimize(ReclaimLevel::Emergency, &mut []);
        assert!(!emergency.skipped);
        assert_eq!(sampler.reclaim_passes(), [1, 0, 1]);
    }
}
