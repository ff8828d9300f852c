use chrono::{Duration as ChronoDuration, Utc};
use vigil::config::ThresholdConfig;
use vigil::error::{Result, VigilError};
use vigil::monitoring::memory::MB;
use vigil::monitoring::probe::{MemoryReading, PerformanceReading};
use vigil::monitoring::{
    HealthMonitor, HealthState, MemoryProbe, MemorySample, MemorySampler, MemorySamplerConfig,
    PerformanceProbe, PerformanceSampler, PerformanceSamplerConfig,
};

struct Offline;

impl MemoryProbe for Offline {
    fn read_memory(&mut self) -> Result<MemoryReading> {
        Err(VigilError::Sampling("offline".into()))
    }
}

impl PerformanceProbe for Offline {
    fn read_performance(&mut self) -> Result<PerformanceReading> {
        Err(VigilError::Sampling("offline".into()))
    }
}

/// One sample per minute, resident size growing by `step_mb` each time
fn ramp(sampler: &mut MemorySampler, count: usize, step_mb: f64) {
    let start = Utc::now() - ChronoDuration::minutes(count as i64);
    for i in 0..count {
        sampler.record(MemorySample {
            timestamp: start + ChronoDuration::minutes(i as i64),
            resident_bytes: ((200.0 + step_mb * i as f64) * MB) as u64,
            virtual_bytes: 0,
            percent_of_limit: 10.0,
            system_available_bytes: 0,
            live_object_count: 40,
            collector_counts: [0; 3],
        });
    }
}

fn sampler() -> MemorySampler {
    MemorySampler::new(MemorySamplerConfig::default(), Box::new(Offline))
}

#[test]
fn growth_rate_is_sixty_times_per_minute_step() {
    for step in [0.05, 0.1, 0.5, 2.0] {
        let mut sampler = sampler();
        ramp(&mut sampler, 30, step);
        let rate = sampler.growth_rate_mb_per_hour().unwrap();
        assert!((rate - 60.0 * step).abs() < 0.01, "step {} gave {}", step, rate);
    }
}

#[test]
fn leak_flagged_only_above_allowed_rate() {
    let mut slow = sampler();
    ramp(&mut slow, 30, 0.1);
    assert!(!slow.detect_leak());

    let mut fast = sampler();
    ramp(&mut fast, 30, 0.2);
    assert!(fast.detect_leak());

    let mut short = sampler();
    ramp(&mut short, 29, 5.0);
    assert!(!short.detect_leak());
}

#[test]
fn leak_makes_host_critical_regardless_of_score() {
    let mut monitor = HealthMonitor::new(
        ThresholdConfig::default(),
        sampler(),
        PerformanceSampler::new(PerformanceSamplerConfig::default(), Box::new(Offline)),
        50,
    );
    ramp(monitor.memory_mut(), 30, 1.0);

    let snapshot = monitor.evaluate(None);
    assert!(snapshot.detected_issues.memory_leak);
    assert!(snapshot.health_score > 0.9);
    assert_eq!(snapshot.health_state, HealthState::Critical);
    assert_eq!(monitor.history().len(), 1);
}
