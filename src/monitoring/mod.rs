//! Resource sampling and health scoring

pub mod health;
pub mod memory;
pub mod performance;
pub mod probe;
pub mod ring_buffer;

pub use health::{
    AlertKind, DetectedIssues, HealthMonitor, HealthSnapshot, HealthState, PredictiveAlert,
};
pub use memory::{MemorySample, MemorySampler, MemorySamplerConfig, OptimizationReport};
pub use performance::{
    PerformanceBaseline, PerformanceSample, PerformanceSampler, PerformanceSamplerConfig,
};
pub use probe::{HostProbe, MemoryProbe, PerformanceProbe, SystemMetrics, SystemMetricsProbe};
pub use ring_buffer::{ReclaimLevel, Reclaimable, RingBuffer};
