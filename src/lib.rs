pub mod adapters;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod error;
pub mod monitoring;
pub mod persistence;
pub mod supervisor;

pub use adapters::WebhookReporter;
pub use config::SupervisorConfig;
pub use coordination::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, ShutdownController, ShutdownSignal,
};
pub use error::{Result, VigilError};
pub use monitoring::{HealthMonitor, HealthSnapshot, HealthState};
pub use persistence::{StatePayload, StateStore};
pub use supervisor::{
    ProcessManager, ProcessSpec, RecoveryAction, RecoveryPlaybook, ShutdownOutcome, Supervisor,
    SupervisorOptions,
};
