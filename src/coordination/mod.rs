//! Coordination primitives shared by the supervisor loops
//!
//! - Adaptive circuit breaker guarding outbound calls
//! - Shutdown signalling with graceful/emergency escalation

pub mod circuit_breaker;
pub mod shutdown;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState, CircuitError, CircuitState,
};
pub use shutdown::{
    install_signal_handlers, ShutdownController, ShutdownRequest, ShutdownSignal, ShutdownToken,
};
