//! Graceful degradation ladder
//!
//! Steps only ever advance. Resetting requires restarting the supervisor in
//! recovery mode.

use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationStep {
    #[default]
    Normal,
    ReducedMonitoring,
    NonEssentialFeaturesDisabled,
    ReducedProcessCount,
    EmergencyMode,
}

impl DegradationStep {
    pub const ALL: [DegradationStep; 5] = [
        DegradationStep::Normal,
        DegradationStep::ReducedMonitoring,
        DegradationStep::NonEssentialFeaturesDisabled,
        DegradationStep::ReducedProcessCount,
        DegradationStep::EmergencyMode,
    ];

    pub fn level(&self) -> u8 {
        *self as u8
    }

    /// Unknown levels clamp to the last step
    pub fn from_level(level: u8) -> Self {
        Self::ALL
            .get(level as usize)
            .copied()
            .unwrap_or(DegradationStep::EmergencyMode)
    }

    fn next(&self) -> Option<Self> {
        Self::ALL.get(self.level() as usize + 1).copied()
    }
}

impl std::fmt::Display for DegradationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DegradationStep::Normal => write!(f, "normal"),
            DegradationStep::ReducedMonitoring => write!(f, "reduced_monitoring"),
            DegradationStep::NonEssentialFeaturesDisabled => {
                write!(f, "non_essential_features_disabled")
            }
            DegradationStep::ReducedProcessCount => write!(f, "reduced_process_count"),
            DegradationStep::EmergencyMode => write!(f, "emergency_mode"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DegradationLadder {
    current: DegradationStep,
}

impl DegradationLadder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_level(level: u8) -> Self {
        Self {
            current: DegradationStep::from_level(level),
        }
    }

    pub fn current(&self) -> DegradationStep {
        self.current
    }

    pub fn level(&self) -> u8 {
        self.current().level()
    }

    pub fn is_at_least(&self, step: DegradationStep) -> bool {
        self.current() >= step
    }

    /// Move one step down. Returns the new step, or None at the bottom.
    pub fn advance(&mut self) -> Option<DegradationStep> {
        let next = self.current().next()?;
        self.current = next;
        warn!("Degradation advanced to level {} ({})", next.level(), next);
        Some(next)
    }

    /// Interval multiplier contributed by the ladder
    pub fn interval_factor(&self) -> f64 {
        if self.is_at_least(DegradationStep::ReducedMonitoring) {
            2.0
        } else {
            1.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advances_in_order_and_stops() {
        let mut ladder = DegradationLadder::new();
        assert_eq!(ladder.level(), 0);

        let steps: Vec<_> = std::iter::from_fn(|| ladder.advance()).collect();
        assert_eq!(steps, DegradationStep::ALL[1..].to_vec());
        assert_eq!(ladder.current(), DegradationStep::EmergencyMode);
        assert!(ladder.advance().is_none());
    }

    #[test]
    fn test_restore_from_level() {
        let ladder = DegradationLadder::from_level(2);
        assert_eq!(ladder.current(), DegradationStep::NonEssentialFeaturesDisabled);
        assert_eq!(ladder.interval_factor(), 2.0);
        assert_eq!(DegradationLadder::from_level(200).level(), 4);
        assert_eq!(DegradationLadder::new().interval_factor(), 1.0);
    }
}
