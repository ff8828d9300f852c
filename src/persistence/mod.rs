//! Persistence Layer for State Management and Recovery
//!
//! - Checksummed, atomically replaced state file with backup fallback
//! - Tiered retention for superseded state files

pub mod retention;
pub mod state_store;

pub use retention::{BackupEntry, RetentionPolicy};
pub use state_store::{
    EmergencyMarker, LoadSource, ProcessRecord, StatePayload, StateStore, STATE_VERSION,
};
