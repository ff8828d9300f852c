//! Crash-safe supervisor state
//!
//! The state file is a JSON envelope `{version, timestamp, checksum, data}`.
//! Writes go to a temp file that is re-read and verified before being renamed
//! over the primary; the superseded primary is moved into the backup directory.
//! Loads fall back through backups, newest first, and finally to a default
//! state, so a corrupt file never reaches the caller.
//!
//! Writers are serialized across clones of a store. Once the final state of
//! a run is written the store is sealed and later checkpoints are dropped.

use super::retention::{BackupEntry, RetentionPolicy};
use crate::config::PersistenceConfig;
use crate::error::{Result, VigilError};
use crate::monitoring::health::HealthState;
use crate::monitoring::performance::PerformanceBaseline;
use crate::supervisor::process_manager::ProcessStatus;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

pub const STATE_VERSION: u32 = 1;

const BACKUP_PREFIX: &str = "state_backup_";
const BACKUP_STAMP: &str = "%Y%m%d_%H%M%S_%6f";
const BACKUP_STAMP_LEN: usize = 22;

/// Managed process as recorded in the state file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub name: String,
    pub pid: Option<u32>,
    pub restart_count: u32,
    pub status: ProcessStatus,
}

/// Why and when an emergency shutdown happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmergencyMarker {
    pub reason: String,
    pub triggered_at: DateTime<Utc>,
}

/// Supervisor state carried across restarts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatePayload {
    pub restart_count: u64,
    pub error_count: u64,
    pub degradation_level: u8,
    /// True while the supervisor runs; cleared on graceful shutdown
    pub was_running: bool,
    pub uptime_secs: u64,
    pub health_state: HealthState,
    pub health_score: f64,
    pub performance_baseline: Option<PerformanceBaseline>,
    pub managed_processes: Vec<ProcessRecord>,
    pub config_snapshot: Value,
    pub unclean_shutdowns: u64,
    pub emergency: Option<EmergencyMarker>,
}

impl Default for StatePayload {
    fn default() -> Self {
        Self {
            restart_count: 0,
            error_count: 0,
            degradation_level: 0,
            was_running: false,
            uptime_secs: 0,
            health_state: HealthState::Healthy,
            health_score: 1.0,
            performance_baseline: None,
            managed_processes: Vec::new(),
            config_snapshot: Value::Null,
            unclean_shutdowns: 0,
            emergency: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateEnvelope {
    version: u32,
    timestamp: DateTime<Utc>,
    checksum: String,
    data: Value,
}

/// Where a loaded state came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup(PathBuf),
    Default,
}

impl std::fmt::Display for LoadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadSource::Primary => write!(f, "primary"),
            LoadSource::Backup(path) => write!(f, "backup {}", path.display()),
            LoadSource::Default => write!(f, "default"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StateStore {
    state_path: PathBuf,
    backup_dir: PathBuf,
    retention: RetentionPolicy,
    /// Held for the whole write; true once `save_final` ran
    sealed: Arc<Mutex<bool>>,
}

impl StateStore {
    pub fn new(state_path: impl Into<PathBuf>, backup_dir: impl Into<PathBuf>, retention: RetentionPolicy) -> Self {
        Self {
            state_path: state_path.into(),
            backup_dir: backup_dir.into(),
            retention,
            sealed: Arc::new(Mutex::new(false)),
        }
    }

    /// Paths from config, relative to `base_dir`
    pub fn from_config(base_dir: &Path, config: &PersistenceConfig, retention: RetentionPolicy) -> Self {
        Self::new(
            base_dir.join(&config.state_file),
            base_dir.join(&config.backup_dir),
            retention,
        )
    }

    pub fn state_path(&self) -> &Path {
        &self.state_path
    }

    pub fn backup_dir(&self) -> &Path {
        &self.backup_dir
    }

    /// Atomically persist `state`; failures are logged and reported as false
    pub fn save(&self, state: &StatePayload) -> bool {
        self.write(state, false)
    }

    /// Persist the closing state of a run and seal the store, so a
    /// checkpoint still in flight cannot replace it
    pub fn save_final(&self, state: &StatePayload) -> bool {
        self.write(state, true)
    }

    pub fn is_sealed(&self) -> bool {
        *self.sealed.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn write(&self, state: &StatePayload, seal: bool) -> bool {
        let mut sealed = self.sealed.lock().unwrap_or_else(|p| p.into_inner());
        if *sealed {
            debug!("State store sealed, checkpoint dropped");
            return false;
        }
        if seal {
            *sealed = true;
        }

        match self.try_save(state) {
            Ok(()) => {
                debug!("State saved to {}", self.state_path.display());
                true
            }
            Err(e) => {
                error!("Failed to save state to {}: {}", self.state_path.display(), e);
                false
            }
        }
    }

    fn try_save(&self, state: &StatePayload) -> Result<()> {
        let data = serde_json::to_value(state)?;
        let envelope = StateEnvelope {
            version: STATE_VERSION,
            timestamp: Utc::now(),
            checksum: checksum(&data)?,
            data,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let dir = self
            .state_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;

        let file_name = self
            .state_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "state".to_string());
        let temp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4()));

        let result = self.write_and_swap(&temp_path, &bytes, &envelope.checksum);
        if result.is_err() && temp_path.exists() {
            if let Err(e) = fs::remove_file(&temp_path) {
                warn!("Could not remove temp state file {}: {}", temp_path.display(), e);
            }
        }
        result
    }

    fn write_and_swap(&self, temp_path: &Path, bytes: &[u8], expected: &str) -> Result<()> {
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(temp_path)?;
            file.write_all(bytes)?;
            file.sync_all()?;
        }

        let written = read_envelope(temp_path)?;
        if written.checksum != expected {
            return Err(VigilError::ChecksumMismatch {
                expected: expected.to_string(),
                actual: written.checksum,
            });
        }
        verify(&written)?;

        if self.state_path.exists() {
            self.rotate_primary()?;
        }

        fs::rename(temp_path, &self.state_path)?;
        if let Some(dir) = self.state_path.parent() {
            sync_dir(dir);
        }
        Ok(())
    }

    fn rotate_primary(&self) -> Result<()> {
        fs::create_dir_all(&self.backup_dir)?;

        let stamp = Utc::now().format(BACKUP_STAMP).to_string();
        let mut target = self.backup_dir.join(format!("{}{}.json", BACKUP_PREFIX, stamp));
        let mut n = 1;
        while target.exists() {
            target = self
                .backup_dir
                .join(format!("{}{}_{}.json", BACKUP_PREFIX, stamp, n));
            n += 1;
        }

        fs::rename(&self.state_path, &target)?;
        debug!("Previous state moved to {}", target.display());
        Ok(())
    }

    /// Load the newest state that verifies, or the default state
    pub fn load(&self) -> StatePayload {
        self.load_with_source().0
    }

    pub fn load_with_source(&self) -> (StatePayload, LoadSource) {
        match self.read_verified(&self.state_path) {
            Ok(state) => return (state, LoadSource::Primary),
            Err(VigilError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("No state file at {}", self.state_path.display());
            }
            Err(e) => {
                warn!("Primary state file rejected: {}", e);
            }
        }

        for backup in self.list_backups() {
            match self.read_verified(&backup.path) {
                Ok(state) => {
                    info!("Recovered state from backup {}", backup.path.display());
                    return (state, LoadSource::Backup(backup.path));
                }
                Err(e) => warn!("Backup {} rejected: {}", backup.path.display(), e),
            }
        }

        info!("No valid state found, starting fresh");
        (StatePayload::default(), LoadSource::Default)
    }

    /// Read and verify one state file
    pub fn read_verified(&self, path: &Path) -> Result<StatePayload> {
        let envelope = read_envelope(path)?;
        verify(&envelope)?;
        Ok(serde_json::from_value(envelope.data)?)
    }

    /// Backups on disk, newest first
    pub fn list_backups(&self) -> Vec<BackupEntry> {
        let entries = match fs::read_dir(&self.backup_dir) {
            Ok(entries) => entries,
            Err(e) => {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot list backups in {}: {}", self.backup_dir.display(), e);
                }
                return Vec::new();
            }
        };

        let mut backups: Vec<BackupEntry> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter_map(|path| {
                let created_at = backup_timestamp(&path)?;
                Some(BackupEntry { path, created_at })
            })
            .collect();

        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
        backups
    }

    /// Apply the tiered retention policy, returning how many backups were removed
    pub fn cleanup_backups(&self) -> Result<usize> {
        self.cleanup_backups_at(Utc::now())
    }

    pub fn cleanup_backups_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let backups = self.list_backups();
        let expired = self.retention.expired(&backups, now);

        let mut removed = 0;
        for path in &expired {
            match fs::remove_file(path) {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to remove backup {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!(
                "Backup cleanup removed {} of {} backups",
                removed,
                backups.len()
            );
        }
        Ok(removed)
    }
}

fn read_envelope(path: &Path) -> Result<StateEnvelope> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn verify(envelope: &StateEnvelope) -> Result<()> {
    if envelope.version > STATE_VERSION {
        return Err(VigilError::Verification(format!(
            "state version {} is newer than supported {}",
            envelope.version, STATE_VERSION
        )));
    }
    let actual = checksum(&envelope.data)?;
    if actual != envelope.checksum {
        return Err(VigilError::ChecksumMismatch {
            expected: envelope.checksum.clone(),
            actual,
        });
    }
    Ok(())
}

/// SHA-256 over the key-sorted JSON encoding of `data`
pub fn checksum(data: &Value) -> Result<String> {
    let canonical = serde_json::to_vec(&canonicalize(data))?;
    Ok(hex::encode(Sha256::digest(&canonical)))
}

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = serde_json::Map::with_capacity(map.len());
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn backup_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    if !name.ends_with(".json") {
        return None;
    }
    let stamp = name.strip_prefix(BACKUP_PREFIX)?.get(..BACKUP_STAMP_LEN)?;
    match NaiveDateTime::parse_from_str(stamp, BACKUP_STAMP) {
        Ok(naive) => Some(naive.and_utc()),
        Err(_) => fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .map(DateTime::<Utc>::from),
    }
}

fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Ok(handle) = File::open(dir) {
            let _ = handle.sync_all();
        }
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> StateStore {
        StateStore::new(
            dir.path().join("state.json"),
            dir.path().join("backups"),
            RetentionPolicy::new(std::time::Duration::from_secs(30), 90),
        )
    }

    fn payload(restarts: u64) -> StatePayload {
        StatePayload {
            restart_count: restarts,
            error_count: 2,
            degradation_level: 1,
            was_running: true,
            uptime_secs: 3600,
            health_state: HealthState::Degraded,
            health_score: 0.42,
            managed_processes: vec![ProcessRecord {
                name: "api".into(),
                pid: Some(4242),
                restart_count: 3,
                status: ProcessStatus::Running,
            }],
            config_snapshot: serde_json::json!({"b": 1, "a": {"z": true, "y": [1, 2]}}),
            ..Default::default()
        }
    }

    #[test]
    fn test_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        assert!(store.save(&payload(7)));
        let (loaded, source) = store.load_with_source();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded, payload(7));
    }

    #[test]
    fn test_final_save_wins_over_late_checkpoints() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let writers: Vec<_> = (0..2)
            .map(|_| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for n in 0..100 {
                        store.save(&payload(n));
                    }
                })
            })
            .collect();

        std::thread::sleep(std::time::Duration::from_millis(5));
        let closing = StatePayload {
            was_running: false,
            emergency: Some(EmergencyMarker {
                reason: "test".into(),
                triggered_at: Utc::now(),
            }),
            ..payload(1000)
        };
        assert!(store.save_final(&closing));
        for writer in writers {
            writer.join().unwrap();
        }

        assert!(store.is_sealed());
        assert!(!store.save(&payload(1)));
        let (loaded, source) = store.load_with_source();
        assert_eq!(source, LoadSource::Primary);
        assert_eq!(loaded, closing);
    }

    #[test]
    fn test_missing_file_gives_default() {
        let dir = TempDir::new().unwrap();
        let (loaded, source) = store(&dir).load_with_source();
        assert_eq!(source, LoadSource::Default);
        assert_eq!(loaded, StatePayload::default());
    }

    #[test]
    fn test_previous_primary_becomes_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(&payload(1));
        store.save(&payload(2));
        store.save(&payload(3));

        let backups = store.list_backups();
        assert_eq!(backups.len(), 2);
        assert_eq!(store.read_verified(&backups[0].path).unwrap().restart_count, 2);
        assert_eq!(store.read_verified(&backups[1].path).unwrap().restart_count, 1);
    }

    #[test]
    fn test_corrupt_primary_falls_back_to_newest_backup() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(&payload(1));
        store.save(&payload(2));
        store.save(&payload(3));

        // Tamper with the payload but keep the stale checksum
        let mut envelope: Value =
            serde_json::from_slice(&fs::read(store.state_path()).unwrap()).unwrap();
        envelope["data"]["restart_count"] = Value::from(99);
        fs::write(store.state_path(), serde_json::to_vec(&envelope).unwrap()).unwrap();

        let (loaded, source) = store.load_with_source();
        assert!(matches!(source, LoadSource::Backup(_)));
        assert_eq!(loaded.restart_count, 2);
    }

    #[test]
    fn test_skips_corrupt_backups() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);

        store.save(&payload(1));
        store.save(&payload(2));
        store.save(&payload(3));

        fs::write(store.state_path(), b"{ not json").unwrap();
        let newest = store.list_backups()[0].path.clone();
        fs::write(&newest, b"garbage").unwrap();

        assert_eq!(store.load().restart_count, 1);
    }

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = serde_json::json!({"x": 1, "y": {"b": 2, "a": 3}});
        let b: Value = serde_json::from_str(r#"{"y": {"a": 3, "b": 2}, "x": 1}"#).unwrap();
        assert_eq!(checksum(&a).unwrap(), checksum(&b).unwrap());
        assert_ne!(checksum(&a).unwrap(), checksum(&serde_json::json!({"x": 2})).unwrap());
    }

    #[test]
    fn test_backup_names_parse() {
        let path = Path::new("/tmp/state_backup_20260102_030405_123456.json");
        let ts = backup_timestamp(path).unwrap();
        assert_eq!(ts.format("%Y-%m-%d %H:%M:%S").to_string(), "2026-01-02 03:04:05");
        assert!(backup_timestamp(Path::new("/tmp/notes.txt")).is_none());
    }

    #[test]
    fn test_cleanup_removes_expired_backups() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        fs::create_dir_all(store.backup_dir()).unwrap();

        let now = Utc::now();
        for days in [0i64, 100, 200] {
            let ts = now - chrono::Duration::days(days);
            let name = format!("{}{}.json", BACKUP_PREFIX, ts.format(BACKUP_STAMP));
            fs::write(store.backup_dir().join(name), b"{}").unwrap();
        }

        assert_eq!(store.cleanup_backups_at(now).unwrap(), 2);
        assert_eq!(store.list_backups().len(), 1);
    }
}
