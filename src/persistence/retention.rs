//! Tiered backup retention
//!
//! Backups are grouped into epoch-aligned time buckets whose width grows with
//! age; only the newest backup of each bucket survives. Buckets are aligned to
//! the epoch so that repeated cleanups keep choosing the same survivors.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashSet;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupEntry {
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Tier {
    Recent,
    Week,
    Month,
    Archive,
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    /// Health check interval; bucket widths are multiples of it
    pub unit: Duration,
    pub retention_days: i64,
}

impl RetentionPolicy {
    pub fn new(unit: std::time::Duration, retention_days: u32) -> Self {
        let unit = Duration::from_std(unit).unwrap_or_else(|_| Duration::seconds(30));
        Self {
            unit: unit.max(Duration::seconds(1)),
            retention_days: retention_days as i64,
        }
    }

    fn tier(&self, age: Duration) -> Option<(Tier, i64)> {
        if age >= Duration::days(self.retention_days) {
            return None;
        }
        let unit = self.unit.num_seconds().max(1);
        if age < Duration::days(1) {
            Some((Tier::Recent, 0))
        } else if age < Duration::days(7) {
            Some((Tier::Week, unit * 6))
        } else if age < Duration::days(30) {
            Some((Tier::Month, unit * 24))
        } else {
            Some((Tier::Archive, 86_400))
        }
    }

    /// Backups to delete, given every backup currently on disk
    pub fn expired(&self, entries: &[BackupEntry], now: DateTime<Utc>) -> Vec<PathBuf> {
        let mut sorted: Vec<&BackupEntry> = entries.iter().collect();
        sorted.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        let mut seen: HashSet<(Tier, i64)> = HashSet::new();
        let mut expired = Vec::new();

        for entry in sorted {
            let age = now - entry.created_at;
            match self.tier(age.max(Duration::zero())) {
                None => expired.push(entry.path.clone()),
                Some((Tier::Recent, _)) => {}
                Some((tier, width)) => {
                    let bucket = entry.created_at.timestamp().div_euclid(width);
                    if !seen.insert((tier, bucket)) {
                        expired.push(entry.path.clone());
                    }
                }
            }
        }

        expired
    }
}
