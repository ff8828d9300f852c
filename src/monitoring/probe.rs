//! Metric sources
//!
//! Samplers read raw numbers through these traits so that tests can script
//! readings; `HostProbe` is the sysinfo-backed implementation used in production.

use crate::error::{Result, VigilError};
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, Networks, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::debug;

/// Raw memory numbers for one process plus the host
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct MemoryReading {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
    /// Open file descriptors / handles held by the process
    pub open_handles: u64,
}

/// Raw CPU/IO/network numbers for one process plus the host
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct PerformanceReading {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub process_cpu_percent: f64,
    pub process_memory_percent: f64,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub net_sent_bytes: u64,
    pub net_recv_bytes: u64,
    pub load_avg: Option<[f64; 3]>,
    pub thread_count: usize,
}

/// Host-wide metrics gathered when system metrics are enabled
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub cpu_count: usize,
    pub cpu_frequency_mhz: u64,
    /// Highest usage across mounted disks
    pub disk_usage_percent: f64,
    pub net_sent_bytes: u64,
    pub net_recv_bytes: u64,
    pub process_threads: usize,
    pub process_connections: usize,
    pub process_open_files: usize,
}

pub trait MemoryProbe: Send {
    fn read_memory(&mut self) -> Result<MemoryReading>;
}

pub trait PerformanceProbe: Send {
    fn read_performance(&mut self) -> Result<PerformanceReading>;
}

pub trait SystemMetricsProbe: Send {
    fn read_system(&mut self) -> Result<SystemMetrics>;
}

/// sysinfo-backed probe for one process (the supervisor itself by default)
pub struct HostProbe {
    system: System,
    networks: Networks,
    disks: Disks,
    pid: Pid,
}

impl HostProbe {
    /// Probe the running supervisor process
    pub fn current() -> Result<Self> {
        let pid = sysinfo::get_current_pid().map_err(|e| VigilError::Sampling(e.to_string()))?;
        Ok(Self::for_pid(pid.as_u32()))
    }

    pub fn for_pid(pid: u32) -> Self {
        let mut system = System::new();
        system.refresh_memory();
        system.refresh_cpu_usage();

        Self {
            system,
            networks: Networks::new_with_refreshed_list(),
            disks: Disks::new_with_refreshed_list(),
            pid: Pid::from_u32(pid),
        }
    }

    fn refresh_process(&mut self) -> Result<()> {
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[self.pid]),
            true,
            ProcessRefreshKind::new()
                .with_cpu()
                .with_memory()
                .with_disk_usage(),
        );

        if self.system.process(self.pid).is_none() {
            return Err(VigilError::Sampling(format!(
                "process {} not found",
                self.pid
            )));
        }
        Ok(())
    }

    fn network_totals(&mut self) -> (u64, u64) {
        self.networks.refresh();
        self.networks.list().iter().fold((0, 0), |(sent, recv), (_, data)| {
            (
                sent + data.total_transmitted(),
                recv + data.total_received(),
            )
        })
    }
}

impl MemoryProbe for HostProbe {
    fn read_memory(&mut self) -> Result<MemoryReading> {
        self.system.refresh_memory();
        self.refresh_process()?;

        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| VigilError::Sampling(format!("process {} vanished", self.pid)))?;

        Ok(MemoryReading {
            resident_bytes: process.memory(),
            virtual_bytes: process.virtual_memory(),
            system_total_bytes: self.system.total_memory(),
            system_available_bytes: self.system.available_memory(),
            open_handles: open_handle_count(self.pid.as_u32()) as u64,
        })
    }
}

impl PerformanceProbe for HostProbe {
    fn read_performance(&mut self) -> Result<PerformanceReading> {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();
        self.refresh_process()?;
        let (net_sent_bytes, net_recv_bytes) = self.network_totals();

        let total = self.system.total_memory().max(1) as f64;
        let available = self.system.available_memory() as f64;
        let process = self
            .system
            .process(self.pid)
            .ok_or_else(|| VigilError::Sampling(format!("process {} vanished", self.pid)))?;
        let disk = process.disk_usage();

        let load = System::load_average();
        let load_avg = if load.one == 0.0 && load.five == 0.0 && load.fifteen == 0.0 {
            None
        } else {
            Some([load.one, load.five, load.fifteen])
        };

        Ok(PerformanceReading {
            cpu_percent: self.system.global_cpu_usage() as f64,
            memory_percent: ((total - available) / total * 100.0).clamp(0.0, 100.0),
            process_cpu_percent: process.cpu_usage() as f64,
            process_memory_percent: process.memory() as f64 / total * 100.0,
            io_read_bytes: disk.total_read_bytes,
            io_write_bytes: disk.total_written_bytes,
            net_sent_bytes,
            net_recv_bytes,
            load_avg,
            thread_count: thread_count(&self.system, self.pid),
        })
    }
}

impl SystemMetricsProbe for HostProbe {
    fn read_system(&mut self) -> Result<SystemMetrics> {
        self.system.refresh_cpu_frequency();
        self.disks.refresh();
        self.refresh_process()?;
        let (net_sent_bytes, net_recv_bytes) = self.network_totals();

        let disk_usage_percent = self
            .disks
            .list()
            .iter()
            .filter(|d| d.total_space() > 0)
            .map(|d| {
                let used = d.total_space().saturating_sub(d.available_space()) as f64;
                used / d.total_space() as f64 * 100.0
            })
            .fold(0.0_f64, f64::max);

        let cpus = self.system.cpus();
        let pid = self.pid.as_u32();

        Ok(SystemMetrics {
            cpu_count: cpus.len(),
            cpu_frequency_mhz: cpus.first().map(|c| c.frequency()).unwrap_or(0),
            disk_usage_percent,
            net_sent_bytes,
            net_recv_bytes,
            process_threads: thread_count(&self.system, self.pid),
            process_connections: socket_count(pid),
            process_open_files: open_handle_count(pid),
        })
    }
}

pub(crate) fn thread_count(system: &System, pid: Pid) -> usize {
    #[cfg(not(target_os = "windows"))]
    {
        system
            .process(pid)
            .and_then(|p| p.tasks())
            .map(|t| t.len().max(1))
            .unwrap_or(1)
    }
    #[cfg(target_os = "windows")]
    {
        let _ = (system, pid);
        1
    }
}

pub(crate) fn open_handle_count(pid: u32) -> usize {
    #[cfg(target_os = "linux")]
    {
        match std::fs::read_dir(format!("/proc/{}/fd", pid)) {
            Ok(entries) => entries.count(),
            Err(e) => {
                debug!("cannot list fds of {}: {}", pid, e);
                0
            }
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        0
    }
}

pub(crate) fn socket_count(pid: u32) -> usize {
    #[cfg(target_os = "linux")]
    {
        let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", pid)) else {
            return 0;
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| std::fs::read_link(e.path()).ok())
            .filter(|target| target.to_string_lossy().starts_with("socket:"))
            .count()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_probe_reads_own_process() {
        let mut probe = HostProbe::current().unwrap();

        let memory = probe.read_memory().unwrap();
        assert!(memory.resident_bytes > 0);
        assert!(memory.system_total_bytes >= memory.system_available_bytes);

        let perf = probe.read_performance().unwrap();
        assert!(perf.memory_percent >= 0.0 && perf.memory_percent <= 100.0);
        assert!(perf.thread_count >= 1);
    }

    #[test]
    fn test_missing_process_is_sampling_error() {
        let mut probe = HostProbe::for_pid(u32::MAX - 7);
        assert!(matches!(
            probe.read_memory(),
            Err(VigilError::Sampling(_))
        ));
    }
}
