use crate::collectors::{Probe, ProbeError};
use crate::state::{DiskUsage, LoadAverage, MemoryStats, SystemMetrics};
use async_trait::async_trait;
use chrono::{Local, TimeZone};
use std::sync::{Arc, Mutex};
use sysinfo::{CpuExt, DiskExt, System, SystemExt};

const PSEUDO_FILESYSTEMS: [&str; 11] = [
    "squashfs", "tmpfs", "devtmpfs", "overlay", "aufs", "ramfs", "proc", "sysfs", "cgroup",
    "cgroup2", "efivarfs",
];

/// sysinfo needs the previous refresh to compute CPU usage, so one `System`
/// lives for the whole run.
pub struct SystemProbe {
    system: Arc<Mutex<System>>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        Self {
            system: Arc::new(Mutex::new(system)),
        }
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Probe for SystemProbe {
    type Output = SystemMetrics;

    fn name(&self) -> &'static str {
        "system"
    }

    async fn sample(&self) -> Result<SystemMetrics, ProbeError> {
        let system = self.system.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = system.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            collect_system(&mut guard)
        })
        .await
        .map_err(|err| ProbeError::Unavailable(format!("сбор sysinfo прерван: {err}")))
    }
}

pub fn collect_system(system: &mut System) -> SystemMetrics {
    system.refresh_cpu();
    system.refresh_memory();
    system.refresh_processes();
    system.refresh_disks_list();
    system.refresh_disks();

    let cpus = system.cpus();
    let cpu_freq_mhz = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|c| c.frequency() as f64).sum::<f64>() / cpus.len() as f64
    };

    let total = system.total_memory();
    let available = system.available_memory();
    let memory = MemoryStats {
        percent: memory_percent(total, available),
        used_bytes: total.saturating_sub(available),
        total_bytes: total,
        available_bytes: available,
    };

    let load = system.load_average();
    let disks = system
        .disks()
        .iter()
        .filter_map(|d| {
            disk_usage(
                &d.name().to_string_lossy(),
                &d.mount_point().to_string_lossy(),
                &String::from_utf8_lossy(d.file_system()),
                d.total_space(),
                d.available_space(),
            )
        })
        .collect();

    SystemMetrics {
        cpu_usage: system.global_cpu_info().cpu_usage() as f64,
        cpu_freq_mhz,
        memory,
        load_average: LoadAverage {
            one: load.one,
            five: load.five,
            fifteen: load.fifteen,
        },
        uptime_secs: system.uptime(),
        boot_time: Local.timestamp_opt(system.boot_time() as i64, 0).single(),
        process_count: system.processes().len() as u64,
        disks,
    }
}

/// Share of memory not available to new allocations.
pub fn memory_percent(total: u64, available: u64) -> f64 {
    if total == 0 {
        return 0.0;
    }
    total.saturating_sub(available) as f64 / total as f64 * 100.0
}

pub fn is_physical_disk(device: &str, mountpoint: &str, fs_type: &str) -> bool {
    !(mountpoint.contains("/snap/")
        || device.starts_with("/dev/loop")
        || PSEUDO_FILESYSTEMS.contains(&fs_type))
}

fn disk_usage(
    device: &str,
    mountpoint: &str,
    fs_type: &str,
    total: u64,
    available: u64,
) -> Option<DiskUsage> {
    if !is_physical_disk(device, mountpoint, fs_type) || total == 0 {
        return None;
    }
    let used = total.saturating_sub(available);
    Some(DiskUsage {
        device: device.to_string(),
        mountpoint: mountpoint.to_string(),
        fs_type: fs_type.to_string(),
        percent: used as f64 / total as f64 * 100.0,
        used_bytes: used,
        total_bytes: total,
    })
}
