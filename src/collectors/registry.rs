//! Start-up discovery of temperature files and GPU presence.
//!
//! hwmon indices are not stable across kernels, so each logical slot is
//! bound by driver name first and by the Legion's usual fixed directory last.

use crate::collectors::{
    read_millidegrees, read_trimmed, run_command, BoxedProbe, FallbackChain, Probe, ProbeError,
};
use crate::config::ProbeConfig;
use crate::state::TempSource;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

pub const CPU_SLOT: &str = "cpu";
const NVME_SLOTS: [(&str, u8, &str); 3] = [
    ("nvme_temp1", 1, "NVMe Composite"),
    ("nvme_temp2", 2, "NVMe Sensor 1"),
    ("nvme_temp3", 3, "NVMe Sensor 2"),
];

#[derive(Debug, Clone, PartialEq)]
pub struct SensorHandle {
    pub logical_name: String,
    pub label: String,
    pub input: PathBuf,
    pub critical: Option<PathBuf>,
    pub source: TempSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GpuPresence {
    Tool,
    /// Driver version file exists; the tool may be broken.
    DriverFile,
    BusListing,
    Absent,
}

impl GpuPresence {
    pub fn is_present(self) -> bool {
        self != GpuPresence::Absent
    }

    pub fn describe(self) -> &'static str {
        match self {
            GpuPresence::Tool => "доступна (nvidia-smi)",
            GpuPresence::DriverFile => "обнаружена через драйвер, nvidia-smi не отвечает",
            GpuPresence::BusListing => "обнаружена на шине PCI, драйвер не загружен",
            GpuPresence::Absent => "не обнаружена",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SensorRegistry {
    sensors: BTreeMap<String, SensorHandle>,
    gpu: GpuPresence,
}

impl SensorRegistry {
    pub async fn discover(cfg: &ProbeConfig) -> Self {
        let sensors = discover_sensors(&cfg.hwmon_root);
        let gpu = detect_gpu(cfg).await;
        info!(
            sensors = sensors.len(),
            gpu = ?gpu,
            "обнаружение датчиков завершено"
        );
        Self::from_parts(sensors, gpu)
    }

    pub fn from_parts(sensors: BTreeMap<String, SensorHandle>, gpu: GpuPresence) -> Self {
        Self { sensors, gpu }
    }

    pub fn get(&self, logical_name: &str) -> Option<&SensorHandle> {
        self.sensors.get(logical_name)
    }

    pub fn nvme_handles(&self) -> Vec<SensorHandle> {
        NVME_SLOTS
            .iter()
            .filter_map(|(slot, _, _)| self.sensors.get(*slot).cloned())
            .collect()
    }

    pub fn sensors(&self) -> &BTreeMap<String, SensorHandle> {
        &self.sensors
    }

    pub fn gpu(&self) -> GpuPresence {
        self.gpu
    }
}

enum Locator {
    Driver(&'static str),
    Fixed(&'static str),
}

/// Binds logical slots to the first candidate file holding a parseable value.
pub fn discover_sensors(hwmon_root: &Path) -> BTreeMap<String, SensorHandle> {
    let devices = list_hwmon_devices(hwmon_root);
    let mut out = BTreeMap::new();

    let cpu_candidates = [
        Locator::Driver("k10temp"),
        Locator::Driver("zenpower"),
        Locator::Driver("coretemp"),
        Locator::Fixed("hwmon3"),
    ];
    if let Some((input, _, source)) =
        first_valid(hwmon_root, &devices, &cpu_candidates, 1, TempSource::K10temp)
    {
        let label = match source {
            TempSource::Coretemp => "CPU (Package)",
            _ => "CPU (Tctl)",
        };
        out.insert(
            CPU_SLOT.to_string(),
            SensorHandle {
                logical_name: CPU_SLOT.to_string(),
                label: label.to_string(),
                input,
                critical: None,
                source,
            },
        );
    }

    let nvme_candidates = [Locator::Driver("nvme"), Locator::Fixed("hwmon2")];
    for (slot, index, label) in NVME_SLOTS {
        if let Some((input, dir, source)) =
            first_valid(hwmon_root, &devices, &nvme_candidates, index, TempSource::Nvme)
        {
            let crit = dir.join(format!("temp{index}_crit"));
            out.insert(
                slot.to_string(),
                SensorHandle {
                    logical_name: slot.to_string(),
                    label: label.to_string(),
                    input,
                    critical: crit.exists().then_some(crit),
                    source,
                },
            );
        }
    }

    out
}

/// `(directory, driver name)` for every hwmon device, sorted by directory.
fn list_hwmon_devices(hwmon_root: &Path) -> Vec<(PathBuf, Option<String>)> {
    let Ok(entries) = fs::read_dir(hwmon_root) else {
        debug!(root = %hwmon_root.display(), "каталог hwmon недоступен");
        return Vec::new();
    };

    let mut devices: Vec<(PathBuf, Option<String>)> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("hwmon"))
        })
        .map(|p| {
            let driver = read_trimmed(&p.join("name")).ok();
            (p, driver)
        })
        .collect();
    devices.sort_by(|a, b| a.0.cmp(&b.0));
    devices
}

fn first_valid(
    hwmon_root: &Path,
    devices: &[(PathBuf, Option<String>)],
    candidates: &[Locator],
    index: u8,
    legacy_source: TempSource,
) -> Option<(PathBuf, PathBuf, TempSource)> {
    let file = format!("temp{index}_input");
    for candidate in candidates {
        let found = match candidate {
            Locator::Driver(driver) => devices
                .iter()
                .filter(|(_, name)| name.as_deref() == Some(*driver))
                .find_map(|(dir, _)| {
                    let source = TempSource::from_driver(driver)?;
                    probe_file(dir, &file).map(|input| (input, dir.clone(), source))
                }),
            Locator::Fixed(dir_name) => {
                let dir = hwmon_root.join(dir_name);
                // A legacy directory that names a driver we do not know is
                // some other device; without a name file the Legion layout is assumed.
                let source = match read_trimmed(&dir.join("name")) {
                    Ok(driver) => TempSource::from_driver(&driver),
                    Err(_) => Some(legacy_source),
                };
                source.and_then(|source| probe_file(&dir, &file).map(|input| (input, dir, source)))
            }
        };
        if found.is_some() {
            return found;
        }
    }
    None
}

fn probe_file(dir: &Path, file: &str) -> Option<PathBuf> {
    let path = dir.join(file);
    match read_millidegrees(&path) {
        Ok(_) => Some(path),
        Err(err) => {
            debug!(path = %path.display(), error = %err, "кандидат отклонён");
            None
        }
    }
}

async fn detect_gpu(cfg: &ProbeConfig) -> GpuPresence {
    let tiers: Vec<BoxedProbe<GpuPresence>> = vec![
        Box::new(ToolTier {
            tool: cfg.gpu_tool.clone(),
            timeout: cfg.command_timeout(),
        }),
        Box::new(DriverFileTier {
            path: cfg.gpu_driver_version_file.clone(),
        }),
        Box::new(BusListingTier {
            tool: cfg.bus_listing_tool.clone(),
            timeout: cfg.command_timeout(),
        }),
    ];
    FallbackChain::new("gpu-presence", tiers)
        .sample()
        .await
        .unwrap_or(GpuPresence::Absent)
}

struct ToolTier {
    tool: String,
    timeout: Duration,
}

#[async_trait]
impl Probe for ToolTier {
    type Output = GpuPresence;

    fn name(&self) -> &'static str {
        "gpu-tool"
    }

    async fn sample(&self) -> Result<GpuPresence, ProbeError> {
        run_command(&self.tool, &["-L"], self.timeout)
            .await?
            .into_stdout(&self.tool)
            .map(|_| GpuPresence::Tool)
    }
}

struct DriverFileTier {
    path: PathBuf,
}

#[async_trait]
impl Probe for DriverFileTier {
    type Output = GpuPresence;

    fn name(&self) -> &'static str {
        "gpu-driver-file"
    }

    async fn sample(&self) -> Result<GpuPresence, ProbeError> {
        if self.path.exists() {
            Ok(GpuPresence::DriverFile)
        } else {
            Err(ProbeError::Unavailable(self.path.display().to_string()))
        }
    }
}

struct BusListingTier {
    tool: String,
    timeout: Duration,
}

#[async_trait]
impl Probe for BusListingTier {
    type Output = GpuPresence;

    fn name(&self) -> &'static str {
        "gpu-bus-listing"
    }

    async fn sample(&self) -> Result<GpuPresence, ProbeError> {
        let listing = run_command(&self.tool, &[], self.timeout)
            .await?
            .into_stdout(&self.tool)?;
        if listing.to_lowercase().contains("nvidia") {
            Ok(GpuPresence::BusListing)
        } else {
            Err(ProbeError::Unavailable(format!(
                "{}: устройство NVIDIA не найдено",
                self.tool
            )))
        }
    }
}
