use chrono::{DateTime, Local};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};
use std::collections::BTreeSet;

/// Closed set of probe tags a temperature reading may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TempSource {
    K10temp,
    Coretemp,
    Nvme,
    Nvidia,
    Sensors,
    Hwmon,
    Unavailable,
}

impl TempSource {
    /// Maps an hwmon `name` file (kernel driver) to a source tag.
    /// Unknown drivers yield `None` and their readings are dropped.
    pub fn from_driver(driver: &str) -> Option<Self> {
        match driver.trim() {
            "k10temp" | "zenpower" => Some(TempSource::K10temp),
            "coretemp" => Some(TempSource::Coretemp),
            "nvme" => Some(TempSource::Nvme),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TempSource::K10temp => "k10temp",
            TempSource::Coretemp => "coretemp",
            TempSource::Nvme => "nvme",
            TempSource::Nvidia => "nvidia",
            TempSource::Sensors => "sensors",
            TempSource::Hwmon => "hwmon",
            TempSource::Unavailable => "unavailable",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Cpu,
    Gpu,
    Nvme,
    Other,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TemperatureReading {
    pub name: String,
    pub celsius: f64,
    pub source: TempSource,
    pub critical: Option<f64>,
}

impl TemperatureReading {
    pub fn new(name: impl Into<String>, celsius: f64, source: TempSource) -> Self {
        Self {
            name: name.into(),
            celsius,
            source,
            critical: None,
        }
    }

    pub fn with_critical(mut self, critical: Option<f64>) -> Self {
        self.critical = critical;
        self
    }

    /// Stand-in entry emitted when no temperature source answered.
    pub fn placeholder() -> Self {
        Self::new("CPU", 0.0, TempSource::Unavailable)
    }

    pub fn is_placeholder(&self) -> bool {
        self.source == TempSource::Unavailable
    }

    pub fn kind(&self) -> SensorKind {
        if self.name.contains("CPU") {
            SensorKind::Cpu
        } else if self.name.contains("GPU") {
            SensorKind::Gpu
        } else if self.name.contains("NVMe") {
            SensorKind::Nvme
        } else {
            SensorKind::Other
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuStatus {
    Working,
    DetectedNoDriverBridge,
    QueryFailed,
    Unavailable,
}

impl GpuStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GpuStatus::Working => "working",
            GpuStatus::DetectedNoDriverBridge => "detected-no-driver-bridge",
            GpuStatus::QueryFailed => "query-failed",
            GpuStatus::Unavailable => "unavailable",
        }
    }
}

/// Decoded bits of `clocks_throttle_reasons.active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleReason {
    ApplicationsClocks,
    SwPowerCap,
    HwSlowdown,
    SyncBoost,
    SwThermalSlowdown,
    HwThermalSlowdown,
    HwPowerBrake,
    DisplayClock,
    Unspecified,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GpuState {
    pub available: bool,
    pub status: GpuStatus,
    pub temperature: f64,
    pub power_draw: f64,
    pub utilization: f64,
    pub memory_used: f64,
    pub memory_total: f64,
    pub clock_core: f64,
    pub clock_memory: f64,
    pub fan_speed: f64,
    pub power_limit: f64,
    pub driver_version: String,
    pub throttle_reasons: BTreeSet<ThrottleReason>,
}

impl GpuState {
    pub fn unavailable() -> Self {
        Self {
            available: false,
            status: GpuStatus::Unavailable,
            temperature: 0.0,
            power_draw: 0.0,
            utilization: 0.0,
            memory_used: 0.0,
            memory_total: 0.0,
            clock_core: 0.0,
            clock_memory: 0.0,
            fan_speed: 0.0,
            power_limit: 0.0,
            driver_version: "unknown".to_string(),
            throttle_reasons: BTreeSet::new(),
        }
    }

    /// Present but not queryable; all metrics stay zero.
    pub fn degraded(status: GpuStatus) -> Self {
        Self {
            available: true,
            status,
            ..Self::unavailable()
        }
    }

    pub fn memory_percent(&self) -> f64 {
        if self.memory_total > 0.0 {
            self.memory_used / self.memory_total * 100.0
        } else {
            0.0
        }
    }

    pub fn is_working(&self) -> bool {
        self.available && self.status == GpuStatus::Working
    }

    pub fn is_throttling(&self) -> bool {
        !self.throttle_reasons.is_empty()
    }
}

impl Default for GpuState {
    fn default() -> Self {
        Self::unavailable()
    }
}

// Hand-written so the derived percentage lands in exports without being a field.
impl Serialize for GpuState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("GpuState", 14)?;
        s.serialize_field("available", &self.available)?;
        s.serialize_field("status", &self.status)?;
        s.serialize_field("temperature", &self.temperature)?;
        s.serialize_field("power_draw", &self.power_draw)?;
        s.serialize_field("utilization", &self.utilization)?;
        s.serialize_field("memory_used", &self.memory_used)?;
        s.serialize_field("memory_total", &self.memory_total)?;
        s.serialize_field("memory_percent", &self.memory_percent())?;
        s.serialize_field("clock_core", &self.clock_core)?;
        s.serialize_field("clock_memory", &self.clock_memory)?;
        s.serialize_field("fan_speed", &self.fan_speed)?;
        s.serialize_field("power_limit", &self.power_limit)?;
        s.serialize_field("driver_version", &self.driver_version)?;
        s.serialize_field("throttle_reasons", &self.throttle_reasons)?;
        s.end()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct MemoryStats {
    pub percent: f64,
    pub used_bytes: u64,
    pub total_bytes: u64,
    pub available_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct LoadAverage {
    pub one: f64,
    pub five: f64,
    pub fifteen: f64,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DiskUsage {
    pub device: String,
    pub mountpoint: String,
    pub fs_type: String,
    pub percent: f64,
    pub used_bytes: u64,
    pub total_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SystemMetrics {
    pub cpu_usage: f64,
    pub cpu_freq_mhz: f64,
    pub memory: MemoryStats,
    pub load_average: LoadAverage,
    pub uptime_secs: u64,
    pub boot_time: Option<DateTime<Local>>,
    pub process_count: u64,
    pub disks: Vec<DiskUsage>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct BatteryState {
    pub present: bool,
    pub percent: f64,
    pub charging: bool,
    pub voltage: f64,
    pub power_source: String,
}

impl Default for BatteryState {
    fn default() -> Self {
        Self {
            present: false,
            percent: 0.0,
            charging: false,
            voltage: 0.0,
            power_source: "Unknown".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LogErrorEntry {
    pub timestamp: String,
    pub message: String,
    pub unit: String,
    pub priority: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    CpuTemp,
    GpuTemp,
    NvmeTemp,
    CpuUsage,
    MemoryUsage,
    GpuPower,
    GpuUtilization,
    GpuThrottling,
    DiskUsage,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Warning {
    pub rule: Rule,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Local>,
    pub temperatures: Vec<TemperatureReading>,
    pub gpu: GpuState,
    pub system: SystemMetrics,
    pub battery: BatteryState,
    pub errors: Vec<LogErrorEntry>,
    pub warnings: Vec<Warning>,
    pub alerts_today: usize,
}
