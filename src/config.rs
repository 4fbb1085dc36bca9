use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub thresholds: Thresholds,
    #[serde(default)]
    pub probes: ProbeConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Json,
    Txt,
    Csv,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Json => "json",
            ExportFormat::Txt => "txt",
            ExportFormat::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_format")]
    pub format: ExportFormat,
    #[serde(default = "default_export_dir")]
    pub dir: PathBuf,
}

/// Пороговые значения правил. Превышение строгое (`>`).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Thresholds {
    #[serde(default = "default_cpu_temp")]
    pub cpu_temp: f64,
    #[serde(default = "default_gpu_temp")]
    pub gpu_temp: f64,
    #[serde(default = "default_nvme_temp")]
    pub nvme_temp: f64,
    #[serde(default = "default_cpu_usage")]
    pub cpu_usage: f64,
    #[serde(default = "default_memory_usage")]
    pub memory_usage: f64,
    #[serde(default = "default_gpu_power")]
    pub gpu_power: f64,
    #[serde(default = "default_gpu_utilization")]
    pub gpu_utilization: f64,
    #[serde(default = "default_disk_usage")]
    pub disk_usage: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProbeConfig {
    #[serde(default = "default_hwmon_root")]
    pub hwmon_root: PathBuf,
    #[serde(default = "default_power_supply_root")]
    pub power_supply_root: PathBuf,
    #[serde(default = "default_gpu_tool")]
    pub gpu_tool: String,
    #[serde(default = "default_gpu_driver_version_file")]
    pub gpu_driver_version_file: PathBuf,
    #[serde(default = "default_bus_listing_tool")]
    pub bus_listing_tool: String,
    #[serde(default = "default_sensors_tool")]
    pub sensors_tool: String,
    #[serde(default = "default_journal_tool")]
    pub journal_tool: String,
    #[serde(default = "default_journal_lines")]
    pub journal_lines: usize,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_query_timeout_ms")]
    pub query_timeout_ms: u64,
    #[serde(default = "default_probe_deadline_ms")]
    pub probe_deadline_ms: u64,
}

impl ProbeConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn query_timeout(&self) -> Duration {
        Duration::from_millis(self.query_timeout_ms)
    }

    pub fn probe_deadline(&self) -> Duration {
        Duration::from_millis(self.probe_deadline_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            export: ExportConfig::default(),
            thresholds: Thresholds::default(),
            probes: ProbeConfig::default(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: default_export_format(),
            dir: default_export_dir(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            cpu_temp: default_cpu_temp(),
            gpu_temp: default_gpu_temp(),
            nvme_temp: default_nvme_temp(),
            cpu_usage: default_cpu_usage(),
            memory_usage: default_memory_usage(),
            gpu_power: default_gpu_power(),
            gpu_utilization: default_gpu_utilization(),
            disk_usage: default_disk_usage(),
        }
    }
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            hwmon_root: default_hwmon_root(),
            power_supply_root: default_power_supply_root(),
            gpu_tool: default_gpu_tool(),
            gpu_driver_version_file: default_gpu_driver_version_file(),
            bus_listing_tool: default_bus_listing_tool(),
            sensors_tool: default_sensors_tool(),
            journal_tool: default_journal_tool(),
            journal_lines: default_journal_lines(),
            command_timeout_ms: default_command_timeout_ms(),
            query_timeout_ms: default_query_timeout_ms(),
            probe_deadline_ms: default_probe_deadline_ms(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("не удалось прочитать файл конфигурации {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации конфигурации: {0}")]
    Validation(String),
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        let path_display = path_ref.display().to_string();
        let text = fs::read_to_string(path_ref).map_err(|source| ConfigError::Read {
            path: path_display.clone(),
            source,
        })?;

        let cfg = Self::from_yaml(&text).map_err(|source| ConfigError::Parse {
            path: path_display,
            source,
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < 1 {
            return Err(ConfigError::Validation(
                "interval_secs должно быть >= 1".to_string(),
            ));
        }

        validate_thresholds(&self.thresholds)?;
        validate_probes(&self.probes)?;

        Ok(())
    }

    pub fn example_yaml() -> &'static str {
        include_str!("../config.yaml.example")
    }
}

fn validate_thresholds(t: &Thresholds) -> Result<(), ConfigError> {
    let temps = [
        ("cpu_temp", t.cpu_temp),
        ("gpu_temp", t.gpu_temp),
        ("nvme_temp", t.nvme_temp),
        ("gpu_power", t.gpu_power),
    ];
    for (name, value) in temps {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "thresholds.{name} должно быть > 0"
            )));
        }
    }

    let percents = [
        ("cpu_usage", t.cpu_usage),
        ("memory_usage", t.memory_usage),
        ("gpu_utilization", t.gpu_utilization),
        ("disk_usage", t.disk_usage),
    ];
    for (name, value) in percents {
        if !(0.0..=100.0).contains(&value) {
            return Err(ConfigError::Validation(format!(
                "thresholds.{name} должно быть в диапазоне 0..100"
            )));
        }
    }

    Ok(())
}

fn validate_probes(p: &ProbeConfig) -> Result<(), ConfigError> {
    let tools = [
        ("gpu_tool", &p.gpu_tool),
        ("bus_listing_tool", &p.bus_listing_tool),
        ("sensors_tool", &p.sensors_tool),
        ("journal_tool", &p.journal_tool),
    ];
    for (name, value) in tools {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!(
                "probes.{name} не должен быть пустым"
            )));
        }
    }
    if p.journal_lines == 0 {
        return Err(ConfigError::Validation(
            "probes.journal_lines должно быть >= 1".to_string(),
        ));
    }
    if p.command_timeout_ms == 0 || p.query_timeout_ms == 0 {
        return Err(ConfigError::Validation(
            "таймауты команд probes.*_timeout_ms должны быть > 0".to_string(),
        ));
    }
    if p.probe_deadline_ms < p.command_timeout_ms {
        return Err(ConfigError::Validation(
            "probes.probe_deadline_ms не может быть меньше command_timeout_ms".to_string(),
        ));
    }
    Ok(())
}

const fn default_interval_secs() -> u64 {
    2
}

const fn default_export_format() -> ExportFormat {
    ExportFormat::Txt
}

fn default_export_dir() -> PathBuf {
    PathBuf::from(".")
}

const fn default_cpu_temp() -> f64 {
    85.0
}

const fn default_gpu_temp() -> f64 {
    78.0
}

const fn default_nvme_temp() -> f64 {
    70.0
}

const fn default_cpu_usage() -> f64 {
    90.0
}

const fn default_memory_usage() -> f64 {
    85.0
}

const fn default_gpu_power() -> f64 {
    125.0
}

const fn default_gpu_utilization() -> f64 {
    95.0
}

const fn default_disk_usage() -> f64 {
    90.0
}

fn default_hwmon_root() -> PathBuf {
    PathBuf::from("/sys/class/hwmon")
}

fn default_power_supply_root() -> PathBuf {
    PathBuf::from("/sys/class/power_supply")
}

fn default_gpu_tool() -> String {
    "nvidia-smi".to_string()
}

fn default_gpu_driver_version_file() -> PathBuf {
    PathBuf::from("/proc/driver/nvidia/version")
}

fn default_bus_listing_tool() -> String {
    "lspci".to_string()
}

fn default_sensors_tool() -> String {
    "sensors".to_string()
}

fn default_journal_tool() -> String {
    "journalctl".to_string()
}

const fn default_journal_lines() -> usize {
    5
}

const fn default_command_timeout_ms() -> u64 {
    3000
}

const fn default_query_timeout_ms() -> u64 {
    5000
}

const fn default_probe_deadline_ms() -> u64 {
    8000
}
