use crate::collectors::registry::{SensorHandle, SensorRegistry, CPU_SLOT};
use crate::collectors::{
    read_millidegrees, run_command, BoxedProbe, FallbackChain, Probe, ProbeError,
};
use crate::config::ProbeConfig;
use crate::state::{TempSource, TemperatureReading};
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Plausibility window for the blind hwmon scan, exclusive on both ends.
const SCAN_MIN_CELSIUS: f64 = 30.0;
const SCAN_MAX_CELSIUS: f64 = 150.0;
const SCAN_LIMIT: usize = 3;

const SENSORS_LABELS: [(&str, &str); 3] = [
    ("Tctl:", "CPU (Tctl)"),
    ("Tdie:", "CPU (Tdie)"),
    ("Package id 0:", "CPU (Package)"),
];

/// CPU readings through the fallback chain, then NVMe readings from the
/// registry. Always yields at least one entry.
pub struct TemperatureProbe {
    cpu: FallbackChain<Vec<TemperatureReading>>,
    nvme: Vec<SensorHandle>,
    nvme_critical_default: f64,
}

impl TemperatureProbe {
    pub fn new(registry: &SensorRegistry, cfg: &ProbeConfig, nvme_critical_default: f64) -> Self {
        let tiers: Vec<BoxedProbe<Vec<TemperatureReading>>> = vec![
            Box::new(SysfsCpuProbe {
                handle: registry.get(CPU_SLOT).cloned(),
            }),
            Box::new(SensorsToolProbe {
                tool: cfg.sensors_tool.clone(),
                timeout: cfg.query_timeout(),
            }),
            Box::new(HwmonScanProbe {
                root: cfg.hwmon_root.clone(),
            }),
        ];
        Self {
            cpu: FallbackChain::new("cpu-temperature", tiers),
            nvme: registry.nvme_handles(),
            nvme_critical_default,
        }
    }

    fn nvme_readings(&self) -> Vec<TemperatureReading> {
        self.nvme
            .iter()
            .filter_map(|handle| {
                let celsius = match read_millidegrees(&handle.input) {
                    Ok(v) => v,
                    Err(err) => {
                        debug!(sensor = %handle.logical_name, error = %err, "датчик NVMe не прочитан");
                        return None;
                    }
                };
                let critical = handle
                    .critical
                    .as_deref()
                    .and_then(|p| read_millidegrees(p).ok())
                    .unwrap_or(self.nvme_critical_default);
                Some(
                    TemperatureReading::new(handle.label.clone(), celsius, handle.source)
                        .with_critical(Some(critical)),
                )
            })
            .collect()
    }
}

#[async_trait]
impl Probe for TemperatureProbe {
    type Output = Vec<TemperatureReading>;

    fn name(&self) -> &'static str {
        "temperatures"
    }

    async fn sample(&self) -> Result<Vec<TemperatureReading>, ProbeError> {
        let mut readings = match self.cpu.sample().await {
            Ok(readings) => readings,
            Err(err) => {
                debug!(error = %err, "температура CPU недоступна ни из одного источника");
                vec![TemperatureReading::placeholder()]
            }
        };
        readings.extend(self.nvme_readings());
        Ok(readings)
    }
}

pub struct SysfsCpuProbe {
    handle: Option<SensorHandle>,
}

#[async_trait]
impl Probe for SysfsCpuProbe {
    type Output = Vec<TemperatureReading>;

    fn name(&self) -> &'static str {
        "sysfs"
    }

    async fn sample(&self) -> Result<Vec<TemperatureReading>, ProbeError> {
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| ProbeError::Unavailable("датчик CPU не обнаружен".to_string()))?;
        let celsius = read_millidegrees(&handle.input)?;
        Ok(vec![TemperatureReading::new(
            handle.label.clone(),
            celsius,
            handle.source,
        )])
    }
}

pub struct SensorsToolProbe {
    tool: String,
    timeout: Duration,
}

#[async_trait]
impl Probe for SensorsToolProbe {
    type Output = Vec<TemperatureReading>;

    fn name(&self) -> &'static str {
        "sensors"
    }

    async fn sample(&self) -> Result<Vec<TemperatureReading>, ProbeError> {
        let text = run_command(&self.tool, &[], self.timeout)
            .await?
            .into_stdout(&self.tool)?;
        let readings = parse_sensors_output(&text);
        if readings.is_empty() {
            return Err(ProbeError::ParseFailure(format!(
                "{}: нет строк Tctl/Tdie/Package",
                self.tool
            )));
        }
        Ok(readings)
    }
}

pub fn parse_sensors_output(text: &str) -> Vec<TemperatureReading> {
    let mut out = Vec::new();
    for line in text.lines() {
        for (label, name) in SENSORS_LABELS {
            let Some(pos) = line.find(label) else {
                continue;
            };
            if let Some(celsius) = degrees_after(&line[pos + label.len()..]) {
                out.push(TemperatureReading::new(name, celsius, TempSource::Sensors));
            }
        }
    }
    out
}

/// Signed number right before the first degree sign, e.g. `  +45.5°C`.
fn degrees_after(rest: &str) -> Option<f64> {
    let end = rest.find('°')?;
    rest[..end].trim().parse::<f64>().ok()
}

pub struct HwmonScanProbe {
    root: PathBuf,
}

#[async_trait]
impl Probe for HwmonScanProbe {
    type Output = Vec<TemperatureReading>;

    fn name(&self) -> &'static str {
        "hwmon-scan"
    }

    async fn sample(&self) -> Result<Vec<TemperatureReading>, ProbeError> {
        let root = self.root.clone();
        let readings = tokio::task::spawn_blocking(move || scan_hwmon(&root))
            .await
            .map_err(|err| ProbeError::Unavailable(format!("сканирование hwmon прервано: {err}")))?;
        if readings.is_empty() {
            return Err(ProbeError::Unavailable(format!(
                "{}: правдоподобных датчиков нет",
                self.root.display()
            )));
        }
        Ok(readings)
    }
}

pub fn scan_hwmon(root: &Path) -> Vec<TemperatureReading> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };

    let mut dirs: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| file_name(p).starts_with("hwmon"))
        .collect();
    dirs.sort();

    let mut files = Vec::new();
    for dir in dirs {
        let Ok(entries) = fs::read_dir(&dir) else {
            continue;
        };
        let mut temps: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                let name = file_name(p);
                name.starts_with("temp") && name.ends_with("_input")
            })
            .collect();
        temps.sort();
        files.extend(temps);
    }

    files
        .into_iter()
        .filter_map(|path| {
            let celsius = read_millidegrees(&path).ok()?;
            if celsius <= SCAN_MIN_CELSIUS || celsius >= SCAN_MAX_CELSIUS {
                return None;
            }
            let device = path.parent().map(file_name).unwrap_or_default();
            let name = format!("{device}_{}", file_name(&path));
            Some(TemperatureReading::new(name, celsius, TempSource::Hwmon))
        })
        .take(SCAN_LIMIT)
        .collect()
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::registry::GpuPresence;
    use std::collections::BTreeMap;

    const SENSORS_SAMPLE: &str = "\
k10temp-pci-00c3
Adapter: PCI adapter
Tctl:         +67.5°C
Tdie:         -1.0°C  (high = +95.0°C)

nvme-pci-0400
Adapter: PCI adapter
Composite:    +38.9°C  (low  = -273.1°C, high = +84.8°C)
";

    fn write(dir: &Path, file: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(file), content).unwrap();
    }

    fn probe_config(hwmon_root: &Path) -> ProbeConfig {
        ProbeConfig {
            hwmon_root: hwmon_root.to_path_buf(),
            sensors_tool: "legionmon-no-such-sensors".to_string(),
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn parses_signed_values_before_degree_sign() {
        let readings = parse_sensors_output(SENSORS_SAMPLE);
        assert_eq!(readings.len(), 2);
        assert_eq!(readings[0].name, "CPU (Tctl)");
        assert_eq!(readings[0].celsius, 67.5);
        assert_eq!(readings[1].name, "CPU (Tdie)");
        assert_eq!(readings[1].celsius, -1.0);
        assert!(readings.iter().all(|r| r.source == TempSource::Sensors));
    }

    #[test]
    fn scan_keeps_first_three_plausible_values() {
        let root = tempfile::tempdir().unwrap();
        let r = root.path();
        write(&r.join("hwmon0"), "temp1_input", "25000");
        write(&r.join("hwmon0"), "temp2_input", "45000");
        write(&r.join("hwmon1"), "temp1_input", "200000");
        write(&r.join("hwmon1"), "temp2_input", "50000");
        write(&r.join("hwmon2"), "temp1_input", "60000");
        write(&r.join("hwmon2"), "temp2_input", "70000");

        let names: Vec<String> = scan_hwmon(r).into_iter().map(|t| t.name).collect();
        assert_eq!(
            names,
            vec![
                "hwmon0_temp2_input".to_string(),
                "hwmon1_temp2_input".to_string(),
                "hwmon2_temp1_input".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn nothing_found_yields_single_placeholder() {
        let root = tempfile::tempdir().unwrap();
        let registry = SensorRegistry::from_parts(BTreeMap::new(), GpuPresence::Absent);
        let probe = TemperatureProbe::new(&registry, &probe_config(root.path()), 70.0);

        let readings = probe.sample().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].source, TempSource::Unavailable);
        assert!(readings[0].is_placeholder());
    }

    #[tokio::test]
    async fn sysfs_tier_wins_and_nvme_uses_default_critical() {
        let root = tempfile::tempdir().unwrap();
        let r = root.path();
        write(&r.join("hwmon3"), "name", "k10temp");
        write(&r.join("hwmon3"), "temp1_input", "71250");
        write(&r.join("hwmon2"), "name", "nvme");
        write(&r.join("hwmon2"), "temp1_input", "39850");
        write(&r.join("hwmon2"), "temp2_input", "44850");
        write(&r.join("hwmon2"), "temp2_crit", "84850");

        let sensors = crate::collectors::registry::discover_sensors(r);
        let registry = SensorRegistry::from_parts(sensors, GpuPresence::Absent);
        let probe = TemperatureProbe::new(&registry, &probe_config(r), 70.0);

        let readings = probe.sample().await.unwrap();
        assert_eq!(readings.len(), 3);
        assert_eq!(readings[0].name, "CPU (Tctl)");
        assert_eq!(readings[0].source, TempSource::K10temp);
        assert_eq!(readings[0].celsius, 71.25);
        assert_eq!(readings[1].name, "NVMe Composite");
        assert_eq!(readings[1].critical, Some(70.0));
        assert_eq!(readings[2].critical, Some(84.85));
    }

    #[tokio::test]
    async fn scan_tier_used_when_cpu_file_missing() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("hwmon7"), "temp1_input", "48000");

        let registry = SensorRegistry::from_parts(BTreeMap::new(), GpuPresence::Absent);
        let probe = TemperatureProbe::new(&registry, &probe_config(root.path()), 70.0);

        let readings = probe.sample().await.unwrap();
        assert_eq!(readings.len(), 1);
        assert_eq!(readings[0].name, "hwmon7_temp1_input");
        assert_eq!(readings[0].source, TempSource::Hwmon);
    }
}
