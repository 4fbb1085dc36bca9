use crate::alerts::{Alert, AlertLedger, Component};
use crate::collectors::battery::BatteryProbe;
use crate::collectors::gpu::GpuProbe;
use crate::collectors::journal::JournalProbe;
use crate::collectors::registry::SensorRegistry;
use crate::collectors::system::SystemProbe;
use crate::collectors::temperature::TemperatureProbe;
use crate::collectors::{BoxedProbe, Probe, ProbeError};
use crate::config::{Config, Thresholds};
use crate::state::{
    BatteryState, GpuState, GpuStatus, LogErrorEntry, Rule, SensorKind, Snapshot, SystemMetrics,
    TempSource, TemperatureReading, Warning,
};
use chrono::Local;
use std::time::Duration;
use tokio::time;
use tracing::{debug, warn};

/// One probe per snapshot section.
pub struct ProbeSet {
    pub temperatures: BoxedProbe<Vec<TemperatureReading>>,
    pub gpu: BoxedProbe<GpuState>,
    pub system: BoxedProbe<SystemMetrics>,
    pub battery: BoxedProbe<BatteryState>,
    pub journal: BoxedProbe<Vec<LogErrorEntry>>,
    /// Registry saw a GPU, so a silent GPU probe means `query-failed`.
    pub gpu_present: bool,
}

impl ProbeSet {
    pub fn from_host(registry: &SensorRegistry, cfg: &Config) -> Self {
        Self {
            temperatures: Box::new(TemperatureProbe::new(
                registry,
                &cfg.probes,
                cfg.thresholds.nvme_temp,
            )),
            gpu: Box::new(GpuProbe::new(registry.gpu(), &cfg.probes)),
            system: Box::new(SystemProbe::new()),
            battery: Box::new(BatteryProbe::new(cfg.probes.power_supply_root.clone())),
            journal: Box::new(JournalProbe::new(&cfg.probes)),
            gpu_present: registry.gpu().is_present(),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq)]
pub struct Evaluation {
    pub warnings: Vec<Warning>,
    pub alerts: Vec<Alert>,
}

impl Evaluation {
    fn warn(&mut self, rule: Rule, message: String) {
        self.warnings.push(Warning { rule, message });
    }
}

pub struct SnapshotAggregator {
    probes: ProbeSet,
    thresholds: Thresholds,
    deadline: Duration,
    ledger: AlertLedger,
}

impl SnapshotAggregator {
    pub fn new(probes: ProbeSet, cfg: &Config, ledger: AlertLedger) -> Self {
        Self {
            probes,
            thresholds: cfg.thresholds.clone(),
            deadline: cfg.probes.probe_deadline(),
            ledger,
        }
    }

    /// Samples every probe concurrently. Never fails: a probe that errors or
    /// misses its deadline contributes its default value, except that a GPU
    /// the registry saw stays `available` with status `query-failed`.
    pub async fn tick(&self) -> Snapshot {
        let p = &self.probes;
        let (temperatures, gpu, system, battery, errors) = tokio::join!(
            sample_within(p.temperatures.as_ref(), self.deadline),
            sample_within(p.gpu.as_ref(), self.deadline),
            sample_within(p.system.as_ref(), self.deadline),
            sample_within(p.battery.as_ref(), self.deadline),
            sample_within(p.journal.as_ref(), self.deadline),
        );

        let mut temperatures = absorb("temperatures", temperatures)
            .unwrap_or_else(|| vec![TemperatureReading::placeholder()]);
        let gpu = absorb("gpu", gpu).unwrap_or_else(|| {
            if p.gpu_present {
                GpuState::degraded(GpuStatus::QueryFailed)
            } else {
                GpuState::unavailable()
            }
        });
        let system = absorb("system", system).unwrap_or_default();
        let battery = absorb("battery", battery).unwrap_or_default();
        let errors = absorb("journal", errors).unwrap_or_default();

        if gpu.is_working() {
            temperatures.push(TemperatureReading::new(
                "GPU",
                gpu.temperature,
                TempSource::Nvidia,
            ));
        }

        let Evaluation { warnings, alerts } =
            evaluate(&self.thresholds, &temperatures, &gpu, &system);
        for alert in alerts {
            self.ledger.record(alert);
        }

        Snapshot {
            timestamp: Local::now(),
            temperatures,
            gpu,
            system,
            battery,
            errors,
            warnings,
            alerts_today: self.ledger.count_today(),
        }
    }
}

async fn sample_within<T: Send>(
    probe: &dyn Probe<Output = T>,
    deadline: Duration,
) -> Result<T, ProbeError> {
    match time::timeout(deadline, probe.sample()).await {
        Ok(result) => result,
        Err(_elapsed) => Err(ProbeError::Timeout {
            what: probe.name().to_string(),
            after: deadline,
        }),
    }
}

fn absorb<T>(probe: &str, result: Result<T, ProbeError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err @ ProbeError::Unavailable(_)) => {
            debug!(probe, error = %err, "источник недоступен, используется значение по умолчанию");
            None
        }
        Err(err) => {
            warn!(probe, error = %err, "источник не ответил, используется значение по умолчанию");
            None
        }
    }
}

/// Applies the threshold table. Every comparison is a strict `>`; alerts are
/// raised only for CPU/GPU temperatures and GPU throttling.
pub fn evaluate(
    t: &Thresholds,
    temperatures: &[TemperatureReading],
    gpu: &GpuState,
    system: &SystemMetrics,
) -> Evaluation {
    let mut out = Evaluation::default();

    for reading in temperatures {
        let value = reading.celsius;
        match reading.kind() {
            SensorKind::Cpu if value > t.cpu_temp => {
                out.warn(
                    Rule::CpuTemp,
                    format!("⚠️ Высокая температура CPU: {value:.1}°C"),
                );
                out.alerts.push(Alert::critical(
                    Component::Cpu,
                    format!("{}: {value:.1}°C", reading.name),
                    value,
                    t.cpu_temp,
                ));
            }
            SensorKind::Gpu if value > t.gpu_temp => {
                out.warn(
                    Rule::GpuTemp,
                    format!("🔥 Высокая температура GPU: {value:.1}°C"),
                );
                out.alerts.push(Alert::critical(
                    Component::Gpu,
                    format!("{}: {value:.1}°C", reading.name),
                    value,
                    t.gpu_temp,
                ));
            }
            SensorKind::Nvme if value > t.nvme_temp => {
                out.warn(
                    Rule::NvmeTemp,
                    format!("💾 Высокая температура SSD: {value:.1}°C"),
                );
            }
            _ => {}
        }
    }

    if gpu.available {
        if gpu.power_draw > t.gpu_power {
            out.warn(
                Rule::GpuPower,
                format!("⚡ Высокое потребление GPU: {:.1}W", gpu.power_draw),
            );
        }
        if gpu.utilization > t.gpu_utilization {
            out.warn(
                Rule::GpuUtilization,
                format!("🎮 Высокая загрузка GPU: {:.1}%", gpu.utilization),
            );
        }
        if gpu.is_throttling() {
            out.warn(Rule::GpuThrottling, "🚨 GPU THROTTLING активен!".to_string());
            out.alerts.push(Alert::critical(
                Component::Gpu,
                format!("GPU throttling: {:?}", gpu.throttle_reasons),
                1.0,
                0.0,
            ));
        }
    }

    if system.cpu_usage > t.cpu_usage {
        out.warn(
            Rule::CpuUsage,
            format!("💻 Высокая загрузка CPU: {:.1}%", system.cpu_usage),
        );
    }
    if system.memory.percent > t.memory_usage {
        out.warn(
            Rule::MemoryUsage,
            format!("🧠 Высокое использование RAM: {:.1}%", system.memory.percent),
        );
    }
    for disk in &system.disks {
        if disk.percent > t.disk_usage {
            out.warn(
                Rule::DiskUsage,
                format!("💿 Диск {}: {:.1}%", disk.device, disk.percent),
            );
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::gpu::{write_fake_tool, GpuProbe};
    use crate::collectors::registry::GpuPresence;
    use crate::state::{DiskUsage, ThrottleReason};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct Fake<T> {
        result: Result<T, ProbeError>,
        delay: Duration,
    }

    #[async_trait]
    impl<T: Clone + Send + Sync + 'static> Probe for Fake<T> {
        type Output = T;

        fn name(&self) -> &'static str {
            "fake"
        }

        async fn sample(&self) -> Result<T, ProbeError> {
            if !self.delay.is_zero() {
                time::sleep(self.delay).await;
            }
            self.result.clone()
        }
    }

    fn ok<T: Clone + Send + Sync + 'static>(value: T) -> BoxedProbe<T> {
        Box::new(Fake {
            result: Ok(value),
            delay: Duration::ZERO,
        })
    }

    fn failing<T: Clone + Send + Sync + 'static>() -> BoxedProbe<T> {
        Box::new(Fake {
            result: Err(ProbeError::ParseFailure("fake".to_string())),
            delay: Duration::ZERO,
        })
    }

    fn unavailable_probes() -> ProbeSet {
        ProbeSet {
            temperatures: failing(),
            gpu: Box::new(Fake {
                result: Err(ProbeError::Unavailable("fake".to_string())),
                delay: Duration::ZERO,
            }),
            system: failing(),
            battery: failing(),
            journal: failing(),
            gpu_present: false,
        }
    }

    fn working_gpu(temperature: f64) -> GpuState {
        let mut gpu = GpuState::degraded(GpuStatus::Working);
        gpu.temperature = temperature;
        gpu.power_limit = 130.0;
        gpu
    }

    #[tokio::test]
    async fn hot_cpu_gives_one_warning_and_one_alert() {
        let ledger = AlertLedger::new();
        let probes = ProbeSet {
            temperatures: ok(vec![TemperatureReading::new(
                "CPU (Tctl)",
                90.0,
                TempSource::K10temp,
            )]),
            ..unavailable_probes()
        };
        let aggregator = SnapshotAggregator::new(probes, &Config::default(), ledger.clone());

        let snapshot = aggregator.tick().await;

        let cpu_warnings: Vec<&Warning> = snapshot
            .warnings
            .iter()
            .filter(|w| w.rule == Rule::CpuTemp)
            .collect();
        assert_eq!(cpu_warnings.len(), 1);
        assert_eq!(snapshot.warnings.len(), 1);
        assert_eq!(ledger.len(), 1);
        assert_eq!(snapshot.alerts_today, 1);

        let alert = &ledger.alerts()[0];
        assert_eq!(alert.component, Component::Cpu);
        assert_eq!(alert.value, 90.0);
        assert_eq!(alert.threshold, 85.0);
    }

    #[tokio::test]
    async fn failing_probes_yield_defaults() {
        let aggregator =
            SnapshotAggregator::new(unavailable_probes(), &Config::default(), AlertLedger::new());

        let snapshot = aggregator.tick().await;

        assert_eq!(snapshot.temperatures, vec![TemperatureReading::placeholder()]);
        assert_eq!(snapshot.gpu, GpuState::unavailable());
        assert_eq!(snapshot.system, SystemMetrics::default());
        assert_eq!(snapshot.battery, BatteryState::default());
        assert!(snapshot.errors.is_empty());
        assert!(snapshot.warnings.is_empty());
        assert_eq!(snapshot.alerts_today, 0);
    }

    #[tokio::test]
    async fn slow_probe_is_cut_at_deadline() {
        let mut cfg = Config::default();
        cfg.probes.probe_deadline_ms = 50;
        let probes = ProbeSet {
            system: Box::new(Fake {
                result: Ok(SystemMetrics {
                    cpu_usage: 99.0,
                    ..SystemMetrics::default()
                }),
                delay: Duration::from_secs(10),
            }),
            ..unavailable_probes()
        };
        let aggregator = SnapshotAggregator::new(probes, &cfg, AlertLedger::new());

        let started = std::time::Instant::now();
        let snapshot = aggregator.tick().await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(snapshot.system.cpu_usage, 0.0);
        assert!(snapshot.warnings.is_empty());
    }

    #[tokio::test]
    async fn working_gpu_adds_reading_and_throttle_alert() {
        let ledger = AlertLedger::new();
        let mut gpu = working_gpu(70.0);
        gpu.throttle_reasons = BTreeSet::from([ThrottleReason::SwPowerCap]);
        let probes = ProbeSet {
            temperatures: ok(vec![TemperatureReading::new(
                "CPU (Tctl)",
                60.0,
                TempSource::K10temp,
            )]),
            gpu: ok(gpu),
            ..unavailable_probes()
        };
        let aggregator = SnapshotAggregator::new(probes, &Config::default(), ledger.clone());

        let snapshot = aggregator.tick().await;

        let last = snapshot.temperatures.last().unwrap();
        assert_eq!(last.name, "GPU");
        assert_eq!(last.source, TempSource::Nvidia);
        assert_eq!(last.celsius, 70.0);

        let rules: Vec<Rule> = snapshot.warnings.iter().map(|w| w.rule).collect();
        assert_eq!(rules, vec![Rule::GpuThrottling]);
        let alert = &ledger.alerts()[0];
        assert_eq!(alert.component, Component::Gpu);
        assert_eq!((alert.value, alert.threshold), (1.0, 0.0));
    }

    #[test]
    fn thresholds_are_strict_and_usage_only_warns() {
        let t = Thresholds::default();
        let temps = vec![
            TemperatureReading::new("CPU (Tctl)", 85.0, TempSource::K10temp),
            TemperatureReading::new("NVMe Composite", 71.0, TempSource::Nvme),
            TemperatureReading::new("hwmon4_temp1_input", 140.0, TempSource::Hwmon),
        ];
        let mut gpu = working_gpu(78.0);
        gpu.power_draw = 126.0;
        gpu.utilization = 96.0;
        let system = SystemMetrics {
            cpu_usage: 95.0,
            memory: crate::state::MemoryStats {
                percent: 85.0,
                ..Default::default()
            },
            disks: vec![DiskUsage {
                device: "/dev/nvme0n1p2".to_string(),
                mountpoint: "/".to_string(),
                fs_type: "ext4".to_string(),
                percent: 93.5,
                used_bytes: 935,
                total_bytes: 1000,
            }],
            ..SystemMetrics::default()
        };

        let result = evaluate(&t, &temps, &gpu, &system);

        let rules: Vec<Rule> = result.warnings.iter().map(|w| w.rule).collect();
        assert_eq!(
            rules,
            vec![
                Rule::NvmeTemp,
                Rule::GpuPower,
                Rule::GpuUtilization,
                Rule::CpuUsage,
                Rule::DiskUsage,
            ]
        );
        assert!(result.alerts.is_empty());
    }

    #[test]
    fn placeholder_never_triggers() {
        let result = evaluate(
            &Thresholds::default(),
            &[TemperatureReading::placeholder()],
            &GpuState::unavailable(),
            &SystemMetrics::default(),
        );
        assert_eq!(result, Evaluation::default());
    }

    #[tokio::test]
    async fn silent_gpu_that_registry_saw_is_query_failed() {
        let mut cfg = Config::default();
        cfg.probes.probe_deadline_ms = 50;
        let probes = ProbeSet {
            gpu: Box::new(Fake {
                result: Ok(working_gpu(60.0)),
                delay: Duration::from_secs(10),
            }),
            gpu_present: true,
            ..unavailable_probes()
        };
        let aggregator = SnapshotAggregator::new(probes, &cfg, AlertLedger::new());

        let snapshot = aggregator.tick().await;

        assert!(snapshot.gpu.available);
        assert_eq!(snapshot.gpu.status, GpuStatus::QueryFailed);
        assert!(snapshot.temperatures.iter().all(|r| r.name != "GPU"));
    }

    #[tokio::test]
    async fn hung_throttle_query_keeps_gpu_metrics_in_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(
            dir.path(),
            "sleep 0.4; echo 'GPU 0: NVIDIA GeForce RTX 3070 Laptop GPU'",
            "sleep 0.7; echo '64, 42.0, 35, 1024, 8192, 1350, 7000, 40, 130.00, 535.104.05'",
            "exec sleep 30",
        );
        let mut cfg = Config::default();
        cfg.probes.gpu_tool = tool;
        cfg.probes.command_timeout_ms = 800;
        cfg.probes.query_timeout_ms = 1_200;
        cfg.probes.probe_deadline_ms = 1_800;
        cfg.validate().unwrap();

        let probes = ProbeSet {
            gpu: Box::new(GpuProbe::new(GpuPresence::Tool, &cfg.probes)),
            gpu_present: true,
            ..unavailable_probes()
        };
        let aggregator = SnapshotAggregator::new(probes, &cfg, AlertLedger::new());

        let snapshot = aggregator.tick().await;

        assert!(snapshot.gpu.available);
        assert_eq!(snapshot.gpu.status, GpuStatus::QueryFailed);
        assert_eq!(snapshot.gpu.power_draw, 42.0);
        assert_eq!(snapshot.gpu.temperature, 64.0);
    }
}
