use crate::config::Thresholds;
use crate::state::{SensorKind, Snapshot, TemperatureReading};
use colored::{ColoredString, Colorize};
use crossterm::{cursor, execute, terminal};
use std::fmt::Write as _;
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;

const RULE: &str = "──────────────────────────────────────────────────────────────────────";
const FALLBACK_CRITICAL: f64 = 80.0;
const MAX_DISKS: usize = 3;
const MAX_WARNINGS: usize = 5;
const MAX_ERRORS: usize = 3;
const ERROR_WIDTH: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grade {
    Critical,
    Hot,
    Warm,
    Normal,
}

impl Grade {
    pub fn paint(self, text: String) -> ColoredString {
        match self {
            Grade::Critical => text.red().bold(),
            Grade::Hot => text.bright_yellow().bold(),
            Grade::Warm => text.yellow(),
            Grade::Normal => text.green(),
        }
    }
}

pub fn temp_grade(celsius: f64, critical: f64) -> Grade {
    if celsius >= critical {
        Grade::Critical
    } else if celsius >= critical * 0.85 {
        Grade::Hot
    } else if celsius >= critical * 0.7 {
        Grade::Warm
    } else {
        Grade::Normal
    }
}

pub fn usage_grade(value: f64, critical: f64) -> Grade {
    if value >= critical {
        Grade::Critical
    } else if value >= critical * 0.8 {
        Grade::Warm
    } else {
        Grade::Normal
    }
}

pub struct Presenter {
    thresholds: Thresholds,
    log_path: PathBuf,
}

impl Presenter {
    pub fn new(thresholds: Thresholds, log_path: PathBuf) -> Self {
        Self {
            thresholds,
            log_path,
        }
    }

    pub fn critical_for(&self, reading: &TemperatureReading) -> f64 {
        match reading.kind() {
            SensorKind::Cpu => self.thresholds.cpu_temp,
            SensorKind::Gpu => self.thresholds.gpu_temp,
            SensorKind::Nvme => self.thresholds.nvme_temp,
            SensorKind::Other => reading.critical.unwrap_or(FALLBACK_CRITICAL),
        }
    }

    pub fn draw(&self, snapshot: &Snapshot, export_error: Option<&str>) -> io::Result<()> {
        let frame = self.render(snapshot, export_error);
        let mut stdout = io::stdout();
        execute!(
            stdout,
            terminal::Clear(terminal::ClearType::All),
            cursor::MoveTo(0, 0)
        )?;
        stdout.write_all(frame.as_bytes())?;
        stdout.flush()
    }

    pub fn render(&self, snapshot: &Snapshot, export_error: Option<&str>) -> String {
        let mut out = String::new();
        header(&mut out);
        self.temperatures(&mut out, snapshot);
        self.gpu(&mut out, snapshot);
        self.system(&mut out, snapshot);
        self.disks(&mut out, snapshot);
        warnings(&mut out, snapshot);
        errors(&mut out, snapshot);
        self.controls(&mut out, snapshot, export_error);
        out
    }

    fn temperatures(&self, out: &mut String, snapshot: &Snapshot) {
        open(out, "ТЕМПЕРАТУРЫ");
        for reading in &snapshot.temperatures {
            let icon = match reading.kind() {
                SensorKind::Cpu => "🔥",
                SensorKind::Gpu => "🎮",
                SensorKind::Nvme => "💾",
                SensorKind::Other => "🌡️",
            };
            if reading.is_placeholder() {
                let _ = writeln!(
                    out,
                    "│ {icon} {:<20}: {} ({})",
                    reading.name,
                    "нет данных".red(),
                    reading.source.as_str()
                );
                continue;
            }
            let grade = temp_grade(reading.celsius, self.critical_for(reading));
            let critical = reading
                .critical
                .map(|c| format!("/{c:.0}°C"))
                .unwrap_or_default();
            let _ = writeln!(
                out,
                "│ {icon} {:<20}: {} ({})",
                reading.name,
                grade.paint(format!("{:5.1}°C{critical}", reading.celsius)),
                reading.source.as_str()
            );
        }
        close(out);
    }

    fn gpu(&self, out: &mut String, snapshot: &Snapshot) {
        let gpu = &snapshot.gpu;
        if !gpu.available {
            open(out, "ВИДЕОКАРТА");
            let _ = writeln!(
                out,
                "│ {}",
                "❌ GPU не обнаружена или драйверы не установлены".red()
            );
            close(out);
            return;
        }

        open(out, "ВИДЕОКАРТА (RTX 3070 Mobile)");
        if gpu.is_working() {
            let t = &self.thresholds;
            let _ = writeln!(
                out,
                "│ Температура: {}  │  Мощность: {}  │  Загрузка: {}",
                temp_grade(gpu.temperature, t.gpu_temp).paint(format!("{:5.1}°C", gpu.temperature)),
                usage_grade(gpu.power_draw, t.gpu_power).paint(format!("{:5.1}W", gpu.power_draw)),
                usage_grade(gpu.utilization, t.gpu_utilization)
                    .paint(format!("{:4.1}%", gpu.utilization)),
            );
            let _ = writeln!(
                out,
                "│ VRAM: {:4.1}GB/{:4.1}GB ({:4.1}%)  │  Частота: {}  │  Вентилятор: {:.0}%",
                gpu.memory_used / 1024.0,
                gpu.memory_total / 1024.0,
                gpu.memory_percent(),
                format!("{:4.0}MHz", gpu.clock_core).green(),
                gpu.fan_speed,
            );
            if gpu.is_throttling() {
                let _ = writeln!(out, "│ {}", "🚨 THROTTLING АКТИВЕН!".red().bold());
            }
        } else {
            let _ = writeln!(out, "│ Статус: {}", gpu.status.as_str().yellow());
            let _ = writeln!(out, "│ Драйвер: {}", gpu.driver_version.cyan());
            let _ = writeln!(
                out,
                "│ {}",
                "💡 Решение: sudo reboot или переустановка драйверов".yellow()
            );
        }
        close(out);
    }

    fn system(&self, out: &mut String, snapshot: &Snapshot) {
        let sys = &snapshot.system;
        let t = &self.thresholds;
        open(out, "СИСТЕМА");
        let _ = writeln!(
            out,
            "│ CPU: {}  │  Частота: {}  │  RAM: {}",
            usage_grade(sys.cpu_usage, t.cpu_usage).paint(format!("{:5.1}%", sys.cpu_usage)),
            format!("{:4.0}MHz", sys.cpu_freq_mhz).cyan(),
            usage_grade(sys.memory.percent, t.memory_usage)
                .paint(format!("{:4.1}%", sys.memory.percent)),
        );
        let uptime = humantime::format_duration(Duration::from_secs(sys.uptime_secs));
        let _ = writeln!(
            out,
            "│ Память: {:4.1}GB/{:4.1}GB  │  Load: {}  │  Время работы: {}",
            gib(sys.memory.used_bytes),
            gib(sys.memory.total_bytes),
            format!("{:4.2}", sys.load_average.one).yellow(),
            uptime.to_string().green(),
        );

        let battery = &snapshot.battery;
        if battery.present {
            let paint = |text: String| {
                if battery.charging {
                    text.green()
                } else {
                    text.yellow()
                }
            };
            let _ = writeln!(
                out,
                "│ Питание: {}  │  Батарея: {}  │  Напряжение: {}",
                paint(battery.power_source.clone()),
                paint(format!("{:3.0}%", battery.percent)),
                format!("{:.2}V", battery.voltage).cyan(),
            );
        }
        close(out);
    }

    fn disks(&self, out: &mut String, snapshot: &Snapshot) {
        let disks = &snapshot.system.disks;
        if disks.is_empty() {
            return;
        }
        open(out, "ДИСКИ");
        for disk in disks.iter().take(MAX_DISKS) {
            let _ = writeln!(
                out,
                "│ {:<15}: {} ({:4.1}GB/{:4.1}GB) {}",
                disk.device,
                usage_grade(disk.percent, self.thresholds.disk_usage)
                    .paint(format!("{:5.1}%", disk.percent)),
                gib(disk.used_bytes),
                gib(disk.total_bytes),
                disk.mountpoint
            );
        }
        close(out);
    }

    fn controls(&self, out: &mut String, snapshot: &Snapshot, export_error: Option<&str>) {
        open(out, "УПРАВЛЕНИЕ");
        let _ = writeln!(
            out,
            "│ {} - Выход  │  {} - Сохранить  │  {} - Сброс  │  Alerts: {}",
            "q".green(),
            "s".green(),
            "r".green(),
            snapshot.alerts_today.to_string().yellow()
        );
        let _ = writeln!(
            out,
            "│ Лог: {}",
            self.log_path.display().to_string().cyan()
        );
        if let Some(err) = export_error {
            let _ = writeln!(out, "│ {}", format!("❌ Ошибка экспорта: {err}").red());
        }
        close(out);
    }
}

fn header(out: &mut String) {
    let bar = "═".repeat(70);
    let _ = writeln!(out, "{}", format!("╔{bar}╗").cyan().bold());
    let _ = writeln!(
        out,
        "{}",
        "║              LEGION 5 PRO MONITOR: температуры и производительность".cyan().bold()
    );
    let _ = writeln!(out, "{}", format!("╚{bar}╝").cyan().bold());
}

fn warnings(out: &mut String, snapshot: &Snapshot) {
    if snapshot.warnings.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{}", "┌─ ПРЕДУПРЕЖДЕНИЯ".red().bold());
    for warning in snapshot.warnings.iter().take(MAX_WARNINGS) {
        let _ = writeln!(out, "│ {}", warning.message.red());
    }
    let _ = writeln!(out, "{}", format!("└{RULE}").red().bold());
}

fn errors(out: &mut String, snapshot: &Snapshot) {
    if snapshot.errors.is_empty() {
        return;
    }
    let _ = writeln!(out, "\n{}", "┌─ СИСТЕМНЫЕ ОШИБКИ".yellow().bold());
    for entry in snapshot.errors.iter().take(MAX_ERRORS) {
        let _ = writeln!(out, "│ {}", truncate(&entry.message, ERROR_WIDTH).yellow());
    }
    let _ = writeln!(out, "{}", format!("└{RULE}").yellow().bold());
}

fn open(out: &mut String, title: &str) {
    let _ = writeln!(out, "\n{}", format!("┌─ {title} ").white().bold());
}

fn close(out: &mut String) {
    let _ = writeln!(out, "{}", format!("└{RULE}").white().bold());
}

fn gib(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0 / 1024.0
}

pub fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width).collect();
    cut.push_str("...");
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{
        BatteryState, GpuState, GpuStatus, LogErrorEntry, Rule, SystemMetrics, TempSource,
        Warning,
    };
    use chrono::Local;

    fn presenter() -> Presenter {
        Presenter::new(Thresholds::default(), PathBuf::from("legion_20240517_140309.txt"))
    }

    fn snapshot() -> Snapshot {
        Snapshot {
            timestamp: Local::now(),
            temperatures: vec![TemperatureReading::placeholder()],
            gpu: GpuState::unavailable(),
            system: SystemMetrics::default(),
            battery: BatteryState::default(),
            errors: Vec::new(),
            warnings: Vec::new(),
            alerts_today: 0,
        }
    }

    #[test]
    fn temperature_grades_follow_critical_fractions() {
        assert_eq!(temp_grade(85.0, 85.0), Grade::Critical);
        assert_eq!(temp_grade(73.0, 85.0), Grade::Hot);
        assert_eq!(temp_grade(60.0, 85.0), Grade::Warm);
        assert_eq!(temp_grade(59.0, 85.0), Grade::Normal);
    }

    #[test]
    fn usage_grades_follow_critical_fractions() {
        assert_eq!(usage_grade(90.0, 90.0), Grade::Critical);
        assert_eq!(usage_grade(75.0, 90.0), Grade::Warm);
        assert_eq!(usage_grade(71.9, 90.0), Grade::Normal);
    }

    #[test]
    fn unknown_sensor_uses_own_critical_or_fallback() {
        let p = presenter();
        let other = TemperatureReading::new("hwmon4_temp1_input", 40.0, TempSource::Hwmon);
        assert_eq!(p.critical_for(&other), 80.0);
        assert_eq!(p.critical_for(&other.with_critical(Some(100.0))), 100.0);
        let nvme = TemperatureReading::new("NVMe Composite", 40.0, TempSource::Nvme);
        assert_eq!(p.critical_for(&nvme), 70.0);
    }

    #[test]
    fn long_messages_are_truncated() {
        let message = "x".repeat(75);
        let cut = truncate(&message, 60);
        assert_eq!(cut.chars().count(), 63);
        assert!(cut.ends_with("..."));
        assert_eq!(truncate("short", 60), "short");
    }

    #[test]
    fn placeholder_reading_is_labeled_unavailable() {
        let frame = presenter().render(&snapshot(), None);
        assert!(frame.contains("нет данных"));
        assert!(frame.contains("(unavailable)"));
        assert!(!frame.contains("0.0°C"));
    }

    #[test]
    fn degraded_gpu_shows_status_and_hint() {
        let mut snap = snapshot();
        snap.gpu = GpuState::degraded(GpuStatus::DetectedNoDriverBridge);
        let frame = presenter().render(&snap, None);
        assert!(frame.contains("detected-no-driver-bridge"));
        assert!(frame.contains("sudo reboot"));
        assert!(!frame.contains("не обнаружена"));
    }

    #[test]
    fn frame_limits_lists_and_shows_export_failure() {
        let mut snap = snapshot();
        snap.warnings = (0..7)
            .map(|i| Warning {
                rule: Rule::DiskUsage,
                message: format!("warning-{i}"),
            })
            .collect();
        snap.errors = (0..4)
            .map(|i| LogErrorEntry {
                timestamp: String::new(),
                message: format!("error-{i}"),
                unit: "unknown".to_string(),
                priority: "3".to_string(),
            })
            .collect();

        let frame = presenter().render(&snap, Some("диск переполнен"));
        assert!(frame.contains("warning-4"));
        assert!(!frame.contains("warning-5"));
        assert!(frame.contains("error-2"));
        assert!(!frame.contains("error-3"));
        assert!(frame.contains("диск переполнен"));
        assert!(frame.contains("legion_20240517_140309.txt"));
        assert!(frame.contains("GPU не обнаружена"));
    }
}
