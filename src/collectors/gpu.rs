use crate::collectors::registry::GpuPresence;
use crate::collectors::{parse_f64_loose, read_trimmed, run_command, Probe, ProbeError};
use crate::config::ProbeConfig;
use crate::state::{GpuState, GpuStatus, ThrottleReason};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

const QUERY_FIELDS: &str = "--query-gpu=temperature.gpu,power.draw,utilization.gpu,memory.used,\
memory.total,clocks.current.graphics,clocks.current.memory,fan.speed,power.limit,driver_version";
const QUERY_FORMAT: &str = "--format=csv,noheader,nounits";
const THROTTLE_FIELD: &str = "--query-gpu=clocks_throttle_reasons.active";
const THROTTLE_FORMAT: &str = "--format=csv,noheader";
const MIN_FIELDS: usize = 4;
// Left at the end of the probe deadline for returning what was collected.
const RETURN_MARGIN: Duration = Duration::from_millis(250);

const SENTINELS: [&str; 3] = ["[Not Supported]", "[N/A]", "[Unknown Error]"];

// Bit 0x1 (GPU idle) is not a throttle.
const THROTTLE_BITS: [(u64, ThrottleReason); 8] = [
    (0x2, ThrottleReason::ApplicationsClocks),
    (0x4, ThrottleReason::SwPowerCap),
    (0x8, ThrottleReason::HwSlowdown),
    (0x10, ThrottleReason::SyncBoost),
    (0x20, ThrottleReason::SwThermalSlowdown),
    (0x40, ThrottleReason::HwThermalSlowdown),
    (0x80, ThrottleReason::HwPowerBrake),
    (0x100, ThrottleReason::DisplayClock),
];

pub struct GpuProbe {
    presence: GpuPresence,
    tool: String,
    driver_version_file: PathBuf,
    command_timeout: Duration,
    query_timeout: Duration,
    budget: Duration,
}

impl GpuProbe {
    pub fn new(presence: GpuPresence, cfg: &ProbeConfig) -> Self {
        Self {
            presence,
            tool: cfg.gpu_tool.clone(),
            driver_version_file: cfg.gpu_driver_version_file.clone(),
            command_timeout: cfg.command_timeout(),
            query_timeout: cfg.query_timeout(),
            budget: cfg.probe_deadline().saturating_sub(RETURN_MARGIN),
        }
    }

    /// Per-command timeout, shortened so the three calls together finish
    /// inside the aggregator's deadline.
    fn limit(&self, started: Instant, timeout: Duration) -> Duration {
        timeout.min(self.budget.saturating_sub(started.elapsed()))
    }

    async fn tool_responds(&self, started: Instant) -> bool {
        let timeout = self.limit(started, self.command_timeout);
        match run_command(&self.tool, &["-L"], timeout).await {
            Ok(out) => out.success,
            Err(err) => {
                debug!(error = %err, "nvidia-smi -L не ответил");
                false
            }
        }
    }

    fn driver_version_from_file(&self) -> String {
        read_trimmed(&self.driver_version_file)
            .ok()
            .and_then(|text| text.lines().next().map(str::to_string))
            .filter(|line| !line.is_empty())
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn throttle_reasons(
        &self,
        started: Instant,
    ) -> Result<BTreeSet<ThrottleReason>, ProbeError> {
        let timeout = self.limit(started, self.command_timeout);
        run_command(&self.tool, &[THROTTLE_FIELD, THROTTLE_FORMAT], timeout)
            .await
            .and_then(|out| out.into_stdout(&self.tool))
            .and_then(|text| parse_throttle_reasons(&text))
            .map_err(|err| ProbeError::PartialData(format!("причины троттлинга: {err}")))
    }
}

#[async_trait]
impl Probe for GpuProbe {
    type Output = GpuState;

    fn name(&self) -> &'static str {
        "gpu"
    }

    async fn sample(&self) -> Result<GpuState, ProbeError> {
        if !self.presence.is_present() {
            return Err(ProbeError::Unavailable("GPU не обнаружена".to_string()));
        }

        let started = Instant::now();
        if !self.tool_responds(started).await {
            let mut state = GpuState::degraded(GpuStatus::DetectedNoDriverBridge);
            state.driver_version = self.driver_version_from_file();
            return Ok(state);
        }

        let timeout = self.limit(started, self.query_timeout);
        let output = match run_command(&self.tool, &[QUERY_FIELDS, QUERY_FORMAT], timeout)
            .await
            .and_then(|out| out.into_stdout(&self.tool))
        {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "запрос метрик GPU не удался");
                return Ok(GpuState::degraded(GpuStatus::QueryFailed));
            }
        };

        let line = output.lines().find(|l| !l.trim().is_empty()).unwrap_or_default();
        let mut state = match parse_gpu_query_line(line) {
            Ok(state) => state,
            Err(err) => {
                warn!(error = %err, "ответ nvidia-smi не разобран");
                return Ok(GpuState::degraded(GpuStatus::QueryFailed));
            }
        };

        match self.throttle_reasons(started).await {
            Ok(reasons) => state.throttle_reasons = reasons,
            Err(err) => {
                warn!(error = %err, "метрики GPU получены без причин троттлинга");
                state.status = GpuStatus::QueryFailed;
            }
        }

        Ok(state)
    }
}

/// Positional parse of the ten-field query line. Missing trailing fields
/// read as zero; fewer than four fields is not a usable answer.
pub fn parse_gpu_query_line(line: &str) -> Result<GpuState, ProbeError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if line.trim().is_empty() || fields.len() < MIN_FIELDS {
        return Err(ProbeError::ParseFailure(format!(
            "ожидалось не меньше {MIN_FIELDS} полей, получено: '{line}'"
        )));
    }

    let num = |i: usize| fields.get(i).map(|v| field_value(v)).unwrap_or(0.0);
    let driver_version = fields
        .get(9)
        .filter(|v| !v.is_empty() && !is_sentinel(v))
        .map(|v| v.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    Ok(GpuState {
        available: true,
        status: GpuStatus::Working,
        temperature: num(0),
        power_draw: num(1),
        utilization: num(2),
        memory_used: num(3),
        memory_total: num(4),
        clock_core: num(5),
        clock_memory: num(6),
        fan_speed: num(7),
        power_limit: num(8),
        driver_version,
        throttle_reasons: BTreeSet::new(),
    })
}

fn is_sentinel(value: &str) -> bool {
    SENTINELS.contains(&value)
}

fn field_value(raw: &str) -> f64 {
    if raw.is_empty() || is_sentinel(raw) {
        return 0.0;
    }
    let stripped = ["MiB", "MHz", "W", "%"]
        .iter()
        .fold(raw, |acc, unit| acc.trim_end_matches(unit).trim_end());
    parse_f64_loose(stripped).unwrap_or(0.0)
}

pub fn parse_throttle_reasons(text: &str) -> Result<BTreeSet<ThrottleReason>, ProbeError> {
    let token = text.lines().next().unwrap_or_default().trim();
    if token.is_empty() || is_sentinel(token) || token == "Not Active" {
        return Ok(BTreeSet::new());
    }
    if token == "Active" {
        return Ok(BTreeSet::from([ThrottleReason::Unspecified]));
    }

    let hex = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .ok_or_else(|| ProbeError::ParseFailure(format!("маска троттлинга: '{token}'")))?;
    let mask = u64::from_str_radix(hex, 16)
        .map_err(|_| ProbeError::ParseFailure(format!("маска троттлинга: '{token}'")))?;

    Ok(THROTTLE_BITS
        .iter()
        .filter(|(bit, _)| mask & bit != 0)
        .map(|(_, reason)| *reason)
        .collect())
}

/// Writes an executable `nvidia-smi` stand-in whose three invocations run
/// the given shell snippets.
#[cfg(test)]
pub(crate) fn write_fake_tool(
    dir: &std::path::Path,
    list: &str,
    query: &str,
    throttle: &str,
) -> String {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("nvidia-smi");
    let script = format!(
        "#!/bin/sh\ncase \"$1\" in\n  -L) {list} ;;\n  {THROTTLE_FIELD}) {throttle} ;;\n  *) {query} ;;\nesac\n"
    );
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();

    // A child forked by a parallel test may still hold the write handle.
    for _ in 0..50 {
        match std::process::Command::new(&path).arg("-L").output() {
            Err(err) if err.raw_os_error() == Some(26) => {
                std::thread::sleep(Duration::from_millis(10))
            }
            _ => break,
        }
    }
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIST_OK: &str = "echo 'GPU 0: NVIDIA GeForce RTX 3070 Laptop GPU'";
    const QUERY_OK: &str =
        "echo '61, 42.0, 35, 1024, 8192, 1350, 7000, 40, 130.00, 535.104.05'";

    fn tool_config(tool: String) -> ProbeConfig {
        ProbeConfig {
            gpu_tool: tool,
            ..ProbeConfig::default()
        }
    }

    #[test]
    fn full_line_parses_every_field() {
        let state = parse_gpu_query_line(
            "61, 42.17, 35, 1024, 6144, 1350, 7000, 40, 130.00, 535.104.05",
        )
        .unwrap();
        assert_eq!(state.status, GpuStatus::Working);
        assert_eq!(state.temperature, 61.0);
        assert_eq!(state.power_draw, 42.17);
        assert_eq!(state.memory_total, 6144.0);
        assert_eq!(state.power_limit, 130.0);
        assert_eq!(state.driver_version, "535.104.05");
    }

    #[test]
    fn unsupported_power_reads_zero_and_rest_survives() {
        let state = parse_gpu_query_line(
            "55, [Not Supported], 12, 512, 6144, [N/A], 5000, [Unknown Error], 115, 550.54",
        )
        .unwrap();
        assert_eq!(state.power_draw, 0.0);
        assert_eq!(state.temperature, 55.0);
        assert_eq!(state.utilization, 12.0);
        assert_eq!(state.clock_core, 0.0);
        assert_eq!(state.fan_speed, 0.0);
        assert_eq!(state.clock_memory, 5000.0);
        assert_eq!(state.driver_version, "550.54");
    }

    #[test]
    fn units_are_stripped_and_short_lines_rejected() {
        let state = parse_gpu_query_line("48 %, 20.5 W, 7 %, 300 MiB").unwrap();
        assert_eq!(state.temperature, 48.0);
        assert_eq!(state.power_draw, 20.5);
        assert_eq!(state.memory_used, 300.0);
        assert_eq!(state.memory_total, 0.0);
        assert_eq!(state.driver_version, "unknown");

        assert!(matches!(
            parse_gpu_query_line("48, 20.5, 7"),
            Err(ProbeError::ParseFailure(_))
        ));
        assert!(parse_gpu_query_line("").is_err());
    }

    #[test]
    fn throttle_mask_decodes_and_ignores_idle() {
        assert!(parse_throttle_reasons("0x0000000000000001\n").unwrap().is_empty());
        assert_eq!(
            parse_throttle_reasons("0x0000000000000044").unwrap(),
            BTreeSet::from([
                ThrottleReason::SwPowerCap,
                ThrottleReason::HwThermalSlowdown
            ])
        );
        assert_eq!(
            parse_throttle_reasons("Active").unwrap(),
            BTreeSet::from([ThrottleReason::Unspecified])
        );
        assert!(parse_throttle_reasons("Not Active").unwrap().is_empty());
        assert!(parse_throttle_reasons("[N/A]").unwrap().is_empty());
        assert!(parse_throttle_reasons("bogus").is_err());
    }

    #[tokio::test]
    async fn absent_gpu_is_unavailable() {
        let probe = GpuProbe::new(GpuPresence::Absent, &ProbeConfig::default());
        assert!(matches!(
            probe.sample().await,
            Err(ProbeError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn broken_tool_reports_driver_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let version = dir.path().join("version");
        std::fs::write(
            &version,
            "NVRM version: NVIDIA UNIX x86_64 Kernel Module  535.104.05\nGCC version: gcc 12\n",
        )
        .unwrap();
        let cfg = ProbeConfig {
            gpu_tool: "legionmon-no-such-smi".to_string(),
            gpu_driver_version_file: version,
            ..ProbeConfig::default()
        };

        let state = GpuProbe::new(GpuPresence::DriverFile, &cfg)
            .sample()
            .await
            .unwrap();
        assert!(state.available);
        assert_eq!(state.status, GpuStatus::DetectedNoDriverBridge);
        assert_eq!(
            state.driver_version,
            "NVRM version: NVIDIA UNIX x86_64 Kernel Module  535.104.05"
        );
        assert_eq!(state.temperature, 0.0);
    }

    #[tokio::test]
    async fn healthy_tool_reports_working_with_reasons() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), LIST_OK, QUERY_OK, "echo 0x0000000000000004");

        let state = GpuProbe::new(GpuPresence::Tool, &tool_config(tool))
            .sample()
            .await
            .unwrap();
        assert_eq!(state.status, GpuStatus::Working);
        assert_eq!(state.power_draw, 42.0);
        assert_eq!(
            state.throttle_reasons,
            BTreeSet::from([ThrottleReason::SwPowerCap])
        );
    }

    #[tokio::test]
    async fn failed_throttle_query_keeps_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), LIST_OK, QUERY_OK, "exit 3");

        let state = GpuProbe::new(GpuPresence::Tool, &tool_config(tool))
            .sample()
            .await
            .unwrap();
        assert!(state.available);
        assert_eq!(state.status, GpuStatus::QueryFailed);
        assert_eq!(state.temperature, 61.0);
        assert_eq!(state.power_draw, 42.0);
        assert_eq!(state.driver_version, "535.104.05");
        assert!(state.throttle_reasons.is_empty());
    }

    #[tokio::test]
    async fn failed_metrics_query_is_query_failed_not_absent() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), LIST_OK, "exit 1", "echo 'Not Active'");

        let state = GpuProbe::new(GpuPresence::Tool, &tool_config(tool))
            .sample()
            .await
            .unwrap();
        assert!(state.available);
        assert_eq!(state.status, GpuStatus::QueryFailed);
        assert_eq!(state.power_draw, 0.0);
    }

    #[tokio::test]
    async fn hung_throttle_query_is_cut_inside_the_deadline() {
        let dir = tempfile::tempdir().unwrap();
        let tool = write_fake_tool(dir.path(), LIST_OK, QUERY_OK, "exec sleep 30");
        let cfg = ProbeConfig {
            command_timeout_ms: 5_000,
            query_timeout_ms: 5_000,
            probe_deadline_ms: 1_500,
            ..tool_config(tool)
        };

        let started = std::time::Instant::now();
        let state = GpuProbe::new(GpuPresence::Tool, &cfg).sample().await.unwrap();

        assert!(started.elapsed() < Duration::from_millis(1_500));
        assert_eq!(state.status, GpuStatus::QueryFailed);
        assert_eq!(state.power_draw, 42.0);
    }
}
