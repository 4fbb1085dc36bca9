pub mod battery;
pub mod gpu;
pub mod journal;
pub mod registry;
pub mod system;
pub mod temperature;

use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Why a probe produced nothing this cycle. Never fatal for the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProbeError {
    #[error("источник недоступен: {0}")]
    Unavailable(String),
    #[error("{what}: превышен таймаут {after:?}")]
    Timeout { what: String, after: Duration },
    #[error("не удалось разобрать вывод: {0}")]
    ParseFailure(String),
    #[error("данные получены частично: {0}")]
    PartialData(String),
}

/// One external data source, normalized to `Output`.
#[async_trait]
pub trait Probe: Send + Sync {
    type Output: Send;

    fn name(&self) -> &'static str;

    async fn sample(&self) -> Result<Self::Output, ProbeError>;
}

pub type BoxedProbe<T> = Box<dyn Probe<Output = T>>;

/// Ordered probes for the same value; the first `Ok` wins.
pub struct FallbackChain<T> {
    name: &'static str,
    tiers: Vec<BoxedProbe<T>>,
}

impl<T: Send> FallbackChain<T> {
    pub fn new(name: &'static str, tiers: Vec<BoxedProbe<T>>) -> Self {
        Self { name, tiers }
    }
}

#[async_trait]
impl<T: Send + 'static> Probe for FallbackChain<T> {
    type Output = T;

    fn name(&self) -> &'static str {
        self.name
    }

    async fn sample(&self) -> Result<T, ProbeError> {
        let mut last_err = ProbeError::Unavailable(format!("{}: нет источников", self.name));
        for tier in &self.tiers {
            match tier.sample().await {
                Ok(value) => {
                    debug!(chain = self.name, tier = tier.name(), "источник ответил");
                    return Ok(value);
                }
                Err(err) => {
                    debug!(chain = self.name, tier = tier.name(), error = %err, "источник не ответил, пробуем следующий");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
}

impl CommandOutput {
    pub fn into_stdout(self, program: &str) -> Result<String, ProbeError> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(ProbeError::Unavailable(format!(
                "{program} завершился с ошибкой"
            )))
        }
    }
}

/// Runs an external tool with a hard deadline. The child is killed when the
/// deadline passes or when the returned future is dropped.
pub async fn run_command(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, ProbeError> {
    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| ProbeError::Unavailable(format!("{program}: {err}")))?;

    match time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        }),
        Ok(Err(err)) => Err(ProbeError::Unavailable(format!("{program}: {err}"))),
        Err(_elapsed) => Err(ProbeError::Timeout {
            what: program.to_string(),
            after: timeout,
        }),
    }
}

pub fn read_trimmed(path: &Path) -> Result<String, ProbeError> {
    fs::read_to_string(path)
        .map(|s| s.trim().to_string())
        .map_err(|err| match err.kind() {
            ErrorKind::NotFound => ProbeError::Unavailable(path.display().to_string()),
            _ => ProbeError::Unavailable(format!("{}: {err}", path.display())),
        })
}

/// hwmon temperature file (millidegrees) to °C.
pub fn read_millidegrees(path: &Path) -> Result<f64, ProbeError> {
    let raw = read_trimmed(path)?;
    raw.parse::<f64>()
        .map(|v| v / 1000.0)
        .map_err(|_| ProbeError::ParseFailure(format!("{}: '{raw}'", path.display())))
}

pub fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, '.' | '-' | '+' | 'e' | 'E'))
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.parse::<f64>().ok()
}
