use crate::config::ExportFormat;
use crate::state::Snapshot;
use chrono::{DateTime, Local, SecondsFormat};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("не удалось открыть файл экспорта {path}: {source}")]
    Open {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось записать в файл экспорта {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось сериализовать снимок: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Append-only log of snapshots in one format. One file per run.
#[derive(Debug, Clone)]
pub struct Exporter {
    path: PathBuf,
    format: ExportFormat,
}

impl Exporter {
    pub fn new(dir: &Path, format: ExportFormat, started: DateTime<Local>) -> Self {
        let name = format!(
            "legion_{}.{}",
            started.format("%Y%m%d_%H%M%S"),
            format.extension()
        );
        Self {
            path: dir.join(name),
            format,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes the whole record with a single `write_all`; existing content is
    /// never rewritten.
    pub async fn append(&self, snapshot: &Snapshot) -> Result<(), ExportError> {
        let record = render(self.format, snapshot)?;
        let path = self.path.display().to_string();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|source| ExportError::Open {
                path: path.clone(),
                source,
            })?;
        file.write_all(record.as_bytes())
            .await
            .map_err(|source| ExportError::Write {
                path: path.clone(),
                source,
            })?;
        file.flush()
            .await
            .map_err(|source| ExportError::Write { path, source })
    }
}

pub fn render(format: ExportFormat, snapshot: &Snapshot) -> Result<String, ExportError> {
    match format {
        ExportFormat::Json => render_json(snapshot),
        ExportFormat::Csv => Ok(render_csv(snapshot)),
        ExportFormat::Txt => Ok(render_txt(snapshot)),
    }
}

fn render_json(snapshot: &Snapshot) -> Result<String, ExportError> {
    let mut out = serde_json::to_string_pretty(snapshot)?;
    out.push('\n');
    Ok(out)
}

fn timestamp(snapshot: &Snapshot) -> String {
    snapshot.timestamp.to_rfc3339_opts(SecondsFormat::Secs, false)
}

/// `timestamp,cpu%,mem%,gpu_temp,gpu_power,temps...,warning_count`, no header.
fn render_csv(snapshot: &Snapshot) -> String {
    let mut line = format!(
        "{},{:.1},{:.1}",
        timestamp(snapshot),
        snapshot.system.cpu_usage,
        snapshot.system.memory.percent
    );
    if snapshot.gpu.available {
        let _ = write!(
            line,
            ",{:.1},{:.1}",
            snapshot.gpu.temperature, snapshot.gpu.power_draw
        );
    } else {
        line.push_str(",0,0");
    }
    for reading in &snapshot.temperatures {
        let _ = write!(line, ",{:.1}", reading.celsius);
    }
    let _ = writeln!(line, ",{}", snapshot.warnings.len());
    line
}

fn render_txt(snapshot: &Snapshot) -> String {
    let mut out = format!("[{}] ", timestamp(snapshot));
    for reading in &snapshot.temperatures {
        let _ = write!(out, "{}: {:.1}°C | ", reading.name, reading.celsius);
    }
    if snapshot.gpu.available {
        let _ = write!(
            out,
            "GPU: {:.1}°C/{:.1}W | ",
            snapshot.gpu.temperature, snapshot.gpu.power_draw
        );
    }
    let _ = writeln!(
        out,
        "CPU: {:.1}% | RAM: {:.1}%",
        snapshot.system.cpu_usage, snapshot.system.memory.percent
    );
    for warning in &snapshot.warnings {
        let _ = writeln!(out, "  WARNING: {}", warning.message);
    }
    out.push('\n');
    out
}
