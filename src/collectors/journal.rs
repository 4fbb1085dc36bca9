use crate::collectors::{run_command, Probe, ProbeError};
use crate::config::ProbeConfig;
use crate::state::LogErrorEntry;
use async_trait::async_trait;
use chrono::{Local, SecondsFormat, TimeZone};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

pub struct JournalProbe {
    tool: String,
    lines: usize,
    timeout: Duration,
}

impl JournalProbe {
    pub fn new(cfg: &ProbeConfig) -> Self {
        Self {
            tool: cfg.journal_tool.clone(),
            lines: cfg.journal_lines,
            timeout: cfg.query_timeout(),
        }
    }
}

#[async_trait]
impl Probe for JournalProbe {
    type Output = Vec<LogErrorEntry>;

    fn name(&self) -> &'static str {
        "journal"
    }

    async fn sample(&self) -> Result<Vec<LogErrorEntry>, ProbeError> {
        let count = self.lines.to_string();
        let args = ["-p", "err", "-n", count.as_str(), "--no-pager", "--output=json"];
        let text = run_command(&self.tool, &args, self.timeout)
            .await?
            .into_stdout(&self.tool)?;
        Ok(parse_journal_output(&text, self.lines))
    }
}

pub fn parse_journal_output(text: &str, limit: usize) -> Vec<LogErrorEntry> {
    let mut entries: Vec<LogErrorEntry> = text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str::<Value>(line) {
            Ok(value) => entry_from_json(&value),
            Err(err) => {
                debug!(error = %err, "строка журнала пропущена");
                None
            }
        })
        .collect();
    entries.reverse();
    entries.truncate(limit);
    entries
}

fn entry_from_json(value: &Value) -> Option<LogErrorEntry> {
    let message = match value.get("MESSAGE")? {
        Value::String(s) => s.clone(),
        // Non-UTF-8 messages arrive as byte arrays.
        Value::Array(bytes) => {
            let raw: Vec<u8> = bytes
                .iter()
                .filter_map(|b| b.as_u64().and_then(|b| u8::try_from(b).ok()))
                .collect();
            String::from_utf8_lossy(&raw).into_owned()
        }
        _ => return None,
    };
    if message.trim().is_empty() {
        return None;
    }

    let timestamp = value
        .get("__REALTIME_TIMESTAMP")
        .and_then(Value::as_str)
        .map(format_realtime)
        .unwrap_or_default();
    let unit = value
        .get("_SYSTEMD_UNIT")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string();
    let priority = value
        .get("PRIORITY")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    Some(LogErrorEntry {
        timestamp,
        message,
        unit,
        priority,
    })
}

/// Microseconds since the epoch to local RFC 3339; unparseable input is kept raw.
fn format_realtime(raw: &str) -> String {
    raw.parse::<i64>()
        .ok()
        .and_then(|micros| Local.timestamp_micros(micros).single())
        .map(|ts| ts.to_rfc3339_opts(SecondsFormat::Secs, false))
        .unwrap_or_else(|| raw.to_string())
}
