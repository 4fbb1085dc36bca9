use crate::collectors::{read_trimmed, Probe, ProbeError};
use crate::state::BatteryState;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};

pub struct BatteryProbe {
    root: PathBuf,
}

impl BatteryProbe {
    pub fn new(power_supply_root: impl Into<PathBuf>) -> Self {
        Self {
            root: power_supply_root.into(),
        }
    }
}

#[async_trait]
impl Probe for BatteryProbe {
    type Output = BatteryState;

    fn name(&self) -> &'static str {
        "battery"
    }

    async fn sample(&self) -> Result<BatteryState, ProbeError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || read_battery(&root))
            .await
            .map_err(|err| ProbeError::Unavailable(format!("чтение power_supply прервано: {err}")))?
    }
}

/// First battery under `power_supply`, plus whether any mains adapter is online.
pub fn read_battery(root: &Path) -> Result<BatteryState, ProbeError> {
    let entries = fs::read_dir(root)
        .map_err(|err| ProbeError::Unavailable(format!("{}: {err}", root.display())))?;
    let mut supplies: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    supplies.sort();

    let battery = supplies
        .iter()
        .find(|dir| is_battery(dir))
        .ok_or_else(|| ProbeError::Unavailable("батарея не найдена".to_string()))?;

    let percent = read_trimmed(&battery.join("capacity"))
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .unwrap_or(0.0);
    let status = read_trimmed(&battery.join("status")).unwrap_or_default();
    let voltage = read_trimmed(&battery.join("voltage_now"))
        .ok()
        .and_then(|v| v.parse::<f64>().ok())
        .map(|microvolts| microvolts / 1_000_000.0)
        .unwrap_or(0.0);

    let mains: Vec<&PathBuf> = supplies
        .iter()
        .filter(|dir| supply_type(dir).as_deref() == Some("Mains"))
        .collect();
    let plugged = if mains.is_empty() {
        matches!(status.as_str(), "Charging" | "Full")
    } else {
        mains
            .iter()
            .any(|dir| read_trimmed(&dir.join("online")).is_ok_and(|v| v == "1"))
    };

    Ok(BatteryState {
        present: true,
        percent,
        charging: plugged,
        voltage,
        power_source: if plugged { "AC" } else { "Battery" }.to_string(),
    })
}

fn supply_type(dir: &Path) -> Option<String> {
    read_trimmed(&dir.join("type")).ok()
}

fn is_battery(dir: &Path) -> bool {
    supply_type(dir).as_deref() == Some("Battery")
        || dir
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("BAT"))
}
