use chrono::{DateTime, Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

/// Hard cap on stored alerts.
pub const LEDGER_CAPACITY: usize = 100;
/// How many of the newest alerts survive a trim.
pub const LEDGER_RETAIN: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Component {
    Cpu,
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Alert {
    pub timestamp: DateTime<Local>,
    pub severity: Severity,
    pub component: Component,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
}

impl Alert {
    pub fn critical(component: Component, message: String, value: f64, threshold: f64) -> Self {
        Self {
            timestamp: Local::now(),
            severity: Severity::Critical,
            component,
            message,
            value,
            threshold,
        }
    }
}

/// Bounded alert log shared by the polling loop (append) and the input task (reset).
#[derive(Debug, Clone, Default)]
pub struct AlertLedger {
    inner: Arc<Mutex<Vec<Alert>>>,
}

impl AlertLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an alert. A full ledger is first cut down to the newest
    /// `LEDGER_RETAIN` entries in one batch.
    pub fn record(&self, alert: Alert) {
        let mut alerts = self.lock();
        if alerts.len() >= LEDGER_CAPACITY {
            let excess = alerts.len() - LEDGER_RETAIN;
            alerts.drain(..excess);
        }
        alerts.push(alert);
    }

    pub fn count_today(&self) -> usize {
        self.count_on(Local::now().date_naive())
    }

    pub fn count_on(&self, day: NaiveDate) -> usize {
        self.lock()
            .iter()
            .filter(|a| a.timestamp.date_naive() == day)
            .count()
    }

    /// Clears the ledger and returns how many alerts it held.
    pub fn reset(&self) -> usize {
        std::mem::take(&mut *self.lock()).len()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    #[cfg(test)]
    pub fn alerts(&self) -> Vec<Alert> {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Alert>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
