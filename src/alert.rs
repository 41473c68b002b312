//! Operator alerts raised on task failure.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, warn};

use crate::pipeline::model::TaskId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Warning,
    Error,
}

impl fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => f.write_str("WARNING"),
            Self::Error => f.write_str("ERROR"),
        }
    }
}

/// One raised alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub source: String,
    pub task_id: Option<TaskId>,
    pub severity: AlertSeverity,
    pub message: String,
    pub raised_at: DateTime<Utc>,
}

/// Sink for operator alerts.
pub trait AlertService: Send + Sync {
    fn generate_alert(
        &self,
        source: &str,
        task_id: Option<TaskId>,
        severity: AlertSeverity,
        message: &str,
    );
}

/// Emits alerts as `tracing` events.
#[derive(Debug, Default)]
pub struct LoggingAlertService;

impl AlertService for LoggingAlertService {
    fn generate_alert(
        &self,
        source: &str,
        task_id: Option<TaskId>,
        severity: AlertSeverity,
        message: &str,
    ) {
        let task_id = task_id.map(|id| id.to_string()).unwrap_or_default();
        match severity {
            AlertSeverity::Error => error!(alert = true, source, task_id = %task_id, "{message}"),
            AlertSeverity::Warning => warn!(alert = true, source, task_id = %task_id, "{message}"),
        }
    }
}

/// Keeps alerts in memory; useful for tests and the status endpoint.
#[derive(Debug, Default)]
pub struct RecordingAlertService {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlertService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl AlertService for RecordingAlertService {
    fn generate_alert(
        &self,
        source: &str,
        task_id: Option<TaskId>,
        severity: AlertSeverity,
        message: &str,
    ) {
        LoggingAlertService.generate_alert(source, task_id, severity, message);
        self.alerts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Alert {
                source: source.to_string(),
                task_id,
                severity,
                message: message.to_string(),
                raised_at: Utc::now(),
            });
    }
}
