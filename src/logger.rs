//! Structured per-run load log
//!
//! Entries are mirrored to `tracing` as they happen and buffered so the
//! whole run can be flushed to `meta/load_log.json` on exit — success or
//! failure. The buffer keeps the executed SQL alongside the step labels,
//! which is what you want when a delta run went sideways at 3am.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::destination::Destination;
use crate::error::{MirrorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    pub run_id: Uuid,
    pub level: LogLevel,
    pub table: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sub_load: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Buffered logger for one load run
#[derive(Debug)]
pub struct LoadLogger {
    run_id: Uuid,
    table: String,
    sink: Option<Arc<dyn Destination>>,
    entries: Mutex<Vec<LogEntry>>,
}

impl LoadLogger {
    pub fn new(table: impl Into<String>, sink: Option<Arc<dyn Destination>>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            table: table.into(),
            sink,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn push(&self, level: LogLevel, message: String, sub_load: Option<String>, sql: Option<String>) {
        let entry = LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            run_id: self.run_id,
            level,
            table: self.table.clone(),
            message,
            sub_load,
            sql,
        };
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        let message = message.into();
        info!(table = %self.table, run_id = %self.run_id, "{message}");
        self.push(LogLevel::Info, message, None, None);
    }

    pub fn info_sql(&self, message: impl Into<String>, sub_load: &str, sql: &str) {
        let message = message.into();
        info!(table = %self.table, run_id = %self.run_id, sub_load, sql, "{message}");
        self.push(
            LogLevel::Info,
            message,
            Some(sub_load.to_string()),
            Some(sql.to_string()),
        );
    }

    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        warn!(table = %self.table, run_id = %self.run_id, "{message}");
        self.push(LogLevel::Warn, message, None, None);
    }

    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!(table = %self.table, run_id = %self.run_id, "{message}");
        self.push(LogLevel::Error, message, None, None);
    }

    /// Upload the buffered entries to the sink, if one is configured
    pub fn flush(&self) -> Result<()> {
        let Some(sink) = &self.sink else {
            return Ok(());
        };
        let entries = self
            .entries
            .lock()
            .map_err(|_| MirrorError::Internal("load log mutex poisoned".into()))?;
        sink.upload_str(&serde_json::to_string_pretty(&*entries)?)?;
        Ok(())
    }
}
