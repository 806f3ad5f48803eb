use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

use chrono::{DateTime, Local, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::OnceLock;
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::{CropcastResult, IoError};

// ================================================================================================
// Record Schema
// ================================================================================================

/// Standard actions for collector/checker audit entries.
///
/// The JSON-lines format is a compatibility contract: a separate log-reading
/// process consumes these files for alerting, and the verifier replays
/// `DATA_SAVE`/`DATA_UPDATE` entries. Field names must not change.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogAction {
    Startup,
    ApiCall,
    DataSave,
    DataUpdate,
    DataDelete,
    Validation,
    Error,
    Shutdown,
    VerificationStart,
    VerificationResult,
}

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    EnumString,
    Display,
    IntoStaticStr,
)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Critical,
}

/// One audit line. Serialized as a single JSON object per line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub collector: String,
    pub action: LogAction,
    pub details: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    pub run_id: String,
}

/// Generate a short unique run ID for a collector/checker execution.
pub fn generate_run_id() -> String {
    uuid::Uuid::new_v4().to_string()[..8].to_string()
}

// ================================================================================================
// Redaction
// ================================================================================================

fn secret_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r#"(?i)(api[_-]?key|password|secret|token)["']?\s*[=:]\s*["']?[^\s"',}]+"#)
                .expect("valid redaction pattern"),
            Regex::new(r"(?i)bearer\s+[A-Za-z0-9._\-]+").expect("valid redaction pattern"),
        ]
    })
}

/// Redact credential-shaped substrings before a string reaches the audit log.
pub fn sanitize(text: &str) -> String {
    let mut out = text.to_string();
    for re in secret_patterns() {
        out = re.replace_all(&out, "[REDACTED]").into_owned();
    }
    out
}

/// Recursively sanitize every string value inside a JSON payload.
pub fn sanitize_value(value: &mut Value) {
    match value {
        Value::String(s) => {
            let clean = sanitize(s);
            if &clean != s {
                *s = clean;
            }
        }
        Value::Array(items) => items.iter_mut().for_each(sanitize_value),
        Value::Object(map) => map.values_mut().for_each(sanitize_value),
        _ => {}
    }
}

// ================================================================================================
// Writer
// ================================================================================================

enum Sink {
    File(Mutex<BufWriter<File>>),
    Memory(Mutex<Vec<LogRecord>>),
}

/// Append-only JSON-lines audit log. Opened per run, single writer, one file
/// per collector/checker execution.
pub struct AuditLog {
    collector: String,
    run_id: String,
    sink: Sink,
    log_path: Option<PathBuf>,
}

impl AuditLog {
    /// Open `{log_dir}/{collector}_{YYYY-MM-DD}_{HH-MM-SS}.log` for appending.
    pub fn create(log_dir: &Path, collector: &str, run_id: &str) -> CropcastResult<Self> {
        std::fs::create_dir_all(log_dir).map_err(|e| {
            IoError::FileSystem(format!(
                "Failed to create log directory {}: {}",
                log_dir.display(),
                e
            ))
        })?;

        let stamp = Local::now().format("%Y-%m-%d_%H-%M-%S");
        let path = log_dir.join(format!("{collector}_{stamp}.log"));
        let file = File::create(&path).map_err(|e| IoError::WriterCreation(e.to_string()))?;

        Ok(Self {
            collector: collector.to_string(),
            run_id: run_id.to_string(),
            sink: Sink::File(Mutex::new(BufWriter::new(file))),
            log_path: Some(path),
        })
    }

    /// In-memory sink for tests and dry runs.
    pub fn in_memory(collector: &str, run_id: &str) -> Self {
        Self {
            collector: collector.to_string(),
            run_id: run_id.to_string(),
            sink: Sink::Memory(Mutex::new(Vec::new())),
            log_path: None,
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn log_path(&self) -> Option<&Path> {
        self.log_path.as_deref()
    }

    pub fn record(&self, level: LogLevel, action: LogAction, details: Value) {
        self.record_timed(level, action, details, None);
    }

    pub fn record_timed(
        &self,
        level: LogLevel,
        action: LogAction,
        mut details: Value,
        duration_seconds: Option<f64>,
    ) {
        sanitize_value(&mut details);

        let record = LogRecord {
            timestamp: Utc::now(),
            level,
            collector: self.collector.clone(),
            action,
            details,
            duration_seconds,
            run_id: self.run_id.clone(),
        };

        let description = record
            .details
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or("");
        match level {
            LogLevel::Info => tracing::info!(collector = %self.collector, action = %action, "{description}"),
            LogLevel::Warn => tracing::warn!(collector = %self.collector, action = %action, "{description}"),
            LogLevel::Error | LogLevel::Critical => {
                tracing::error!(collector = %self.collector, action = %action, "{description}")
            }
        }

        self.write(&record);
    }

    fn write(&self, record: &LogRecord) {
        match &self.sink {
            Sink::File(writer) => {
                // An audit write failure must not abort the run; the line is
                // lost but the collector keeps going.
                if let Ok(line) = serde_json::to_string(record) {
                    if let Ok(mut w) = writer.lock() {
                        let _ = writeln!(w, "{line}");
                        let _ = w.flush();
                    }
                }
            }
            Sink::Memory(records) => {
                if let Ok(mut r) = records.lock() {
                    r.push(record.clone());
                }
            }
        }
    }

    /// Records captured by an in-memory sink. Empty for file-backed logs.
    pub fn captured(&self) -> Vec<LogRecord> {
        match &self.sink {
            Sink::Memory(records) => records.lock().map(|r| r.clone()).unwrap_or_default(),
            Sink::File(_) => Vec::new(),
        }
    }
}

// ================================================================================================
// Reading (verifier side)
// ================================================================================================

/// Parse a JSON-lines audit log, skipping malformed lines.
pub fn read_log(path: &Path) -> CropcastResult<Vec<LogRecord>> {
    let text =
        std::fs::read_to_string(path).map_err(|e| IoError::ReaderCreation(e.to_string()))?;
    Ok(text
        .lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| serde_json::from_str(line).ok())
        .collect())
}

/// Find the most recent log file in `log_dir` whose name starts with `prefix`.
pub fn find_latest_log(log_dir: &Path, prefix: &str) -> Option<PathBuf> {
    let mut logs: Vec<(std::time::SystemTime, PathBuf)> = std::fs::read_dir(log_dir)
        .ok()?
        .flatten()
        .filter(|entry| {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            name.starts_with(&format!("{prefix}_")) && name.ends_with(".log")
        })
        .filter_map(|entry| {
            let mtime = entry.metadata().ok()?.modified().ok()?;
            Some((mtime, entry.path()))
        })
        .collect();
    logs.sort_by(|a, b| b.0.cmp(&a.0));
    logs.into_iter().next().map(|(_, p)| p)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn run_id_is_short_and_unique() {
        let a = generate_run_id();
        let b = generate_run_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn action_serializes_screaming_snake() {
        let s = serde_json::to_string(&LogAction::VerificationResult).unwrap();
        assert_eq!(s, "\"VERIFICATION_RESULT\"");
        let s = serde_json::to_string(&LogAction::ApiCall).unwrap();
        assert_eq!(s, "\"API_CALL\"");
    }

    #[test]
    fn sanitize_redacts_credentials() {
        let dirty = "calling with api_key=abc123 and Authorization: Bearer xyz.token";
        let clean = sanitize(dirty);
        assert!(!clean.contains("abc123"));
        assert!(!clean.contains("xyz.token"));
        assert!(clean.contains("[REDACTED]"));
    }

    #[test]
    fn memory_sink_captures_records_in_order() {
        let log = AuditLog::in_memory("unit_test", "run00001");
        log.record(LogLevel::Info, LogAction::Startup, json!({"description": "up"}));
        log.record(
            LogLevel::Info,
            LogAction::Shutdown,
            json!({"description": "down", "password=verysecret": 1}),
        );

        let records = log.captured();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, LogAction::Startup);
        assert_eq!(records[1].action, LogAction::Shutdown);
        assert!(records.iter().all(|r| r.run_id == "run00001"));
    }

    #[test]
    fn details_strings_are_sanitized_recursively() {
        let log = AuditLog::in_memory("unit_test", "run00002");
        log.record(
            LogLevel::Info,
            LogAction::ApiCall,
            json!({"nested": {"auth": "token: supersecret"}}),
        );
        let records = log.captured();
        let nested = records[0].details["nested"]["auth"].as_str().unwrap();
        assert!(!nested.contains("supersecret"));
    }
}
