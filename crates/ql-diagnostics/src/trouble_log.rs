//! Append-only troubleshooting log.
//!
//! One line per event: `[ISO] [LEVEL] [App] message {JSON details}`.
//! Exit events must carry both `exitCode` and `normalTermination` in the
//! details so later analyses can discount clean exits. The file grows
//! without bound; rotation is the operator's concern.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ql_common::Result;
use regex::Regex;
use serde_json::Value;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing::warn;

/// Severity of a troubleshooting event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl LogLevel {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(LogLevel::Info),
            "WARN" => Some(LogLevel::Warn),
            "ERROR" => Some(LogLevel::Error),
            _ => None,
        }
    }
}

/// One parsed line of the troubleshooting log.
#[derive(Debug, Clone)]
pub struct TroubleEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub app: String,
    pub message: String,
    pub details: Option<Value>,
}

impl TroubleEntry {
    /// Whether the details mark this event as a normal termination.
    pub fn is_normal_termination(&self) -> bool {
        self.details
            .as_ref()
            .and_then(|d| d.get("normalTermination"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

/// The persistent troubleshooting log.
pub struct TroubleLog {
    path: PathBuf,
    // Serializes appends so concurrent handlers never interleave lines.
    write_lock: Mutex<()>,
}

fn line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[([^\]]+)\] \[(INFO|WARN|ERROR)\] \[([^\]]+)\] (.*)$").unwrap()
    })
}

impl TroubleLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Append one event line.
    pub fn append(&self, level: LogLevel, app: &str, message: &str, details: Option<&Value>) -> Result<()> {
        let line = match details {
            Some(details) => format!(
                "[{}] [{}] [{}] {} {}\n",
                Utc::now().to_rfc3339(),
                level,
                app,
                message,
                serde_json::to_string(details)?
            ),
            None => format!("[{}] [{}] [{}] {}\n", Utc::now().to_rfc3339(), level, app, message),
        };

        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Read and parse every line. Unparseable lines are skipped (the file
    /// may contain hand edits or partial writes from a crash).
    pub fn read_entries(&self) -> Result<Vec<TroubleEntry>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in content.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match Self::parse_line(line) {
                Some(entry) => entries.push(entry),
                None => warn!("Skipping unparseable troubleshooting line: {}", line),
            }
        }
        Ok(entries)
    }

    fn parse_line(line: &str) -> Option<TroubleEntry> {
        let caps = line_re().captures(line)?;
        let timestamp = DateTime::parse_from_rfc3339(&caps[1]).ok()?.with_timezone(&Utc);
        let level = LogLevel::parse(&caps[2])?;
        let app = caps[3].to_string();
        let rest = caps[4].to_string();

        // Details are the trailing JSON object, if any. The message itself
        // may contain braces, so scan candidate start positions.
        let (message, details) = Self::split_details(&rest);
        Some(TroubleEntry {
            timestamp,
            level,
            app,
            message,
            details,
        })
    }

    fn split_details(rest: &str) -> (String, Option<Value>) {
        if rest.ends_with('}') {
            for (idx, _) in rest.char_indices().filter(|(_, c)| *c == '{') {
                if let Ok(value) = serde_json::from_str::<Value>(&rest[idx..]) {
                    return (rest[..idx].trim_end().to_string(), Some(value));
                }
            }
        }
        (rest.to_string(), None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log() -> (tempfile::TempDir, TroubleLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = TroubleLog::new(dir.path().join("troubleshooting.log"));
        (dir, log)
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let (_dir, log) = temp_log();
        log.append(
            LogLevel::Error,
            "my-app",
            "Port 5173 in use",
            Some(&json!({"port": 5173})),
        )
        .unwrap();
        log.append(LogLevel::Info, "my-app", "started", None).unwrap();

        let entries = log.read_entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].app, "my-app");
        assert_eq!(entries[0].message, "Port 5173 in use");
        assert_eq!(entries[0].details.as_ref().unwrap()["port"], 5173);
        assert!(entries[1].details.is_none());
    }

    #[test]
    fn test_normal_termination_flag() {
        let (_dir, log) = temp_log();
        log.append(
            LogLevel::Info,
            "app",
            "exited with code 3221225786",
            Some(&json!({"exitCode": 3221225786u32, "normalTermination": true})),
        )
        .unwrap();

        let entries = log.read_entries().unwrap();
        assert!(entries[0].is_normal_termination());
    }

    #[test]
    fn test_message_with_braces_before_details() {
        let (_dir, log) = temp_log();
        log.append(
            LogLevel::Warn,
            "app",
            "template {x} failed",
            Some(&json!({"a": 1})),
        )
        .unwrap();

        let entries = log.read_entries().unwrap();
        assert_eq!(entries[0].message, "template {x} failed");
        assert_eq!(entries[0].details.as_ref().unwrap()["a"], 1);
    }

    #[test]
    fn test_missing_file_reads_empty() {
        let (_dir, log) = temp_log();
        assert!(log.read_entries().unwrap().is_empty());
    }
}
