//! Append-only resolutions log.
//!
//! Each record states that an issue class was fixed (`resolved`) or
//! dismissed (`cancelled`). Resolved records discount older failures in
//! pattern analysis. Records are `---`-separated `Key: value` blocks.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ql_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::io::Write;
use std::path::PathBuf;

/// Whether an issue was fixed or dismissed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Resolved,
    Cancelled,
}

impl fmt::Display for Disposition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Disposition::Resolved => write!(f, "resolved"),
            Disposition::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Disposition {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "resolved" => Some(Disposition::Resolved),
            "cancelled" => Some(Disposition::Cancelled),
            _ => None,
        }
    }
}

/// One resolution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resolution {
    pub date: DateTime<Utc>,
    pub app: String,
    pub issue: String,
    pub error_type: String,
    pub disposition: Disposition,
    #[serde(default)]
    pub explanation: String,
    #[serde(default)]
    pub notes: String,
}

/// Classify an issue description into an error type by keyword.
///
/// Used when a resolution arrives without an explicit type.
pub fn classify_issue(issue: &str) -> &'static str {
    let lower = issue.to_lowercase();
    if lower.contains("port") {
        "PORT_IN_USE"
    } else if lower.contains("not found") || lower.contains("not exist") || lower.contains("path") {
        "PATH_NOT_FOUND"
    } else if lower.contains("module") || lower.contains("depend") {
        "MISSING_MODULE"
    } else if lower.contains("crash") || lower.contains("exited") {
        "CRASH"
    } else {
        "UNKNOWN"
    }
}

/// The persistent resolutions log.
pub struct ResolutionsLog {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl ResolutionsLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Append one record.
    pub fn append(&self, resolution: &Resolution) -> Result<()> {
        let block = format!(
            "---\nDate: {}\nApp: {}\nIssue: {}\nErrorType: {}\nDisposition: {}\nExplanation: {}\nNotes: {}\n",
            resolution.date.to_rfc3339(),
            resolution.app,
            resolution.issue,
            resolution.error_type,
            resolution.disposition,
            resolution.explanation,
            resolution.notes,
        );

        let _guard = self.write_lock.lock();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(block.as_bytes())?;
        Ok(())
    }

    /// Read all records. Malformed blocks are skipped.
    pub fn read_all(&self) -> Result<Vec<Resolution>> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for block in content.split("---") {
            if block.trim().is_empty() {
                continue;
            }
            if let Some(resolution) = Self::parse_block(block) {
                records.push(resolution);
            }
        }
        Ok(records)
    }

    fn parse_block(block: &str) -> Option<Resolution> {
        let mut fields: HashMap<&str, String> = HashMap::new();
        for line in block.lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                match key {
                    "Date" | "App" | "Issue" | "ErrorType" | "Disposition" | "Explanation"
                    | "Notes" => {
                        fields.insert(
                            match key {
                                "Date" => "date",
                                "App" => "app",
                                "Issue" => "issue",
                                "ErrorType" => "error_type",
                                "Disposition" => "disposition",
                                "Explanation" => "explanation",
                                _ => "notes",
                            },
                            value.trim().to_string(),
                        );
                    }
                    _ => {}
                }
            }
        }

        let date = DateTime::parse_from_rfc3339(fields.get("date")?)
            .ok()?
            .with_timezone(&Utc);
        Some(Resolution {
            date,
            app: fields.get("app")?.clone(),
            issue: fields.get("issue").cloned().unwrap_or_default(),
            error_type: fields.get("error_type").cloned().unwrap_or_else(|| "UNKNOWN".into()),
            disposition: Disposition::parse(fields.get("disposition")?)?,
            explanation: fields.get("explanation").cloned().unwrap_or_default(),
            notes: fields.get("notes").cloned().unwrap_or_default(),
        })
    }

    /// Map of error type to latest `resolved` timestamp.
    pub fn latest_resolved(&self) -> Result<HashMap<String, DateTime<Utc>>> {
        let mut latest: HashMap<String, DateTime<Utc>> = HashMap::new();
        for record in self.read_all()? {
            if record.disposition != Disposition::Resolved {
                continue;
            }
            latest
                .entry(record.error_type)
                .and_modify(|existing| {
                    if record.date > *existing {
                        *existing = record.date;
                    }
                })
                .or_insert(record.date);
        }
        Ok(latest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn temp_log() -> (tempfile::TempDir, ResolutionsLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = ResolutionsLog::new(dir.path().join("resolutions.log"));
        (dir, log)
    }

    fn record(error_type: &str, disposition: Disposition, date: DateTime<Utc>) -> Resolution {
        Resolution {
            date,
            app: "my-app".into(),
            issue: "port conflict".into(),
            error_type: error_type.into(),
            disposition,
            explanation: "freed the port".into(),
            notes: String::new(),
        }
    }

    #[test]
    fn test_append_and_read_roundtrip() {
        let (_dir, log) = temp_log();
        let now = Utc::now();
        log.append(&record("PORT_IN_USE", Disposition::Resolved, now)).unwrap();
        log.append(&record("CRASH", Disposition::Cancelled, now)).unwrap();

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].error_type, "PORT_IN_USE");
        assert_eq!(all[1].disposition, Disposition::Cancelled);
    }

    #[test]
    fn test_latest_resolved_keeps_newest_and_skips_cancelled() {
        let (_dir, log) = temp_log();
        let old = Utc::now() - Duration::days(3);
        let new = Utc::now();
        log.append(&record("PORT_IN_USE", Disposition::Resolved, old)).unwrap();
        log.append(&record("PORT_IN_USE", Disposition::Resolved, new)).unwrap();
        log.append(&record("CRASH", Disposition::Cancelled, new)).unwrap();

        let latest = log.latest_resolved().unwrap();
        assert_eq!(latest.len(), 1);
        let got = latest.get("PORT_IN_USE").unwrap();
        assert!((*got - new).num_seconds().abs() < 2);
    }

    #[test]
    fn test_classify_issue_keywords() {
        assert_eq!(classify_issue("Port 5173 already taken"), "PORT_IN_USE");
        assert_eq!(classify_issue("directory does not exist"), "PATH_NOT_FOUND");
        assert_eq!(classify_issue("Cannot find module 'vite'"), "MISSING_MODULE");
        assert_eq!(classify_issue("app crashed again"), "CRASH");
        assert_eq!(classify_issue("something odd"), "UNKNOWN");
    }
}
