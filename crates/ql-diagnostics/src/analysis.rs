//! Pattern analysis over the troubleshooting log.
//!
//! Failures are classified by message shape, discounted when a later
//! `resolved` resolution exists for the same error type, and summarized
//! into a tiered recommendation.

use crate::trouble_log::{LogLevel, TroubleEntry};
use chrono::{DateTime, Duration, Utc};
use ql_common::is_normal_exit;
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;

/// Error classes recognized in log messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    PortInUse,
    PathNotFound,
    MissingModule,
    Crash,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorType::PortInUse => "PORT_IN_USE",
            ErrorType::PathNotFound => "PATH_NOT_FOUND",
            ErrorType::MissingModule => "MISSING_MODULE",
            ErrorType::Crash => "CRASH",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn exit_code_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"exited with code (-?\d+)").unwrap())
}

/// Classify a log message into an error type.
pub fn classify_message(message: &str) -> Option<ErrorType> {
    if message.contains("Port") && message.contains("in use") {
        return Some(ErrorType::PortInUse);
    }
    if message.contains("not found") || message.contains("not exist") {
        return Some(ErrorType::PathNotFound);
    }
    if message.to_lowercase().contains("module") {
        return Some(ErrorType::MissingModule);
    }
    if let Some(caps) = exit_code_re().captures(message) {
        if let Ok(code) = caps[1].parse::<i64>() {
            if !is_normal_exit(code as i32) {
                return Some(ErrorType::Crash);
            }
        }
    }
    None
}

/// Recommendation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecLevel {
    Warning,
    Critical,
}

/// Advisory surfaced with start responses and the TODO engine.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub level: RecLevel,
    pub error_type: ErrorType,
    pub message: String,
    pub actions: Vec<String>,
    pub should_auto_todo: bool,
}

/// Result of analyzing one app's failure history.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureAnalysis {
    pub app: String,
    pub total_failures: u32,
    pub recent_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dominant_error_type: Option<ErrorType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<Recommendation>,
}

fn actions_for(error_type: ErrorType, level: RecLevel) -> Vec<String> {
    let (warning, critical) = match error_type {
        ErrorType::PortInUse => (
            "Check which process owns the port before starting",
            "Reserve a dedicated port for this app or stop the conflicting process for good",
        ),
        ErrorType::PathNotFound => (
            "Verify the app directory still exists at the configured path",
            "Fix the configured path; the directory has been missing repeatedly",
        ),
        ErrorType::MissingModule => (
            "Run a dependency install for this app",
            "Reinstall dependencies; node_modules keeps disappearing for this app",
        ),
        ErrorType::Crash => (
            "Inspect the app's recent logs for the crash cause",
            "The app crashes persistently; investigate before relying on auto-restart",
        ),
    };
    match level {
        RecLevel::Warning => vec![warning.to_string()],
        RecLevel::Critical => vec![warning.to_string(), critical.to_string()],
    }
}

/// Analyze the failure history for `app`.
///
/// A log entry at time `t` counts only when no `resolved` resolution for
/// its error type exists at or after `t` (the discount rule). Recent
/// failures are those within the last 7 days of `now`.
pub fn analyze(
    entries: &[TroubleEntry],
    resolved: &HashMap<String, DateTime<Utc>>,
    app: &str,
    now: DateTime<Utc>,
) -> FailureAnalysis {
    let week_ago = now - Duration::days(7);
    let mut total: HashMap<ErrorType, u32> = HashMap::new();
    let mut recent: HashMap<ErrorType, u32> = HashMap::new();
    let mut last_failure = None;

    for entry in entries {
        if entry.app != app || entry.level == LogLevel::Info {
            continue;
        }
        if entry.is_normal_termination() {
            continue;
        }
        let Some(error_type) = classify_message(&entry.message) else {
            continue;
        };
        if let Some(resolved_at) = resolved.get(error_type.as_str()) {
            if entry.timestamp <= *resolved_at {
                continue;
            }
        }

        *total.entry(error_type).or_insert(0) += 1;
        if entry.timestamp >= week_ago {
            *recent.entry(error_type).or_insert(0) += 1;
        }
        if last_failure.map_or(true, |prev| entry.timestamp > prev) {
            last_failure = Some(entry.timestamp);
        }
    }

    let total_failures: u32 = total.values().sum();
    let recent_failures: u32 = recent.values().sum();

    // Dominant type is decided by recent count, total as tiebreaker.
    let dominant = recent
        .iter()
        .map(|(ty, count)| (*ty, *count))
        .max_by_key(|&(ty, count)| (count, total.get(&ty).copied().unwrap_or(0)))
        .map(|(ty, _)| ty)
        .or_else(|| {
            total
                .iter()
                .map(|(ty, count)| (*ty, *count))
                .max_by_key(|&(_, count)| count)
                .map(|(ty, _)| ty)
        });

    let recommendation = dominant.and_then(|error_type| {
        let level = if recent_failures >= 6 {
            RecLevel::Critical
        } else if recent_failures >= 3 {
            RecLevel::Warning
        } else {
            return None;
        };
        Some(Recommendation {
            level,
            error_type,
            message: format!(
                "{} failed with {} {} time(s) in the last 7 days",
                app, error_type, recent_failures
            ),
            actions: actions_for(error_type, level),
            should_auto_todo: level == RecLevel::Critical,
        })
    });

    FailureAnalysis {
        app: app.to_string(),
        total_failures,
        recent_failures,
        dominant_error_type: dominant,
        last_failure,
        recommendation,
    }
}
