//! Diagnostics facade composing the three persistent artifacts.

use crate::analysis::{analyze, FailureAnalysis};
use crate::resolutions::{classify_issue, Disposition, Resolution, ResolutionsLog};
use crate::todo::{TodoFile, TodoInventory, TriageAction, TriageOutcome};
use crate::trouble_log::{LogLevel, TroubleLog};
use chrono::{Local, Utc};
use ql_common::Result;
use serde_json::Value;
use std::path::Path;
use tracing::info;

/// The diagnostics engine: troubleshooting log, resolutions log, TODO.md.
///
/// All three live in the supervisor's working directory.
pub struct DiagnosticsEngine {
    trouble: TroubleLog,
    resolutions: ResolutionsLog,
    todo: TodoFile,
}

impl DiagnosticsEngine {
    pub fn new(dir: &Path) -> Self {
        Self {
            trouble: TroubleLog::new(dir.join("troubleshooting.log")),
            resolutions: ResolutionsLog::new(dir.join("resolutions.log")),
            todo: TodoFile::new(dir.join("TODO.md")),
        }
    }

    /// Write one structured event to the troubleshooting log.
    ///
    /// Exit events must include `exitCode` and `normalTermination` in
    /// `details`; analysis relies on the latter to discount clean exits.
    pub fn log_event(&self, level: LogLevel, app: &str, message: &str, details: Option<&Value>) {
        if let Err(e) = self.trouble.append(level, app, message, details) {
            tracing::warn!("Failed to append troubleshooting log: {}", e);
        }
    }

    /// Analyze the failure history of `app` with resolution discounting.
    pub fn analyze_app(&self, app: &str) -> Result<FailureAnalysis> {
        let entries = self.trouble.read_entries()?;
        let resolved = self.resolutions.latest_resolved()?;
        Ok(analyze(&entries, &resolved, app, Utc::now()))
    }

    /// Synthesize today's TODO entry for a critical analysis, at most once
    /// per app per day. Returns whether an entry was written.
    pub fn maybe_auto_todo(&self, app: &str, analysis: &FailureAnalysis) -> Result<bool> {
        let Some(rec) = &analysis.recommendation else {
            return Ok(false);
        };
        if !rec.should_auto_todo {
            return Ok(false);
        }

        let today = Local::now().format("%Y-%m-%d").to_string();
        let inserted = self.todo.insert_auto_todo(
            app,
            &today,
            rec.error_type.as_str(),
            analysis.recent_failures,
        )?;
        if inserted {
            info!("Auto-detected issue recorded in TODO.md for {}", app);
        }
        Ok(inserted)
    }

    pub fn todos(&self) -> Result<TodoInventory> {
        self.todo.inventory()
    }

    /// Apply triage actions; `dontdo` items get a cancelled resolution.
    pub fn triage(&self, actions: &[TriageAction]) -> Result<TriageOutcome> {
        let outcome = self.todo.apply_triage(actions)?;
        for cancelled in &outcome.cancelled {
            let error_type = if cancelled.was_auto_detected {
                "AUTO_DETECTED_RESOLVED"
            } else {
                "TODO_TRIAGED"
            };
            self.resolutions.append(&Resolution {
                date: Utc::now(),
                app: String::new(),
                issue: cancelled.text.clone(),
                error_type: error_type.to_string(),
                disposition: Disposition::Cancelled,
                explanation: "Dismissed during TODO triage".to_string(),
                notes: String::new(),
            })?;
        }
        Ok(outcome)
    }

    pub fn read_resolutions(&self) -> Result<Vec<Resolution>> {
        self.resolutions.read_all()
    }

    /// Record a resolution and delete the first matching TODO item.
    ///
    /// A missing or `UNKNOWN` error type is auto-classified from the
    /// issue text. Returns the recorded resolution and the removed TODO
    /// line, if one matched.
    pub fn record_resolution(
        &self,
        app: &str,
        issue: &str,
        error_type: Option<&str>,
        disposition: Disposition,
        explanation: &str,
        notes: &str,
    ) -> Result<(Resolution, Option<String>)> {
        let error_type = match error_type {
            Some(et) if !et.is_empty() && et != "UNKNOWN" => et.to_string(),
            _ => classify_issue(issue).to_string(),
        };

        let resolution = Resolution {
            date: Utc::now(),
            app: app.to_string(),
            issue: issue.to_string(),
            error_type,
            disposition,
            explanation: explanation.to_string(),
            notes: notes.to_string(),
        };
        self.resolutions.append(&resolution)?;

        let removed = self.todo.remove_first_matching(issue)?;
        Ok((resolution, removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn engine() -> (tempfile::TempDir, DiagnosticsEngine) {
        let dir = tempfile::tempdir().unwrap();
        let engine = DiagnosticsEngine::new(dir.path());
        (dir, engine)
    }

    #[test]
    fn test_analysis_counts_logged_failures() {
        let (_dir, engine) = engine();
        for _ in 0..6 {
            engine.log_event(
                LogLevel::Error,
                "billing",
                "Port 5173 in use",
                Some(&json!({"port": 5173})),
            );
        }

        let analysis = engine.analyze_app("billing").unwrap();
        assert_eq!(analysis.recent_failures, 6);
        let rec = analysis.recommendation.unwrap();
        assert!(rec.should_auto_todo);
    }

    #[test]
    fn test_resolution_then_clean_analysis() {
        let (_dir, engine) = engine();
        for _ in 0..6 {
            engine.log_event(LogLevel::Error, "billing", "Port 5173 in use", None);
        }
        engine
            .record_resolution(
                "billing",
                "port conflict on 5173",
                Some("PORT_IN_USE"),
                Disposition::Resolved,
                "stopped stale process",
                "",
            )
            .unwrap();

        let analysis = engine.analyze_app("billing").unwrap();
        assert_eq!(analysis.recent_failures, 0);
        assert!(analysis.recommendation.is_none());
    }

    #[test]
    fn test_auto_todo_once_per_day() {
        let (dir, engine) = engine();
        for _ in 0..6 {
            engine.log_event(LogLevel::Error, "billing", "Port 5173 in use", None);
        }
        let analysis = engine.analyze_app("billing").unwrap();

        assert!(engine.maybe_auto_todo("billing", &analysis).unwrap());
        assert!(!engine.maybe_auto_todo("billing", &analysis).unwrap());

        let content = std::fs::read_to_string(dir.path().join("TODO.md")).unwrap();
        assert_eq!(content.matches("billing").count() >= 1, true);
    }

    #[test]
    fn test_record_resolution_autoclassifies_and_prunes_todo() {
        let (dir, engine) = engine();
        std::fs::write(
            dir.path().join("TODO.md"),
            "## High Priority\n- [ ] Fix port conflict on billing\n",
        )
        .unwrap();

        let (resolution, removed) = engine
            .record_resolution(
                "billing",
                "port conflict",
                None,
                Disposition::Resolved,
                "",
                "",
            )
            .unwrap();
        assert_eq!(resolution.error_type, "PORT_IN_USE");
        assert_eq!(removed.as_deref(), Some("Fix port conflict on billing"));
    }
}
