//! Per-app startup history (memory-only).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};

/// Bounded attempts kept per app.
const HISTORY_CAP: usize = 10;

/// How an individual start attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Success,
    Partial,
    Failed,
    NeedsInstall,
}

/// One recorded start attempt.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupAttempt {
    pub timestamp: DateTime<Utc>,
    pub steps: Vec<String>,
    pub result: AttemptResult,
}

/// Guarded per-app startup history.
#[derive(Default)]
pub struct StartupHistory {
    attempts: Mutex<HashMap<String, VecDeque<StartupAttempt>>>,
    last_errors: Mutex<HashMap<String, String>>,
}

impl StartupHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, app_id: &str, steps: Vec<String>, result: AttemptResult) {
        let mut attempts = self.attempts.lock();
        let list = attempts.entry(app_id.to_string()).or_default();
        if list.len() >= HISTORY_CAP {
            list.pop_front();
        }
        list.push_back(StartupAttempt {
            timestamp: Utc::now(),
            steps,
            result,
        });
    }

    pub fn set_last_error(&self, app_id: &str, error: String) {
        self.last_errors.lock().insert(app_id.to_string(), error);
    }

    pub fn for_app(&self, app_id: &str) -> (Vec<StartupAttempt>, Option<String>) {
        let attempts = self
            .attempts
            .lock()
            .get(app_id)
            .map(|list| list.iter().cloned().collect())
            .unwrap_or_default();
        let last_error = self.last_errors.lock().get(app_id).cloned();
        (attempts, last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_is_bounded() {
        let history = StartupHistory::new();
        for i in 0..15 {
            history.record("app", vec![format!("attempt {}", i)], AttemptResult::Failed);
        }

        let (attempts, _) = history.for_app("app");
        assert_eq!(attempts.len(), HISTORY_CAP);
        assert_eq!(attempts.last().unwrap().steps[0], "attempt 14");
    }

    #[test]
    fn test_last_error_tracked_separately() {
        let history = StartupHistory::new();
        history.record("app", vec!["spawn".into()], AttemptResult::Success);
        history.set_last_error("app", "port busy".into());

        let (_, last_error) = history.for_app("app");
        assert_eq!(last_error.as_deref(), Some("port busy"));
        assert!(history.for_app("other").1.is_none());
    }
}
