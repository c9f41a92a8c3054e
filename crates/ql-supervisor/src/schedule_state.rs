//! Persisted per-app schedule state.
//!
//! Written after every scheduled or manual execution completes so missed
//! runs can be recovered across supervisor restarts.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ql_common::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

const STATE_FILE: &str = "schedule-state.json";

/// Outcome of the most recent scheduled execution of one app.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_exit_code: Option<i32>,
    #[serde(default)]
    pub was_manual: bool,
}

/// Store for the schedule-state document.
pub struct ScheduleStateStore {
    path: PathBuf,
    states: RwLock<HashMap<String, ScheduleState>>,
}

impl ScheduleStateStore {
    pub async fn open(dir: &Path) -> Result<Self> {
        let path = dir.join(STATE_FILE);
        let states = match tokio::fs::read_to_string(&path).await {
            Ok(content) => serde_json::from_str(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            states: RwLock::new(states),
        })
    }

    pub fn get(&self, app_id: &str) -> ScheduleState {
        self.states.read().get(app_id).cloned().unwrap_or_default()
    }

    /// Record the outcome of a run and persist the whole document.
    pub async fn record(&self, app_id: &str, state: ScheduleState) -> Result<()> {
        let snapshot = {
            let mut states = self.states.write();
            states.insert(app_id.to_string(), state);
            states.clone()
        };

        let json = serde_json::to_string_pretty(&snapshot)?;
        let temp = self.path.with_extension("json.tmp");
        tokio::fs::write(&temp, json).await?;
        tokio::fs::rename(&temp, &self.path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let now = Utc::now();
        {
            let store = ScheduleStateStore::open(dir.path()).await.unwrap();
            store
                .record(
                    "backup",
                    ScheduleState {
                        last_run: Some(now),
                        last_exit_code: Some(0),
                        was_manual: false,
                    },
                )
                .await
                .unwrap();
        }

        let store = ScheduleStateStore::open(dir.path()).await.unwrap();
        let state = store.get("backup");
        assert_eq!(state.last_exit_code, Some(0));
        assert!((state.last_run.unwrap() - now).num_seconds().abs() < 2);
        assert!(store.get("unknown").last_run.is_none());
    }
}
