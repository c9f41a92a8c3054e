//! Canonical in-memory table of managed child processes.
//!
//! Keyed by the composite process key (`appId` or `appId:sync`), so a
//! long-running server and its periodic task never collide. Every
//! mutation goes through the guarded helpers; terminal entries never
//! transition back to a live state.

use crate::config::AppConfig;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ql_common::FailureKind;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Bounded size of the per-process log ring.
const LOG_RING_CAP: usize = 200;

const SYNC_SUFFIX: &str = ":sync";

/// Composite process key: `appId` or `appId:sync`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ProcessKey(String);

impl ProcessKey {
    pub fn app(id: &str) -> Self {
        Self(id.to_string())
    }

    pub fn sync(id: &str) -> Self {
        Self(format!("{}{}", id, SYNC_SUFFIX))
    }

    /// Parse a raw key string as sent by clients.
    pub fn parse(raw: &str) -> Self {
        Self(raw.to_string())
    }

    pub fn app_id(&self) -> &str {
        self.0.strip_suffix(SYNC_SUFFIX).unwrap_or(&self.0)
    }

    pub fn is_sync(&self) -> bool {
        self.0.ends_with(SYNC_SUFFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Status of a managed process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Starting,
    Running,
    Stopped,
    Failed,
    Restarting,
    Completed,
    External,
}

impl ProcessStatus {
    /// Terminal states never transition back to a live state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Stopped | ProcessStatus::Failed | ProcessStatus::Completed
        )
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self,
            ProcessStatus::Starting | ProcessStatus::Running | ProcessStatus::Restarting
        )
    }
}

impl fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProcessStatus::Starting => "starting",
            ProcessStatus::Running => "running",
            ProcessStatus::Stopped => "stopped",
            ProcessStatus::Failed => "failed",
            ProcessStatus::Restarting => "restarting",
            ProcessStatus::Completed => "completed",
            ProcessStatus::External => "external",
        };
        write!(f, "{}", s)
    }
}

/// One captured stdout/stderr line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub line: String,
}

/// Structured startup error classified from stream output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartupError {
    pub kind: FailureKind,
    pub message: String,
}

/// One managed child process.
#[derive(Debug, Clone)]
pub struct ProcessEntry {
    pub key: ProcessKey,
    pub pid: Option<u32>,
    /// Declared port; 0 for sync-only processes.
    pub port: u16,
    pub name: String,
    pub logs: VecDeque<LogLine>,
    pub start_time: DateTime<Utc>,
    pub status: ProcessStatus,
    pub exit_code: Option<i32>,
    pub error: Option<StartupError>,
    /// The config used at spawn; restarts read this snapshot, never a
    /// possibly-mutated live config.
    pub config: AppConfig,
    pub is_scheduled: bool,
    pub is_manual: bool,
    pub is_sync: bool,
    /// Cancelled on stop; aborts pending health polling.
    pub cancel: CancellationToken,
}

impl ProcessEntry {
    pub fn new(key: ProcessKey, config: AppConfig, port: u16) -> Self {
        let is_sync = key.is_sync();
        Self {
            name: config.name.clone(),
            key,
            pid: None,
            port,
            logs: VecDeque::with_capacity(64),
            start_time: Utc::now(),
            status: ProcessStatus::Starting,
            exit_code: None,
            error: None,
            config,
            is_scheduled: false,
            is_manual: true,
            is_sync,
            cancel: CancellationToken::new(),
        }
    }

    pub fn recent_logs(&self, n: usize) -> Vec<LogLine> {
        self.logs.iter().rev().take(n).rev().cloned().collect()
    }
}

/// Guarded map of managed processes.
#[derive(Clone, Default)]
pub struct ProcessTable {
    inner: Arc<Mutex<HashMap<String, ProcessEntry>>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh entry. A live entry under the same key is rejected;
    /// a terminal leftover is dropped and replaced.
    pub fn insert(&self, entry: ProcessEntry) -> Result<(), ProcessStatus> {
        let mut map = self.inner.lock();
        if let Some(existing) = map.get(entry.key.as_str()) {
            if existing.status.is_live() {
                return Err(existing.status);
            }
        }
        map.insert(entry.key.as_str().to_string(), entry);
        Ok(())
    }

    pub fn get(&self, key: &ProcessKey) -> Option<ProcessEntry> {
        self.inner.lock().get(key.as_str()).cloned()
    }

    pub fn remove(&self, key: &ProcessKey) -> Option<ProcessEntry> {
        self.inner.lock().remove(key.as_str())
    }

    pub fn contains_live(&self, key: &ProcessKey) -> bool {
        self.inner
            .lock()
            .get(key.as_str())
            .map(|e| e.status.is_live())
            .unwrap_or(false)
    }

    pub fn set_pid(&self, key: &ProcessKey, pid: u32) {
        if let Some(entry) = self.inner.lock().get_mut(key.as_str()) {
            entry.pid = Some(pid);
        }
    }

    /// Append to the bounded log ring.
    pub fn append_log(&self, key: &ProcessKey, line: String) {
        if let Some(entry) = self.inner.lock().get_mut(key.as_str()) {
            if entry.logs.len() >= LOG_RING_CAP {
                entry.logs.pop_front();
            }
            entry.logs.push_back(LogLine {
                timestamp: Utc::now(),
                line,
            });
        }
    }

    /// Record the first classified startup error; later ones are noise.
    pub fn record_startup_error(&self, key: &ProcessKey, error: StartupError) {
        if let Some(entry) = self.inner.lock().get_mut(key.as_str()) {
            if entry.error.is_none() {
                entry.error = Some(error);
            }
        }
    }

    /// Compare-and-set `Starting → Running`. Only the health probe calls
    /// this; any other current state (including terminal) is left alone.
    pub fn set_running(&self, key: &ProcessKey) -> bool {
        let mut map = self.inner.lock();
        match map.get_mut(key.as_str()) {
            Some(entry) if entry.status == ProcessStatus::Starting => {
                entry.status = ProcessStatus::Running;
                true
            }
            _ => false,
        }
    }

    /// Transition a live entry to `status`. Terminal entries are never
    /// upgraded or rewritten; returns the entry after the change.
    pub fn transition(&self, key: &ProcessKey, status: ProcessStatus) -> Option<ProcessEntry> {
        let mut map = self.inner.lock();
        let entry = map.get_mut(key.as_str())?;
        if entry.status.is_terminal() {
            return None;
        }
        entry.status = status;
        Some(entry.clone())
    }

    /// Terminal transition from the exit observer.
    pub fn mark_exited(
        &self,
        key: &ProcessKey,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Option<ProcessEntry> {
        let mut map = self.inner.lock();
        let entry = map.get_mut(key.as_str())?;
        if entry.status.is_terminal() {
            return None;
        }
        entry.status = status;
        entry.exit_code = exit_code;
        Some(entry.clone())
    }

    pub fn snapshot_all(&self) -> Vec<ProcessEntry> {
        self.inner.lock().values().cloned().collect()
    }
}
