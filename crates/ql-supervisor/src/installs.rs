//! Dependency preflight heuristics and install jobs.
//!
//! The node_modules preflight only applies when the command heuristically
//! runs through a node package manager; the predicate is deliberately
//! pluggable rather than a single string comparison. Install jobs are
//! fire-and-forget: not cancellable, bounded logs, and they self-expire
//! 30 seconds after exit.

use crate::table::LogLine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use ql_common::{Error, Result};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

const INSTALL_LOG_CAP: usize = 100;
const EXPIRE_AFTER: std::time::Duration = std::time::Duration::from_secs(30);

/// Whether the command's launcher implies a node_modules directory.
///
/// Matches package-manager launchers and `node` running a local script.
/// Windows shims (`npm.cmd`) are matched by stem.
pub fn needs_node_modules(argv: &[String]) -> bool {
    let Some(first) = argv.first() else {
        return false;
    };
    let stem = Path::new(first)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(first)
        .to_lowercase();
    matches!(stem.as_str(), "npm" | "npx" | "yarn" | "pnpm" | "node")
}

pub fn has_manifest(dir: &Path) -> bool {
    dir.join("package.json").is_file()
}

pub fn has_node_modules(dir: &Path) -> bool {
    dir.join("node_modules").is_dir()
}

/// Infer the package manager from lockfile presence.
pub fn detect_package_manager(dir: &Path) -> &'static str {
    if dir.join("yarn.lock").is_file() {
        "yarn"
    } else {
        "npm"
    }
}

/// Install job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallStatus {
    Running,
    Completed,
    Failed,
}

/// One tracked dependency install.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallJob {
    pub app_id: String,
    pub package_manager: String,
    pub status: InstallStatus,
    pub logs: VecDeque<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub started: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished: Option<DateTime<Utc>>,
}

/// Guarded registry of ongoing installs, one per app.
#[derive(Clone, Default)]
pub struct InstallRegistry {
    jobs: Arc<Mutex<HashMap<String, InstallJob>>>,
}

impl InstallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, app_id: &str) -> Option<InstallJob> {
        self.jobs.lock().get(app_id).cloned()
    }

    /// Spawn `<pm> install` in `dir` and track it under `app_id`.
    ///
    /// Returns the detected package manager immediately; progress is
    /// queried via [`InstallRegistry::get`].
    pub fn start(&self, app_id: &str, dir: &Path) -> Result<&'static str> {
        {
            let jobs = self.jobs.lock();
            if jobs
                .get(app_id)
                .map(|j| j.status == InstallStatus::Running)
                .unwrap_or(false)
            {
                return Err(Error::internal(format!(
                    "install already running for {}",
                    app_id
                )));
            }
        }

        let pm = detect_package_manager(dir);
        let argv = vec![pm.to_string(), "install".to_string()];
        let mut child = ql_process::spawn_app_command(app_id, &argv, dir)?;

        self.jobs.lock().insert(
            app_id.to_string(),
            InstallJob {
                app_id: app_id.to_string(),
                package_manager: pm.to_string(),
                status: InstallStatus::Running,
                logs: VecDeque::new(),
                exit_code: None,
                started: Utc::now(),
                finished: None,
            },
        );

        info!("Install started for {} via {}", app_id, pm);

        for stream in [
            child.stdout.take().map(tokio_util::either::Either::Left),
            child.stderr.take().map(tokio_util::either::Either::Right),
        ]
        .into_iter()
        .flatten()
        {
            let jobs = Arc::clone(&self.jobs);
            let id = app_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stream).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let mut jobs = jobs.lock();
                    if let Some(job) = jobs.get_mut(&id) {
                        if job.logs.len() >= INSTALL_LOG_CAP {
                            job.logs.pop_front();
                        }
                        job.logs.push_back(LogLine {
                            timestamp: Utc::now(),
                            line,
                        });
                    }
                }
            });
        }

        let jobs = Arc::clone(&self.jobs);
        let id = app_id.to_string();
        tokio::spawn(async move {
            let exit = child.wait().await;
            let code = exit.as_ref().ok().and_then(|s| s.code());
            let ok = exit.map(|s| s.success()).unwrap_or(false);

            {
                let mut jobs = jobs.lock();
                if let Some(job) = jobs.get_mut(&id) {
                    job.status = if ok {
                        InstallStatus::Completed
                    } else {
                        InstallStatus::Failed
                    };
                    job.exit_code = code;
                    job.finished = Some(Utc::now());
                }
            }
            if ok {
                info!("Install completed for {}", id);
            } else {
                warn!("Install failed for {} (exit code {:?})", id, code);
            }

            // Finished jobs linger briefly for status queries, then expire.
            tokio::time::sleep(EXPIRE_AFTER).await;
            jobs.lock().remove(&id);
        });

        Ok(pm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn argv(cmd: &str) -> Vec<String> {
        cmd.split_whitespace().map(str::to_string).collect()
    }

    #[test]
    fn test_needs_node_modules_heuristic() {
        assert!(needs_node_modules(&argv("npm run dev")));
        assert!(needs_node_modules(&argv("yarn start")));
        assert!(needs_node_modules(&argv("pnpm dev")));
        assert!(needs_node_modules(&argv("npx vite")));
        assert!(needs_node_modules(&argv("node server.js")));
        assert!(needs_node_modules(&argv("npm.cmd run dev")));
        assert!(!needs_node_modules(&argv("cargo run")));
        assert!(!needs_node_modules(&argv("python -m http.server")));
        assert!(!needs_node_modules(&[]));
    }

    #[test]
    fn test_detect_package_manager_from_lockfile() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_package_manager(dir.path()), "npm");

        std::fs::write(dir.path().join("yarn.lock"), "").unwrap();
        assert_eq!(detect_package_manager(dir.path()), "yarn");
    }

    #[test]
    fn test_manifest_and_node_modules_checks() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!has_manifest(dir.path()));
        assert!(!has_node_modules(dir.path()));

        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::create_dir(dir.path().join("node_modules")).unwrap();
        assert!(has_manifest(dir.path()));
        assert!(has_node_modules(dir.path()));
    }
}
