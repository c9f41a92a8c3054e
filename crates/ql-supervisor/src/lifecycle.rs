//! The start/stop lifecycle state machine.
//!
//! Start runs a preflight chain (duplicate key, failure-history advisory,
//! port, path, package manifest, dependency directory), spawns the child
//! with stream observers, and gates `Starting → Running` on the HTTP
//! health probe alone; stdout readiness markers are informational. The
//! exit observer classifies terminations (normal exit, startup crash
//! within 5 s, runtime crash) and drives the bounded auto-restart policy.
//! Stop removes the table entry before the kill so a late exit observer
//! finds nothing and is a no-op.

use crate::config::{AppConfig, ConfigStore};
use crate::history::{AttemptResult, StartupHistory};
use crate::installs::{self, InstallRegistry};
use crate::restart::RestartPolicy;
use crate::schedule_state::{ScheduleState, ScheduleStateStore};
use crate::table::{LogLine, ProcessEntry, ProcessKey, ProcessStatus, ProcessTable, StartupError};
use chrono::{DateTime, Utc};
use ql_common::{is_normal_exit, Error, FailureKind, SupportCode};
use ql_diagnostics::{DiagnosticsEngine, FailureAnalysis, LogLevel};
use ql_health::{HealthPollOptions, HealthPollOutcome};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

const POST_SPAWN_DELAY: Duration = Duration::from_millis(500);
const STARTUP_CRASH_WINDOW_MS: i64 = 5_000;
const RESTART_DELAY: Duration = Duration::from_secs(2);
const STABILITY_WINDOW: Duration = Duration::from_secs(60);
const EXTERNAL_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const ALTERNATIVE_PORT_BASE: u16 = 5174;
const STATUS_LOG_LINES: usize = 10;

/// Inputs accepted by `POST /api/start`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StartRequest {
    pub id: String,
    pub name: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub retry: bool,
    pub override_port: Option<u16>,
    pub health_check_url: Option<String>,
    pub startup_timeout: Option<u64>,
    pub auto_restart: Option<bool>,
    pub max_restart_attempts: Option<u32>,
}

/// Successful start envelope.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartSuccess {
    pub success: bool,
    pub id: String,
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub port: u16,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health: Option<HealthPollOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<FailureAnalysis>,
    pub elapsed_ms: u64,
}

/// Structured start failure surfaced to the client.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartFailure {
    pub error: String,
    pub kind: FailureKind,
    pub support_code: SupportCode,
    pub suggestion: String,
    pub troubleshooting: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub can_retry: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub can_use_alternative: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alternative_port: Option<u16>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub needs_install: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_manager: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_process: Option<BlockingProcess>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub recent_logs: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<FailureAnalysis>,
}

/// Identified owner of a conflicting port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockingProcess {
    pub pid: u32,
    pub name: String,
}

impl StartFailure {
    fn new(kind: FailureKind, error: String, suggestion: String, steps: Vec<String>) -> Self {
        Self {
            error,
            kind,
            support_code: support_code_for(kind),
            suggestion,
            troubleshooting: steps,
            can_retry: false,
            can_use_alternative: false,
            alternative_port: None,
            needs_install: false,
            package_manager: None,
            blocking_process: None,
            recent_logs: Vec::new(),
            analysis: None,
        }
    }

    /// HTTP status the RPC surface should answer with.
    pub fn http_status(&self) -> u16 {
        match self.kind {
            FailureKind::StartupCrash
            | FailureKind::RuntimeCrash
            | FailureKind::Exception
            | FailureKind::AutoRestartExhausted => 500,
            _ => 400,
        }
    }
}

/// Error side of a start: either a plain rejection or a full envelope.
#[derive(Debug)]
pub enum StartError {
    Rejected(Error),
    Failure(Box<StartFailure>),
}

impl From<Error> for StartError {
    fn from(e: Error) -> Self {
        StartError::Rejected(e)
    }
}

fn support_code_for(kind: FailureKind) -> SupportCode {
    match kind {
        FailureKind::PortInUse => SupportCode::PortInUse,
        FailureKind::PathNotFound => SupportCode::PathMissing,
        FailureKind::MissingManifest => SupportCode::ManifestMissing,
        FailureKind::MissingDependencies => SupportCode::DependenciesMissing,
        FailureKind::FileNotFound => SupportCode::FileMissing,
        FailureKind::HealthTimeout => SupportCode::Network,
        _ => SupportCode::Server,
    }
}

/// Exit classification per the termination rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExitClass {
    Normal,
    StartupCrash,
    RuntimeCrash,
}

pub(crate) fn classify_exit(code: i32, runtime_ms: i64) -> ExitClass {
    if is_normal_exit(code) {
        ExitClass::Normal
    } else if runtime_ms < STARTUP_CRASH_WINDOW_MS {
        ExitClass::StartupCrash
    } else {
        ExitClass::RuntimeCrash
    }
}

/// One app's row in the status map.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AppStatusInfo {
    pub running: bool,
    pub port: u16,
    pub name: String,
    pub pid: Option<u32>,
    pub status: ProcessStatus,
    pub recent_logs: Vec<LogLine>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub external: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
}

/// Acknowledgement of a scheduled/manual run kick-off.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleRunStarted {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// The supervisor: every component behind the RPC surface.
pub struct Supervisor {
    pub config: ConfigStore,
    pub table: ProcessTable,
    pub history: StartupHistory,
    pub restarts: RestartPolicy,
    pub installs: InstallRegistry,
    pub diagnostics: DiagnosticsEngine,
    pub schedule_state: ScheduleStateStore,
}

impl Supervisor {
    pub fn new(
        config: ConfigStore,
        schedule_state: ScheduleStateStore,
        diagnostics: DiagnosticsEngine,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: ProcessTable::new(),
            history: StartupHistory::new(),
            restarts: RestartPolicy::new(),
            installs: InstallRegistry::new(),
            diagnostics,
            schedule_state,
        })
    }

    /// Interactive start: the full preflight + spawn + health-poll chain.
    pub async fn start_app(self: &Arc<Self>, req: StartRequest) -> Result<StartSuccess, StartError> {
        let started_at = std::time::Instant::now();
        let key = ProcessKey::app(&req.id);
        let mut steps: Vec<String> = Vec::new();

        // Duplicate key: live entries reject, terminal leftovers are dropped.
        if let Some(existing) = self.table.get(&key) {
            if existing.status.is_live() {
                return Err(Error::already_running(&req.id).into());
            }
            self.table.remove(&key);
        }

        let app = self.resolve_app(&req)?;
        steps.push(format!("Resolved app '{}' on port {}", app.name, app.port));

        // Failure-history advisory; a critical level files today's TODO.
        let analysis = self.diagnostics.analyze_app(&app.name).ok();
        if let Some(analysis) = &analysis {
            if let Err(e) = self.diagnostics.maybe_auto_todo(&app.name, analysis) {
                warn!("Auto-TODO failed for {}: {}", app.name, e);
            }
        }

        if app.port > 0 {
            if let Some(failure) = self.preflight_port(&app, req.retry, &mut steps, &analysis).await {
                self.history.record(&req.id, steps, AttemptResult::Failed);
                self.history.set_last_error(&req.id, failure.error.clone());
                return Err(StartError::Failure(failure));
            }
        }

        let dir = Path::new(&app.path);
        if !dir.is_dir() {
            steps.push(format!("Path check failed: {}", app.path));
            self.diagnostics.log_event(
                LogLevel::Error,
                &app.name,
                &format!("Directory does not exist: {}", app.path),
                Some(&json!({ "path": app.path })),
            );
            let mut failure = StartFailure::new(
                FailureKind::PathNotFound,
                format!("Directory does not exist: {}", app.path),
                "Fix the app's configured path or restore the directory".to_string(),
                steps.clone(),
            );
            failure.analysis = analysis;
            self.history.record(&req.id, steps, AttemptResult::Failed);
            self.history.set_last_error(&req.id, failure.error.clone());
            return Err(StartError::Failure(Box::new(failure)));
        }
        steps.push("Path check passed".to_string());

        let argv = ql_process::split_command(&app.command);
        if installs::needs_node_modules(&argv) {
            if let Some(failure) = self.preflight_node_deps(&app, dir, &mut steps, &analysis) {
                let result = if failure.needs_install {
                    AttemptResult::NeedsInstall
                } else {
                    AttemptResult::Failed
                };
                self.history.record(&req.id, steps, result);
                self.history.set_last_error(&req.id, failure.error.clone());
                return Err(StartError::Failure(failure));
            }
            steps.push("Dependency check passed".to_string());
        }

        // Spawn and attach observers.
        let pid = match self.spawn_and_observe(&key, app.clone(), &app.command, app.port, false, true)
        {
            Ok(pid) => pid,
            Err(e) => {
                steps.push(format!("Spawn failed: {}", e));
                self.diagnostics.log_event(
                    LogLevel::Error,
                    &app.name,
                    &format!("Failed to spawn: {}", e),
                    None,
                );
                let mut failure = StartFailure::new(
                    FailureKind::Exception,
                    e.to_string(),
                    "Check that the command's executable is installed and on PATH".to_string(),
                    steps.clone(),
                );
                failure.analysis = analysis;
                self.history.record(&req.id, steps, AttemptResult::Failed);
                self.history.set_last_error(&req.id, failure.error.clone());
                return Err(StartError::Failure(Box::new(failure)));
            }
        };
        steps.push(format!("Spawned PID {}", pid));

        // Give instant crashes a moment to surface before polling.
        tokio::time::sleep(POST_SPAWN_DELAY).await;
        if let Some(failure) = self.early_crash_failure(&key, &steps, &analysis) {
            self.history.record(&req.id, steps, AttemptResult::Failed);
            self.history.set_last_error(&req.id, failure.error.clone());
            return Err(StartError::Failure(failure));
        }

        if app.port == 0 {
            // Nothing to probe; the exit observer owns the rest.
            self.history.record(&req.id, steps, AttemptResult::Success);
            return Ok(StartSuccess {
                success: true,
                id: req.id.clone(),
                key: key.to_string(),
                pid: Some(pid),
                port: 0,
                status: ProcessStatus::Starting,
                health: None,
                warning: None,
                analysis,
                elapsed_ms: started_at.elapsed().as_millis() as u64,
            });
        }

        let cancel = match self.table.get(&key) {
            Some(entry) => entry.cancel.clone(),
            None => return Err(Error::not_running(&req.id).into()),
        };
        let outcome =
            ql_health::wait_for_healthy(app.port, &poll_options(&app), &cancel).await;

        if outcome.cancelled {
            return Err(Error::not_running(&req.id).into());
        }

        if outcome.healthy {
            // Sole writer of Starting → Running. The CAS loses only when
            // the exit observer already pushed the entry terminal.
            if !self.table.set_running(&key) {
                if let Some(failure) = self.early_crash_failure(&key, &steps, &analysis) {
                    self.history.record(&req.id, steps, AttemptResult::Failed);
                    self.history.set_last_error(&req.id, failure.error.clone());
                    return Err(StartError::Failure(failure));
                }
                // The entry is gone or already terminal without a crash
                // classification: a stop or normal exit won the race.
                if !self.table.contains_live(&key) {
                    return Err(Error::not_running(&req.id).into());
                }
            }
            steps.push(format!(
                "Health check passed after {} attempt(s)",
                outcome.attempts
            ));
            self.diagnostics.log_event(
                LogLevel::Info,
                &app.name,
                "Started and healthy",
                Some(&json!({ "pid": pid, "port": app.port, "elapsedMs": outcome.elapsed_ms })),
            );
            self.history.record(&req.id, steps, AttemptResult::Success);
            return Ok(StartSuccess {
                success: true,
                id: req.id.clone(),
                key: key.to_string(),
                pid: Some(pid),
                port: app.port,
                status: ProcessStatus::Running,
                health: Some(outcome),
                warning: None,
                analysis,
                elapsed_ms: started_at.elapsed().as_millis() as u64,
            });
        }

        // Timed out. The app may have crashed during the poll; otherwise it
        // is slow and stays `starting` (never killed for a health timeout).
        if let Some(failure) = self.early_crash_failure(&key, &steps, &analysis) {
            self.history.record(&req.id, steps, AttemptResult::Failed);
            self.history.set_last_error(&req.id, failure.error.clone());
            return Err(StartError::Failure(failure));
        }

        steps.push(format!(
            "Health check timed out after {} attempt(s)",
            outcome.attempts
        ));
        warn!(
            "{} did not answer health checks within {}ms, leaving it starting",
            app.name, app.startup_timeout
        );
        self.history.record(&req.id, steps, AttemptResult::Partial);
        Ok(StartSuccess {
            success: true,
            id: req.id.clone(),
            key: key.to_string(),
            pid: Some(pid),
            port: app.port,
            status: ProcessStatus::Starting,
            health: Some(outcome),
            warning: Some(format!(
                "App did not respond within {}ms; it may still become healthy",
                app.startup_timeout
            )),
            analysis,
            elapsed_ms: started_at.elapsed().as_millis() as u64,
        })
    }

    /// Port preflight. Returns the failure envelope if the start cannot
    /// proceed.
    async fn preflight_port(
        self: &Arc<Self>,
        app: &AppConfig,
        retry: bool,
        steps: &mut Vec<String>,
        analysis: &Option<FailureAnalysis>,
    ) -> Option<Box<StartFailure>> {
        if !ql_process::is_port_in_use(app.port) {
            steps.push(format!("Port {} is free", app.port));
            return None;
        }

        if retry {
            steps.push(format!("Port {} in use, attempting to free it", app.port));
            if ql_process::free_port(app.port).await {
                tokio::time::sleep(POST_SPAWN_DELAY).await;
            }
            if !ql_process::is_port_in_use(app.port) {
                steps.push(format!("Port {} freed", app.port));
                return None;
            }

            self.diagnostics.log_event(
                LogLevel::Error,
                &app.name,
                &format!("Port {} still in use after retry", app.port),
                Some(&json!({ "port": app.port })),
            );
            let mut failure = StartFailure::new(
                FailureKind::PortInUse,
                format!("Port {} is still in use after freeing it", app.port),
                "Stop the conflicting process manually or use another port".to_string(),
                steps.clone(),
            );
            failure.support_code = SupportCode::PortInUseAfterRetry;
            failure.analysis = analysis.clone();
            return Some(Box::new(failure));
        }

        let owner = ql_process::identify_port_owner(app.port).await;
        let alternative = self
            .config
            .snapshot()
            .suggest_port(ALTERNATIVE_PORT_BASE.max(app.port.saturating_add(1)))
            .ok();

        steps.push(match &owner {
            Some(owner) => format!(
                "Port {} in use by {} (PID {})",
                app.port, owner.name, owner.pid
            ),
            None => format!("Port {} in use by an unidentified process", app.port),
        });

        self.diagnostics.log_event(
            LogLevel::Error,
            &app.name,
            &format!("Port {} in use", app.port),
            Some(&json!({
                "port": app.port,
                "blockingPid": owner.as_ref().map(|o| o.pid),
            })),
        );

        let mut failure = StartFailure::new(
            FailureKind::PortInUse,
            format!("Port {} is already in use", app.port),
            "Retry to free the port, or start on the suggested alternative".to_string(),
            steps.clone(),
        );
        failure.can_retry = true;
        failure.can_use_alternative = alternative.is_some();
        failure.alternative_port = alternative;
        failure.blocking_process = owner.map(|o| BlockingProcess {
            pid: o.pid,
            name: o.name,
        });
        failure.analysis = analysis.clone();
        Some(Box::new(failure))
    }

    /// Manifest and node_modules preflight for package-manager commands.
    fn preflight_node_deps(
        &self,
        app: &AppConfig,
        dir: &Path,
        steps: &mut Vec<String>,
        analysis: &Option<FailureAnalysis>,
    ) -> Option<Box<StartFailure>> {
        if !installs::has_manifest(dir) {
            steps.push("package.json not found".to_string());
            self.diagnostics.log_event(
                LogLevel::Error,
                &app.name,
                &format!("package.json not found in {}", app.path),
                None,
            );
            let mut failure = StartFailure::new(
                FailureKind::MissingManifest,
                format!("No package.json found in {}", app.path),
                "Point the app at the directory containing its package.json".to_string(),
                steps.clone(),
            );
            failure.analysis = analysis.clone();
            return Some(Box::new(failure));
        }

        if !installs::has_node_modules(dir) {
            let pm = installs::detect_package_manager(dir);
            steps.push(format!("node_modules missing ({} detected)", pm));
            self.diagnostics.log_event(
                LogLevel::Error,
                &app.name,
                &format!("Dependencies module directory missing in {}", app.path),
                Some(&json!({ "packageManager": pm })),
            );
            let mut failure = StartFailure::new(
                FailureKind::MissingDependencies,
                format!("Dependencies are not installed in {}", app.path),
                format!("Run `{} install` in the app directory", pm),
                steps.clone(),
            );
            failure.needs_install = true;
            failure.package_manager = Some(pm.to_string());
            failure.analysis = analysis.clone();
            return Some(Box::new(failure));
        }

        None
    }

    /// Build the 5xx envelope when the entry already went terminal during
    /// startup.
    fn early_crash_failure(
        &self,
        key: &ProcessKey,
        steps: &[String],
        analysis: &Option<FailureAnalysis>,
    ) -> Option<Box<StartFailure>> {
        let entry = self.table.get(key)?;
        if entry.status != ProcessStatus::Failed {
            return None;
        }

        let (marker_kind, message) = match &entry.error {
            Some(err) => (Some(err.kind), err.message.clone()),
            None => (
                None,
                format!(
                    "Process exited with code {} during startup",
                    entry.exit_code.unwrap_or(-1)
                ),
            ),
        };

        // Always a 5xx: the kind is the startup crash, the classified
        // marker (if any) picks the support code.
        let mut failure = StartFailure::new(
            FailureKind::StartupCrash,
            message,
            "Inspect the captured output below for the failure cause".to_string(),
            steps.to_vec(),
        );
        if let Some(kind) = marker_kind {
            failure.support_code = support_code_for(kind);
        }
        failure.recent_logs = entry.recent_logs(STATUS_LOG_LINES);
        failure.analysis = analysis.clone();
        Some(Box::new(failure))
    }

    fn resolve_app(&self, req: &StartRequest) -> Result<AppConfig, Error> {
        let mut app = match self.config.app(&req.id) {
            Some(app) => app,
            None => {
                // Ad-hoc start of an unsaved app requires the full set.
                match (&req.name, &req.port, &req.path, &req.command) {
                    (Some(name), Some(port), Some(path), Some(command)) => {
                        let mut app: AppConfig = serde_json::from_value(json!({
                            "id": req.id,
                            "name": name,
                            "port": port,
                            "path": path,
                            "command": command,
                        }))
                        .map_err(|e| Error::invalid_config(e.to_string()))?;
                        app.auto_restart = false;
                        app
                    }
                    _ => return Err(Error::app_not_found(&req.id)),
                }
            }
        };

        if let Some(name) = &req.name {
            app.name = name.clone();
        }
        if let Some(port) = req.port {
            app.port = port;
        }
        if let Some(path) = &req.path {
            app.path = path.clone();
        }
        if let Some(command) = &req.command {
            app.command = command.clone();
        }
        if let Some(url) = &req.health_check_url {
            app.health_check_url = Some(url.clone());
        }
        if let Some(timeout) = req.startup_timeout {
            app.startup_timeout = timeout;
        }
        if let Some(auto_restart) = req.auto_restart {
            app.auto_restart = auto_restart;
        }
        if let Some(max) = req.max_restart_attempts {
            app.max_restart_attempts = max;
        }
        if let Some(port) = req.override_port {
            app.port = port;
        }
        Ok(app)
    }

    /// Spawn the command, insert the table entry, and attach the stream
    /// and exit observers. The entry's config snapshot is what restarts
    /// will respawn from.
    pub(crate) fn spawn_and_observe(
        self: &Arc<Self>,
        key: &ProcessKey,
        app: AppConfig,
        command: &str,
        port: u16,
        scheduled: bool,
        manual: bool,
    ) -> Result<u32, Error> {
        let argv = ql_process::split_command(command);
        if argv.is_empty() {
            return Err(Error::invalid_config(format!("empty command for {}", key)));
        }

        let dir = Path::new(&app.path);
        let mut child = ql_process::spawn_app_command(key.as_str(), &argv, dir)?;
        let pid = child.id().unwrap_or(0);

        let mut entry = ProcessEntry::new(key.clone(), app, port);
        entry.pid = Some(pid);
        entry.is_scheduled = scheduled;
        entry.is_manual = manual;
        self.table
            .insert(entry)
            .map_err(|_| Error::already_running(key.as_str()))?;

        if let Some(stdout) = child.stdout.take() {
            self.spawn_stream_reader(key.clone(), stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            self.spawn_stream_reader(key.clone(), stderr);
        }

        let supervisor = Arc::clone(self);
        let exit_key = key.clone();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    error!("Failed to wait for {}: {}", exit_key, e);
                    None
                }
            };
            supervisor.handle_exit(exit_key, code).await;
        });

        Ok(pid)
    }

    fn spawn_stream_reader(
        self: &Arc<Self>,
        key: ProcessKey,
        stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let mut lines = BufReader::new(stream).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Some(err) = classify_output_line(&line) {
                    supervisor.table.record_startup_error(&key, err);
                }
                supervisor.table.append_log(&key, line);
            }
        });
    }

    /// Exit observer body: classification, diagnostics, restart policy.
    async fn handle_exit(self: Arc<Self>, key: ProcessKey, exit_code: Option<i32>) {
        // An explicit stop removed the entry first; nothing to do.
        let Some(entry) = self.table.get(&key) else {
            return;
        };
        let code = exit_code.unwrap_or(-1);
        let runtime_ms = (Utc::now() - entry.start_time).num_milliseconds().max(0);

        if entry.is_scheduled {
            let status = if code == 0 {
                ProcessStatus::Completed
            } else {
                ProcessStatus::Failed
            };
            self.table.mark_exited(&key, status, Some(code));

            let level = if code == 0 { LogLevel::Info } else { LogLevel::Error };
            self.diagnostics.log_event(
                level,
                &entry.name,
                &format!("Scheduled run exited with code {}", code),
                Some(&json!({
                    "exitCode": code,
                    "normalTermination": is_normal_exit(code),
                    "manual": entry.is_manual,
                })),
            );

            if let Err(e) = self
                .schedule_state
                .record(
                    key.app_id(),
                    ScheduleState {
                        last_run: Some(Utc::now()),
                        last_exit_code: Some(code),
                        was_manual: entry.is_manual,
                    },
                )
                .await
            {
                warn!("Failed to persist schedule state for {}: {}", key, e);
            }
            return;
        }

        match classify_exit(code, runtime_ms) {
            ExitClass::Normal => {
                self.table.mark_exited(&key, ProcessStatus::Stopped, Some(code));
                info!("{} exited normally with code {}", entry.name, code);
                self.diagnostics.log_event(
                    LogLevel::Info,
                    &entry.name,
                    &format!("exited with code {}", code),
                    Some(&json!({
                        "exitCode": code,
                        "normalTermination": true,
                        "runtimeMs": runtime_ms,
                    })),
                );
                return;
            }
            ExitClass::StartupCrash => {
                self.table.mark_exited(&key, ProcessStatus::Failed, Some(code));
                error!(
                    "{} crashed {}ms after start (exit code {})",
                    entry.name, runtime_ms, code
                );
                self.diagnostics.log_event(
                    LogLevel::Error,
                    &entry.name,
                    &format!("exited with code {} after {}ms", code, runtime_ms),
                    Some(&json!({
                        "exitCode": code,
                        "normalTermination": false,
                        "runtimeMs": runtime_ms,
                        "startupCrash": true,
                    })),
                );
                self.history.record(
                    key.app_id(),
                    vec![format!("Startup crash with exit code {}", code)],
                    AttemptResult::Failed,
                );
                return;
            }
            ExitClass::RuntimeCrash => {}
        }

        // Runtime crash.
        let app_id = key.app_id().to_string();
        let snapshot = entry.config.clone();
        let may_restart = snapshot.auto_restart
            && self
                .restarts
                .should_restart(&app_id, snapshot.max_restart_attempts);

        if may_restart {
            let tracker = self
                .restarts
                .note_attempt(&app_id, snapshot.max_restart_attempts);
            self.table.transition(&key, ProcessStatus::Restarting);
            warn!(
                "{} crashed after {}s (exit code {}), restart attempt {}/{}",
                entry.name,
                runtime_ms / 1000,
                code,
                tracker.attempts,
                snapshot.max_restart_attempts
            );
            self.diagnostics.log_event(
                LogLevel::Warn,
                &entry.name,
                &format!("exited with code {} after {}ms", code, runtime_ms),
                Some(&json!({
                    "exitCode": code,
                    "normalTermination": false,
                    "runtimeMs": runtime_ms,
                    "restartAttempt": tracker.attempts,
                })),
            );

            let supervisor = Arc::clone(&self);
            tokio::spawn(async move {
                supervisor.perform_restart(key, snapshot).await;
            });
        } else {
            self.table.mark_exited(&key, ProcessStatus::Failed, Some(code));
            error!("{} crashed with exit code {}", entry.name, code);
            self.diagnostics.log_event(
                LogLevel::Error,
                &entry.name,
                &format!("exited with code {} after {}ms", code, runtime_ms),
                Some(&json!({
                    "exitCode": code,
                    "normalTermination": false,
                    "runtimeMs": runtime_ms,
                })),
            );
            if snapshot.auto_restart {
                self.diagnostics.log_event(
                    LogLevel::Warn,
                    &entry.name,
                    "Automatic restart budget exhausted",
                    Some(&json!({ "maxRestartAttempts": snapshot.max_restart_attempts })),
                );
            }
        }
    }

    /// Delayed respawn from the snapshot config, then a stability timer.
    async fn perform_restart(self: Arc<Self>, key: ProcessKey, snapshot: AppConfig) {
        tokio::time::sleep(RESTART_DELAY).await;

        // A stop during the delay removes the entry; bail out.
        match self.table.get(&key) {
            Some(entry) if entry.status == ProcessStatus::Restarting => {}
            _ => return,
        }

        if snapshot.port > 0 && ql_process::is_port_in_use(snapshot.port) {
            ql_process::free_port(snapshot.port).await;
        }

        self.table.remove(&key);
        let command = snapshot.command.clone();
        match self.spawn_and_observe(&key, snapshot.clone(), &command, snapshot.port, false, false) {
            Ok(pid) => {
                info!("Restarted {} (PID {})", key, pid);
                self.diagnostics.log_event(
                    LogLevel::Info,
                    &snapshot.name,
                    "Restarted after crash",
                    Some(&json!({ "pid": pid })),
                );

                if snapshot.port > 0 {
                    let supervisor = Arc::clone(&self);
                    let poll_key = key.clone();
                    let opts = poll_options(&snapshot);
                    let port = snapshot.port;
                    tokio::spawn(async move {
                        let Some(entry) = supervisor.table.get(&poll_key) else {
                            return;
                        };
                        let outcome =
                            ql_health::wait_for_healthy(port, &opts, &entry.cancel).await;
                        if outcome.healthy {
                            supervisor.table.set_running(&poll_key);
                        }
                    });
                }

                // Stability reset: still alive after the window clears the
                // tracker so the full budget reaccumulates.
                let supervisor = Arc::clone(&self);
                let stable_key = key.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(STABILITY_WINDOW).await;
                    if let Some(entry) = supervisor.table.get(&stable_key) {
                        if entry.status.is_live() {
                            supervisor.restarts.clear(stable_key.app_id());
                        }
                    }
                });
            }
            Err(e) => {
                error!("Restart spawn failed for {}: {}", key, e);
                self.diagnostics.log_event(
                    LogLevel::Error,
                    &snapshot.name,
                    &format!("Restart failed: {}", e),
                    None,
                );
                let mut entry = ProcessEntry::new(key.clone(), snapshot, 0);
                entry.status = ProcessStatus::Failed;
                entry.error = Some(StartupError {
                    kind: FailureKind::Exception,
                    message: e.to_string(),
                });
                let _ = self.table.insert(entry);
            }
        }
    }

    /// Stop a managed process by composite key.
    ///
    /// Valid in any non-terminal state. The entry is removed before the
    /// kill is issued, so the exit observer's late callback is a no-op,
    /// and the cancellation token aborts any in-flight health poll.
    pub fn stop_app(&self, raw_key: &str) -> Result<(), Error> {
        let key = ProcessKey::parse(raw_key);
        let entry = self.table.remove(&key).ok_or_else(|| Error::not_running(raw_key))?;

        if entry.status.is_terminal() {
            // The leftover is dropped, but the stop itself is a client error.
            return Err(Error::not_running(raw_key));
        }

        entry.cancel.cancel();
        if let Some(pid) = entry.pid {
            tokio::spawn(async move {
                if let Err(e) = ql_process::kill_process_tree(pid).await {
                    warn!("Tree kill for PID {} failed: {}", pid, e);
                }
            });
        }

        info!("Stopped {} ({})", entry.name, key);
        self.diagnostics.log_event(
            LogLevel::Info,
            &entry.name,
            "Stopped by user",
            Some(&json!({ "pid": entry.pid })),
        );
        Ok(())
    }

    /// Status of every table entry plus externally-detected apps.
    pub async fn status_snapshot(self: &Arc<Self>) -> HashMap<String, AppStatusInfo> {
        let mut out = HashMap::new();
        for entry in self.table.snapshot_all() {
            out.insert(
                entry.key.as_str().to_string(),
                AppStatusInfo {
                    running: entry.status == ProcessStatus::Running,
                    port: entry.port,
                    name: entry.name.clone(),
                    pid: entry.pid,
                    status: entry.status,
                    recent_logs: entry.recent_logs(STATUS_LOG_LINES),
                    start_time: Some(entry.start_time),
                    external: false,
                    exit_code: entry.exit_code,
                },
            );
        }

        // External detection: configured apps with a port that are not
        // live in the table but answer a fast probe were started outside
        // the supervisor.
        let doc = self.config.snapshot();
        let mut probes = tokio::task::JoinSet::new();
        for app in doc.apps {
            if app.port == 0 {
                continue;
            }
            let key = ProcessKey::app(&app.id);
            if self.table.contains_live(&key) {
                continue;
            }
            probes.spawn(async move {
                let url = ql_health::health_url(app.port, None);
                let data = ql_health::probe_once(&url, EXTERNAL_PROBE_TIMEOUT).await;
                (app, data.responded)
            });
        }

        while let Some(Ok((app, responded))) = probes.join_next().await {
            if responded {
                out.insert(
                    app.id.clone(),
                    AppStatusInfo {
                        running: true,
                        port: app.port,
                        name: app.name.clone(),
                        pid: None,
                        status: ProcessStatus::External,
                        recent_logs: Vec::new(),
                        start_time: None,
                        external: true,
                        exit_code: None,
                    },
                );
            }
        }

        out
    }

    /// Scheduled or manual execution of a scheduled app.
    pub fn execute_scheduled_app(
        self: &Arc<Self>,
        app_id: &str,
        is_manual: bool,
    ) -> Result<ScheduleRunStarted, Error> {
        let app = self
            .config
            .app(app_id)
            .ok_or_else(|| Error::app_not_found(app_id))?;

        if !app.schedule_enabled {
            return Err(Error::ScheduleDisabled {
                id: app_id.to_string(),
            });
        }

        // Hybrid apps run the periodic task beside the server.
        let key = if app.schedule_command.is_some() {
            ProcessKey::sync(app_id)
        } else {
            ProcessKey::app(app_id)
        };

        if self.table.contains_live(&key) {
            return Err(Error::SyncInProgress {
                key: key.to_string(),
            });
        }
        if let Some(entry) = self.table.get(&key) {
            if entry.status.is_terminal() {
                self.table.remove(&key);
            }
        }

        if !Path::new(&app.path).is_dir() {
            return Err(Error::path_not_found(&app.path));
        }

        let mut command = app
            .schedule_command
            .clone()
            .unwrap_or_else(|| app.command.clone());
        // Scheduled (non-manual) sync runs must not pop a browser window.
        if !is_manual && command.contains("npm run sync") {
            command.push_str(" -- --headless");
        }

        let port = if key.is_sync() { 0 } else { app.port };
        let name = app.name.clone();
        let pid = self.spawn_and_observe(&key, app, &command, port, true, is_manual)?;

        info!(
            "{} run started for {} ({})",
            if is_manual { "Manual" } else { "Scheduled" },
            name,
            key
        );
        self.diagnostics.log_event(
            LogLevel::Info,
            &name,
            "Scheduled run started",
            Some(&json!({ "manual": is_manual, "pid": pid })),
        );

        Ok(ScheduleRunStarted {
            key: key.to_string(),
            pid: Some(pid),
        })
    }
}

fn poll_options(app: &AppConfig) -> HealthPollOptions {
    HealthPollOptions {
        health_url: app.health_check_url.clone(),
        startup_timeout: Duration::from_millis(app.startup_timeout),
        ..Default::default()
    }
}

/// Classify well-known startup error markers in stream output.
///
/// The markers only attribute failures; readiness markers in stdout never
/// transition the entry to running.
fn classify_output_line(line: &str) -> Option<StartupError> {
    if line.contains("EADDRINUSE") {
        Some(StartupError {
            kind: FailureKind::PortInUse,
            message: line.to_string(),
        })
    } else if line.contains("Cannot find module") {
        Some(StartupError {
            kind: FailureKind::MissingDependencies,
            message: line.to_string(),
        })
    } else if line.contains("ENOENT") {
        Some(StartupError {
            kind: FailureKind::PathNotFound,
            message: line.to_string(),
        })
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDocument;

    async fn test_supervisor(dir: &Path) -> Arc<Supervisor> {
        let config = ConfigStore::open(dir).await.unwrap();
        let schedule_state = ScheduleStateStore::open(dir).await.unwrap();
        let diagnostics = DiagnosticsEngine::new(dir);
        Supervisor::new(config, schedule_state, diagnostics)
    }

    fn request(id: &str, port: u16, path: &str, command: &str) -> StartRequest {
        StartRequest {
            id: id.to_string(),
            name: Some(id.to_string()),
            port: Some(port),
            path: Some(path.to_string()),
            command: Some(command.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_exit_classification() {
        assert_eq!(classify_exit(0, 100), ExitClass::Normal);
        assert_eq!(classify_exit(3221225786u32 as i32, 60_000), ExitClass::Normal);
        assert_eq!(classify_exit(1, 100), ExitClass::StartupCrash);
        assert_eq!(classify_exit(1, 4_999), ExitClass::StartupCrash);
        assert_eq!(classify_exit(1, 5_000), ExitClass::RuntimeCrash);
        assert_eq!(classify_exit(137, 60_000), ExitClass::RuntimeCrash);
    }

    #[test]
    fn test_classify_output_markers() {
        assert_eq!(
            classify_output_line("Error: listen EADDRINUSE: address already in use :::5173")
                .unwrap()
                .kind,
            FailureKind::PortInUse
        );
        assert_eq!(
            classify_output_line("Error: Cannot find module 'vite'").unwrap().kind,
            FailureKind::MissingDependencies
        );
        assert_eq!(
            classify_output_line("spawn ENOENT").unwrap().kind,
            FailureKind::PathNotFound
        );
        assert!(classify_output_line("ready in 300ms").is_none());
    }

    #[tokio::test]
    async fn test_start_rejects_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        let req = request("app", 0, "/definitely/not/a/dir", "npm run dev");
        match supervisor.start_app(req).await {
            Err(StartError::Failure(failure)) => {
                assert_eq!(failure.kind, FailureKind::PathNotFound);
                assert_eq!(failure.support_code, SupportCode::PathMissing);
                assert_eq!(failure.http_status(), 400);
                assert!(!failure.troubleshooting.is_empty());
            }
            other => panic!("expected path failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_start_reports_missing_manifest_then_dependencies() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;
        let app_dir = dir.path().join("app");
        std::fs::create_dir(&app_dir).unwrap();

        let req = request("app", 0, app_dir.to_str().unwrap(), "npm run dev");
        match supervisor.start_app(req.clone()).await {
            Err(StartError::Failure(failure)) => {
                assert_eq!(failure.support_code, SupportCode::ManifestMissing);
            }
            other => panic!("expected manifest failure, got {:?}", other.is_ok()),
        }

        std::fs::write(app_dir.join("package.json"), "{}").unwrap();
        std::fs::write(app_dir.join("yarn.lock"), "").unwrap();
        match supervisor.start_app(req).await {
            Err(StartError::Failure(failure)) => {
                assert_eq!(failure.support_code, SupportCode::DependenciesMissing);
                assert!(failure.needs_install);
                assert_eq!(failure.package_manager.as_deref(), Some("yarn"));
            }
            other => panic!("expected dependency failure, got {:?}", other.is_ok()),
        }
    }

    #[tokio::test]
    async fn test_start_port_conflict_offers_alternative() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let req = request("app", port, dir.path().to_str().unwrap(), "sleep 5");
        match supervisor.start_app(req).await {
            Err(StartError::Failure(failure)) => {
                assert_eq!(failure.kind, FailureKind::PortInUse);
                assert_eq!(failure.support_code, SupportCode::PortInUse);
                assert!(failure.can_retry);
                assert!(failure.can_use_alternative);
                assert!(failure.alternative_port.is_some());
                assert_eq!(failure.http_status(), 400);
            }
            other => panic!("expected port failure, got {:?}", other.is_ok()),
        }
        drop(listener);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_instant_crash_surfaces_as_startup_failure() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        let req = request("crasher", 0, dir.path().to_str().unwrap(), "false");
        match supervisor.start_app(req).await {
            Err(StartError::Failure(failure)) => {
                assert_eq!(failure.http_status(), 500);
                assert_eq!(failure.kind, FailureKind::StartupCrash);
            }
            other => panic!("expected startup crash, got {:?}", other.is_ok()),
        }

        // The entry is terminal, so a later start may replace it.
        let entry = supervisor.table.get(&ProcessKey::app("crasher")).unwrap();
        assert_eq!(entry.status, ProcessStatus::Failed);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_normal_exit_is_stopped_not_failed() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        let req = request("oneshot", 0, dir.path().to_str().unwrap(), "true");
        let result = supervisor.start_app(req).await;
        assert!(result.is_ok());

        // Give the exit observer a moment.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let entry = supervisor.table.get(&ProcessKey::app("oneshot")).unwrap();
        assert_eq!(entry.status, ProcessStatus::Stopped);
        assert_eq!(entry.exit_code, Some(0));

        // The troubleshooting log carries the normal-termination marker.
        let entries = supervisor.diagnostics.analyze_app("oneshot").unwrap();
        assert_eq!(entries.total_failures, 0);
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_stop_removes_entry_before_kill() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        let req = request("sleeper", 0, dir.path().to_str().unwrap(), "sleep 30");
        supervisor.start_app(req).await.unwrap();

        supervisor.stop_app("sleeper").unwrap();
        assert!(supervisor.table.get(&ProcessKey::app("sleeper")).is_none());

        // Stopping again is a client error.
        assert!(matches!(
            supervisor.stop_app("sleeper"),
            Err(Error::NotRunning { .. })
        ));
    }

    #[tokio::test]
    async fn test_stop_unknown_key_is_client_error() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;
        assert!(matches!(
            supervisor.stop_app("ghost"),
            Err(Error::NotRunning { .. })
        ));
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_scheduled_run_uses_sync_key_and_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        supervisor
            .config
            .mutate(|doc: &mut ConfigDocument| {
                let mut app: AppConfig = serde_json::from_value(json!({
                    "id": "hybrid",
                    "name": "hybrid",
                    "port": 5199,
                    "path": dir.path().to_str().unwrap(),
                    "command": "sleep 30",
                    "schedule": "02:30",
                    "scheduleEnabled": true,
                    "scheduleCommand": "true",
                }))
                .unwrap();
                app.schedule_enabled = true;
                doc.apps.push(app);
                Ok(())
            })
            .await
            .unwrap();

        let started = supervisor.execute_scheduled_app("hybrid", true).unwrap();
        assert_eq!(started.key, "hybrid:sync");

        tokio::time::sleep(Duration::from_millis(400)).await;
        let entry = supervisor.table.get(&ProcessKey::sync("hybrid")).unwrap();
        assert_eq!(entry.status, ProcessStatus::Completed);

        let state = supervisor.schedule_state.get("hybrid");
        assert_eq!(state.last_exit_code, Some(0));
        assert!(state.was_manual);
        assert!(state.last_run.is_some());
    }

    #[tokio::test]
    async fn test_manual_run_requires_enabled_schedule() {
        let dir = tempfile::tempdir().unwrap();
        let supervisor = test_supervisor(dir.path()).await;

        supervisor
            .config
            .mutate(|doc: &mut ConfigDocument| {
                let app: AppConfig = serde_json::from_value(json!({
                    "id": "task",
                    "name": "task",
                    "path": "/tmp",
                    "command": "true",
                    "schedule": "02:30",
                }))
                .unwrap();
                doc.apps.push(app);
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            supervisor.execute_scheduled_app("task", true),
            Err(Error::ScheduleDisabled { .. })
        ));
    }
}
