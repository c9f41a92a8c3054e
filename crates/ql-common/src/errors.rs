//! Error types for the QuickLaunch supervisor.

use thiserror::Error;

/// Result type alias for supervisor operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for supervisor operations.
///
/// Each variant carries enough context to produce the client-facing
/// failure envelope (support code, suggestion, troubleshooting trace).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Port {port} is already in use{}", owner.as_deref().map(|o| format!(" by {}", o)).unwrap_or_default())]
    PortInUse { port: u16, owner: Option<String> },

    #[error("Directory does not exist: {path}")]
    PathNotFound { path: String },

    #[error("No package.json found in {path}")]
    MissingManifest { path: String },

    #[error("Dependencies not installed in {path}")]
    MissingDependencies { path: String, package_manager: String },

    #[error("Required file not found: {path}")]
    FileNotFound { path: String },

    #[error("Failed to spawn process for {id}: {reason}")]
    SpawnFailed { id: String, reason: String },

    #[error("App is not running: {id}")]
    NotRunning { id: String },

    #[error("App is already running: {id}")]
    AlreadyRunning { id: String },

    #[error("App not found: {id}")]
    AppNotFound { id: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Schedule is not enabled for {id}")]
    ScheduleDisabled { id: String },

    #[error("A scheduled run is already in progress: {key}")]
    SyncInProgress { key: String },

    #[error("Invalid schedule expression '{expr}': {reason}")]
    InvalidSchedule { expr: String, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn port_in_use(port: u16, owner: Option<String>) -> Self {
        Self::PortInUse { port, owner }
    }

    pub fn path_not_found(path: impl Into<String>) -> Self {
        Self::PathNotFound { path: path.into() }
    }

    pub fn missing_manifest(path: impl Into<String>) -> Self {
        Self::MissingManifest { path: path.into() }
    }

    pub fn missing_dependencies(path: impl Into<String>, package_manager: impl Into<String>) -> Self {
        Self::MissingDependencies {
            path: path.into(),
            package_manager: package_manager.into(),
        }
    }

    pub fn spawn_failed(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SpawnFailed {
            id: id.into(),
            reason: reason.into(),
        }
    }

    pub fn not_running(id: impl Into<String>) -> Self {
        Self::NotRunning { id: id.into() }
    }

    pub fn already_running(id: impl Into<String>) -> Self {
        Self::AlreadyRunning { id: id.into() }
    }

    pub fn app_not_found(id: impl Into<String>) -> Self {
        Self::AppNotFound { id: id.into() }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub fn invalid_schedule(expr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            expr: expr.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal(reason.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        let err = Error::port_in_use(5173, Some("node (PID 4242)".to_string()));
        assert_eq!(err.to_string(), "Port 5173 is already in use by node (PID 4242)");

        let err = Error::port_in_use(5173, None);
        assert_eq!(err.to_string(), "Port 5173 is already in use");

        let err = Error::not_running("my-app");
        assert!(matches!(err, Error::NotRunning { .. }));
        assert_eq!(err.to_string(), "App is not running: my-app");
    }

    #[test]
    fn test_error_pattern_matching() {
        let err = Error::missing_dependencies("/work/app", "yarn");
        match err {
            Error::MissingDependencies { package_manager, .. } => {
                assert_eq!(package_manager, "yarn");
            }
            _ => panic!("Wrong error type"),
        }
    }
}
