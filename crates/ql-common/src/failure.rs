//! Failure taxonomy and client-facing support codes.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure classification attached to start failures and log analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    PortInUse,
    PathNotFound,
    MissingManifest,
    MissingDependencies,
    FileNotFound,
    StartupCrash,
    RuntimeCrash,
    HealthTimeout,
    AutoRestartExhausted,
    Exception,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FailureKind::PortInUse => "PORT_IN_USE",
            FailureKind::PathNotFound => "PATH_NOT_FOUND",
            FailureKind::MissingManifest => "MISSING_MANIFEST",
            FailureKind::MissingDependencies => "MISSING_DEPENDENCIES",
            FailureKind::FileNotFound => "FILE_NOT_FOUND",
            FailureKind::StartupCrash => "STARTUP_CRASH",
            FailureKind::RuntimeCrash => "RUNTIME_CRASH",
            FailureKind::HealthTimeout => "HEALTH_TIMEOUT",
            FailureKind::AutoRestartExhausted => "AUTO_RESTART_EXHAUSTED",
            FailureKind::Exception => "EXCEPTION",
        };
        write!(f, "{}", s)
    }
}

/// Opaque client-facing identifier for a failure class.
///
/// These are surfaced verbatim to users for documentation and triage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupportCode {
    #[serde(rename = "QL-PORT-001")]
    PortInUse,
    #[serde(rename = "QL-PORT-002")]
    PortInUseAfterRetry,
    #[serde(rename = "QL-PATH-001")]
    PathMissing,
    #[serde(rename = "QL-NPM-001")]
    ManifestMissing,
    #[serde(rename = "QL-MOD-001")]
    DependenciesMissing,
    #[serde(rename = "QL-FILE-001")]
    FileMissing,
    #[serde(rename = "QL-NET-001")]
    Network,
    #[serde(rename = "QL-ERR-000")]
    Unknown,
    #[serde(rename = "QL-ERR-500")]
    Server,
}

impl SupportCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SupportCode::PortInUse => "QL-PORT-001",
            SupportCode::PortInUseAfterRetry => "QL-PORT-002",
            SupportCode::PathMissing => "QL-PATH-001",
            SupportCode::ManifestMissing => "QL-NPM-001",
            SupportCode::DependenciesMissing => "QL-MOD-001",
            SupportCode::FileMissing => "QL-FILE-001",
            SupportCode::Network => "QL-NET-001",
            SupportCode::Unknown => "QL-ERR-000",
            SupportCode::Server => "QL-ERR-500",
        }
    }
}

impl fmt::Display for SupportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_support_code_display() {
        assert_eq!(SupportCode::PortInUse.to_string(), "QL-PORT-001");
        assert_eq!(SupportCode::DependenciesMissing.to_string(), "QL-MOD-001");
        assert_eq!(SupportCode::Server.to_string(), "QL-ERR-500");
    }

    #[test]
    fn test_support_code_serializes_verbatim() {
        let json = serde_json::to_string(&SupportCode::PathMissing).unwrap();
        assert_eq!(json, "\"QL-PATH-001\"");
    }

    #[test]
    fn test_failure_kind_wire_format() {
        let json = serde_json::to_string(&FailureKind::PortInUse).unwrap();
        assert_eq!(json, "\"PORT_IN_USE\"");
        assert_eq!(FailureKind::AutoRestartExhausted.to_string(), "AUTO_RESTART_EXHAUSTED");
    }
}
