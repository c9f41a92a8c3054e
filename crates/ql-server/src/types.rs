//! Request bodies for the RPC surface.

use ql_diagnostics::TriageAction;
use serde::Deserialize;

/// Partial update for `PUT /api/apps/:id`. The id is immutable.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub port: Option<u16>,
    pub path: Option<String>,
    pub command: Option<String>,
    pub icon: Option<String>,
    pub icon_path: Option<String>,
    pub colors: Option<Vec<String>>,
    pub health_check_url: Option<String>,
    pub startup_timeout: Option<u64>,
    pub auto_restart: Option<bool>,
    pub max_restart_attempts: Option<u32>,
    pub schedule: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub run_if_missed: Option<bool>,
    pub schedule_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrateRequest {
    pub apps: Vec<ql_supervisor::AppConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReserveRequest {
    pub port: u16,
    pub description: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckDepsRequest {
    pub path: String,
    #[serde(default)]
    pub command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopRequest {
    pub id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableScheduleRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleUpdate {
    pub schedule: Option<String>,
    pub schedule_enabled: Option<bool>,
    pub run_if_missed: Option<bool>,
    pub schedule_command: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriageRequest {
    pub items: Vec<TriageAction>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolutionRequest {
    #[serde(default)]
    pub app: Option<String>,
    pub issue: String,
    #[serde(default)]
    pub error_type: Option<String>,
    #[serde(default)]
    pub disposition: Option<ql_diagnostics::Disposition>,
    #[serde(default)]
    pub explanation: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IconQuery {
    pub path: String,
}
