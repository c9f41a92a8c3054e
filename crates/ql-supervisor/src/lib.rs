//! # QuickLaunch Supervisor
//!
//! The supervisor core: declarative app configuration, the in-memory
//! process table, the start/stop lifecycle state machine with bounded
//! auto-restart, dependency install jobs, and the cron scheduler with
//! missed-run recovery.

pub mod config;
pub mod history;
pub mod installs;
pub mod lifecycle;
pub mod restart;
pub mod schedule_state;
pub mod scheduler;
pub mod table;

pub use config::{AppConfig, ConfigDocument, ConfigStore, RegistryCheck, RegistryReason, SUPERVISOR_PORT};
pub use history::{AttemptResult, StartupAttempt, StartupHistory};
pub use installs::{InstallJob, InstallRegistry, InstallStatus};
pub use lifecycle::{
    AppStatusInfo, BlockingProcess, ScheduleRunStarted, StartError, StartFailure, StartRequest,
    StartSuccess, Supervisor,
};
pub use restart::{RestartPolicy, RestartTracker};
pub use schedule_state::{ScheduleState, ScheduleStateStore};
pub use scheduler::{ScheduleInfo, ScheduleSpec, Scheduler};
pub use table::{LogLine, ProcessEntry, ProcessKey, ProcessStatus, ProcessTable, StartupError};
