//! # QuickLaunch Diagnostics
//!
//! Adaptive diagnostics for the supervisor:
//! - Append-only troubleshooting log (`[ISO] [LEVEL] [App] message {json}`)
//! - Append-only resolutions log (`---`-separated records)
//! - Pattern analysis with resolution-aware discounting
//! - TODO.md inventory, auto-detected issue synthesis, and triage

pub mod analysis;
pub mod engine;
pub mod resolutions;
pub mod todo;
pub mod trouble_log;

pub use analysis::{analyze, classify_message, ErrorType, FailureAnalysis, RecLevel, Recommendation};
pub use engine::DiagnosticsEngine;
pub use resolutions::{classify_issue, Disposition, Resolution, ResolutionsLog};
pub use todo::{TodoFile, TodoInventory, TodoItem, TriageAction, TriageOutcome};
pub use trouble_log::{LogLevel, TroubleEntry, TroubleLog};
