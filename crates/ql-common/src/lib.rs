//! # QuickLaunch Common
//!
//! Shared types for the QuickLaunch supervisor:
//! - Error types and `Result` alias
//! - Failure taxonomy and client-facing support codes
//! - Exit-code classification

pub mod errors;
pub mod exit;
pub mod failure;

pub use errors::{Error, Result};
pub use exit::{is_normal_exit, NORMAL_EXIT_CODES};
pub use failure::{FailureKind, SupportCode};
