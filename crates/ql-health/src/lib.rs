//! # QuickLaunch Health
//!
//! HTTP liveness probing for managed apps:
//! - Single-attempt probes (used by external-app detection)
//! - The startup polling loop with a hard total deadline

pub mod http;
pub mod prober;

pub use http::{probe_once, ProbeData};
pub use prober::{wait_for_healthy, HealthPollOptions, HealthPollOutcome};

/// Build the probe URL for a port and optional health path.
///
/// A missing or empty path means the root. Paths are expected to start
/// with `/`; anything else is prefixed.
pub fn health_url(port: u16, health_path: Option<&str>) -> String {
    let path = match health_path {
        None | Some("") => "/",
        Some(p) => p,
    };
    if path.starts_with('/') {
        format!("http://localhost:{}{}", port, path)
    } else {
        format!("http://localhost:{}/{}", port, path)
    }
}
