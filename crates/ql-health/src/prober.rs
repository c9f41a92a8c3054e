//! Startup health polling.
//!
//! Polls the app's health URL until it answers or the total deadline
//! elapses. Connection refusals and per-attempt timeouts are non-fatal and
//! trigger another poll after `poll_interval`. The caller's cancellation
//! token aborts the loop early (a stopped app must not keep being probed).

use crate::http::probe_once;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Options for the startup polling loop.
#[derive(Debug, Clone)]
pub struct HealthPollOptions {
    /// Path appended to `http://localhost:<port>`; `None` means root.
    pub health_url: Option<String>,
    /// Hard total deadline.
    pub startup_timeout: Duration,
    /// Delay between poll attempts.
    pub poll_interval: Duration,
    /// Per-attempt timeout, independent of the total deadline.
    pub attempt_timeout: Duration,
}

impl Default for HealthPollOptions {
    fn default() -> Self {
        Self {
            health_url: None,
            startup_timeout: Duration::from_millis(30_000),
            poll_interval: Duration::from_millis(500),
            attempt_timeout: Duration::from_millis(2_000),
        }
    }
}

/// Outcome of a polling run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthPollOutcome {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    pub elapsed_ms: u64,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

/// Poll `http://localhost:<port><health_url>` until healthy, deadline, or
/// cancellation.
pub async fn wait_for_healthy(
    port: u16,
    opts: &HealthPollOptions,
    cancel: &CancellationToken,
) -> HealthPollOutcome {
    let url = crate::health_url(port, opts.health_url.as_deref());
    let start = std::time::Instant::now();
    let mut attempts = 0u32;
    let mut last_error = None;

    debug!(
        "Health polling {} (deadline {:?}, interval {:?})",
        url, opts.startup_timeout, opts.poll_interval
    );

    loop {
        if cancel.is_cancelled() {
            return HealthPollOutcome {
                healthy: false,
                status_code: None,
                elapsed_ms: start.elapsed().as_millis() as u64,
                attempts,
                error: last_error,
                timed_out: false,
                cancelled: true,
            };
        }

        attempts += 1;
        let data = probe_once(&url, opts.attempt_timeout).await;

        if data.responded {
            let elapsed = start.elapsed().as_millis() as u64;
            info!(
                "Health check passed for port {} after {} attempt(s) in {}ms",
                port, attempts, elapsed
            );
            return HealthPollOutcome {
                healthy: true,
                status_code: data.status_code,
                elapsed_ms: elapsed,
                attempts,
                error: None,
                timed_out: false,
                cancelled: false,
            };
        }

        last_error = data.error;

        if start.elapsed() >= opts.startup_timeout {
            return HealthPollOutcome {
                healthy: false,
                status_code: None,
                elapsed_ms: start.elapsed().as_millis() as u64,
                attempts,
                error: last_error,
                timed_out: true,
                cancelled: false,
            };
        }

        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(opts.poll_interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_opts() -> HealthPollOptions {
        HealthPollOptions {
            health_url: None,
            startup_timeout: Duration::from_millis(300),
            poll_interval: Duration::from_millis(50),
            attempt_timeout: Duration::from_millis(100),
        }
    }

    #[tokio::test]
    async fn test_times_out_when_nothing_listens() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cancel = CancellationToken::new();
        let outcome = wait_for_healthy(port, &fast_opts(), &cancel).await;
        assert!(!outcome.healthy);
        assert!(outcome.timed_out);
        assert!(outcome.attempts >= 2);
    }

    #[tokio::test]
    async fn test_cancellation_stops_polling() {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = wait_for_healthy(port, &fast_opts(), &cancel).await;
        assert!(!outcome.healthy);
        assert!(outcome.cancelled);
        assert!(!outcome.timed_out);
    }

    #[tokio::test]
    async fn test_becomes_healthy_once_server_answers() {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            loop {
                if let Ok((mut socket, _)) = listener.accept().await {
                    use tokio::io::AsyncWriteExt;
                    let _ = socket
                        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\n\r\n")
                        .await;
                }
            }
        });

        let cancel = CancellationToken::new();
        let opts = HealthPollOptions {
            startup_timeout: Duration::from_secs(5),
            ..fast_opts()
        };
        let outcome = wait_for_healthy(port, &opts, &cancel).await;
        assert!(outcome.healthy);
        assert_eq!(outcome.status_code, Some(200));
    }
}
