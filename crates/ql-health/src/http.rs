//! Single-attempt HTTP probe.

use http_body_util::Empty;
use hyper::body::Bytes;
use hyper::{Method, Request, Uri};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::timeout;
use tracing::debug;

/// Result of one probe attempt.
///
/// Any HTTP response counts as alive; a dev server answering 404 on `/`
/// is still a dev server. Only connection failures and timeouts are
/// unhealthy.
#[derive(Debug, Clone)]
pub struct ProbeData {
    pub responded: bool,
    pub status_code: Option<u16>,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

/// Issue a single GET against `url` with a per-attempt timeout.
pub async fn probe_once(url: &str, attempt_timeout: Duration) -> ProbeData {
    let start = std::time::Instant::now();

    let uri: Uri = match url.parse() {
        Ok(uri) => uri,
        Err(e) => {
            return ProbeData {
                responded: false,
                status_code: None,
                response_time_ms: 0,
                error: Some(format!("Invalid URL: {}", e)),
            };
        }
    };

    let client = Client::builder(TokioExecutor::new()).build_http();

    let request = match Request::builder()
        .method(Method::GET)
        .uri(uri)
        .header("User-Agent", "QuickLaunch/1.0")
        .body(Empty::<Bytes>::new())
    {
        Ok(req) => req,
        Err(e) => {
            return ProbeData {
                responded: false,
                status_code: None,
                response_time_ms: 0,
                error: Some(format!("Failed to build request: {}", e)),
            };
        }
    };

    match timeout(attempt_timeout, client.request(request)).await {
        Ok(Ok(response)) => {
            let status = response.status().as_u16();
            let elapsed = start.elapsed().as_millis() as u64;
            debug!("Probe {} responded {} in {}ms", url, status, elapsed);
            ProbeData {
                responded: true,
                status_code: Some(status),
                response_time_ms: elapsed,
                error: None,
            }
        }
        Ok(Err(e)) => ProbeData {
            responded: false,
            status_code: None,
            response_time_ms: start.elapsed().as_millis() as u64,
            error: Some(format!("Connection failed: {}", e)),
        },
        Err(_) => ProbeData {
            responded: false,
            status_code: None,
            response_time_ms: attempt_timeout.as_millis() as u64,
            error: Some("Timeout".to_string()),
        },
    }
}
