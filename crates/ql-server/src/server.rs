//! HTTP server binding.

use crate::api::{create_router, AppState};
use ql_common::Result;
use tokio::net::TcpListener;
use tracing::info;

/// Bind the RPC surface on `port` and serve until the task is dropped or
/// the process shuts down.
pub async fn serve(state: AppState, port: u16) -> Result<()> {
    let addr = format!("127.0.0.1:{}", port);
    let listener = TcpListener::bind(&addr).await?;
    info!("QuickLaunch API listening on http://{}", addr);

    let router = create_router(state);
    axum::serve(listener, router)
        .await
        .map_err(|e| ql_common::Error::internal(format!("server error: {}", e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ql_diagnostics::DiagnosticsEngine;
    use ql_supervisor::{ConfigStore, ScheduleStateStore, Scheduler, Supervisor};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serve_answers_status_over_tcp() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigStore::open(dir.path()).await.unwrap();
        let schedule_state = ScheduleStateStore::open(dir.path()).await.unwrap();
        let diagnostics = DiagnosticsEngine::new(dir.path());
        let supervisor = Supervisor::new(config, schedule_state, diagnostics);
        let scheduler = Scheduler::new(Arc::clone(&supervisor));
        let state = AppState::new(supervisor, scheduler);

        // Pick a free port, then serve on it in the background.
        let probe = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let handle = tokio::spawn(serve(state, port));
        tokio::time::sleep(Duration::from_millis(200)).await;

        let url = format!("http://localhost:{}/api/status", port);
        let data = ql_health::probe_once(&url, Duration::from_secs(2)).await;
        assert!(data.responded);
        assert_eq!(data.status_code, Some(200));

        handle.abort();
    }
}
