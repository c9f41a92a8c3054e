use anyhow::Result;
use clap::Parser;
use ql_diagnostics::DiagnosticsEngine;
use ql_server::AppState;
use ql_supervisor::{ConfigStore, ScheduleStateStore, Scheduler, Supervisor, SUPERVISOR_PORT};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// QuickLaunch - local development-process supervisor
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Working directory for config, state, and logs (defaults to cwd)
    #[arg(short = 'd', long, value_name = "DIR")]
    dir: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long, default_value_t = SUPERVISOR_PORT)]
    port: u16,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    initialize_logging(args.debug);

    let dir = match args.dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    info!("Starting QuickLaunch supervisor in {}", dir.display());

    let config = ConfigStore::open(&dir).await?;
    let schedule_state = ScheduleStateStore::open(&dir).await?;
    let diagnostics = DiagnosticsEngine::new(&dir);

    let supervisor = Supervisor::new(config, schedule_state, diagnostics);
    info!(
        "Loaded configuration for {} app(s)",
        supervisor.config.snapshot().apps.len()
    );

    let scheduler = Scheduler::new(Arc::clone(&supervisor));
    scheduler.run_missed();
    scheduler.install_all();

    let state = AppState::new(supervisor, scheduler);
    let server = tokio::spawn(ql_server::serve(state, args.port));

    shutdown_signal().await;
    info!("Shutting down QuickLaunch supervisor");
    server.abort();

    Ok(())
}

fn initialize_logging(debug: bool) {
    let level = if debug { "debug" } else { "info" };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_target(false)
        .init();
}

async fn shutdown_signal() {
    use tokio::signal;

    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
            .expect("failed to install SIGINT handler");

        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
    }

    #[cfg(windows)]
    {
        let _ = signal::ctrl_c().await;
        info!("Received Ctrl+C");
    }
}
