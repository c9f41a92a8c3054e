//! Port occupancy probing and blocking-process identification.
//!
//! Occupancy is observed by attempting to bind the port locally; the
//! process bound to a port is attributed by parsing the local tooling
//! (`netstat`/`tasklist` on Windows, `lsof`/`ss` on Unix). Attribution is
//! best-effort and returns `None` when the tooling is unavailable.

use std::net::TcpListener;
use std::time::Duration;
use tracing::{debug, warn};

/// A process identified as the owner of a bound port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    pub pid: u32,
    pub name: String,
}

/// Check whether a local TCP port is currently bound.
///
/// A bind attempt on `127.0.0.1:<port>` is the source of truth:
/// `AddrInUse` means occupied. Other bind errors (e.g. permission denied
/// on privileged ports) are also treated as unavailable.
pub fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => true,
        Err(e) => {
            debug!("Bind probe on port {} failed ({}), treating as in use", port, e);
            true
        }
    }
}

/// Identify the process bound to `port`, if the platform tooling allows it.
pub async fn identify_port_owner(port: u16) -> Option<PortOwner> {
    #[cfg(unix)]
    {
        identify_port_owner_unix(port).await
    }

    #[cfg(windows)]
    {
        identify_port_owner_windows(port).await
    }
}

#[cfg(unix)]
async fn identify_port_owner_unix(port: u16) -> Option<PortOwner> {
    // lsof prints one PID per line with -t
    let output = tokio::process::Command::new("lsof")
        .args(["-ti", &format!(":{}", port), "-sTCP:LISTEN"])
        .output()
        .await
        .ok()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    let pid: u32 = stdout.lines().next()?.trim().parse().ok()?;

    let name = process_name_unix(pid).await.unwrap_or_else(|| "unknown".to_string());
    Some(PortOwner { pid, name })
}

#[cfg(unix)]
async fn process_name_unix(pid: u32) -> Option<String> {
    let output = tokio::process::Command::new("ps")
        .args(["-p", &pid.to_string(), "-o", "comm="])
        .output()
        .await
        .ok()?;

    let name = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(windows)]
async fn identify_port_owner_windows(port: u16) -> Option<PortOwner> {
    let output = hidden_command("netstat", &["-ano"]).output().await.ok()?;

    let needle = format!(":{}", port);
    let stdout = String::from_utf8_lossy(&output.stdout);
    let pid: u32 = stdout
        .lines()
        .filter(|line| line.contains("LISTENING"))
        .find(|line| {
            // Local address column, e.g. "0.0.0.0:5173" or "[::]:5173"
            line.split_whitespace()
                .nth(1)
                .map(|addr| addr.ends_with(&needle))
                .unwrap_or(false)
        })
        .and_then(|line| line.split_whitespace().last())
        .and_then(|pid| pid.parse().ok())?;

    let name = process_name_windows(pid)
        .await
        .unwrap_or_else(|| "unknown".to_string());
    Some(PortOwner { pid, name })
}

#[cfg(windows)]
async fn process_name_windows(pid: u32) -> Option<String> {
    let filter = format!("PID eq {}", pid);
    let output = hidden_command("tasklist", &["/FI", &filter, "/FO", "CSV", "/NH"])
        .output()
        .await
        .ok()?;

    // CSV row: "name.exe","1234",...
    let stdout = String::from_utf8_lossy(&output.stdout);
    let first_field = stdout.lines().next()?.split(',').next()?;
    let name = first_field.trim_matches('"').to_string();
    if name.is_empty() {
        None
    } else {
        Some(name)
    }
}

#[cfg(windows)]
fn hidden_command(program: &str, args: &[&str]) -> tokio::process::Command {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;
    let mut cmd = tokio::process::Command::new(program);
    cmd.args(args).creation_flags(CREATE_NO_WINDOW);
    cmd
}

/// Forcibly terminate the process tree bound to `port`.
///
/// Returns `true` when the port is observed free afterwards.
pub async fn free_port(port: u16) -> bool {
    let Some(owner) = identify_port_owner(port).await else {
        warn!("Cannot free port {}: owning process not identifiable", port);
        return !is_port_in_use(port);
    };

    debug!(
        "Freeing port {} by terminating {} (PID {})",
        port, owner.name, owner.pid
    );

    if let Err(e) = crate::terminate::kill_process_tree(owner.pid).await {
        warn!("Failed to terminate PID {} on port {}: {}", owner.pid, port, e);
        return false;
    }

    // The socket is released asynchronously after the kill.
    for _ in 0..10 {
        if !is_port_in_use(port) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    !is_port_in_use(port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_port_is_not_in_use() {
        // Bind to an ephemeral port, note it, release it, then probe.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        assert!(!is_port_in_use(port));
    }

    #[test]
    fn test_bound_port_is_in_use() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port));
        drop(listener);
    }
}
