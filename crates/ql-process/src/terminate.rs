//! Process-tree termination.
//!
//! Managed apps routinely spawn their own children (package-manager
//! launchers, bundler workers), so termination always targets the tree.

use ql_common::{Error, Result};
use tracing::debug;

/// Forcibly terminate a process and all of its descendants.
///
/// On Unix the process group is signalled (children spawned by the
/// supervisor lead their own group); if the group signal fails the PID is
/// signalled directly. On Windows this delegates to `taskkill /T /F`.
pub async fn kill_process_tree(pid: u32) -> Result<()> {
    #[cfg(unix)]
    {
        kill_process_tree_unix(pid)
    }

    #[cfg(windows)]
    {
        kill_process_tree_windows(pid).await
    }
}

#[cfg(unix)]
fn kill_process_tree_unix(pid: u32) -> Result<()> {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    // Negative PID addresses the whole process group.
    let group = Pid::from_raw(-(pid as i32));
    match kill(group, Signal::SIGKILL) {
        Ok(()) => {
            debug!("Killed process group {}", pid);
            return Ok(());
        }
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => {
            debug!("Group kill for {} failed ({}), falling back to PID", pid, e);
        }
    }

    match kill(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => Ok(()),
        Err(e) => Err(Error::internal(format!(
            "Failed to kill process {}: {}",
            pid, e
        ))),
    }
}

#[cfg(windows)]
async fn kill_process_tree_windows(pid: u32) -> Result<()> {
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let output = tokio::process::Command::new("taskkill")
        .args(["/PID", &pid.to_string(), "/T", "/F"])
        .creation_flags(CREATE_NO_WINDOW)
        .output()
        .await?;

    if output.status.success() {
        debug!("taskkill terminated process tree {}", pid);
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        // "not found" means the tree already exited; treat as success.
        if stderr.contains("not found") {
            Ok(())
        } else {
            Err(Error::internal(format!(
                "taskkill failed for PID {}: {}",
                pid,
                stderr.trim()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(unix)]
    async fn test_kill_spawned_process() {
        let argv = vec!["sleep".to_string(), "30".to_string()];
        let mut child =
            crate::spawn::spawn_app_command("victim", &argv, std::path::Path::new(".")).unwrap();
        let pid = child.id().unwrap();

        kill_process_tree(pid).await.unwrap();

        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    #[cfg(unix)]
    async fn test_kill_nonexistent_process_is_ok() {
        // A PID in this range is extremely unlikely to exist.
        assert!(kill_process_tree(4_000_000).await.is_ok());
    }
}
