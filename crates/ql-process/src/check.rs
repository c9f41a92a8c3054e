//! Process existence checking.

use ql_common::Result;

/// Check if a process with the given PID exists and is running.
///
/// Non-destructive: on Unix it uses `kill(pid, 0)`, which delivers no
/// signal but reports whether the process exists. On Windows it queries
/// `tasklist` for the PID.
pub fn process_exists(pid: u32) -> Result<bool> {
    #[cfg(unix)]
    {
        process_exists_unix(pid)
    }

    #[cfg(windows)]
    {
        process_exists_windows(pid)
    }
}

#[cfg(unix)]
fn process_exists_unix(pid: u32) -> Result<bool> {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid as i32), None) {
        Ok(_) => Ok(true),
        Err(nix::errno::Errno::ESRCH) => Ok(false),
        // Process exists but belongs to another user
        Err(nix::errno::Errno::EPERM) => Ok(true),
        Err(e) => Err(ql_common::Error::internal(format!(
            "Failed to check process {}: {}",
            pid, e
        ))),
    }
}

#[cfg(windows)]
fn process_exists_windows(pid: u32) -> Result<bool> {
    use std::os::windows::process::CommandExt;
    const CREATE_NO_WINDOW: u32 = 0x0800_0000;

    let filter = format!("PID eq {}", pid);
    let output = std::process::Command::new("tasklist")
        .args(["/FI", &filter, "/FO", "CSV", "/NH"])
        .creation_flags(CREATE_NO_WINDOW)
        .output()?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.contains(&format!("\"{}\"", pid)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_exists() {
        let current_pid = std::process::id();
        assert!(process_exists(current_pid).unwrap());
    }

    #[test]
    #[cfg(unix)]
    fn test_init_process_exists() {
        assert!(process_exists(1).unwrap());
    }
}
