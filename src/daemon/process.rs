//! Host process table helpers.
//!
//! Liveness is decided by looking the pid up in the list of running
//! processes rather than by signalling it; signal checks are unreliable for
//! processes that are not our direct children.

use std::collections::HashSet;
use std::io;
use tracing::{debug, trace, warn};

/// Whether a process with `pid` currently exists (zombies count as gone).
pub fn is_process_running(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    match running_pids() {
        Ok(pids) => {
            let running = pids.contains(&pid);
            trace!(pid, running, "Checked process table");
            running
        }
        Err(e) => {
            warn!(pid, "Failed to enumerate processes: {}", e);
            false
        }
    }
}

#[cfg(target_os = "linux")]
fn running_pids() -> io::Result<HashSet<u32>> {
    let mut pids = HashSet::new();
    for entry in std::fs::read_dir("/proc")?.flatten() {
        let Some(pid) = entry.file_name().to_str().and_then(|s| s.parse::<u32>().ok()) else {
            continue;
        };
        if !is_zombie(pid) {
            pids.insert(pid);
        }
    }
    Ok(pids)
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: "pid (comm) S ..." where comm may contain spaces
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after_comm = stat.rsplit_once(')')?.1;
            after_comm.split_whitespace().next().map(|s| s == "Z")
        })
        .unwrap_or(false)
}

#[cfg(all(unix, not(target_os = "linux")))]
fn running_pids() -> io::Result<HashSet<u32>> {
    let output = std::process::Command::new("ps")
        .args(["-A", "-o", "pid=,stat="])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let zombie = fields.next().is_some_and(|s| s.starts_with('Z'));
            (!zombie).then_some(pid)
        })
        .collect())
}

#[cfg(windows)]
fn running_pids() -> io::Result<HashSet<u32>> {
    let output = std::process::Command::new("tasklist")
        .args(["/FO", "CSV", "/NH"])
        .output()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout
        .lines()
        .filter_map(|line| line.split(',').nth(1))
        .filter_map(|pid| pid.trim_matches('"').parse().ok())
        .collect())
}

/// Forcefully terminate `pid`. Succeeds if the process is already gone.
pub fn kill_process(pid: u32) -> io::Result<()> {
    if !is_process_running(pid) {
        return Ok(());
    }
    debug!(pid, "Killing process");

    #[cfg(unix)]
    {
        let rc = unsafe { libc::kill(pid as i32, libc::SIGKILL) };
        if rc != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(err);
            }
        }
        Ok(())
    }

    #[cfg(windows)]
    {
        let status = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .status()?;
        if !status.success() && is_process_running(pid) {
            return Err(io::Error::other(format!("taskkill failed for pid {pid}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_running() {
        assert!(is_process_running(std::process::id()));
    }

    #[test]
    fn absurd_pid_is_not_running() {
        assert!(!is_process_running(99_999_999));
        assert!(!is_process_running(0));
    }

    #[test]
    fn killing_a_missing_process_is_ok() {
        assert!(kill_process(99_999_999).is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn killed_child_disappears() {
        let mut child = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        let pid = child.id();
        assert!(is_process_running(pid));

        kill_process(pid).unwrap();
        child.wait().unwrap();
        assert!(!is_process_running(pid));
    }
}
