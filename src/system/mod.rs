//! OS process helpers shared by the worker runtime and the readiness gate.

use std::time::Duration;

use tokio::process::Child;
use tracing::{debug, warn};

/// Exit code 128 + signal number, as reported by shells for signalled children.
pub const SIGINT_EXIT_CODE: i32 = 130;
pub const SIGKILL_EXIT_CODE: i32 = 137;
pub const SIGTERM_EXIT_CODE: i32 = 143;

/// Ask the process group led by `pid` to terminate (SIGTERM).
///
/// Children are spawned as group leaders, so this also reaches anything
/// they forked. Returns false when no signal could be delivered.
pub fn send_terminate(pid: u32) -> bool {
    #[cfg(unix)]
    {
        let pid = pid as libc::pid_t;
        // Group first, then the leader alone in case it left its group.
        let group = unsafe { libc::kill(-pid, libc::SIGTERM) } == 0;
        let leader = unsafe { libc::kill(pid, libc::SIGTERM) } == 0;
        group || leader
    }
    #[cfg(not(unix))]
    {
        let _ = pid;
        false
    }
}

/// SIGKILL the process group led by `pid`. No-op off unix.
pub fn kill_group(pid: u32) {
    #[cfg(unix)]
    unsafe {
        libc::kill(-(pid as libc::pid_t), libc::SIGKILL);
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Gracefully terminate a child process.
///
/// Sends SIGTERM first, waits up to `grace`, then force kills the child and
/// its process group. Returns true when the child exited within the grace
/// period.
pub async fn terminate_child(child: &mut Child, grace: Duration) -> bool {
    let pid = child.id();
    let signalled = pid.map(send_terminate).unwrap_or(false);

    if signalled {
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(exit_code = status.code(), "child exited after SIGTERM");
                return true;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "error waiting for child after SIGTERM");
            }
            Err(_) => {
                warn!(?pid, "child did not exit after SIGTERM, sending SIGKILL");
            }
        }
    }

    if let Some(pid) = pid {
        kill_group(pid);
    }
    if let Err(e) = child.kill().await {
        debug!(error = %e, "failed to SIGKILL child (already exited?)");
    }
    false
}
