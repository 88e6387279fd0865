//! Liveness and termination helpers for detached background jobs.

use std::thread;
use std::time::{Duration, Instant};

use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tracing::debug;

/// Check whether a process with the given pid exists, using the null
/// signal. `EPERM` counts as alive (the process exists, we just cannot
/// signal it); `ESRCH` and pids that do not fit in an `i32` count as dead.
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Terminate a background job: SIGTERM first, then SIGKILL if it is still
/// running after `grace`. Returns quietly if the process is already gone.
pub fn terminate_process(pid: u32, grace: Duration) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let target = Pid::from_raw(raw);

    if kill(target, Signal::SIGTERM).is_err() {
        return;
    }
    debug!(pid, "sent SIGTERM to background job");

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(200));
    }

    if is_process_alive(pid) {
        debug!(pid, "job survived SIGTERM, sending SIGKILL");
        let _ = kill(target, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
    }

    #[test]
    fn test_nonexistent_pid_is_dead() {
        assert!(!is_process_alive(999_999_999));
    }

    #[test]
    fn test_overflowing_pid_is_dead() {
        assert!(!is_process_alive(u32::MAX));
    }

    #[test]
    fn test_terminate_kills_sleeping_child() {
        let child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let pid = child.id();
        assert!(is_process_alive(pid));

        terminate_process(pid, Duration::from_secs(2));

        // Reap so the pid does not linger as a zombie (zombies still
        // answer the null signal).
        let mut child = child;
        let _ = child.wait();
        assert!(!is_process_alive(pid));
    }

    #[test]
    fn test_terminate_missing_pid_is_a_no_op() {
        terminate_process(999_999_999, Duration::from_millis(50));
    }
}
