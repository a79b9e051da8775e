//! Process-wide registry of spawned child processes.
//!
//! Every child this crate spawns (the game server and each bot) is tracked
//! here by pid so that crash recovery can force-kill the lot in one call,
//! no matter which worker thread currently owns the actual handle. The
//! registry deliberately does not own the [`Child`](std::process::Child):
//! killing only needs the pid, and the marshal worker needs the handle for
//! `try_wait`/`wait`.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

/// Tracked set of live child processes, shared behind an `Arc`.
///
/// All operations are idempotent: re-tracking a pid overwrites, untracking
/// or killing an unknown (or already dead) pid is a no-op, and
/// [`kill_all`](ProcessRegistry::kill_all) may be called any number of
/// times, including on an empty registry.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: Mutex<HashMap<u32, String>>,
}

impl ProcessRegistry {
    /// Create an empty registry.
    pub fn new() -> ProcessRegistry {
        ProcessRegistry::default()
    }

    /// Record `pid` under a human-readable label (bot name, "q2ded", ...).
    pub fn track(&self, pid: u32, label: &str) {
        let mut guard = self.processes.lock().expect("poisoned");
        guard.insert(pid, label.to_string());
    }

    /// Forget `pid` without killing it. No-op when absent.
    pub fn untrack(&self, pid: u32) {
        let mut guard = self.processes.lock().expect("poisoned");
        guard.remove(&pid);
    }

    /// Best-effort forced termination of `pid`, then untrack it.
    ///
    /// Errors from the OS are ignored: the process may already be gone,
    /// which is exactly the outcome we want.
    pub fn kill(&self, pid: u32) {
        let mut guard = self.processes.lock().expect("poisoned");
        if let Some(label) = guard.remove(&pid) {
            debug!("killing {label} (pid {pid})");
        }
        kill_pid(pid);
    }

    /// Kill every tracked process. Used once per crash recovery to make
    /// sure no orphaned bot or game-server process survives.
    pub fn kill_all(&self) {
        let mut guard = self.processes.lock().expect("poisoned");
        for (pid, label) in guard.drain() {
            debug!("killing {label} (pid {pid})");
            kill_pid(pid);
        }
    }

    /// Number of currently tracked processes.
    pub fn tracked(&self) -> usize {
        self.processes.lock().expect("poisoned").len()
    }
}

#[cfg(unix)]
pub(crate) fn kill_pid(pid: u32) {
    // A pid that does not fit a positive pid_t must never reach kill():
    // kill(-1, SIGKILL) would signal the whole session.
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return;
    };
    if pid <= 0 {
        return;
    }
    unsafe {
        libc::kill(pid, libc::SIGKILL);
    }
}

#[cfg(windows)]
pub(crate) fn kill_pid(pid: u32) {
    use windows_sys::Win32::Foundation::CloseHandle;
    use windows_sys::Win32::System::Threading::{
        OpenProcess, TerminateProcess, PROCESS_TERMINATE,
    };

    unsafe {
        let handle = OpenProcess(PROCESS_TERMINATE, 0, pid);
        if !handle.is_null() {
            TerminateProcess(handle, 1);
            CloseHandle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kill_all_on_empty_registry_is_a_no_op() {
        let registry = ProcessRegistry::new();
        registry.kill_all();
        registry.kill_all();
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn untrack_and_kill_unknown_pid_do_not_error() {
        let registry = ProcessRegistry::new();
        registry.untrack(424242);
        registry.kill(424242);
        assert_eq!(registry.tracked(), 0);
    }

    #[test]
    fn track_is_idempotent_overwrite() {
        let registry = ProcessRegistry::new();
        registry.track(7, "first");
        registry.track(7, "second");
        assert_eq!(registry.tracked(), 1);
        registry.untrack(7);
        assert_eq!(registry.tracked(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn kill_terminates_a_live_process() {
        use std::process::Command;

        let mut child = Command::new("sleep")
            .arg("30")
            .spawn()
            .expect("could not spawn sleep");
        let registry = ProcessRegistry::new();
        registry.track(child.id(), "sleeper");

        registry.kill(child.id());
        let status = child.wait().expect("wait failed");
        assert!(!status.success());
        assert_eq!(registry.tracked(), 0);

        // A second kill of the same (now dead) pid is a no-op.
        registry.kill(child.id());
    }
}
