//! SIGTERM relay: forwards the signal to the child and flags the relay loop to unwind.

use crate::log_debug;
use anyhow::{anyhow, Result};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Set by the handler; polled by the relay loop between waits.
static TERMINATION_REQUESTED: AtomicBool = AtomicBool::new(false);
static RELAY_CHILD_PID: AtomicI32 = AtomicI32::new(0);

/// Async-signal-safe: two atomic ops and `kill(2)`, nothing else.
extern "C" fn handle_sigterm(signal: libc::c_int) {
    let pid = RELAY_CHILD_PID.load(Ordering::SeqCst);
    if pid > 0 {
        // SAFETY: kill is async-signal-safe; ESRCH (child already gone) is ignored.
        unsafe {
            if libc::kill(-pid, signal) != 0 {
                let _ = libc::kill(pid, signal);
            }
        }
    }
    TERMINATION_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installed SIGTERM disposition. Dropping it restores the previous handler.
///
/// Install before fork so a signal during startup is still honored; the child's
/// `execve` resets the handler to the default on its side.
pub(crate) struct TerminationRelay {
    previous: libc::sighandler_t,
}

impl TerminationRelay {
    /// # Errors
    ///
    /// Returns an error if the handler cannot be installed.
    pub(crate) fn install() -> Result<Self> {
        TERMINATION_REQUESTED.store(false, Ordering::SeqCst);
        RELAY_CHILD_PID.store(0, Ordering::SeqCst);
        // SAFETY: handle_sigterm only touches atomics and calls kill, both async-signal-safe.
        let previous = unsafe {
            let handler = handle_sigterm as *const () as libc::sighandler_t;
            libc::signal(libc::SIGTERM, handler)
        };
        if previous == libc::SIG_ERR {
            log_debug("failed to install SIGTERM handler");
            return Err(anyhow!("failed to install SIGTERM handler"));
        }
        Ok(Self { previous })
    }

    /// Route future SIGTERMs to `pid`.
    pub(crate) fn attach_child(&self, pid: i32) {
        RELAY_CHILD_PID.store(pid, Ordering::SeqCst);
    }

    /// Stop forwarding; used once the child has been reaped.
    pub(crate) fn detach_child(&self) {
        RELAY_CHILD_PID.store(0, Ordering::SeqCst);
    }

    pub(crate) fn flag(&self) -> &'static AtomicBool {
        &TERMINATION_REQUESTED
    }
}

impl Drop for TerminationRelay {
    fn drop(&mut self) {
        RELAY_CHILD_PID.store(0, Ordering::SeqCst);
        // SAFETY: restores the disposition that was active before install().
        unsafe {
            libc::signal(libc::SIGTERM, self.previous);
        }
    }
}

#[cfg(test)]
pub(crate) fn signal_test_lock() -> &'static std::sync::Mutex<()> {
    static LOCK: std::sync::OnceLock<std::sync::Mutex<()>> = std::sync::OnceLock::new();
    LOCK.get_or_init(|| std::sync::Mutex::new(()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::Command;

    #[test]
    fn handler_forwards_to_attached_child_and_sets_flag() {
        let _guard = signal_test_lock().lock().unwrap_or_else(|p| p.into_inner());
        let relay = TerminationRelay::install().expect("install handler");
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn sleep");
        relay.attach_child(child.id() as i32);

        handle_sigterm(libc::SIGTERM);

        assert!(relay.flag().load(Ordering::SeqCst));
        let status = child.wait().expect("wait sleep");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        drop(relay);
    }

    #[test]
    fn handler_without_child_only_sets_flag() {
        let _guard = signal_test_lock().lock().unwrap_or_else(|p| p.into_inner());
        let relay = TerminationRelay::install().expect("install handler");
        assert!(!relay.flag().load(Ordering::SeqCst));
        relay.detach_child();
        handle_sigterm(libc::SIGTERM);
        assert!(relay.flag().load(Ordering::SeqCst));
    }

    #[test]
    fn drop_restores_previous_disposition() {
        let _guard = signal_test_lock().lock().unwrap_or_else(|p| p.into_inner());
        let before = unsafe { libc::signal(libc::SIGTERM, libc::SIG_DFL) };
        let relay = TerminationRelay::install().expect("install handler");
        drop(relay);
        let after = unsafe { libc::signal(libc::SIGTERM, before) };
        assert_eq!(after, libc::SIG_DFL);
    }
}
