//! Child process handle: reaps exactly once and maps the status to our exit code.

use crate::log_debug;
use crate::process_signal::{signal_child, SignalDelivery};
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::ExitStatus;
use std::thread;
use std::time::{Duration, Instant};

/// Exit code used whenever the child did not exit normally.
pub const ABNORMAL_EXIT_CODE: i32 = 1;

const REAP_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Non-blocking reap result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReapPoll {
    Running,
    Exited(ExitStatus),
    /// `waitpid` reported `ECHILD`: the status is unobtainable.
    Gone,
}

#[derive(Debug)]
pub(crate) struct ChildProcess {
    pid: i32,
    status: Option<ExitStatus>,
    gone: bool,
}

impl ChildProcess {
    pub(crate) fn new(pid: i32) -> Self {
        Self {
            pid,
            status: None,
            gone: pid <= 0,
        }
    }

    pub(crate) fn pid(&self) -> i32 {
        self.pid
    }

    /// Status recorded by an earlier reap.
    pub(crate) fn status(&self) -> Option<ExitStatus> {
        self.status
    }

    /// True once the child is reaped or known to be unwaitable.
    pub(crate) fn is_settled(&self) -> bool {
        self.status.is_some() || self.gone
    }

    /// `waitpid(WNOHANG)`. A recorded status is returned again without re-waiting.
    pub(crate) fn try_reap(&mut self) -> ReapPoll {
        if let Some(status) = self.status {
            return ReapPoll::Exited(status);
        }
        if self.gone {
            return ReapPoll::Gone;
        }
        let mut raw = 0;
        // SAFETY: pid is our own child; WNOHANG never blocks.
        let ret = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
        if ret > 0 {
            let status = ExitStatus::from_raw(raw);
            self.status = Some(status);
            return ReapPoll::Exited(status);
        }
        if ret == 0 {
            return ReapPoll::Running;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            return ReapPoll::Running;
        }
        log_debug(&format!("waitpid({}, WNOHANG) failed: {err}", self.pid));
        self.gone = true;
        ReapPoll::Gone
    }

    /// Poll for exit for up to `timeout`.
    pub(crate) fn wait_timeout(&mut self, timeout: Duration) -> ReapPoll {
        let start = Instant::now();
        loop {
            let poll = self.try_reap();
            if poll != ReapPoll::Running || start.elapsed() >= timeout {
                return poll;
            }
            thread::sleep(REAP_POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
        }
    }

    /// Blocking `waitpid`, retried on `EINTR`.
    pub(crate) fn wait_blocking(&mut self) -> Option<ExitStatus> {
        if self.is_settled() {
            return self.status;
        }
        loop {
            let mut raw = 0;
            // SAFETY: pid is our own child and has not been reaped yet.
            let ret = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if ret > 0 {
                let status = ExitStatus::from_raw(raw);
                self.status = Some(status);
                return Some(status);
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            log_debug(&format!("waitpid({}) failed: {err}", self.pid));
            self.gone = true;
            return None;
        }
    }

    /// Send `signal` unless the child is already settled. Absence is not an error.
    pub(crate) fn signal(&self, signal: i32) {
        if self.is_settled() {
            return;
        }
        match signal_child(self.pid, signal) {
            Ok(SignalDelivery::Delivered) => {
                log_debug(&format!("sent signal {signal} to child {}", self.pid));
            }
            Ok(SignalDelivery::AlreadyGone) => {}
            Err(err) => log_debug(&format!("signal {signal} to child failed: {err}")),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL and wait without bound.
    pub(crate) fn terminate_and_reap(&mut self, grace: Duration) -> Option<ExitStatus> {
        if self.is_settled() {
            return self.status;
        }
        self.signal(libc::SIGTERM);
        if self.wait_timeout(grace) == ReapPoll::Running {
            log_debug(&format!(
                "child {} ignored SIGTERM for {grace:?}; sending SIGKILL",
                self.pid
            ));
            self.signal(libc::SIGKILL);
        }
        self.wait_blocking()
    }
}

/// Map a final child status to the supervisor's exit code.
///
/// A normal exit propagates its code; signals and unknown status become 1.
#[must_use]
pub fn exit_code_for(status: Option<ExitStatus>) -> i32 {
    status
        .and_then(|status| status.code())
        .unwrap_or(ABNORMAL_EXIT_CODE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;
    use std::process::Command;

    fn spawn_sh(script: &str) -> ChildProcess {
        let child = Command::new("/bin/sh")
            .arg("-c")
            .arg(script)
            .spawn()
            .expect("spawn sh");
        ChildProcess::new(child.id() as i32)
    }

    #[rstest]
    #[case(0)]
    #[case(3)]
    #[case(42)]
    #[case(255)]
    fn reaped_exit_code_is_propagated(#[case] code: i32) {
        let mut child = spawn_sh(&format!("exit {code}"));
        let status = child.wait_blocking();
        assert_eq!(exit_code_for(status), code);
    }

    #[test]
    fn signal_termination_maps_to_abnormal_code() {
        let mut child = spawn_sh("kill -TERM $$; sleep 5");
        let status = child.wait_blocking().expect("status");
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        assert_eq!(exit_code_for(Some(status)), ABNORMAL_EXIT_CODE);
    }

    #[test]
    fn unknown_status_maps_to_abnormal_code() {
        assert_eq!(exit_code_for(None), ABNORMAL_EXIT_CODE);
    }

    #[test]
    fn try_reap_reports_running_then_exited_once() {
        let mut child = spawn_sh("sleep 0.2; exit 7");
        assert_eq!(child.try_reap(), ReapPoll::Running);
        let poll = child.wait_timeout(Duration::from_secs(5));
        let ReapPoll::Exited(status) = poll else {
            panic!("child should have exited, got {poll:?}");
        };
        assert_eq!(status.code(), Some(7));
        // The recorded status stays authoritative; no second waitpid happens.
        assert_eq!(child.try_reap(), ReapPoll::Exited(status));
        assert_eq!(child.wait_blocking(), Some(status));
        assert!(child.is_settled());
    }

    #[test]
    fn wait_timeout_gives_up_on_running_child() {
        let mut child = spawn_sh("sleep 5");
        assert_eq!(
            child.wait_timeout(Duration::from_millis(50)),
            ReapPoll::Running
        );
        let status = child.terminate_and_reap(Duration::from_secs(2));
        assert_eq!(exit_code_for(status), ABNORMAL_EXIT_CODE);
    }

    #[test]
    fn terminate_escalates_to_sigkill() {
        let mut child = spawn_sh("trap '' TERM; sleep 5");
        // Give the shell time to install the trap.
        thread::sleep(Duration::from_millis(100));
        let status = child
            .terminate_and_reap(Duration::from_millis(100))
            .expect("status");
        assert_eq!(status.signal(), Some(libc::SIGKILL));
    }

    #[test]
    fn foreign_pid_is_gone_not_fatal() {
        // pid 1 is never our child.
        let mut child = ChildProcess::new(1);
        assert_eq!(child.try_reap(), ReapPoll::Gone);
        assert_eq!(child.wait_blocking(), None);
        assert_eq!(exit_code_for(child.status()), ABNORMAL_EXIT_CODE);
    }

    #[test]
    fn invalid_pid_starts_settled() {
        let mut child = ChildProcess::new(-1);
        assert!(child.is_settled());
        assert_eq!(child.terminate_and_reap(Duration::from_millis(10)), None);
    }

    proptest! {
        #[test]
        fn normal_exit_codes_round_trip(code in 0i32..=255) {
            let status = ExitStatus::from_raw(code << 8);
            prop_assert_eq!(exit_code_for(Some(status)), code);
        }

        #[test]
        fn signalled_statuses_are_abnormal(signal in 1i32..=31) {
            let status = ExitStatus::from_raw(signal);
            prop_assert_eq!(exit_code_for(Some(status)), ABNORMAL_EXIT_CODE);
        }
    }
}
