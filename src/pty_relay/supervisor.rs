//! Supervisor lifecycle: allocate, spawn, relay, then clean up on every exit path.

use super::child::{exit_code_for, ChildProcess, ReapPoll, ABNORMAL_EXIT_CODE};
use super::launch::LaunchSpec;
use super::pty::{TerminalMaster, TerminalPair};
use super::relay::{Relay, RelayEndpoints, RelayExit, RelayOutcome};
use super::signals::TerminationRelay;
use super::spawn::spawn_on_terminal;
use crate::config::RelayConfig;
use crate::log_debug;
use anyhow::{Context, Result};
use std::process::ExitStatus;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Timing knobs for one supervisor run.
#[derive(Debug, Clone, Copy)]
pub struct SupervisorOptions {
    pub poll_interval: Duration,
    /// How long a child whose terminal closed may take to exit before SIGTERM.
    pub exit_grace: Duration,
    /// How long after SIGTERM before SIGKILL.
    pub kill_grace: Duration,
}

impl SupervisorOptions {
    #[must_use]
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            exit_grace: config.exit_grace(),
            kill_grace: config.kill_grace(),
        }
    }
}

/// Owns the PTY master and the child for the lifetime of one relay.
///
/// `finish` runs the cleanup sequence; `Drop` runs it too if `finish` never did
/// (for example while unwinding from a panic).
pub(crate) struct Supervisor {
    master: TerminalMaster,
    child: ChildProcess,
    options: SupervisorOptions,
    finished: bool,
}

impl Supervisor {
    /// Allocate the terminal and start the child on it.
    ///
    /// # Errors
    ///
    /// Returns an error if no terminal can be allocated or the fork fails.
    pub(crate) fn start(spec: &LaunchSpec, options: SupervisorOptions) -> Result<Self> {
        let pair = TerminalPair::allocate().context("cannot allocate a pseudo-terminal")?;
        let (master, child) = spawn_on_terminal(pair, spec)
            .with_context(|| format!("cannot start {}", spec.display_name()))?;
        log_debug(&format!(
            "spawned {} as pid {} on master fd {}",
            spec.display_name(),
            child.pid(),
            master.fd()
        ));
        tracing::info!(
            command = spec.display_name(),
            pid = child.pid(),
            "child started on pseudo-terminal"
        );
        Ok(Self {
            master,
            child,
            options,
            finished: false,
        })
    }

    pub(crate) fn child_pid(&self) -> i32 {
        self.child.pid()
    }

    pub(crate) fn relay(&mut self, endpoints: RelayEndpoints, stop: &AtomicBool) -> RelayOutcome {
        let outcome = Relay::new(self.master.fd(), endpoints, self.options.poll_interval, stop)
            .run(&mut self.child);
        log_debug(&format!(
            "relay finished: {:?} (to terminal {} bytes, from terminal {} bytes)",
            outcome.exit, outcome.bytes_to_terminal, outcome.bytes_from_terminal
        ));
        tracing::info!(
            exit = ?outcome.exit,
            bytes_to_terminal = outcome.bytes_to_terminal,
            bytes_from_terminal = outcome.bytes_from_terminal,
            "relay loop finished"
        );
        outcome
    }

    /// Close the master, make sure the child is gone, and resolve our exit code.
    ///
    /// Every step is attempted even if an earlier one fails.
    pub(crate) fn finish(mut self, outcome: &RelayOutcome) -> i32 {
        let status = self.cleanup(Some(outcome.exit));
        let code = exit_code_for(status);
        tracing::info!(exit_code = code, status = ?status, "supervisor finished");
        log_debug(&format!("supervisor exit code {code}"));
        code
    }

    fn cleanup(&mut self, exit: Option<RelayExit>) -> Option<ExitStatus> {
        self.finished = true;

        // 1. No further reads or writes happen on the master past this point.
        if self.master.is_open() {
            log_debug("closing terminal master");
            self.master.close();
        }

        // 2. A child whose terminal just closed is usually exiting on its own.
        if exit == Some(RelayExit::TerminalClosed) && !self.child.is_settled() {
            if let ReapPoll::Exited(status) = self.child.wait_timeout(self.options.exit_grace) {
                log_debug(&format!("child exited after terminal close: {status}"));
            }
        }

        // 3 + 4. Signal if still unconfirmed, then wait; a recorded status wins.
        self.child.terminate_and_reap(self.options.kill_grace)
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.finished {
            log_debug("supervisor dropped without finish; cleaning up");
            let _ = self.cleanup(None);
        }
    }
}

/// Run the configured command under a PTY relayed over our own stdio.
///
/// Returns the exit code the process should terminate with.
pub fn run_supervisor(config: &RelayConfig) -> i32 {
    match run_with_endpoints(config, RelayEndpoints::stdio()) {
        Ok(code) => code,
        Err(err) => {
            log_debug(&format!("supervisor setup failed: {err:#}"));
            tracing::error!(error = %format!("{err:#}"), "supervisor setup failed");
            eprintln!("ptyrelay: {err:#}");
            ABNORMAL_EXIT_CODE
        }
    }
}

/// Same as [`run_supervisor`] with explicit relay descriptors.
///
/// # Errors
///
/// Returns an error for configuration, allocation, fork, or handler setup failures.
/// Anything after the child starts is folded into the returned exit code.
pub fn run_with_endpoints(config: &RelayConfig, endpoints: RelayEndpoints) -> Result<i32> {
    let spec = LaunchSpec::from_config(config)?;
    let options = SupervisorOptions::from_config(config);

    let termination = TerminationRelay::install()?;
    let mut supervisor = Supervisor::start(&spec, options)?;
    termination.attach_child(supervisor.child_pid());

    let outcome = supervisor.relay(endpoints, termination.flag());
    let code = supervisor.finish(&outcome);
    termination.detach_child();
    drop(termination);
    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pty_relay::io::{read_chunk, write_all};
    use crate::pty_relay::pty::close_fd;
    use crate::env_lock;
    use crate::pty_relay::signals::signal_test_lock;
    use clap::Parser;
    use std::ffi::OsString;
    use std::io;
    use std::os::unix::io::RawFd;
    use std::time::Instant;

    fn pipe_pair() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let result = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) };
        assert_eq!(result, 0, "pipe() failed: {}", io::Error::last_os_error());
        (fds[0], fds[1])
    }

    fn read_all(fd: RawFd) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 256];
        while let Ok(n) = read_chunk(fd, &mut buf) {
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&out).into_owned()
    }

    fn sh_config(script: &str) -> RelayConfig {
        let args = shell_words::join(["-c", script]);
        RelayConfig::parse_from([
            "ptyrelay",
            "--command",
            "/bin/sh",
            "--command-args",
            args.as_str(),
            "--poll-interval-ms",
            "50",
            "--kill-grace-ms",
            "1000",
        ])
    }

    fn options() -> SupervisorOptions {
        SupervisorOptions {
            poll_interval: Duration::from_millis(50),
            exit_grace: Duration::from_millis(200),
            kill_grace: Duration::from_millis(500),
        }
    }

    fn sh_spec(script: &str) -> LaunchSpec {
        let vars: Vec<(OsString, OsString)> = vec![("PATH".into(), "/bin:/usr/bin".into())];
        LaunchSpec::new("sh", &["-c".to_string(), script.to_string()], "dumb", vars)
            .expect("launch spec")
    }

    #[test]
    fn run_with_endpoints_propagates_exit_code_and_output() {
        // Config parsing and LaunchSpec::from_config both read the environment.
        let _env = env_lock().lock().unwrap_or_else(|p| p.into_inner());
        let _signals = signal_test_lock().lock().unwrap_or_else(|p| p.into_inner());
        let (in_read, in_write) = pipe_pair();
        let (out_read, out_write) = pipe_pair();
        write_all(in_write, b"ABC123\n").unwrap();

        let config = sh_config("printf 'code: '; read line; echo \"got:$line\"; exit 5");
        let code = run_with_endpoints(
            &config,
            RelayEndpoints {
                input_fd: in_read,
                output_fd: out_write,
            },
        )
        .expect("supervisor runs");
        unsafe {
            close_fd(out_write);
            close_fd(in_write);
            close_fd(in_read);
        }
        let text = read_all(out_read);
        unsafe { close_fd(out_read) };

        assert_eq!(code, 5);
        assert!(text.contains("code: "), "output: {text:?}");
        assert!(text.contains("got:ABC123"), "output: {text:?}");
    }

    #[test]
    fn invalid_args_fail_before_spawning() {
        let _env = env_lock().lock().unwrap_or_else(|p| p.into_inner());
        let config = RelayConfig::parse_from(["ptyrelay", "--command-args", "'unbalanced"]);
        let err = run_with_endpoints(&config, RelayEndpoints::stdio()).unwrap_err();
        assert!(err.to_string().contains("invalid command arguments"));
    }

    #[test]
    fn finish_uses_status_recorded_in_loop() {
        let spec = sh_spec("exit 12");
        let mut supervisor = Supervisor::start(&spec, options()).expect("start");
        let start = Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if let ReapPoll::Exited(_) = supervisor.child.try_reap() {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        let recorded = supervisor.child.status().expect("reaped in loop");
        let outcome = RelayOutcome {
            exit: RelayExit::ChildExited,
            state: Default::default(),
            status: Some(recorded),
            bytes_to_terminal: 0,
            bytes_from_terminal: 0,
        };
        assert_eq!(supervisor.finish(&outcome), 12);
    }

    #[test]
    fn finish_terminates_running_child() {
        let spec = sh_spec("trap '' HUP; sleep 30");
        let supervisor = Supervisor::start(&spec, options()).expect("start");
        let pid = supervisor.child_pid();
        let outcome = RelayOutcome {
            exit: RelayExit::Interrupted,
            state: Default::default(),
            status: None,
            bytes_to_terminal: 0,
            bytes_from_terminal: 0,
        };
        assert_eq!(supervisor.finish(&outcome), ABNORMAL_EXIT_CODE);
        // Reaped: the pid no longer names a child of ours.
        let ret = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(ret, -1);
    }

    #[test]
    fn drop_without_finish_still_reaps_child() {
        let spec = sh_spec("sleep 30");
        let supervisor = Supervisor::start(&spec, options()).expect("start");
        let pid = supervisor.child_pid();
        drop(supervisor);
        let ret = unsafe { libc::waitpid(pid, std::ptr::null_mut(), libc::WNOHANG) };
        assert_eq!(ret, -1);
    }
}
