//! Bidirectional byte relay between our stdio and the PTY master.
//!
//! Single-threaded: one bounded multiplexed wait per iteration, followed by a
//! non-blocking reap check. Bytes pass through untouched in both directions.

use super::child::{ChildProcess, ReapPoll};
use super::io::{
    preview_bytes, read_chunk, should_retry_read_error, try_write, wait_ready, write_all, Watch,
    CHUNK_SIZE,
};
use crate::{log_debug, log_debug_content};
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::os::unix::io::RawFd;
use std::process::ExitStatus;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Upper bound on reading leftover output once the child is known to be done.
const DRAIN_BUDGET: Duration = Duration::from_millis(250);
const CONTENT_PREVIEW_BYTES: usize = 64;
/// Stdin is not read again while this much input is still queued for the terminal.
pub(crate) const INPUT_MAX_BUFFER_BYTES: usize = 256 * 1024;
/// Non-blocking master writes attempted per flush before returning to the wait.
const INPUT_FLUSH_ATTEMPTS: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayPhase {
    Running,
    /// Upstream stdin hit end-of-stream; output keeps flowing.
    StdinHalfClosed,
    /// Terminal closed or child reaped; flushing what is left on the master.
    Draining,
    Done,
}

/// Why the loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayExit {
    /// Reaped by the in-loop non-blocking check.
    ChildExited,
    /// Master read returned end-of-stream or an error.
    TerminalClosed,
    /// Writing child output to our stdout failed.
    OutputFailed,
    /// Forwarding stdin bytes to the master failed.
    InputForwardFailed,
    /// Reading our own stdin failed.
    InputFailed,
    /// The multiplexed wait failed or reported a closed descriptor.
    WaitFailed,
    /// Termination signal received.
    Interrupted,
    /// The child can no longer be waited on.
    ChildLost,
}

/// Mutable relay state shared with the cleanup step.
#[derive(Debug, Clone, Copy)]
pub struct RelayState {
    pub phase: RelayPhase,
    pub child_alive: bool,
    pub stdin_open: bool,
}

impl Default for RelayState {
    fn default() -> Self {
        Self {
            phase: RelayPhase::Running,
            child_alive: true,
            stdin_open: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RelayOutcome {
    pub exit: RelayExit,
    pub state: RelayState,
    /// Status captured by the in-loop reap, authoritative for the exit code.
    pub status: Option<ExitStatus>,
    pub bytes_to_terminal: u64,
    pub bytes_from_terminal: u64,
}

/// Descriptors on our side of the relay.
#[derive(Debug, Clone, Copy)]
pub struct RelayEndpoints {
    pub input_fd: RawFd,
    pub output_fd: RawFd,
}

impl RelayEndpoints {
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            input_fd: libc::STDIN_FILENO,
            output_fd: libc::STDOUT_FILENO,
        }
    }
}

pub(crate) struct Relay<'a> {
    master_fd: RawFd,
    endpoints: RelayEndpoints,
    poll_interval: Duration,
    stop: &'a AtomicBool,
    state: RelayState,
    exit: Option<RelayExit>,
    bytes_to_terminal: u64,
    bytes_from_terminal: u64,
    // Stdin bytes the master has not accepted yet, oldest first.
    pending_input: VecDeque<Vec<u8>>,
    pending_input_offset: usize,
    pending_input_bytes: usize,
    buf: Box<[u8; CHUNK_SIZE]>,
}

impl<'a> Relay<'a> {
    pub(crate) fn new(
        master_fd: RawFd,
        endpoints: RelayEndpoints,
        poll_interval: Duration,
        stop: &'a AtomicBool,
    ) -> Self {
        Self {
            master_fd,
            endpoints,
            poll_interval,
            stop,
            state: RelayState::default(),
            exit: None,
            bytes_to_terminal: 0,
            bytes_from_terminal: 0,
            pending_input: VecDeque::new(),
            pending_input_offset: 0,
            pending_input_bytes: 0,
            buf: Box::new([0u8; CHUNK_SIZE]),
        }
    }

    /// Relay until the child exits, the terminal closes, an I/O error occurs,
    /// or `stop` is raised.
    pub(crate) fn run(mut self, child: &mut ChildProcess) -> RelayOutcome {
        while self.relaying() {
            if self.stop.load(Ordering::SeqCst) {
                log_debug("termination requested; leaving relay loop");
                self.state.child_alive = false;
                self.finish(RelayExit::Interrupted);
                break;
            }

            self.wait_and_pump();

            if self.relaying() {
                self.check_child(child);
            }
        }

        if self.state.phase == RelayPhase::Draining {
            self.drain_terminal();
            // A terminal close usually means the child is on its way out.
            if child.status().is_none() {
                if let ReapPoll::Exited(_) = child.try_reap() {
                    self.state.child_alive = false;
                }
            }
            self.state.phase = RelayPhase::Done;
        }

        if self.pending_input_bytes > 0 {
            log_debug(&format!(
                "dropping {} stdin bytes the terminal never accepted",
                self.pending_input_bytes
            ));
        }

        RelayOutcome {
            exit: self.exit.unwrap_or(RelayExit::ChildLost),
            state: self.state,
            status: child.status(),
            bytes_to_terminal: self.bytes_to_terminal,
            bytes_from_terminal: self.bytes_from_terminal,
        }
    }

    fn watching_input(&self) -> bool {
        self.state.stdin_open
            && self.state.phase == RelayPhase::Running
            && self.pending_input_bytes < INPUT_MAX_BUFFER_BYTES
    }

    fn relaying(&self) -> bool {
        matches!(
            self.state.phase,
            RelayPhase::Running | RelayPhase::StdinHalfClosed
        )
    }

    fn finish(&mut self, exit: RelayExit) {
        tracing::debug!(exit = ?exit, "relay stopping");
        self.state.phase = RelayPhase::Done;
        self.exit.get_or_insert(exit);
    }

    fn start_draining(&mut self, exit: RelayExit) {
        tracing::debug!(exit = ?exit, "relay draining terminal");
        self.state.phase = RelayPhase::Draining;
        self.exit.get_or_insert(exit);
    }

    fn wait_and_pump(&mut self) {
        // The master is read every pass, so a child echoing our input never stalls it.
        let mut watches = vec![Watch::read_write(
            self.master_fd,
            self.pending_input_bytes > 0,
        )];
        let input_watched = self.watching_input();
        if input_watched {
            watches.push(Watch::read(self.endpoints.input_fd));
        }

        let ready = match wait_ready(&watches, self.poll_interval) {
            Ok(ready) => ready,
            // A signal landed; the stop flag is checked on the next pass.
            Err(err) if err.kind() == ErrorKind::Interrupted => return,
            Err(err) => {
                log_debug(&format!("poll failed: {err}"));
                self.finish(RelayExit::WaitFailed);
                return;
            }
        };

        if ready.iter().any(|r| r.invalid) {
            log_debug("relay descriptor closed while waiting");
            self.finish(RelayExit::WaitFailed);
            return;
        }

        let master = ready.first().copied().unwrap_or_default();
        if master.readable {
            self.pump_terminal_output();
        }
        if master.writable && self.relaying() && !self.flush_pending_input() {
            self.finish(RelayExit::InputForwardFailed);
            return;
        }
        let input_ready = input_watched && ready.get(1).is_some_and(|r| r.readable);
        if input_ready && self.watching_input() {
            self.pump_input();
        }
    }

    /// Master -> our stdout.
    fn pump_terminal_output(&mut self) {
        match read_chunk(self.master_fd, &mut self.buf[..]) {
            Ok(0) => {
                log_debug("terminal reached end-of-stream");
                self.start_draining(RelayExit::TerminalClosed);
            }
            Ok(n) => {
                self.forward_output(n);
            }
            Err(err) if should_retry_read_error(&err) => {}
            Err(err) => {
                // Linux reports EIO once every slave descriptor is closed.
                log_debug(&format!("terminal read ended: {err}"));
                self.start_draining(RelayExit::TerminalClosed);
            }
        }
    }

    fn forward_output(&mut self, n: usize) -> bool {
        let data = &self.buf[..n];
        log_debug_content(&format!(
            "terminal -> stdout ({n} bytes): {}",
            preview_bytes(data, CONTENT_PREVIEW_BYTES)
        ));
        if let Err(err) = write_all(self.endpoints.output_fd, data) {
            log_debug(&format!("stdout write failed: {err:#}"));
            self.finish(RelayExit::OutputFailed);
            return false;
        }
        self.bytes_from_terminal += n as u64;
        true
    }

    /// Our stdin -> master.
    fn pump_input(&mut self) {
        match read_chunk(self.endpoints.input_fd, &mut self.buf[..]) {
            Ok(0) => {
                // Upstream closed stdin. Keep the terminal open; the child may still talk.
                log_debug("stdin closed upstream; relaying output only");
                self.state.stdin_open = false;
                self.state.phase = RelayPhase::StdinHalfClosed;
            }
            Ok(n) => {
                log_debug_content(&format!(
                    "stdin -> terminal ({n} bytes): {}",
                    preview_bytes(&self.buf[..n], CONTENT_PREVIEW_BYTES)
                ));
                if !self.write_or_queue_input(n) {
                    self.finish(RelayExit::InputForwardFailed);
                }
            }
            Err(err) if should_retry_read_error(&err) => {}
            Err(err) => {
                log_debug(&format!("stdin read failed: {err}"));
                self.finish(RelayExit::InputFailed);
            }
        }
    }

    /// Write the first `n` bytes of the buffer to the master without blocking.
    /// Whatever the master does not take is queued behind earlier pending input.
    ///
    /// Returns `false` on a write error that is not retryable.
    fn write_or_queue_input(&mut self, n: usize) -> bool {
        let mut written = 0;
        if self.pending_input.is_empty() {
            match try_write(self.master_fd, &self.buf[..n]) {
                Ok(count) => written = count,
                Err(err) if should_retry_read_error(&err) => {}
                Err(err) => {
                    log_debug(&format!("terminal write failed: {err}"));
                    return false;
                }
            }
        }
        self.bytes_to_terminal += written as u64;
        if written < n {
            self.pending_input.push_back(self.buf[written..n].to_vec());
            self.pending_input_bytes += n - written;
        }
        true
    }

    /// Push queued input into the master until it would block.
    ///
    /// Returns `false` on a write error that is not retryable.
    fn flush_pending_input(&mut self) -> bool {
        let mut attempts = 0;
        while attempts < INPUT_FLUSH_ATTEMPTS {
            let Some(front) = self.pending_input.front() else {
                break;
            };
            let front_len = front.len();
            if self.pending_input_offset >= front_len {
                self.pending_input.pop_front();
                self.pending_input_offset = 0;
                continue;
            }
            attempts += 1;
            match try_write(self.master_fd, &front[self.pending_input_offset..]) {
                Ok(written) => {
                    self.pending_input_offset += written;
                    self.pending_input_bytes = self.pending_input_bytes.saturating_sub(written);
                    self.bytes_to_terminal += written as u64;
                }
                Err(err) if should_retry_read_error(&err) => break,
                Err(err) => {
                    log_debug(&format!("terminal write failed: {err}"));
                    return false;
                }
            }
        }
        if self.pending_input.is_empty() {
            self.pending_input_offset = 0;
            self.pending_input_bytes = 0;
        }
        true
    }

    fn check_child(&mut self, child: &mut ChildProcess) {
        match child.try_reap() {
            ReapPoll::Running => {}
            ReapPoll::Exited(status) => {
                log_debug(&format!("child exited in relay loop: {status}"));
                self.state.child_alive = false;
                self.start_draining(RelayExit::ChildExited);
            }
            ReapPoll::Gone => {
                self.state.child_alive = false;
                self.finish(RelayExit::ChildLost);
            }
        }
    }

    /// Flush output still buffered on the master after the child is done.
    fn drain_terminal(&mut self) {
        let start = Instant::now();
        while start.elapsed() < DRAIN_BUDGET {
            match read_chunk(self.master_fd, &mut self.buf[..]) {
                Ok(0) => break,
                Ok(n) => {
                    if !self.forward_output(n) {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                // WouldBlock: nothing buffered; EIO: slave fully closed.
                Err(_) => break,
            }
        }
    }
}
