//! Signal delivery to the relayed child and the session it leads.

use std::io;

/// Result of trying to signal a child that may already be gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SignalDelivery {
    Delivered,
    AlreadyGone,
}

/// Signal the child's process group, falling back to the pid itself.
///
/// The child calls `setsid()`, so `-pid` also reaches anything it spawned.
/// A missing target (`ESRCH`) is not an error: the child racing us to exit is expected.
pub(crate) fn signal_child(pid: i32, signal: i32) -> io::Result<SignalDelivery> {
    if pid <= 0 {
        return Ok(SignalDelivery::AlreadyGone);
    }

    // SAFETY: kill takes plain integers; errno is read immediately after each call.
    unsafe {
        if libc::kill(-pid, signal) == 0 {
            return Ok(SignalDelivery::Delivered);
        }
        let group_err = io::Error::last_os_error();

        if libc::kill(pid, signal) == 0 {
            return Ok(SignalDelivery::Delivered);
        }
        let pid_err = io::Error::last_os_error();

        if is_no_such_process(&pid_err) {
            return Ok(SignalDelivery::AlreadyGone);
        }

        Err(io::Error::new(
            pid_err.kind(),
            format!("signal {signal} to group -{pid} failed: {group_err}; to pid {pid}: {pid_err}"),
        ))
    }
}

pub(crate) fn is_no_such_process(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(code) if code == libc::ESRCH)
}
