//! Fork point: attaches the PTY slave as the child's controlling terminal and execs the target.

use super::child::ChildProcess;
use super::launch::LaunchSpec;
use super::pty::{close_fd, errno_error, TerminalMaster, TerminalPair};
use anyhow::Result;
use std::io;
use std::os::unix::io::RawFd;

/// Exit status of the child branch when setup or exec fails.
const CHILD_SETUP_FAILURE: libc::c_int = 1;

/// Fork a child running `spec` on the slave side of `pair`.
///
/// The parent closes its slave copy before returning and keeps only the master.
///
/// # Errors
///
/// Returns an error if `fork` fails; both PTY ends are closed in that case.
/// Failures after the fork (missing program, exec error) are reported by the child
/// itself on the terminal and surface to the parent as exit status 1.
pub(crate) fn spawn_on_terminal(
    pair: TerminalPair,
    spec: &LaunchSpec,
) -> Result<(TerminalMaster, ChildProcess)> {
    // SAFETY: every allocation the child needs happened in LaunchSpec; the child
    // branch never returns and only calls async-signal-safe functions before exec.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        let err = errno_error("fork failed");
        // SAFETY: the pair is still exclusively owned here.
        unsafe {
            close_fd(pair.master_fd);
            close_fd(pair.slave_fd);
        }
        return Err(err);
    }

    if pid == 0 {
        // SAFETY: we are the freshly forked child.
        unsafe { child_exec(pair.master_fd, pair.slave_fd, spec) };
    }

    // SAFETY: the child holds its own copy; the parent never touches the slave again.
    unsafe { close_fd(pair.slave_fd) };
    Ok((TerminalMaster::new(pair.master_fd), ChildProcess::new(pid)))
}

/// Child side after fork: new session, slave as controlling terminal and stdio, exec.
///
/// # Safety
///
/// Must only be called in the child after `fork()`. Never returns: it either
/// replaces the process image or calls `_exit(1)`. Allocates nothing.
unsafe fn child_exec(master_fd: RawFd, slave_fd: RawFd, spec: &LaunchSpec) -> ! {
    close_fd(master_fd);

    if libc::setsid() == -1 {
        fail_child(spec, "setsid");
    }
    if libc::ioctl(slave_fd, libc::TIOCSCTTY as libc::c_ulong, 0) == -1 {
        fail_child(spec, "ioctl(TIOCSCTTY)");
    }
    if libc::dup2(slave_fd, libc::STDIN_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDOUT_FILENO) < 0
        || libc::dup2(slave_fd, libc::STDERR_FILENO) < 0
    {
        fail_child(spec, "dup2");
    }
    if slave_fd > libc::STDERR_FILENO {
        close_fd(slave_fd);
    } else if libc::fcntl(slave_fd, libc::F_SETFD, 0) == -1 {
        // dup2 onto itself leaves FD_CLOEXEC in place; exec would close that stdio slot.
        fail_child(spec, "fcntl(F_SETFD)");
    }

    let Some(program) = spec.program() else {
        write_stderr(spec.not_found_message());
        libc::_exit(CHILD_SETUP_FAILURE);
    };

    libc::execve(program.as_ptr(), spec.argv_ptr(), spec.envp_ptr());
    fail_child(spec, "execve");
}

/// Report a failed setup step as `<prefix><step>: errno <n>` and exit.
unsafe fn fail_child(spec: &LaunchSpec, step: &str) -> ! {
    let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);
    let mut digits = [0u8; 12];
    write_stderr(spec.failure_prefix());
    write_stderr(step.as_bytes());
    write_stderr(b": errno ");
    write_stderr(format_decimal(errno, &mut digits));
    write_stderr(b"\n");
    libc::_exit(CHILD_SETUP_FAILURE);
}

/// Render `value` into the tail of `buf` without allocating.
fn format_decimal(value: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut rest = value.unsigned_abs();
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (rest % 10) as u8;
        rest /= 10;
        if rest == 0 {
            break;
        }
    }
    if value < 0 {
        start -= 1;
        buf[start] = b'-';
    }
    &buf[start..]
}

unsafe fn write_stderr(bytes: &[u8]) {
    // SAFETY: write is async-signal-safe; stderr is the slave terminal at this point.
    let _ = libc::write(
        libc::STDERR_FILENO,
        bytes.as_ptr() as *const libc::c_void,
        bytes.len(),
    );
}
