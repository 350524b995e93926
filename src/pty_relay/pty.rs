//! Pseudo-terminal allocation and raw descriptor helpers.

use anyhow::{anyhow, Result};
use std::io;
use std::os::unix::io::RawFd;
use std::ptr;

const DEFAULT_ROWS: u16 = 24;
const DEFAULT_COLS: u16 = 80;

/// Freshly allocated master/slave pair. The slave is consumed by the spawn step.
#[derive(Debug)]
pub(crate) struct TerminalPair {
    pub(crate) master_fd: RawFd,
    pub(crate) slave_fd: RawFd,
}

impl TerminalPair {
    /// Allocate one pseudo-terminal with a 24x80 window.
    ///
    /// Both ends are close-on-exec; the child gets the slave through `dup2`, which clears it.
    ///
    /// # Errors
    ///
    /// Returns an error when `openpty` or descriptor setup fails. No descriptors leak on error.
    pub(crate) fn allocate() -> Result<Self> {
        let mut master_fd: RawFd = -1;
        let mut slave_fd: RawFd = -1;
        let mut winsize = libc::winsize {
            ws_row: DEFAULT_ROWS,
            ws_col: DEFAULT_COLS,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        #[allow(clippy::unnecessary_mut_passed)]
        // SAFETY: openpty writes into the two stack locals and reads the winsize we own.
        let ret = unsafe {
            libc::openpty(
                &mut master_fd,
                &mut slave_fd,
                ptr::null_mut(),
                ptr::null_mut(),
                &mut winsize,
            )
        };
        if ret != 0 {
            return Err(errno_error("openpty failed"));
        }

        let pair = Self {
            master_fd,
            slave_fd,
        };
        if let Err(err) = pair.configure() {
            // SAFETY: both fds were just returned by openpty and are owned here.
            unsafe {
                close_fd(pair.master_fd);
                close_fd(pair.slave_fd);
            }
            return Err(err);
        }
        Ok(pair)
    }

    fn configure(&self) -> Result<()> {
        set_cloexec(self.master_fd)?;
        set_cloexec(self.slave_fd)?;
        // SAFETY: master_fd is open and owned by this pair.
        unsafe { set_nonblocking(self.master_fd) }
    }
}

/// Parent-side handle on the PTY master. Closes exactly once.
#[derive(Debug)]
pub(crate) struct TerminalMaster {
    fd: RawFd,
}

impl TerminalMaster {
    pub(crate) fn new(fd: RawFd) -> Self {
        Self { fd }
    }

    /// Raw descriptor, or -1 once closed.
    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn is_open(&self) -> bool {
        self.fd >= 0
    }

    /// Close the master; later calls are no-ops.
    pub(crate) fn close(&mut self) {
        if self.fd < 0 {
            return;
        }
        // SAFETY: fd is owned by this handle and reset to -1 so it is never closed twice.
        unsafe { close_fd(self.fd) };
        self.fd = -1;
    }
}

impl Drop for TerminalMaster {
    fn drop(&mut self) {
        self.close();
    }
}

/// Switch a descriptor to non-blocking mode.
///
/// # Safety
///
/// `fd` must be a valid, open file descriptor.
pub(crate) unsafe fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = libc::fcntl(fd, libc::F_GETFL, 0);
    if flags < 0 {
        return Err(errno_error("fcntl(F_GETFL) failed"));
    }
    if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
        return Err(errno_error("fcntl(F_SETFL) failed"));
    }
    Ok(())
}

/// Mark a descriptor close-on-exec.
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    if fd < 0 {
        return Ok(());
    }
    // SAFETY: F_GETFD/F_SETFD only touch descriptor flags of an fd we own.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(errno_error("fcntl(F_GETFD) failed"));
    }
    let result = unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) };
    if result < 0 {
        return Err(errno_error("fcntl(F_SETFD, FD_CLOEXEC) failed"));
    }
    Ok(())
}

/// Formats the current errno with context.
pub(crate) fn errno_error(context: &str) -> anyhow::Error {
    anyhow!("{context}: {}", io::Error::last_os_error())
}

/// Close a descriptor, ignoring errors.
///
/// # Safety
///
/// `fd` must be owned by the caller (or negative, which is ignored).
pub(crate) unsafe fn close_fd(fd: RawFd) {
    if fd >= 0 {
        let _ = libc::close(fd);
    }
}
