//! Raw descriptor reads, writes and readiness waits used by the relay loop.

use anyhow::{anyhow, Result};
use std::io::{self, ErrorKind};
use std::os::unix::io::RawFd;
use std::thread;
use std::time::Duration;

/// Relay chunk size for both directions.
pub(crate) const CHUNK_SIZE: usize = 4096;

/// One descriptor handed to [`wait_ready`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Watch {
    pub(crate) fd: RawFd,
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Watch {
    pub(crate) fn read(fd: RawFd) -> Self {
        Self {
            fd,
            read: true,
            write: false,
        }
    }

    pub(crate) fn read_write(fd: RawFd, write: bool) -> Self {
        Self {
            fd,
            read: true,
            write,
        }
    }

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.read {
            events |= libc::POLLIN;
        }
        if self.write {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// Readiness reported for one watched descriptor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Readiness {
    /// Data, end-of-stream, or an error condition is waiting; a read will tell which.
    pub(crate) readable: bool,
    pub(crate) writable: bool,
    /// The descriptor is not open.
    pub(crate) invalid: bool,
}

impl Readiness {
    fn from_revents(revents: libc::c_short) -> Self {
        if revents & libc::POLLNVAL != 0 {
            return Self {
                invalid: true,
                ..Self::default()
            };
        }
        Self {
            readable: revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
            writable: revents & libc::POLLOUT != 0,
            invalid: false,
        }
    }
}

pub(crate) fn should_retry_read_error(err: &io::Error) -> bool {
    err.kind() == ErrorKind::Interrupted || err.kind() == ErrorKind::WouldBlock
}

/// Wait up to `timeout` for any watched descriptor to become ready.
///
/// Returns one `Readiness` per watch, in order. `EINTR` surfaces as
/// `ErrorKind::Interrupted` so the caller can re-check its termination flag.
pub(crate) fn wait_ready(watches: &[Watch], timeout: Duration) -> io::Result<Vec<Readiness>> {
    let mut pollfds: Vec<libc::pollfd> = watches
        .iter()
        .map(|watch| libc::pollfd {
            fd: watch.fd,
            events: watch.events(),
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(libc::c_int::MAX as u128) as libc::c_int;

    // SAFETY: pollfds is a live, correctly sized array of pollfd structs.
    let ret = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(pollfds
        .iter()
        .map(|pfd| Readiness::from_revents(pfd.revents))
        .collect())
}

/// Single `read(2)` into `buf`. `Ok(0)` means end-of-stream.
pub(crate) fn read_chunk(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // SAFETY: buf is a live, writable slice and the length passed matches it.
    let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Attempt a single write without retry loops.
pub(crate) fn try_write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    if data.is_empty() {
        return Ok(0);
    }
    // SAFETY: data is a live slice and its length bounds the write.
    let written = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    if written == 0 {
        return Err(io::Error::new(ErrorKind::WriteZero, "write returned 0"));
    }
    Ok(written as usize)
}

/// Write the whole buffer, retrying short writes and transient errors.
///
/// Only for blocking descriptors; the PTY master goes through the relay's pending queue.
pub(crate) fn write_all(fd: RawFd, mut data: &[u8]) -> Result<()> {
    while !data.is_empty() {
        let written = match try_write(fd, data) {
            Ok(written) => written,
            Err(err) => {
                if should_retry_read_error(&err) {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                if err.kind() == ErrorKind::WriteZero {
                    return Err(anyhow!("write to fd {fd} returned 0"));
                }
                return Err(anyhow::Error::new(err).context(format!("write to fd {fd} failed")));
            }
        };
        data = data.get(written..).unwrap_or(&[]);
    }
    Ok(())
}

/// Printable preview of relayed bytes for content logs.
pub(crate) fn preview_bytes(data: &[u8], limit: usize) -> String {
    let shown = data.get(..limit.min(data.len())).unwrap_or(data);
    let mut preview = String::from_utf8_lossy(shown).escape_debug().to_string();
    if data.len() > limit {
        preview.push_str("...");
    }
    preview
}
