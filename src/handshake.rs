//! Daemon lifecycle (C5), parent/child half: lock-file discipline and the
//! fork + readiness-pipe handshake that lets a client reliably observe
//! "the daemon's listener socket now exists" without polling.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::Path;

/// Create the lock file with `O_CREAT|O_EXCL` and mode 0 (no readers, no
/// writers) — a filesystem mutex among racing clients that all want to be
/// the one to spawn the daemon. `Ok(None)` means someone else already
/// holds it.
pub fn try_acquire_lock(lockfn: &Path) -> io::Result<Option<File>> {
    match std::fs::OpenOptions::new()
        .create_new(true)
        .read(true)
        .mode(0)
        .open(lockfn)
    {
        Ok(f) => Ok(Some(f)),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(None),
        Err(e) => Err(e),
    }
}

/// Pragmatic stale-lock recovery: a predecessor crash can leave the lock
/// file behind forever. Callers invoke this only after a connect attempt
/// has *also* failed following a failed lock acquisition, per the spec's
/// discipline — this is not a formal distributed protocol.
pub fn unlink_lock(lockfn: &Path) {
    let _ = std::fs::remove_file(lockfn);
}

/// The pipe used to signal "listener socket is bound" from child to
/// parent across `fork()`. The child closing its write end (an EOF on a
/// blocking read in the parent) is the signal; no byte needs to be sent.
pub struct ReadinessPipe {
    read_fd: RawFd,
    write_fd: RawFd,
}

impl ReadinessPipe {
    pub fn create() -> io::Result<ReadinessPipe> {
        let mut fds = [0i32; 2];
        // SAFETY: `fds` is a valid two-element buffer for `pipe(2)`.
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(ReadinessPipe {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    /// Parent-side: close our copy of the write end (we never write to
    /// it), keeping only the read end.
    pub fn into_parent_end(self) -> ParentEnd {
        // SAFETY: write_fd came from a successful `pipe(2)` above and is
        // not otherwise in use.
        unsafe { libc::close(self.write_fd) };
        ParentEnd { read_fd: self.read_fd }
    }

    /// Child-side: the child keeps the write end open until its listener
    /// socket is bound, then drops it (see `signal_ready`); the read end
    /// is of no use to the child, so close it immediately.
    pub fn into_child_end(self) -> ChildEnd {
        // SAFETY: read_fd came from a successful `pipe(2)` above and is
        // not otherwise in use.
        unsafe { libc::close(self.read_fd) };
        ChildEnd { write_fd: self.write_fd }
    }
}

pub struct ParentEnd {
    read_fd: RawFd,
}

impl ParentEnd {
    /// Block until the child closes its end (EOF) or sends something
    /// (never does, by convention) — either way, the read returning means
    /// the child has reached the point of calling `signal_ready`.
    pub fn wait_ready(self) {
        // SAFETY: read_fd is a valid, open fd owned by this struct; it is
        // closed exactly once, when this File is dropped.
        let mut f = unsafe { File::from_raw_fd(self.read_fd) };
        let mut buf = [0u8; 1];
        let _ = f.read(&mut buf);
        // f dropped here, closing read_fd.
    }
}

pub struct ChildEnd {
    write_fd: RawFd,
}

impl ChildEnd {
    /// Release the parent from `wait_ready`.
    pub fn signal_ready(self) {
        // SAFETY: write_fd is owned by this struct and not otherwise in
        // use; closing it is exactly the intended signal.
        unsafe { libc::close(self.write_fd) };
    }
}
