//! Small shared helpers for Unix-domain socket setup: path-length
//! validation, close-on-exec, and permission bits. Kept separate from
//! `daemon`/`tracked` because both the server and the tracked-request
//! client need them.

use std::os::unix::io::RawFd;
use std::path::Path;

use crate::error::{Result, UpsError};

/// `sockaddr_un.sun_path` capacity on this platform, minus one for the
/// NUL terminator `bind`/`connect` require.
pub fn max_socket_path_len() -> usize {
    // `sun_path` is a fixed-size byte array; libc exposes the struct so we
    // can size against it instead of hard-coding the common 104/108 value.
    std::mem::size_of::<libc::sockaddr_un>()
        - std::mem::size_of::<libc::sa_family_t>()
        - 1
}

/// Abort (return an error) rather than silently truncate when the
/// configured socket path won't fit in `sockaddr_un`.
pub fn check_socket_path_len(path: &Path) -> Result<()> {
    let len = path.as_os_str().len();
    let max = max_socket_path_len();
    if len > max {
        return Err(UpsError::Environment(format!(
            "socket path {} is {} bytes, exceeding this platform's limit of {}",
            path.display(),
            len,
            max
        )));
    }
    Ok(())
}

/// Set `FD_CLOEXEC` explicitly; never rely on defaults. The dispatcher
/// must never leak the listener or a client connection's fd to a spawned
/// `cmdscript` subprocess.
pub fn set_cloexec(fd: RawFd) -> std::io::Result<()> {
    // SAFETY: `fd` is a valid, open file descriptor owned by the caller
    // for the duration of this call.
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(std::io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) < 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Adjust the socket file to mode 0660 after creation. `umask` is touched
/// only around the bind/chmod, not process-wide.
pub fn chmod_socket(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::ffi::CString;
    let c_path = CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    // SAFETY: `c_path` is a valid NUL-terminated string for the lifetime
    // of this call.
    let ret = unsafe { libc::chmod(c_path.as_ptr(), mode as libc::mode_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
