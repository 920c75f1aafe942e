//! Daemon lifecycle (C5), client half: the state machine a client follows
//! to get a connected socket regardless of whether a daemon was already
//! running — try to connect, and if that fails, race to become the one
//! client that spawns it, then retry.
//!
//! ```text
//!    ClientTop -> Connecting -> Connected
//!                    |
//!                    v (failure)
//!              AcquireLock(lockfn)
//!               /              \
//!         got lock          did not get lock
//!             v                   v
//!          SpawnBg             Backoff (250ms)
//!             v                   v
//!      WaitChildReady      (retry Connecting)
//!             v
//!      (retry Connecting)
//! ```

use std::fs::File;
use std::os::unix::net::UnixStream as StdUnixStream;
use std::path::Path;
use std::time::Duration;

use log::{debug, info, warn};

use crate::daemon::{self, Daemon};
use crate::error::{Result, UpsError};
use crate::handshake::{self, ReadinessPipe};

/// Backoff between a failed connect-and-lock-acquire and the next retry.
const BACKOFF: Duration = Duration::from_millis(250);
/// Bounds the client-side retry loop so a genuinely broken daemon (one that
/// forks but never binds) doesn't hang a caller forever. Not named in the
/// spec; chosen so the loop's total budget comfortably covers a cold
/// process start plus a few backoff cycles.
const MAX_ATTEMPTS: u32 = 40;

/// Connect to the scheduler socket at `pipefn`, spawning the daemon on
/// demand (racing safely against sibling clients doing the same) if no
/// daemon is listening yet. Returns the connected stream.
pub fn ensure_connected(
    pipefn: &Path,
    lockfn: &Path,
    cmdscript: &Path,
    verbose: bool,
) -> Result<StdUnixStream> {
    let mut have_tried_stale_unlink = false;

    for attempt in 0..MAX_ATTEMPTS {
        match StdUnixStream::connect(pipefn) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                if verbose {
                    debug!("connect attempt {} to {}: {}", attempt, pipefn.display(), e);
                }
            }
        }

        match handshake::try_acquire_lock(lockfn).map_err(UpsError::from)? {
            Some(lock_file) => {
                spawn_daemon(pipefn, lockfn, cmdscript, verbose, lock_file)?;
                // The child removes the lock file itself once its listener
                // is bound (spec §4.5 step 3); nothing left to do here but
                // retry the connect.
            }
            None => {
                std::thread::sleep(BACKOFF);
                if StdUnixStream::connect(pipefn).is_err() && !have_tried_stale_unlink {
                    // Neither connect nor lock acquisition worked twice in a
                    // row: a predecessor likely crashed holding the lock.
                    // Pragmatic recovery, not a formal protocol (spec §4.5).
                    handshake::unlink_lock(lockfn);
                    have_tried_stale_unlink = true;
                }
            }
        }
    }

    Err(UpsError::Resource(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("could not connect to {} after {} attempts", pipefn.display(), MAX_ATTEMPTS),
    )))
}

/// Fork and run the daemon in the child; block in the parent until the
/// child's listener socket exists. `lock_file` is the fd this process just
/// won `O_CREAT|O_EXCL` on; ownership moves to the child, which removes the
/// lock path once its listener is bound (spec §4.5 step 3).
fn spawn_daemon(
    pipefn: &Path,
    lockfn: &Path,
    cmdscript: &Path,
    verbose: bool,
    lock_file: File,
) -> Result<()> {
    let pipe = ReadinessPipe::create().map_err(UpsError::from)?;

    // SAFETY: `fork()` is called with no other threads in this process (the
    // whole point of this crate's single-threaded cooperative model, spec
    // §5); both branches below only touch state already owned by this
    // process before diverging.
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(UpsError::Resource(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        // Child: never returns to the caller's client-mode logic.
        let child_end = pipe.into_child_end();
        run_spawned_child(pipefn, lockfn, cmdscript, verbose, lock_file, child_end);
        std::process::exit(0);
    }

    // Parent: the lock fd belongs to the child now; drop our copy without
    // unlinking (the child does that after binding).
    drop(lock_file);
    if verbose {
        info!("spawned scheduler daemon, pid {}", pid);
    }
    pipe.into_parent_end().wait_ready();
    Ok(())
}

/// The forked child's path to becoming the daemon: close stdio, bind the
/// listener, remove the lock file and close its fd, signal readiness, then
/// run until idle-exit.
fn run_spawned_child(
    pipefn: &Path,
    lockfn: &Path,
    cmdscript: &Path,
    verbose: bool,
    lock_file: File,
    child_end: handshake::ChildEnd,
) {
    redirect_stdio_to_devnull();

    let listener = match daemon::open_socket(pipefn) {
        Ok(l) => l,
        Err(e) => {
            warn!("daemon child failed to bind {}: {}", pipefn.display(), e);
            child_end.signal_ready();
            return;
        }
    };

    handshake::unlink_lock(lockfn);
    drop(lock_file);

    let hook = Box::new(crate::dispatch::ScriptHook {
        cmdscript: cmdscript.to_path_buf(),
    });

    let mut daemon = match Daemon::new(pipefn.to_path_buf(), listener, hook, verbose) {
        Ok(d) => d,
        Err(e) => {
            warn!("daemon child failed to initialize poll: {}", e);
            child_end.signal_ready();
            return;
        }
    };

    child_end.signal_ready();

    if let Err(e) = daemon.run() {
        warn!("daemon main loop exited with error: {}", e);
    }
}

fn redirect_stdio_to_devnull() {
    use std::os::unix::io::AsRawFd;
    if let Ok(devnull) = std::fs::OpenOptions::new().read(true).write(true).open("/dev/null") {
        let fd = devnull.as_raw_fd();
        // SAFETY: fd is a valid open fd for /dev/null; dup2 onto 0/1/2 is
        // the standard daemonization idiom.
        unsafe {
            libc::dup2(fd, 0);
            libc::dup2(fd, 1);
            libc::dup2(fd, 2);
        }
    }
}
