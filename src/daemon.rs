//! Daemon lifecycle (C5), server half: on-demand listener bring-up, the
//! single-threaded poll loop, and idle-exit.

use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::{info, warn};
use mio::net::UnixListener;
use mio::{Events, Interest, Poll, Token};
use signal_hook::consts::signal::{SIGINT, SIGTERM};
use signal_hook_mio::v1_0::Signals;

use crate::dispatch::{self, ExecuteHook, Frame, Reply};
use crate::error::{Result, UpsError};
use crate::registry::{ConnRegistry, ReadOutcome};
use crate::sockutil;
use crate::timer::TimerQueue;

/// Minimum passes with an empty timer queue before the daemon exits. The
/// spec allows anywhere in `[10, 30]`; this is the reference value.
pub const IDLE_THRESHOLD: u32 = 15;
pub const LISTEN_BACKLOG: i32 = 16;
const LISTENER_TOKEN: Token = Token(0);
const SIGNAL_TOKEN: Token = Token(1);
/// One poll tick per second, so timers are checked regularly even with no
/// socket activity.
const TICK: Duration = Duration::from_secs(1);

/// Bind the Unix-domain listener at `path`: unlinks any stale socket file,
/// binds, sets mode 0660 (umask adjusted only for this call), sets the
/// listen backlog, and marks the fd close-on-exec so it's never leaked to
/// a spawned `cmdscript`.
pub fn open_socket(path: &Path) -> Result<UnixListener> {
    sockutil::check_socket_path_len(path)?;
    let _ = std::fs::remove_file(path);

    // SAFETY: umask is process-wide state; we restore it immediately
    // after the bind+chmod that need it relaxed, matching the spec's
    // "umask adjusted only around socket creation" policy.
    let old_umask = unsafe { libc::umask(0o007) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old_umask) };
    let listener = listener.map_err(UpsError::from)?;

    sockutil::chmod_socket(path, 0o660).map_err(UpsError::from)?;
    sockutil::set_cloexec(listener.as_raw_fd()).map_err(UpsError::from)?;
    Ok(listener)
}

/// Owns the poll loop's entire state: the listener, the connection
/// registry, the timer queue, and the empty-cycle counter. An explicit
/// context struct rather than process-wide globals (see the spec's
/// design notes), constructed once in the daemon's entrypoint.
pub struct Daemon {
    poll: Poll,
    events: Events,
    listener: UnixListener,
    signals: Signals,
    conns: ConnRegistry,
    timers: TimerQueue,
    empty_cycles: u32,
    verbose: bool,
    hook: Box<dyn ExecuteHook>,
    socket_path: PathBuf,
    idle_threshold: u32,
}

impl Daemon {
    pub fn new(
        socket_path: PathBuf,
        mut listener: UnixListener,
        hook: Box<dyn ExecuteHook>,
        verbose: bool,
    ) -> std::io::Result<Daemon> {
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let mut signals = Signals::new([SIGTERM, SIGINT])?;
        poll.registry()
            .register(&mut signals, SIGNAL_TOKEN, Interest::READABLE)?;

        Ok(Daemon {
            poll,
            events: Events::with_capacity(128),
            listener,
            signals,
            conns: ConnRegistry::new(SIGNAL_TOKEN.0 + 1),
            timers: TimerQueue::new(),
            empty_cycles: 0,
            verbose,
            hook,
            socket_path,
            idle_threshold: IDLE_THRESHOLD,
        })
    }

    #[cfg(test)]
    fn with_idle_threshold(mut self, n: u32) -> Self {
        self.idle_threshold = n;
        self
    }

    /// Run the main loop until idle-exit. Returns normally (exit code 0)
    /// once the socket file has been unlinked.
    pub fn run(&mut self) -> std::io::Result<()> {
        loop {
            if self.tick()? {
                return Ok(());
            }
        }
    }

    /// One iteration of the main loop: poll with a 1s ceiling, accept and
    /// service connections, sweep timers, and check idle-exit. Returns
    /// `true` once the daemon has unlinked its socket and should stop.
    fn tick(&mut self) -> std::io::Result<bool> {
        self.poll.poll(&mut self.events, Some(TICK))?;

        let mut listener_ready = false;
        let mut signalled = false;
        let mut ready = std::collections::HashSet::new();
        for event in self.events.iter() {
            if event.token() == LISTENER_TOKEN {
                listener_ready = true;
            } else if event.token() == SIGNAL_TOKEN {
                signalled = true;
            } else {
                ready.insert(event.token());
            }
        }
        // Service in registry (accept) order, not raw event-arrival order —
        // the only cross-connection ordering this crate promises (spec §4.2).
        //
        // Also service any connection still holding unprocessed bytes from
        // a prior call (see `ConnRegistry::has_pending`): under
        // edge-triggered readiness mio won't fire again for data it has
        // already told us about once, so a connection whose backlog
        // exceeded `MAX_READ` last tick would otherwise be stranded with
        // no further poll event to service it on.
        let service_tokens: Vec<Token> = self
            .conns
            .tokens_in_order()
            .into_iter()
            .filter(|t| ready.contains(t) || self.conns.has_pending(*t))
            .collect();

        if signalled {
            for sig in self.signals.pending() {
                if sig == SIGTERM || sig == SIGINT {
                    if self.verbose {
                        info!("received signal {}, shutting down", sig);
                    }
                    let _ = std::fs::remove_file(&self.socket_path);
                    return Ok(true);
                }
            }
        }

        if listener_ready {
            self.accept_all();
        }

        for token in service_tokens {
            self.service(token);
        }

        self.sweep_and_fire();

        if self.timers.is_empty() {
            self.empty_cycles += 1;
        } else {
            self.empty_cycles = 0;
        }

        if self.empty_cycles >= self.idle_threshold {
            if self.verbose {
                info!("timer queue empty, exiting");
            }
            let _ = std::fs::remove_file(&self.socket_path);
            return Ok(true);
        }

        Ok(false)
    }

    fn accept_all(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, _addr)) => {
                    let _ = sockutil::set_cloexec(stream.as_raw_fd());
                    match self.conns.insert(self.poll.registry(), stream) {
                        Ok(token) => {
                            if self.verbose {
                                info!("new connection on token {:?}", token);
                            }
                        }
                        Err(e) => warn!("failed to register new connection: {}", e),
                    }
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("accept on unix fd failed: {}", e);
                    break;
                }
            }
        }
    }

    fn service(&mut self, token: Token) {
        match self.conns.read(token) {
            ReadOutcome::Progress(lines) => {
                for args in lines {
                    self.handle_frame(token, &args);
                }
                // Only close once every byte the peer sent (including
                // whatever coalesced with its EOF) has been processed —
                // `read` may have left some of it in `unprocessed` under
                // the per-call cap, in which case this token is still in
                // `has_pending` and gets serviced again next tick.
                if self.conns.peer_closed_and_drained(token) {
                    self.conns.close(self.poll.registry(), token);
                }
            }
            ReadOutcome::Error(_) => {
                self.conns.close(self.poll.registry(), token);
            }
        }
    }

    /// `NOBROADCAST` is accepted and answered `OK` (see `dispatch::dispatch`)
    /// but otherwise a no-op: the scheduler socket never sends unsolicited
    /// messages, so there is nothing for it to suppress here.
    fn handle_frame(&mut self, token: Token, args: &[String]) {
        let frame = Frame::parse(args);
        let reply = dispatch::dispatch(&frame, &mut self.timers, self.hook.as_ref());
        let should_close = matches!(reply, Reply::CloseAfter(_));
        if self.conns.write_line(token, reply.as_text()).is_err() {
            self.conns.close(self.poll.registry(), token);
            return;
        }
        if should_close {
            self.conns.close(self.poll.registry(), token);
        }
    }

    fn sweep_and_fire(&mut self) {
        let fired = self.timers.sweep(Instant::now());
        for timer in fired {
            self.hook.execute(&timer.name);
        }
    }

    #[cfg(test)]
    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::ExecuteHook;
    use std::cell::RefCell;
    use std::io::Write;
    use std::os::unix::net::UnixStream as StdUnixStream;

    struct RecordingHook(RefCell<Vec<String>>);
    impl ExecuteHook for RecordingHook {
        fn execute(&self, name: &str) {
            self.0.borrow_mut().push(name.to_string());
        }
    }

    fn bound_daemon(dir: &tempfile::TempDir, idle: u32) -> Daemon {
        let path = dir.path().join("sched.sock");
        let listener = open_socket(&path).unwrap();
        let hook = Box::new(RecordingHook(RefCell::new(Vec::new())));
        Daemon::new(path, listener, hook, true)
            .unwrap()
            .with_idle_threshold(idle)
    }

    #[test]
    fn idle_daemon_exits_after_threshold_ticks_with_no_timers() {
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = bound_daemon(&dir, 2);
        assert!(!daemon.tick().unwrap());
        assert!(daemon.tick().unwrap());
        assert!(!dir.path().join("sched.sock").exists());
    }

    #[test]
    fn start_then_cancel_over_the_wire() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = dir.path().join("sched.sock");
        let listener = open_socket(&sock_path).unwrap();
        let hook = Box::new(RecordingHook(RefCell::new(Vec::new())));
        let mut daemon = Daemon::new(sock_path.clone(), listener, hook, true)
            .unwrap()
            .with_idle_threshold(100);

        let mut client = StdUnixStream::connect(&sock_path).unwrap();
        client.write_all(b"START \"shutnow\" \"5\"\n").unwrap();

        // give the accept a moment to land, then drive one tick
        std::thread::sleep(Duration::from_millis(50));
        daemon.tick().unwrap();
        assert_eq!(daemon.timer_count(), 1);

        client.write_all(b"CANCEL \"shutnow\"\n").unwrap();
        std::thread::sleep(Duration::from_millis(50));
        daemon.tick().unwrap();
        assert_eq!(daemon.timer_count(), 0);
    }
}
