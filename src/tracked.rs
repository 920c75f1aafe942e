//! Tracked-request layer (C6): a synchronous request/response façade over
//! the same line protocol (C1), used by CLI tools to hold a correlated
//! dialog with a driver that also broadcasts unsolicited updates to every
//! connected client.
//!
//! The driver side of this protocol is an external collaborator (out of
//! scope per the spec's §1); this module is the client half only.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{debug, error, warn};
use mio::net::UnixStream;
use mio::{Events, Interest, Poll, Token};
use uuid::Uuid;

use crate::codec::{self, Feed};
use crate::sockutil;

/// Socket error, protocol error, or timeout after best-effort recovery.
pub const ERR_TRANSPORT: i32 = -1;
/// Internal: a single read call's timeout expired. Callers of `request`
/// never see this — it's folded into the retry loop until the overall
/// deadline is reached, at which point `ERR_TRANSPORT` is returned instead.
const ERR_READ_TIMEOUT: i32 = -2;

const CONN_TOKEN: Token = Token(0);
/// How often to emit a "still waiting" debug line while blocked on an
/// indefinite-deadline read, so a caller watching logs can tell the client
/// hasn't wedged.
const LIVENESS_LOG_INTERVAL: Duration = Duration::from_secs(60);
/// Best-effort teardown: give the server a moment to see `LOGOUT` before the
/// socket drops.
const TEARDOWN_LINGER: Duration = Duration::from_millis(100);
/// Upper bound on a single poll-and-read slice, so the liveness log and
/// deadline checks stay responsive even under an indefinite overall wait.
const POLL_SLICE: Duration = Duration::from_secs(1);

/// `{seconds, microseconds}` deadline, matching the source's timeval-style
/// API. `{0, 0}` or negative means "wait indefinitely".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    pub seconds: i64,
    pub microseconds: i64,
}

impl Timeout {
    pub fn new(seconds: i64, microseconds: i64) -> Self {
        Timeout { seconds, microseconds }
    }

    pub const fn indefinite() -> Self {
        Timeout { seconds: 0, microseconds: 0 }
    }

    /// `None` means "wait indefinitely".
    fn as_duration(&self) -> Option<Duration> {
        if self.seconds <= 0 && self.microseconds <= 0 {
            return None;
        }
        let secs = self.seconds.max(0) as u64;
        let micros = self.microseconds.max(0) as u64;
        Some(Duration::from_secs(secs) + Duration::from_micros(micros))
    }
}

/// Controls how loudly low-level failures are reported. A field on the
/// client object (not a process global, per the spec's re-architecture
/// note), so opportunistic callers that expect the driver may not be
/// running can ask for quiet connect-failure logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verbosity {
    /// Log connect/transport failures at warn/error.
    Normal,
    /// Suppress routine connect-failure logs; protocol-level oddities still
    /// log at debug.
    Hushed,
}

/// A synchronous client over a driver's Unix-domain socket. Holds one
/// connection; `NOBROADCAST` mode is entered once, in `prepare`, and holds
/// for the client's lifetime.
pub struct DriverClient {
    stream: UnixStream,
    poll: Poll,
    events: Events,
    parser: codec::Parser,
    /// Completed lines parsed out of a `read()` call but not yet returned
    /// to a caller of `read_one_line`. A single `read(2)` can coalesce
    /// several lines (a tracked reply arriving in the same packet as an
    /// unsolicited broadcast, or vice versa); stopping at the first
    /// complete line and discarding the rest of that read's buffer would
    /// silently drop whatever followed it.
    pending_lines: VecDeque<Vec<String>>,
    /// Set once the socket has returned EOF. Checked before polling again
    /// so a peer close doesn't get reported as a fresh read timeout once
    /// `pending_lines` has drained.
    closed: bool,
    verbosity: Verbosity,
}

impl DriverClient {
    /// Connect to `socket_path` and register it for readiness polling.
    /// Does not send anything yet — call `prepare` next.
    pub fn connect(socket_path: &Path, verbosity: Verbosity) -> io::Result<DriverClient> {
        sockutil::check_socket_path_len(socket_path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut stream = match UnixStream::connect(socket_path) {
            Ok(s) => s,
            Err(e) => {
                if verbosity == Verbosity::Normal {
                    warn!("connect to {}: {}", socket_path.display(), e);
                } else {
                    debug!("connect to {}: {}", socket_path.display(), e);
                }
                return Err(e);
            }
        };

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut stream, CONN_TOKEN, Interest::READABLE)?;

        Ok(DriverClient {
            stream,
            poll,
            events: Events::with_capacity(16),
            parser: codec::Parser::new(),
            pending_lines: VecDeque::new(),
            closed: false,
            verbosity,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        self.stream.write_all(buf.as_bytes())
    }

    /// Enter broadcast-suppressed, synchronous-dialog mode: send
    /// `NOBROADCAST`, and if `ping` is set, send `PING` and drain replies
    /// (discarding everything — leftover broadcasts included) until either
    /// `PONG` is seen or `prep_timeout` elapses.
    pub fn prepare(&mut self, ping: bool, prep_timeout: Timeout) -> io::Result<()> {
        self.write_line("NOBROADCAST")?;
        if !ping {
            return Ok(());
        }
        self.write_line("PING")?;

        let deadline = prep_timeout.as_duration().map(|d| Instant::now() + d);
        loop {
            match self.read_one_line(deadline) {
                Ok(Some(args)) => {
                    if args.first().map(String::as_str) == Some("PONG") {
                        return Ok(());
                    }
                    // Anything else during prep is a leftover broadcast;
                    // discard and keep waiting for PONG or the deadline.
                }
                Ok(None) => continue,
                Err(ERR_READ_TIMEOUT) => {
                    if deadline.map(|d| Instant::now() >= d).unwrap_or(false) {
                        return Ok(());
                    }
                }
                Err(_) => {
                    return Err(io::Error::new(io::ErrorKind::Other, "connection lost during prepare"));
                }
            }
        }
    }

    /// Send `query` with a fresh ` TRACKING <uuid>` suffix, then read reply
    /// lines until one begins with `TRACKING <uuid> <status>`; stragglers
    /// without the matching id are ignored. Returns the status code, or one
    /// of the error taxonomy's negative values.
    pub fn request(&mut self, query: &str, timeout: Timeout) -> i32 {
        let id = Uuid::new_v4();
        let line = format!("{} TRACKING {}", query, id);
        if let Err(e) = self.write_line(&line) {
            if self.verbosity == Verbosity::Normal {
                error!("write failed for tracked query {:?}: {}", query, e);
            }
            return ERR_TRANSPORT;
        }

        let want_prefix = format!("TRACKING {} ", id);
        let deadline = timeout.as_duration().map(|d| Instant::now() + d);
        let mut last_liveness_log = Instant::now();

        loop {
            match self.read_one_line(deadline) {
                Ok(Some(args)) => {
                    if let Some(status) = try_parse_tracking_reply(&args, &want_prefix) {
                        return status;
                    }
                    // Not our reply — a broadcast that leaked through, or a
                    // straggler from a prior request. Keep reading.
                }
                Ok(None) => continue,
                Err(ERR_READ_TIMEOUT) => {
                    if let Some(d) = deadline {
                        if Instant::now() >= d {
                            return ERR_TRANSPORT;
                        }
                    } else if last_liveness_log.elapsed() >= LIVENESS_LOG_INTERVAL {
                        debug!("still waiting for tracked reply to {:?} ({})", query, id);
                        last_liveness_log = Instant::now();
                    }
                }
                Err(_) => {
                    if self.verbosity == Verbosity::Normal {
                        error!("connection lost waiting for tracked reply to {:?}", query);
                    }
                    return ERR_TRANSPORT;
                }
            }
        }
    }

    /// Best-effort `LOGOUT` plus a brief linger so the server sees it
    /// before the socket drops. Always succeeds from the caller's
    /// perspective; failures here are not actionable.
    pub fn teardown(mut self) {
        let _ = self.write_line("LOGOUT");
        std::thread::sleep(TEARDOWN_LINGER);
    }

    /// Return the next complete line, pulling more off the wire if the
    /// queue from a prior read is empty. Poll waits are bounded by
    /// `POLL_SLICE` so deadline checks stay responsive.
    /// `Ok(None)` means progress but no complete line yet;
    /// `Err(ERR_READ_TIMEOUT)` means this slice's poll saw nothing;
    /// `Err(ERR_TRANSPORT)` means the peer closed or erred.
    fn read_one_line(&mut self, deadline: Option<Instant>) -> Result<Option<Vec<String>>, i32> {
        if let Some(line) = self.pending_lines.pop_front() {
            return Ok(Some(line));
        }
        if self.closed {
            return Err(ERR_TRANSPORT);
        }

        let slice = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(ERR_READ_TIMEOUT);
                }
                remaining.min(POLL_SLICE)
            }
            None => POLL_SLICE,
        };

        self.poll
            .poll(&mut self.events, Some(slice))
            .map_err(|_| ERR_TRANSPORT)?;
        if self.events.is_empty() {
            return Err(ERR_READ_TIMEOUT);
        }

        // Drain to `WouldBlock`: the poll above is edge-triggered, so it
        // only fires once for whatever arrived — stopping at a single
        // `read(2)` of up to 256 bytes could leave a remainder that never
        // gets a readiness event to service it on. A drained read(2) can
        // also coalesce more than one frame (e.g. a tracked reply landing
        // in the same packet as a preceding broadcast), so every
        // completed line is queued rather than returning on the first.
        let mut buf = [0u8; 256];
        loop {
            match self.stream.read(&mut buf) {
                Ok(0) => {
                    self.closed = true;
                    break;
                }
                Ok(n) => {
                    for &b in &buf[..n] {
                        if let Feed::Complete(args) = self.parser.feed(b) {
                            self.pending_lines.push_back(args);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.closed = true;
                    break;
                }
            }
        }

        match self.pending_lines.pop_front() {
            Some(line) => Ok(Some(line)),
            None if self.closed => Err(ERR_TRANSPORT),
            None => Ok(None),
        }
    }
}

/// If `args` is a single-token line `TRACKING <uuid> <status>` whose
/// `TRACKING <uuid> ` prefix matches `want_prefix`, parse and return the
/// trailing status integer.
fn try_parse_tracking_reply(args: &[String], want_prefix: &str) -> Option<i32> {
    if args.len() != 3 || args[0] != "TRACKING" {
        return None;
    }
    let rebuilt = format!("{} {} ", args[0], args[1]);
    if rebuilt != want_prefix {
        return None;
    }
    args[2].parse::<i32>().ok()
}

/// Connect, prepare (no ping), send one tracked query, read its reply, and
/// tear down — the full round-trip in one call, for callers that don't want
/// to manage a `DriverClient`'s lifetime themselves.
pub fn oneshot(socket_path: &Path, query: &str, timeout: Timeout, verbosity: Verbosity) -> i32 {
    let mut client = match DriverClient::connect(socket_path, verbosity) {
        Ok(c) => c,
        Err(_) => return ERR_TRANSPORT,
    };
    if client.prepare(false, Timeout::new(2, 0)).is_err() {
        return ERR_TRANSPORT;
    }
    let status = client.request(query, timeout);
    client.teardown();
    status
}
