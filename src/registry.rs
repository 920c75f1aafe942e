//! Connection registry (C2): owns the set of accepted client connections,
//! their per-connection parse state, and performs accept/read/write/close.
//!
//! Generalizes the pattern from the teacher crate's own
//! `examples/tcp_server.rs` (a `HashMap<Token, TcpStream>` plus a
//! monotonically increasing `Token` allocator) from TCP to Unix-domain
//! sockets, and adds the line-codec parse context (C1) and the bounded
//! per-iteration read cap the spec requires.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};

use mio::net::UnixStream;
use mio::{Interest, Registry, Token};

use crate::codec::{self, Feed};

/// Bytes processed (fed through a connection's parser) within a single
/// `read()` call. Bounds worst-case latency impact on sibling connections
/// within one poll iteration.
///
/// This is independent from how much is actually pulled off the kernel
/// socket per call: under edge-triggered readiness, mio only re-fires once
/// new data arrives, so a `read()` that stops short of fully draining the
/// socket would strand any remainder — there is no second edge to service
/// it on. `read()` always drains the socket to `WouldBlock` (like the
/// teacher's own `examples/tcp_server.rs`), and any bytes beyond this cap
/// are held in `Connection::unprocessed` for later calls.
pub const MAX_READ: usize = 128;

/// Outcome of reading from one connection.
pub enum ReadOutcome {
    /// No error, but not necessarily any complete lines either.
    Progress(Vec<Vec<String>>),
    /// A transport-level error occurred; the connection should be closed.
    Error(io::Error),
}

/// A single accepted client connection.
pub struct Connection {
    pub socket: UnixStream,
    parser: codec::Parser,
    /// Bytes already pulled off the kernel socket (to fully drain it under
    /// edge-triggered readiness) but not yet fed through the parser,
    /// because doing so would exceed `MAX_READ` for this call. Drained
    /// `MAX_READ` bytes at a time on subsequent `read` calls, which the
    /// daemon issues for any connection with a non-empty buffer here even
    /// without a new poll event.
    unprocessed: VecDeque<u8>,
    /// Set once the peer's `read` has returned 0 (EOF). The connection is
    /// only reported closed once `unprocessed` has also fully drained, so
    /// no buffered line is lost to an early close.
    closed: bool,
}

impl Connection {
    fn new(socket: UnixStream) -> Self {
        Connection {
            socket,
            parser: codec::Parser::new(),
            unprocessed: VecDeque::new(),
            closed: false,
        }
    }
}

/// Owns all accepted connections, keyed by `mio::Token`. Registry order
/// (iteration order of `tokens_in_order`) equals accept order, which is
/// the only ordering guarantee the spec makes across connections.
#[derive(Default)]
pub struct ConnRegistry {
    conns: HashMap<Token, Connection>,
    order: Vec<Token>,
    next_token: usize,
    first_token: usize,
}

impl ConnRegistry {
    /// `first_token` is the first `Token` value available for connections;
    /// callers typically reserve `Token(0)` for the listener itself.
    pub fn new(first_token: usize) -> Self {
        ConnRegistry {
            conns: HashMap::new(),
            order: Vec::new(),
            next_token: first_token,
            first_token,
        }
    }

    fn alloc_token(&mut self) -> Token {
        let t = Token(self.next_token);
        self.next_token += 1;
        t
    }

    /// Register a freshly accepted socket, installing a fresh parse
    /// context. Returns the token it was registered under.
    pub fn insert(&mut self, registry: &Registry, mut socket: UnixStream) -> io::Result<Token> {
        let token = self.alloc_token();
        registry.register(&mut socket, token, Interest::READABLE)?;
        self.conns.insert(token, Connection::new(socket));
        self.order.push(token);
        Ok(token)
    }

    pub fn get(&self, token: Token) -> Option<&Connection> {
        self.conns.get(&token)
    }

    pub fn get_mut(&mut self, token: Token) -> Option<&mut Connection> {
        self.conns.get_mut(&token)
    }

    /// Tokens in accept order, as of this call (a snapshot — safe to
    /// iterate while mutating the registry inside the loop body).
    pub fn tokens_in_order(&self) -> Vec<Token> {
        self.order.clone()
    }

    /// Idempotent: removing an already-removed token is a no-op.
    pub fn close(&mut self, registry: &Registry, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = registry.deregister(&mut conn.socket);
            self.order.retain(|t| *t != token);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.conns.is_empty()
    }

    pub fn len(&self) -> usize {
        self.conns.len()
    }

    /// Drain `token`'s socket to `WouldBlock` (required under
    /// edge-triggered readiness — see `MAX_READ`'s doc comment), then feed
    /// up to `MAX_READ` bytes of the accumulated backlog through its
    /// parser, returning any completed lines. Anything beyond the cap
    /// stays in `Connection::unprocessed`; call `has_pending`/
    /// `peer_closed_and_drained` afterward to know whether this token
    /// needs servicing again before the next poll event.
    pub fn read(&mut self, token: Token) -> ReadOutcome {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return ReadOutcome::Progress(Vec::new()),
        };

        if !conn.closed {
            let mut chunk = [0u8; 1024];
            loop {
                match conn.socket.read(&mut chunk) {
                    Ok(0) => {
                        conn.closed = true;
                        break;
                    }
                    Ok(n) => conn.unprocessed.extend(&chunk[..n]),
                    Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => return ReadOutcome::Error(e),
                }
            }
        }

        let to_process = conn.unprocessed.len().min(MAX_READ);
        let mut lines = Vec::new();
        for _ in 0..to_process {
            let b = conn.unprocessed.pop_front().expect("len checked above");
            match conn.parser.feed(b) {
                Feed::Pending => {}
                Feed::Complete(args) => lines.push(args),
                Feed::Error(msg) => {
                    log::info!("parse error on sock: {}", msg);
                }
            }
        }
        ReadOutcome::Progress(lines)
    }

    /// Whether `token` has bytes already pulled off its socket but not yet
    /// processed (because the last `read()` call's `MAX_READ` cap was
    /// reached). The daemon must service such a connection again even
    /// without a new poll event — edge-triggered readiness has already
    /// fired and won't again until more data arrives.
    pub fn has_pending(&self, token: Token) -> bool {
        self.conns
            .get(&token)
            .map(|c| !c.unprocessed.is_empty())
            .unwrap_or(false)
    }

    /// Whether `token`'s peer has closed (EOF) and every byte it sent has
    /// been processed. `false` while bytes are still queued in
    /// `unprocessed`, so a trailing line coalesced with the close isn't
    /// dropped in favor of reporting the close immediately.
    pub fn peer_closed_and_drained(&self, token: Token) -> bool {
        self.conns
            .get(&token)
            .map(|c| c.closed && c.unprocessed.is_empty())
            .unwrap_or(false)
    }

    /// Write `text` followed by `\n`. A partial write is treated as a
    /// fatal transport error for this connection — the expected traffic
    /// is small enough that the kernel buffer never fills in practice.
    pub fn write_line(&mut self, token: Token, text: &str) -> io::Result<()> {
        let conn = match self.conns.get_mut(&token) {
            Some(c) => c,
            None => return Ok(()),
        };
        let mut line = String::with_capacity(text.len() + 1);
        line.push_str(text);
        line.push('\n');
        let bytes = line.as_bytes();
        let n = conn.socket.write(bytes)?;
        if n != bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "partial write to client socket",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mio::Poll;
    use std::os::unix::net::UnixStream as StdUnixStream;

    fn registered_pair() -> (Poll, ConnRegistry, Token, StdUnixStream) {
        let (std_a, std_b) = StdUnixStream::pair().unwrap();
        std_b.set_nonblocking(true).unwrap();
        let mio_b = UnixStream::from_std(std_b);

        let poll = mio::Poll::new().unwrap();
        let mut registry = ConnRegistry::new(1);
        let token = registry.insert(poll.registry(), mio_b).unwrap();
        (poll, registry, token, std_a)
    }

    #[test]
    fn coalesced_lines_in_one_read_are_all_delivered() {
        let (_poll, mut registry, token, mut std_a) = registered_pair();
        std_a.write_all(b"PING\nPING\n").unwrap();

        match registry.read(token) {
            ReadOutcome::Progress(lines) => {
                assert_eq!(
                    lines,
                    vec![vec!["PING".to_string()], vec!["PING".to_string()]]
                );
            }
            ReadOutcome::Error(e) => panic!("unexpected error: {}", e),
        }
    }

    #[test]
    fn backlog_beyond_max_read_drains_across_calls_without_a_new_event() {
        let (_poll, mut registry, token, mut std_a) = registered_pair();

        let mut payload = String::new();
        for i in 0..40 {
            payload.push_str(&format!("line{}\n", i));
        }
        assert!(payload.len() > MAX_READ, "test payload must exceed the cap");
        std_a.write_all(payload.as_bytes()).unwrap();

        let mut total_lines = 0;
        loop {
            match registry.read(token) {
                ReadOutcome::Progress(lines) => total_lines += lines.len(),
                ReadOutcome::Error(e) => panic!("unexpected error: {}", e),
            }
            if !registry.has_pending(token) {
                break;
            }
        }
        assert_eq!(total_lines, 40);
        assert!(!registry.has_pending(token));
    }

    #[test]
    fn close_coalesced_with_trailing_data_is_not_lost() {
        let (_poll, mut registry, token, mut std_a) = registered_pair();
        std_a.write_all(b"LOGOUT\n").unwrap();
        drop(std_a);

        match registry.read(token) {
            ReadOutcome::Progress(lines) => {
                assert_eq!(lines, vec![vec!["LOGOUT".to_string()]]);
            }
            ReadOutcome::Error(e) => panic!("unexpected error: {}", e),
        }
        assert!(registry.peer_closed_and_drained(token));
    }
}
