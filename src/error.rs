use std::io;

/// Error kinds from the error-handling table: configuration/environment
/// problems are fatal at startup, peer-protocol and transport problems
/// are recoverable per-connection, subprocess and timer-arg problems are
/// just logged.
#[derive(Debug, thiserror::Error)]
pub enum UpsError {
    /// Missing `CMDSCRIPT`/`PIPEFN`/`LOCKFN` before an `AT` line, or a
    /// malformed `AT` verb. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Socket path too long, or `UPSNAME`/`NOTIFYTYPE` missing. Fatal.
    #[error("environment error: {0}")]
    Environment(String),

    /// Cannot open socket, cannot fork, cannot write lock file. Fatal.
    #[error("resource error: {0}")]
    Resource(#[source] io::Error),

    /// Unknown frame, malformed quoting, too many args. Connection stays
    /// alive; caller replies `ERR UNKNOWN` and keeps going.
    #[error("peer protocol error: {0}")]
    PeerProtocol(String),

    /// Read/write error on a client connection. That connection is closed.
    #[error("peer transport error: {0}")]
    PeerTransport(#[source] io::Error),

    /// A tracked request's deadline was reached without a matching reply.
    #[error("tracked request timed out")]
    TrackedTimeout,
}

pub type Result<T> = std::result::Result<T, UpsError>;

impl From<io::Error> for UpsError {
    fn from(e: io::Error) -> Self {
        UpsError::Resource(e)
    }
}
