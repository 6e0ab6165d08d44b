//! Error taxonomy for the transport, per the five classes of handling design:
//! transient network, malformed packet, recoverable flow problem, resource
//! exhaustion, and fatal.

use std::net::SocketAddr;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Every error the transport can surface to a caller.
///
/// Only [`TransportError::Fatal`] latches `connection_lost`. Everything else
/// is recoverable: the caller may retry, and the transport keeps running.
#[derive(Debug, Error)]
pub enum TransportError {
    /// EAGAIN/timeout/decrypt mismatch/unknown kind. Counted, logged at warn, ignored.
    #[error("transient network condition: {0}")]
    Transient(String),

    /// Length mismatch, invalid stream kind, impossible segment geometry. Dropped, counted.
    #[error("malformed packet: {0}")]
    Malformed(String),

    /// NACK slot overwritten, ring slot collision, FEC decode failure. Logged, surfaced as a
    /// stream-reset request next cycle.
    #[error("recoverable flow problem: {0}")]
    RecoverableFlow(String),

    /// Send buffer full (`ENOBUFS`); retried up to `RETRIES_ON_BUFFER_FULL` times.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// ECONNREFUSED after connect, pong timeout, or any other socket error. Latches
    /// `connection_lost`; all subsequent calls fail.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::Fatal(_))
    }

    pub(crate) fn io_fatal(addr: Option<SocketAddr>, err: std::io::Error) -> Self {
        match addr {
            Some(addr) => TransportError::Fatal(format!("socket error with {addr}: {err}")),
            None => TransportError::Fatal(format!("socket error: {err}")),
        }
    }
}
