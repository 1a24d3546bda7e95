//! # Transport Abstraction
//!
//! A minimal, async interface for moving framed bytes between a module and the broker.
//!
//! ## Philosophy
//!
//! - **Byte-Oriented**: The Transport knows nothing about frames, values, or signatures.
//!   It moves opaque buffers and preserves their boundaries.
//! - **Duplex**: Either side may send at any time. Correlating replies with calls is the
//!   job of the `Peer` built on top.

use std::fmt;

use sbwrpc::Fault;

/// Frames larger than this are refused unless configured otherwise.
pub const DEFAULT_MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Errors that occur at the network/transport layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The remote end is unreachable, or the connection was dropped or closed.
    ConnectionLost(String),
    /// A frame exceeded the configured maximum, on either send or receive.
    PayloadTooLarge { len: usize, max: usize },
    /// Generic I/O error or internal transport failure.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            Self::PayloadTooLarge { len, max } => {
                write!(f, "Payload of {} bytes exceeds the {} byte limit", len, max)
            }
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match e.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
                Self::ConnectionLost(e.to_string())
            }
            _ => Self::Io(e.to_string()),
        }
    }
}

impl From<Error> for Fault {
    fn from(e: Error) -> Self {
        Fault::communication(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// A bidirectional, message-preserving byte channel.
///
/// This trait is designed to be object-safe (`Arc<dyn Transport>`).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Sends one frame.
    ///
    /// # Invariants
    /// - Frames are delivered whole and in order, or not at all.
    /// - Must not interpret the payload.
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Receives the next frame.
    ///
    /// Returns `Ok(None)` once the remote end has closed cleanly.
    async fn recv(&self) -> Result<Option<Vec<u8>>>;

    /// Closes the transport. Idempotent; a pending `recv` wakes with `ConnectionLost`.
    async fn close(&self);
}
