use std::{fmt, io};

use crate::net::{Address, Network};

/// A specialized [Result](std::result::Result) for throttled listener operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by a [ThrottledListener](crate::ThrottledListener).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The listener has already been closed.
    ///
    /// Returned by `accept` once the listener is closed, and by every `close` after the first.
    #[error("{op} {net} {addr}: use of closed network connection")]
    Closed {
        /// The operation that observed the closed listener.
        op: Op,
        /// The network family of the wrapped listener.
        net: Network,
        /// The local address of the wrapped listener.
        addr: Address,
        /// The wrapped listener's failure, for accepts it was still serving when closed.
        #[source]
        source: Option<io::Error>,
    },

    /// A failure reported by the wrapped listener, passed through unchanged.
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The listener operation an [Error::Closed] was raised by.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    /// Accepting a connection.
    Accept,
    /// Closing the listener.
    Close,
}

impl Error {
    /// Whether this error reports a closed listener.
    pub fn is_closed(&self) -> bool {
        matches!(self, Error::Closed { .. })
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            closed @ Error::Closed { .. } => io::Error::new(io::ErrorKind::NotConnected, closed),
        }
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Accept => f.write_str("accept"),
            Op::Close => f.write_str("close"),
        }
    }
}
