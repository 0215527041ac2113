//! The listener and connection contracts a [ThrottledListener](crate::ThrottledListener) wraps,
//! along with adapters for tokio's TCP and Unix domain socket listeners.

use std::{
    fmt, io,
    net::SocketAddr,
    path::PathBuf,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream, ToSocketAddrs},
};
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A source of incoming connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// The connection type produced by [Listener::accept].
    type Conn: Connection;

    /// Wait for and return the next connection.
    async fn accept(&self) -> io::Result<Self::Conn>;

    /// Stop listening.
    ///
    /// Pending and future calls to [Listener::accept] should fail once this returns.
    async fn close(&self) -> io::Result<()>;

    /// The local address this listener is bound to.
    fn local_addr(&self) -> io::Result<Address>;

    /// The network family, used to tag errors.
    fn network(&self) -> Network {
        Network::Other
    }
}

/// An accepted connection.
#[async_trait]
pub trait Connection: Send + 'static {
    /// Close the connection.
    async fn close(&mut self) -> io::Result<()>;
}

/// The network family of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    /// TCP over IPv4 or IPv6.
    Tcp,
    /// Unix domain stream sockets.
    Unix,
    /// Anything else.
    Other,
}

/// A listener's local address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// An IP socket address.
    Inet(SocketAddr),
    /// A Unix domain socket path, or `None` for an unnamed socket.
    Unix(Option<PathBuf>),
    /// The address could not be determined.
    Unknown,
}

/// Adapts a [TcpListener] to the [Listener] contract.
#[derive(Debug)]
pub struct TcpAcceptor {
    shared: Shared<TcpListener>,
}

/// Adapts a [UnixListener] to the [Listener] contract.
#[cfg(unix)]
#[derive(Debug)]
pub struct UnixAcceptor {
    shared: Shared<UnixListener>,
}

/// A listener which can be closed while other tasks are accepting from it.
///
/// Closing drops our handle and wakes pending accepts, so the socket is released once the last
/// in-flight accept returns.
#[derive(Debug)]
struct Shared<T> {
    listener: Mutex<Option<Arc<T>>>,
    closed: CancellationToken,
    addr: Address,
}

impl<T> Shared<T> {
    fn new(listener: T, addr: Address) -> Self {
        Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
            addr,
        }
    }

    fn get(&self) -> io::Result<Arc<T>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or_else(closed_error)
    }

    fn close(&self) -> io::Result<()> {
        let taken = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.closed.cancel();

        match taken {
            Some(_) => Ok(()),
            None => Err(closed_error()),
        }
    }

    fn addr(&self) -> io::Result<Address> {
        match &self.addr {
            Address::Unknown => Err(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                "listener address unknown",
            )),
            addr => Ok(addr.clone()),
        }
    }
}

fn closed_error() -> io::Error {
    io::Error::new(
        io::ErrorKind::NotConnected,
        "use of closed network connection",
    )
}

impl TcpAcceptor {
    /// Wrap a bound [TcpListener].
    pub fn new(listener: TcpListener) -> Self {
        let addr = listener
            .local_addr()
            .map(Address::Inet)
            .unwrap_or(Address::Unknown);

        Self {
            shared: Shared::new(listener, addr),
        }
    }

    /// Bind a new TCP listener to `addr`.
    pub async fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        TcpListener::bind(addr).await.map(Self::new)
    }

    /// The bound socket address.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.shared.addr {
            Address::Inet(addr) => Some(addr),
            _ => None,
        }
    }

    #[cfg(unix)]
    pub(crate) fn listener(&self) -> io::Result<Arc<TcpListener>> {
        self.shared.get()
    }
}

impl From<TcpListener> for TcpAcceptor {
    fn from(listener: TcpListener) -> Self {
        Self::new(listener)
    }
}

#[async_trait]
impl Listener for TcpAcceptor {
    type Conn = TcpStream;

    async fn accept(&self) -> io::Result<TcpStream> {
        let listener = self.shared.get()?;

        tokio::select! {
            accepted = listener.accept() => accepted.map(|(stream, _)| stream),
            _ = self.shared.closed.cancelled() => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.shared.addr()
    }

    fn network(&self) -> Network {
        Network::Tcp
    }
}

#[cfg(unix)]
impl UnixAcceptor {
    /// Wrap a bound [UnixListener].
    pub fn new(listener: UnixListener) -> Self {
        let addr = listener
            .local_addr()
            .map(|addr| Address::Unix(addr.as_pathname().map(PathBuf::from)))
            .unwrap_or(Address::Unknown);

        Self {
            shared: Shared::new(listener, addr),
        }
    }

    /// Bind a new Unix domain socket listener to `path`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(path: impl AsRef<std::path::Path>) -> io::Result<Self> {
        UnixListener::bind(path).map(Self::new)
    }

    pub(crate) fn listener(&self) -> io::Result<Arc<UnixListener>> {
        self.shared.get()
    }
}

#[cfg(unix)]
impl From<UnixListener> for UnixAcceptor {
    fn from(listener: UnixListener) -> Self {
        Self::new(listener)
    }
}

#[cfg(unix)]
#[async_trait]
impl Listener for UnixAcceptor {
    type Conn = UnixStream;

    async fn accept(&self) -> io::Result<UnixStream> {
        let listener = self.shared.get()?;

        tokio::select! {
            accepted = listener.accept() => accepted.map(|(stream, _)| stream),
            _ = self.shared.closed.cancelled() => Err(closed_error()),
        }
    }

    async fn close(&self) -> io::Result<()> {
        self.shared.close()
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.shared.addr()
    }

    fn network(&self) -> Network {
        Network::Unix
    }
}

#[async_trait]
impl Connection for TcpStream {
    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

#[cfg(unix)]
#[async_trait]
impl Connection for UnixStream {
    async fn close(&mut self) -> io::Result<()> {
        self.shutdown().await
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Network::Tcp => f.write_str("tcp"),
            Network::Unix => f.write_str("unix"),
            Network::Other => f.write_str("other"),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Inet(addr) => addr.fmt(f),
            Address::Unix(Some(path)) => path.display().fmt(f),
            Address::Unix(None) => f.write_str("(unnamed)"),
            Address::Unknown => f.write_str("(unknown)"),
        }
    }
}
