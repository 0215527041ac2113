use std::io;

use async_trait::async_trait;
use conv::ValueFrom;
use tracing::{debug, info, warn};

use crate::{
    coordinator,
    error::{Error, Op, Result},
    gate::Gate,
    jar::{Jar, MAX_CONNS},
    net::{Address, Listener, Network},
};

pub use conn::ThrottledConn;

mod conn;

/// A listener which caps the number of simultaneously open connections.
///
/// Every accepted connection holds an admission token until it is closed or dropped. The number
/// of tokens in existence follows the limit set with [ThrottledListener::max_conns], changing one
/// token at a time. Tokens held by open connections are never revoked, so lowering the limit
/// takes effect as connections close.
///
/// Closing the listener stops it from admitting new connections. [ThrottledListener::wait] then
/// returns once every connection it accepted has been closed.
///
/// Must be created from within a tokio runtime. The limit starts at zero.
#[derive(Debug)]
pub struct ThrottledListener<L> {
    inner: L,
    jar: Jar,
    gate: Gate,
    coordinator: coordinator::Handle,
}

/// A snapshot of the state of a [ThrottledListener].
///
/// Not guaranteed to be consistent under concurrency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerState {
    limit: usize,
    target: usize,
    available: usize,
    active: usize,
}

impl<L> ThrottledListener<L>
where
    L: Listener,
{
    /// Wrap `inner`, admitting no connections until a limit is set.
    pub fn new(inner: L) -> Self {
        let jar = Jar::new();
        let coordinator = coordinator::spawn(jar.clone());

        Self {
            inner,
            jar,
            gate: Gate::new(),
            coordinator,
        }
    }

    /// Wrap `inner` with an initial limit of `max` connections.
    pub async fn with_max_conns(inner: L, max: usize) -> Self {
        let listener = Self::new(inner);
        listener.set_max_conns(max).await;
        listener
    }

    /// Wait for an admission token, then for the next connection.
    ///
    /// Fails with [Error::Closed] once the listener is closed, including for accepts which were
    /// already waiting on the wrapped listener; those keep its failure as the error's source. Other
    /// failures of the wrapped listener are returned
    /// unchanged, after giving the token back.
    pub async fn accept(&self) -> Result<ThrottledConn<L::Conn>> {
        let Some(token) = self.jar.take().await else {
            return Err(self.closed(Op::Accept, None));
        };
        // Tokens still circulate while draining.
        if self.coordinator.is_shut_down() {
            return Err(self.closed(Op::Accept, None));
        }

        match self.inner.accept().await {
            Ok(conn) => Ok(ThrottledConn::new(conn, token)),
            // Closing the wrapped listener fails accepts which were already waiting on it.
            Err(err) if self.coordinator.is_shut_down() => {
                Err(self.closed(Op::Accept, Some(err)))
            }
            Err(err) => Err(Error::Io(err)),
        }
    }

    /// Close the listener.
    ///
    /// Only the first call closes the wrapped listener, returning its result. Even if that fails
    /// the listener stops admitting connections. Every later call fails with [Error::Closed].
    pub async fn close(&self) -> Result<()> {
        let Some(pass) = self.gate.enter().await else {
            return Err(self.closed(Op::Close, None));
        };
        pass.close_gate();
        self.coordinator.shutdown();

        info!(
            addr = %self.address(),
            active = self.jar.held(),
            "closing throttled listener"
        );

        self.inner.close().await.map_err(|err| {
            warn!(error = %err, "failed to close wrapped listener");
            Error::Io(err)
        })
    }

    /// Wait until the listener is closed and every connection it accepted has been closed.
    ///
    /// Any number of callers may wait.
    pub async fn wait(&self) {
        self.coordinator.drained().await;
    }

    /// Set the connection limit and return the number of free admission slots.
    ///
    /// A negative `n` only queries. Limits above [MAX_CONNS] are clamped. Calling this after
    /// [ThrottledListener::close] has no effect.
    ///
    /// The limit changes gradually, so the returned value is an estimate taken before the change.
    pub async fn max_conns(&self, n: i64) -> usize {
        let ceiling = i64::value_from(MAX_CONNS).unwrap_or(i64::MAX);
        match usize::value_from(n.min(ceiling)) {
            Ok(n) => self.set_max_conns(n).await,
            // Negative.
            Err(_) => self.available(),
        }
    }

    /// Set the connection limit and return the number of free admission slots.
    ///
    /// See [ThrottledListener::max_conns].
    pub async fn set_max_conns(&self, n: usize) -> usize {
        let available = self.available();
        let n = n.min(MAX_CONNS);

        if let Some(_pass) = self.gate.enter().await {
            debug!(max_conns = n, available, "setting connection limit");
            self.coordinator.set_target(n);
        }

        available
    }

    /// The number of free admission slots.
    pub fn available(&self) -> usize {
        self.jar.occupancy()
    }

    /// The current state of the listener.
    pub fn state(&self) -> ListenerState {
        ListenerState {
            limit: self.coordinator.limit(),
            target: self.coordinator.target(),
            available: self.jar.occupancy(),
            active: self.jar.held(),
        }
    }

    /// Whether [ThrottledListener::close] has been called.
    pub fn is_closed(&self) -> bool {
        self.gate.is_closed()
    }

    /// Whether every connection has been reclaimed after closing.
    pub fn is_drained(&self) -> bool {
        self.coordinator.is_drained()
    }

    /// The wrapped listener's local address.
    pub fn local_addr(&self) -> io::Result<Address> {
        self.inner.local_addr()
    }

    /// The wrapped listener.
    pub fn get_ref(&self) -> &L {
        &self.inner
    }

    fn address(&self) -> Address {
        self.inner.local_addr().unwrap_or(Address::Unknown)
    }

    fn closed(&self, op: Op, source: Option<io::Error>) -> Error {
        Error::Closed {
            op,
            net: self.inner.network(),
            addr: self.address(),
            source,
        }
    }
}

#[async_trait]
impl<L> Listener for ThrottledListener<L>
where
    L: Listener,
{
    type Conn = ThrottledConn<L::Conn>;

    async fn accept(&self) -> io::Result<Self::Conn> {
        Ok(ThrottledListener::accept(self).await?)
    }

    async fn close(&self) -> io::Result<()> {
        Ok(ThrottledListener::close(self).await?)
    }

    fn local_addr(&self) -> io::Result<Address> {
        self.inner.local_addr()
    }

    fn network(&self) -> Network {
        self.inner.network()
    }
}

impl ListenerState {
    /// The number of admission tokens in existence, whether free or held.
    pub fn limit(&self) -> usize {
        self.limit
    }
    /// The most recently requested limit.
    pub fn target(&self) -> usize {
        self.target
    }
    /// The number of free admission slots.
    pub fn available(&self) -> usize {
        self.available
    }
    /// The number of admission tokens held by open connections and in-progress accepts.
    pub fn active(&self) -> usize {
        self.active
    }
}
