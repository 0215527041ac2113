use std::{
    io,
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::{jar::Token, net::Connection};

/// A connection accepted by a [ThrottledListener](crate::ThrottledListener).
///
/// Holds one admission token for as long as the connection is open. The token goes back to the
/// listener the first time the connection is closed, or when it is dropped, whichever is first.
#[derive(Debug)]
pub struct ThrottledConn<C> {
    conn: C,
    token: Option<Token>,
}

impl<C> ThrottledConn<C> {
    pub(crate) fn new(conn: C, token: Token) -> Self {
        Self {
            conn,
            token: Some(token),
        }
    }

    /// The wrapped connection.
    pub fn get_ref(&self) -> &C {
        &self.conn
    }

    /// The wrapped connection.
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.conn
    }

    /// Whether this connection still counts towards the listener's limit.
    pub fn holds_token(&self) -> bool {
        self.token.is_some()
    }
}

impl<C> ThrottledConn<C>
where
    C: Connection,
{
    /// Close the wrapped connection and give up its admission token.
    ///
    /// The token is returned exactly once, however many times this is called, and even if closing
    /// the wrapped connection fails.
    pub async fn close(&mut self) -> io::Result<()> {
        let closed = self.conn.close().await;
        self.token.take();
        closed
    }
}

#[async_trait]
impl<C> Connection for ThrottledConn<C>
where
    C: Connection,
{
    async fn close(&mut self) -> io::Result<()> {
        ThrottledConn::close(self).await
    }
}

impl<C> Deref for ThrottledConn<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.conn
    }
}

impl<C> DerefMut for ThrottledConn<C> {
    fn deref_mut(&mut self) -> &mut C {
        &mut self.conn
    }
}

impl<C> AsyncRead for ThrottledConn<C>
where
    C: AsyncRead + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_read(cx, buf)
    }
}

impl<C> AsyncWrite for ThrottledConn<C>
where
    C: AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().conn).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().conn).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.conn.is_write_vectored()
    }
}
