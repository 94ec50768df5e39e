//! A tunnel session exposed as a byte stream.
//!
//! [`TunnelConnection`] owns the application's end of a [`Session`]:
//!
//! ```text
//! write() ──► outbound queue ──► uplink pump / GET /poll handler
//! read()  ◄── inbound queue  ◄── downlink pump / POST /push handler
//! ```
//!
//! Each write hands the whole buffer to the outbound queue as one chunk.
//! Reads copy out of the current inbound chunk and keep whatever did not fit
//! for the next read, so a chunk can be consumed across several reads.
//!
//! Reads and writes race their queue against an optional deadline. The core
//! logic is written in poll form and shared by the inherent async methods and
//! the [`AsyncRead`]/[`AsyncWrite`] impls.

use core::{
    fmt,
    future::Future,
    pin::Pin,
    task::{ready, Context, Poll},
};
use std::{
    io,
    net::SocketAddr,
    sync::atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, Stream};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    time::{Instant, Sleep},
};

use crate::{error::StreamError, session::Session, token::Token};

/// A chunk handed to the outbound queue but not yet accepted by it.
struct PendingWrite {
    chunk: Bytes,
    send: BoxFuture<'static, Result<(), async_channel::SendError<Bytes>>>,
}

/// The application-facing end of a tunnel.
///
/// Implements [`AsyncRead`] and [`AsyncWrite`]. The inherent [`read`],
/// [`write`] and [`close`] methods report [`StreamError`] instead of
/// [`io::Error`].
///
/// Deadlines are absolute. Once a deadline has passed, every read (or write)
/// that would block fails with [`StreamError::TimedOut`] until the deadline
/// is moved or cleared. A timeout leaves the session untouched.
///
/// [`read`]: Self::read
/// [`write`]: Self::write
/// [`close`]: Self::close
pub struct TunnelConnection {
    token: Token,
    session: Session,
    inbound: Pin<Box<async_channel::Receiver<Bytes>>>,
    outbound: async_channel::Sender<Bytes>,
    leftover: Bytes,
    pending_write: Option<PendingWrite>,
    read_deadline: Option<Pin<Box<Sleep>>>,
    write_deadline: Option<Pin<Box<Sleep>>>,
    closed: AtomicBool,
    local_addr: Option<SocketAddr>,
    peer_addr: Option<SocketAddr>,
}

impl TunnelConnection {
    /// Wrap a session.
    #[must_use]
    pub fn new(token: Token, session: Session) -> Self {
        Self {
            inbound: Box::pin(session.inbound_reader()),
            outbound: session.outbound_writer(),
            token,
            session,
            leftover: Bytes::new(),
            pending_write: None,
            read_deadline: None,
            write_deadline: None,
            closed: AtomicBool::new(false),
            local_addr: None,
            peer_addr: None,
        }
    }

    /// Attach the socket addresses of the HTTP connection that created the
    /// session.
    #[must_use]
    pub fn with_addrs(
        mut self,
        local_addr: Option<SocketAddr>,
        peer_addr: Option<SocketAddr>,
    ) -> Self {
        self.local_addr = local_addr;
        self.peer_addr = peer_addr;
        self
    }

    /// The session token.
    #[must_use]
    pub const fn token(&self) -> &Token {
        &self.token
    }

    /// Local address of the HTTP connection that opened the tunnel, if known.
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Remote address of the HTTP connection that opened the tunnel, if known.
    #[must_use]
    pub const fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether this connection or its session has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.is_closed()
    }

    /// Read up to `buf.len()` bytes.
    ///
    /// Returns `Ok(0)` at end-of-stream: the session was closed and every
    /// chunk it had received has been read.
    ///
    /// # Errors
    ///
    /// [`StreamError::Closed`] if [`close`](Self::close) was called on this
    /// connection; [`StreamError::TimedOut`] if the read deadline passed
    /// with no data available.
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize, StreamError> {
        futures::future::poll_fn(|cx| self.poll_read_chunk(cx, buf)).await
    }

    /// Queue the whole of `buf` as one chunk for the peer.
    ///
    /// An empty buffer is a no-op. If the returned future is dropped before it
    /// completes, nothing is queued; a following write of the same bytes
    /// picks the chunk back up in place, any other write discards it.
    ///
    /// # Errors
    ///
    /// [`StreamError::Closed`] if the connection or session is closed;
    /// [`StreamError::TimedOut`] if the write deadline passed while the
    /// outbound queue was full.
    pub async fn write(&mut self, buf: &[u8]) -> Result<usize, StreamError> {
        futures::future::poll_fn(|cx| self.poll_write_chunk(cx, buf)).await
    }

    /// Close the connection and its session.
    ///
    /// Idempotent and safe to call from several places; only the first call
    /// has an effect. Every task waiting on the session wakes up.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            tracing::debug!(token = %self.token, "closing tunnel connection");
            self.session.close();
        }
    }

    /// Set or clear (`None`) the read deadline.
    ///
    /// # Panics
    ///
    /// Arming a deadline panics outside a Tokio runtime with the time driver
    /// enabled.
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Set or clear (`None`) the write deadline.
    ///
    /// # Panics
    ///
    /// Arming a deadline panics outside a Tokio runtime with the time driver
    /// enabled.
    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline.map(|at| Box::pin(tokio::time::sleep_until(at)));
    }

    /// Set or clear both deadlines.
    ///
    /// # Panics
    ///
    /// See [`set_read_deadline`](Self::set_read_deadline).
    pub fn set_deadline(&mut self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    fn take_leftover(&mut self, buf: &mut [u8]) -> usize {
        let n = buf.len().min(self.leftover.len());
        let head = self.leftover.split_to(n);
        if let Some(dst) = buf.get_mut(..n) {
            dst.copy_from_slice(&head);
        }
        n
    }

    fn poll_read_chunk(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut [u8],
    ) -> Poll<Result<usize, StreamError>> {
        if self.closed.load(Ordering::Acquire) {
            return Poll::Ready(Err(StreamError::Closed));
        }

        if !self.leftover.is_empty() {
            return Poll::Ready(Ok(self.take_leftover(buf)));
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        // A closed session closes the inbound queue, which still yields its
        // buffered chunks before ending.
        loop {
            match self.inbound.as_mut().poll_next(cx) {
                Poll::Ready(Some(chunk)) if chunk.is_empty() => continue,
                Poll::Ready(Some(chunk)) => {
                    self.leftover = chunk;
                    return Poll::Ready(Ok(self.take_leftover(buf)));
                }
                Poll::Ready(None) => return Poll::Ready(Ok(0)),
                Poll::Pending => break,
            }
        }

        if let Some(deadline) = self.read_deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                return Poll::Ready(Err(StreamError::TimedOut));
            }
        }

        Poll::Pending
    }

    fn poll_write_chunk(
        &mut self,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<Result<usize, StreamError>> {
        if self.is_closed() {
            self.pending_write = None;
            return Poll::Ready(Err(StreamError::Closed));
        }

        // A write abandoned while pending never reaches the peer.
        if self
            .pending_write
            .as_ref()
            .is_some_and(|pending| pending.chunk != buf)
        {
            self.pending_write = None;
        }

        if buf.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let outbound = &self.outbound;
        let pending = self.pending_write.get_or_insert_with(|| {
            let chunk = Bytes::copy_from_slice(buf);
            let tx = outbound.clone();
            let sent = chunk.clone();
            PendingWrite {
                chunk,
                send: async move { tx.send(sent).await }.boxed(),
            }
        });

        match pending.send.poll_unpin(cx) {
            Poll::Ready(Ok(())) => {
                let written = pending.chunk.len();
                self.pending_write = None;
                Poll::Ready(Ok(written))
            }
            Poll::Ready(Err(_)) => {
                self.pending_write = None;
                Poll::Ready(Err(StreamError::Closed))
            }
            Poll::Pending => self.poll_write_deadline(cx),
        }
    }

    fn poll_write_deadline(&mut self, cx: &mut Context<'_>) -> Poll<Result<usize, StreamError>> {
        if let Some(deadline) = self.write_deadline.as_mut() {
            if deadline.as_mut().poll(cx).is_ready() {
                self.pending_write = None;
                return Poll::Ready(Err(StreamError::TimedOut));
            }
        }
        Poll::Pending
    }
}

impl Unpin for TunnelConnection {}

impl fmt::Debug for TunnelConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelConnection")
            .field("token", &self.token)
            .field("leftover", &self.leftover.len())
            .field("closed", &self.is_closed())
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for TunnelConnection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let n = ready!(this.poll_read_chunk(cx, buf.initialize_unfilled()))
            .map_err(io::Error::from)?;
        buf.advance(n);
        Poll::Ready(Ok(()))
    }
}

impl AsyncWrite for TunnelConnection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut()
            .poll_write_chunk(cx, buf)
            .map_err(io::Error::from)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TunnelConnection {
    fn drop(&mut self) {
        self.close();
    }
}
