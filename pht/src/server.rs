//! Hyper-based HTTP server for the tunnel.
//!
//! | Endpoint | Method | Purpose                                   |
//! |----------|--------|-------------------------------------------|
//! | `/token` | POST   | Check the key, open a session             |
//! | `/push`  | POST   | Client sends one chunk to the server      |
//! | `/poll`  | GET    | Server streams chunks until a cycle ends  |
//! | `/close` | POST   | Clean session teardown                    |
//!
//! [`TunnelHandler::handle`] can be mounted in any hyper service;
//! [`serve`] runs a complete accept loop with an idle session reaper.

use core::{convert::Infallible, fmt, future::Future, net::SocketAddr, time::Duration};
use std::sync::Arc;

use futures::{future::BoxFuture, FutureExt};
use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Empty, Full, Limited, StreamBody};
use hyper::{
    body::{Body, Bytes, Frame},
    header::CONTENT_TYPE,
    HeaderMap, Method, Request, Response, StatusCode,
};
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinSet,
    time::MissedTickBehavior,
};
use tokio_util::sync::CancellationToken;

use crate::{
    auth::Credentials,
    connection::TunnelConnection,
    error::{DeliveryError, ServerError},
    session::{Session, SessionRegistry},
    token::Token,
    AUTHORIZATION_HEADER, CLOSE_PATH, DEFAULT_DELIVERY_WATCHDOG_SECS, DEFAULT_MAX_BODY_SIZE,
    DEFAULT_POLL_CYCLE_SECS, DEFAULT_SESSION_TIMEOUT_SECS, POLL_PATH, PUSH_PATH, TOKEN_PATH,
};

/// Response body type produced by [`TunnelHandler`].
pub type TunnelBody = UnsyncBoxBody<Bytes, Infallible>;

type ConnectFn = Arc<dyn Fn(TunnelConnection) -> BoxFuture<'static, ()> + Send + Sync>;

/// Server-side handler state, shared across request handlers.
#[derive(Clone)]
pub struct TunnelHandler {
    key: Arc<str>,
    sessions: SessionRegistry,
    on_connect: ConnectFn,
    delivery_watchdog: Duration,
    poll_cycle: Duration,
    max_body_size: usize,
    session_timeout: Duration,
    local_addr: Option<SocketAddr>,
}

impl TunnelHandler {
    /// Create a handler that accepts clients presenting `key`.
    ///
    /// `on_connect` is spawned on its own task with the server side of every
    /// newly opened tunnel.
    #[must_use]
    pub fn new<F, Fut>(key: &str, on_connect: F) -> Self
    where
        F: Fn(TunnelConnection) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            key: key.into(),
            sessions: SessionRegistry::new(),
            on_connect: Arc::new(move |conn| on_connect(conn).boxed()),
            delivery_watchdog: Duration::from_secs(DEFAULT_DELIVERY_WATCHDOG_SECS),
            poll_cycle: Duration::from_secs(DEFAULT_POLL_CYCLE_SECS),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
            session_timeout: Duration::from_secs(DEFAULT_SESSION_TIMEOUT_SECS),
            local_addr: None,
        }
    }

    /// Set how long a `/poll` response may sit idle before it ends.
    #[must_use]
    pub const fn with_poll_cycle(mut self, cycle: Duration) -> Self {
        self.poll_cycle = cycle;
        self
    }

    /// Set how long a pushed chunk may wait for inbound queue space.
    #[must_use]
    pub const fn with_delivery_watchdog(mut self, watchdog: Duration) -> Self {
        self.delivery_watchdog = watchdog;
        self
    }

    /// Set the maximum request body size.
    #[must_use]
    pub const fn with_max_body_size(mut self, size: usize) -> Self {
        self.max_body_size = size;
        self
    }

    /// Set how long a session may go without requests before [`serve`]
    /// reaps it.
    #[must_use]
    pub const fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Set the address reported as [`TunnelConnection::local_addr`].
    #[must_use]
    pub const fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.local_addr = Some(addr);
        self
    }

    /// Access the session registry.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Route an incoming HTTP request to the appropriate handler.
    ///
    /// `peer` is the remote address of the HTTP connection, if known. Errors
    /// are mapped to status codes; unknown paths get 404.
    ///
    /// # Errors
    ///
    /// Never fails; the `hyper::Error` type fits [`hyper::service::service_fn`].
    pub async fn handle<B>(
        &self,
        req: Request<B>,
        peer: Option<SocketAddr>,
    ) -> Result<Response<TunnelBody>, hyper::Error>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let path = req.uri().path().to_owned();
        let method = req.method().clone();

        tracing::debug!("{method} {path}");

        let expected = match path.as_str() {
            TOKEN_PATH | PUSH_PATH | CLOSE_PATH => Method::POST,
            POLL_PATH => Method::GET,
            _ => return Ok(not_found()),
        };

        if method != expected {
            return Ok(error_response(&ServerError::MethodNotAllowed));
        }

        let response = match path.as_str() {
            TOKEN_PATH => self.handle_token(req.headers(), peer).await,
            PUSH_PATH => self.handle_push(req).await,
            POLL_PATH => self.handle_poll(req.headers()).await,
            _ => self.handle_close(req.headers()).await,
        };

        Ok(response.unwrap_or_else(|e| {
            match &e {
                ServerError::Forbidden | ServerError::UnknownSession => {
                    tracing::debug!("{method} {path} rejected: {e}");
                }
                _ => tracing::warn!("{method} {path} failed: {e}"),
            }
            error_response(&e)
        }))
    }

    /// Handle `POST /token`.
    async fn handle_token(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<Response<TunnelBody>, ServerError> {
        self.authorize(headers)?;

        let (token, session) = self.sessions.create().await?;
        tracing::info!(token = %token, ?peer, "tunnel opened");

        let body = Bytes::from(format!("token={token}"));
        let conn = TunnelConnection::new(token, session).with_addrs(self.local_addr, peer);
        tokio::spawn((self.on_connect)(conn));

        Ok(ok_response(Full::new(body).boxed_unsync()))
    }

    /// Handle `POST /push`.
    ///
    /// The whole body is delivered to the session's inbound queue as one
    /// chunk.
    async fn handle_push<B>(&self, req: Request<B>) -> Result<Response<TunnelBody>, ServerError>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn core::error::Error + Send + Sync>>,
    {
        let (token, session) = self.lookup(req.headers()).await?;

        let body = match Limited::new(req.into_body(), self.max_body_size)
            .collect()
            .await
        {
            Ok(collected) => collected.to_bytes(),
            Err(e) => {
                self.sessions.teardown(&token).await;
                return Err(ServerError::BodyRead(e.to_string()));
            }
        };

        if body.is_empty() {
            return Ok(empty_ok());
        }

        let len = body.len();
        match session.deliver_inbound(body, self.delivery_watchdog).await {
            Ok(()) => {
                tracing::trace!(token = %token, "received {len} bytes");
                Ok(empty_ok())
            }
            Err(DeliveryError::Closed) => {
                self.sessions.remove(&token).await;
                Ok(empty_ok())
            }
            Err(DeliveryError::TimedOut) => {
                self.sessions.teardown(&token).await;
                Err(ServerError::DeliveryTimeout)
            }
        }
    }

    /// Handle `GET /poll`.
    ///
    /// Responds immediately and streams outbound chunks as separate body
    /// frames. The body ends after one idle poll cycle, or once the session
    /// is closed and its outbound queue drained.
    async fn handle_poll(&self, headers: &HeaderMap) -> Result<Response<TunnelBody>, ServerError> {
        let (token, session) = self.lookup(headers).await?;
        tracing::trace!(token = %token, "poll cycle started");

        let stream = egress(self.sessions.clone(), token, session, self.poll_cycle);
        Ok(ok_response(StreamBody::new(stream).boxed_unsync()))
    }

    /// Handle `POST /close`.
    async fn handle_close(&self, headers: &HeaderMap) -> Result<Response<TunnelBody>, ServerError> {
        let (token, _session) = self.lookup(headers).await?;

        if self.sessions.teardown(&token).await {
            tracing::info!(token = %token, "client disconnected");
        }

        Ok(empty_ok())
    }

    /// Check the key, returning the token if the credential carries a
    /// well-formed one.
    fn authorize(&self, headers: &HeaderMap) -> Result<Option<Token>, ServerError> {
        let header = headers
            .get(AUTHORIZATION_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        let creds = Credentials::parse(header);

        if !creds.key_matches(&self.key) {
            return Err(ServerError::Forbidden);
        }

        Ok(creds.token.parse().ok())
    }

    /// Authorize and resolve the credential's session.
    async fn lookup(&self, headers: &HeaderMap) -> Result<(Token, Session), ServerError> {
        let token = self.authorize(headers)?.ok_or(ServerError::UnknownSession)?;
        let session = self
            .sessions
            .get(&token)
            .await
            .ok_or(ServerError::UnknownSession)?;
        Ok((token, session))
    }
}

impl fmt::Debug for TunnelHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelHandler")
            .field("sessions", &self.sessions)
            .field("delivery_watchdog", &self.delivery_watchdog)
            .field("poll_cycle", &self.poll_cycle)
            .field("max_body_size", &self.max_body_size)
            .field("session_timeout", &self.session_timeout)
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Body frames for one poll response.
fn egress(
    sessions: SessionRegistry,
    token: Token,
    session: Session,
    cycle: Duration,
) -> impl futures::Stream<Item = Result<Frame<Bytes>, Infallible>> + Send + 'static {
    futures::stream::unfold(Some((token, session)), move |state| {
        let sessions = sessions.clone();
        async move {
            let (token, session) = state?;

            tokio::select! {
                chunk = session.pull_outbound() => {
                    if let Some(chunk) = chunk {
                        sessions.touch(&token).await;
                        Some((Ok(Frame::data(chunk)), Some((token, session))))
                    } else {
                        tracing::debug!(token = %token, "session closed, ending poll");
                        sessions.teardown(&token).await;
                        None
                    }
                }
                () = tokio::time::sleep(cycle) => {
                    tracing::trace!(token = %token, "poll cycle idle");
                    None
                }
            }
        }
    })
}

/// Serve tunnel requests on `listener` until `cancel` fires.
///
/// Each accepted TCP connection is served by hyper (HTTP/1.1 or h2c) on its
/// own task. A background task reaps idle sessions. On cancellation every
/// session is closed and open connections are shut down gracefully.
pub async fn serve(listener: TcpListener, handler: TunnelHandler, cancel: CancellationToken) {
    let handler = match listener.local_addr() {
        Ok(addr) => {
            tracing::info!("tunnel server listening on {addr}");
            handler.with_local_addr(addr)
        }
        Err(_) => handler,
    };

    let reaper = tokio::spawn(reap_idle(
        handler.sessions.clone(),
        handler.session_timeout,
        cancel.child_token(),
    ));

    let mut conns = JoinSet::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => {
                tracing::info!("accept loop canceled");
                break;
            }
            res = listener.accept() => {
                match res {
                    Ok((tcp, addr)) => {
                        tracing::debug!("new TCP connection from {addr}");
                        conns.spawn(serve_connection(
                            tcp,
                            addr,
                            handler.clone(),
                            cancel.child_token(),
                        ));
                    }
                    Err(e) => tracing::error!("accept error: {e}"),
                }
            }
        }
    }

    handler.sessions.close_all().await;
    while conns.join_next().await.is_some() {}
    if let Err(e) = reaper.await {
        tracing::error!("session reaper failed: {e}");
    }
}

async fn serve_connection(
    tcp: TcpStream,
    addr: SocketAddr,
    handler: TunnelHandler,
    cancel: CancellationToken,
) {
    use hyper_util::rt::{TokioExecutor, TokioIo};

    let io = TokioIo::new(tcp);

    let service = hyper::service::service_fn(move |req| {
        let handler = handler.clone();
        async move { handler.handle(req, Some(addr)).await }
    });

    let builder = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        res = conn.as_mut() => res,
        () = cancel.cancelled() => {
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };

    if let Err(e) = result {
        tracing::debug!("HTTP connection from {addr} ended: {e}");
    }
}

/// Periodically expire sessions idle for longer than `max_idle`.
async fn reap_idle(sessions: SessionRegistry, max_idle: Duration, cancel: CancellationToken) {
    let mut interval = tokio::time::interval((max_idle / 4).max(Duration::from_secs(1)));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = interval.tick() => {
                let expired = sessions.expire_idle(max_idle).await;
                if !expired.is_empty() {
                    tracing::info!("reaped {} idle sessions", expired.len());
                }
            }
        }
    }
}

#[allow(clippy::expect_used)]
fn ok_response(body: TunnelBody) -> Response<TunnelBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/octet-stream")
        .body(body)
        .expect("valid response")
}

#[allow(clippy::expect_used)]
fn empty_ok() -> Response<TunnelBody> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Empty::new().boxed_unsync())
        .expect("valid response")
}

#[allow(clippy::expect_used)]
fn not_found() -> Response<TunnelBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Full::new(Bytes::from_static(b"not found")).boxed_unsync())
        .expect("static response")
}

/// Build a simple error response.
#[allow(clippy::expect_used)]
fn error_response(err: &ServerError) -> Response<TunnelBody> {
    Response::builder()
        .status(err.status())
        .body(Full::new(Bytes::from(err.to_string())).boxed_unsync())
        .expect("valid error response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;

    const KEY: &str = "secret";

    fn handler() -> (TunnelHandler, async_channel::Receiver<TunnelConnection>) {
        let (tx, rx) = async_channel::unbounded();
        let handler = TunnelHandler::new(KEY, move |conn| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(conn).await;
            }
        });
        (handler, rx)
    }

    fn request(
        method: Method,
        path: &str,
        credential: &str,
        body: &'static [u8],
    ) -> Request<Full<Bytes>> {
        Request::builder()
            .method(method)
            .uri(path)
            .header(AUTHORIZATION_HEADER, credential)
            .body(Full::new(Bytes::from_static(body)))
            .expect("valid request")
    }

    async fn body_bytes(resp: Response<TunnelBody>) -> Bytes {
        resp.into_body().collect().await.expect("infallible").to_bytes()
    }

    /// Open a tunnel through the handler, returning the token and the
    /// server-side connection.
    async fn open(
        handler: &TunnelHandler,
        accepted: &async_channel::Receiver<TunnelConnection>,
    ) -> (Token, TunnelConnection) {
        let resp = handler
            .handle(request(Method::POST, TOKEN_PATH, &auth::key_header(KEY), b""), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_bytes(resp).await;
        let body = core::str::from_utf8(&body).expect("utf8");
        let token: Token = body
            .strip_prefix("token=")
            .expect("token prefix")
            .parse()
            .expect("valid token");

        let conn = accepted.recv().await.expect("accepted connection");
        assert_eq!(conn.token(), &token);
        (token, conn)
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let (handler, _accepted) = handler();
        let resp = handler
            .handle(request(Method::GET, "/nope", "", b""), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn wrong_method_is_rejected() {
        let (handler, _accepted) = handler();
        for (method, path) in [
            (Method::GET, TOKEN_PATH),
            (Method::GET, PUSH_PATH),
            (Method::POST, POLL_PATH),
            (Method::GET, CLOSE_PATH),
        ] {
            let resp = handler
                .handle(request(method, path, &auth::key_header(KEY), b""), None)
                .await
                .expect("handle");
            assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED, "{path}");
        }
        assert!(handler.sessions().is_empty().await);
    }

    #[tokio::test]
    async fn wrong_key_is_forbidden() {
        let (handler, accepted) = handler();
        let resp = handler
            .handle(request(Method::POST, TOKEN_PATH, "key=wrong", b""), None)
            .await
            .expect("handle");

        assert_eq!(resp.status(), StatusCode::FORBIDDEN);
        assert!(handler.sessions().is_empty().await);
        assert!(accepted.is_empty());
    }

    #[tokio::test]
    async fn token_opens_session_with_peer_addr() {
        let (handler, accepted) = handler();
        let peer: SocketAddr = "10.1.2.3:4567".parse().expect("addr");

        let resp = handler
            .handle(request(Method::POST, TOKEN_PATH, &auth::key_header(KEY), b""), Some(peer))
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::OK);

        let conn = accepted.recv().await.expect("accepted connection");
        assert_eq!(conn.peer_addr(), Some(peer));
        assert!(handler.sessions().get(conn.token()).await.is_some());
    }

    #[tokio::test]
    async fn push_with_unknown_token_is_unauthorized() {
        let (handler, _accepted) = handler();
        let resp = handler
            .handle(request(Method::POST, PUSH_PATH, "key=secret; token=missing", b"x"), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

        let resp = handler
            .handle(request(Method::POST, PUSH_PATH, "key=secret", b"x"), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn push_reaches_server_connection() {
        let (handler, accepted) = handler();
        let (token, mut conn) = open(&handler, &accepted).await;
        let credential = auth::session_header(KEY, &token);

        let resp = handler
            .handle(request(Method::POST, PUSH_PATH, &credential, b"ping"), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::OK);

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn empty_push_is_acknowledged_and_ignored() {
        let (handler, accepted) = handler();
        let (token, mut conn) = open(&handler, &accepted).await;
        let credential = auth::session_header(KEY, &token);

        for body in [&b""[..], &b"after"[..]] {
            let resp = handler
                .handle(request(Method::POST, PUSH_PATH, &credential, body), None)
                .await
                .expect("handle");
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let mut buf = [0u8; 16];
        let n = conn.read(&mut buf).await.expect("read");
        assert_eq!(&buf[..n], b"after");
    }

    #[tokio::test]
    async fn oversized_push_tears_session_down() {
        let (handler, accepted) = handler();
        let handler = handler.with_max_body_size(4);
        let (token, conn) = open(&handler, &accepted).await;

        let resp = handler
            .handle(
                request(Method::POST, PUSH_PATH, &auth::session_header(KEY, &token), b"too long"),
                None,
            )
            .await
            .expect("handle");

        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(handler.sessions().get(&token).await.is_none());
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn stalled_push_times_out() {
        let (handler, accepted) = handler();
        let handler = handler.with_delivery_watchdog(Duration::from_millis(20));
        let (token, _conn) = open(&handler, &accepted).await;
        let credential = auth::session_header(KEY, &token);

        let mut last = StatusCode::OK;
        for _ in 0..200 {
            let resp = handler
                .handle(request(Method::POST, PUSH_PATH, &credential, b"x"), None)
                .await
                .expect("handle");
            last = resp.status();
            if last != StatusCode::OK {
                break;
            }
        }

        assert_eq!(last, StatusCode::REQUEST_TIMEOUT);
        assert!(handler.sessions().get(&token).await.is_none());
    }

    #[tokio::test]
    async fn poll_streams_queued_chunks_then_ends_when_idle() {
        let (handler, accepted) = handler();
        let handler = handler.with_poll_cycle(Duration::from_millis(50));
        let (token, mut conn) = open(&handler, &accepted).await;

        conn.write(b"A").await.expect("write");
        conn.write(b"B").await.expect("write");

        let resp = handler
            .handle(request(Method::GET, POLL_PATH, &auth::session_header(KEY, &token), b""), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_bytes(resp).await, Bytes::from_static(b"AB"));

        assert!(handler.sessions().get(&token).await.is_some());
    }

    #[tokio::test]
    async fn poll_ends_and_tears_down_after_server_close() {
        let (handler, accepted) = handler();
        let (token, mut conn) = open(&handler, &accepted).await;

        conn.write(b"bye").await.expect("write");
        conn.close();

        let resp = handler
            .handle(request(Method::GET, POLL_PATH, &auth::session_header(KEY, &token), b""), None)
            .await
            .expect("handle");
        assert_eq!(body_bytes(resp).await, Bytes::from_static(b"bye"));
        assert!(handler.sessions().get(&token).await.is_none());
    }

    #[tokio::test]
    async fn close_endpoint_ends_server_stream() {
        let (handler, accepted) = handler();
        let (token, mut conn) = open(&handler, &accepted).await;
        let credential = auth::session_header(KEY, &token);

        let resp = handler
            .handle(request(Method::POST, CLOSE_PATH, &credential, b""), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::OK);

        let mut buf = [0u8; 4];
        assert_eq!(conn.read(&mut buf).await.expect("eof"), 0);

        let resp = handler
            .handle(request(Method::POST, CLOSE_PATH, &credential, b""), None)
            .await
            .expect("handle");
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn reaper_expires_idle_sessions() {
        let sessions = SessionRegistry::new();
        let (_, session) = sessions.create().await.expect("create");
        let cancel = CancellationToken::new();

        let reaper = tokio::spawn(reap_idle(
            sessions.clone(),
            Duration::from_millis(10),
            cancel.clone(),
        ));

        // The first tick fires immediately; the second runs after one period.
        tokio::time::sleep(Duration::from_millis(1200)).await;
        assert!(session.is_closed());
        assert!(sessions.is_empty().await);

        cancel.cancel();
        reaper.await.expect("reaper task");
    }
}
