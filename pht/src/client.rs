//! Dialing side of the tunnel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     TunnelClient                          │
//! │                                                          │
//! │  TunnelConnection::write ──► outbound ──► uplink task    │
//! │                                    POST /push ─────────► │
//! │                                                          │
//! │  TunnelConnection::read ◄── inbound ◄── downlink task    │
//! │                                    GET /poll ◄────────── │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Neither task retries. The first failed request tears the session down,
//! which the application observes as end-of-stream or
//! [`StreamError::Closed`](crate::error::StreamError::Closed).

use std::sync::Arc;

use bytes::Bytes;
use core::time::Duration;
use futures::StreamExt;

use crate::{
    auth,
    connection::TunnelConnection,
    error::{DeliveryError, DialError, PumpError},
    http_client::HttpClient,
    session::{Session, SessionRegistry},
    token::Token,
    AUTHORIZATION_HEADER, CLOSE_PATH, DEFAULT_DELIVERY_WATCHDOG_SECS, POLL_PATH, PUSH_PATH,
    TOKEN_PATH,
};

#[cfg(feature = "reqwest")]
use crate::http_client::ReqwestHttpClient;

/// Opens tunnels to one server.
///
/// Each [`dial`](Self::dial) performs a token handshake and spawns an uplink
/// and a downlink task on the current Tokio runtime. The client's
/// [`SessionRegistry`] holds every tunnel that is still live.
#[derive(Debug, Clone)]
pub struct TunnelClient<H> {
    base_url: Arc<str>,
    key: Arc<str>,
    http: H,
    sessions: SessionRegistry,
    delivery_watchdog: Duration,
}

#[cfg(feature = "reqwest")]
impl TunnelClient<ReqwestHttpClient> {
    /// Create a client for `host` using a default [`ReqwestHttpClient`].
    ///
    /// `host` is an authority such as `tunnel.example.com:8080`, or a base
    /// URL with an explicit `http://` / `https://` scheme.
    #[must_use]
    pub fn new(host: &str, key: &str) -> Self {
        Self::with_http_client(host, key, ReqwestHttpClient::new())
    }
}

impl<H: HttpClient> TunnelClient<H> {
    /// Create a client that sends its requests through `http`.
    #[must_use]
    pub fn with_http_client(host: &str, key: &str, http: H) -> Self {
        Self {
            base_url: base_url(host).into(),
            key: key.into(),
            http,
            sessions: SessionRegistry::new(),
            delivery_watchdog: Duration::from_secs(DEFAULT_DELIVERY_WATCHDOG_SECS),
        }
    }

    /// Set how long a polled chunk may wait for inbound queue space before
    /// the tunnel is considered stalled.
    #[must_use]
    pub const fn with_delivery_watchdog(mut self, watchdog: Duration) -> Self {
        self.delivery_watchdog = watchdog;
        self
    }

    /// The base URL requests are sent to.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Live tunnels opened by this client.
    #[must_use]
    pub const fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Open a tunnel.
    ///
    /// # Errors
    ///
    /// Returns [`DialError`] if the token request fails, the key is
    /// rejected, or the server's token is empty or malformed. Nothing is
    /// started in that case.
    pub async fn dial(&self) -> Result<TunnelConnection, DialError> {
        let url = format!("{}{TOKEN_PATH}", self.base_url);
        let credential = auth::key_header(&self.key);

        let resp = self
            .http
            .post(&url, &[(AUTHORIZATION_HEADER, credential.as_str())], Bytes::new())
            .await
            .map_err(|e| DialError::Request(e.to_string()))?;

        match resp.status {
            200 => {}
            403 => return Err(DialError::Forbidden),
            status => {
                return Err(DialError::UnexpectedStatus {
                    status,
                    body: String::from_utf8_lossy(&resp.body).into_owned(),
                })
            }
        }

        let body = String::from_utf8_lossy(&resp.body);
        let body = body.trim();
        let token: Token = body.strip_prefix("token=").unwrap_or(body).trim().parse()?;

        let session = Session::new();
        self.sessions.insert(token.clone(), session.clone()).await;

        let pump = Pump {
            http: self.http.clone(),
            base_url: self.base_url.clone(),
            credential: auth::session_header(&self.key, &token).into(),
            token: token.clone(),
            session: session.clone(),
            sessions: self.sessions.clone(),
            delivery_watchdog: self.delivery_watchdog,
        };

        tokio::spawn(uplink(pump.clone()));
        tokio::spawn(downlink(pump));

        tracing::info!(token = %token, base_url = %self.base_url, "tunnel established");

        Ok(TunnelConnection::new(token, session))
    }
}

/// Turn a host or base URL into a base URL without a trailing slash.
fn base_url(host: &str) -> String {
    let host = host.trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_owned()
    } else {
        format!("http://{host}")
    }
}

/// Everything a pump task needs for one tunnel.
#[derive(Debug, Clone)]
struct Pump<H> {
    http: H,
    base_url: Arc<str>,
    credential: Arc<str>,
    token: Token,
    session: Session,
    sessions: SessionRegistry,
    delivery_watchdog: Duration,
}

impl<H: HttpClient> Pump<H> {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn fail(&self, direction: &str, err: PumpError) {
        tracing::warn!(token = %self.token, "{direction} pump stopped: {err}");
        self.sessions.teardown(&self.token).await;
    }

    /// Tell the server the tunnel is gone. Best effort.
    async fn disconnect(&self) {
        let url = self.url(CLOSE_PATH);
        match self
            .http
            .post(&url, &[(AUTHORIZATION_HEADER, &*self.credential)], Bytes::new())
            .await
        {
            Ok(resp) if resp.status == 200 => {
                tracing::debug!(token = %self.token, "server acknowledged disconnect");
            }
            Ok(resp) => {
                tracing::debug!(token = %self.token, "disconnect returned status {}", resp.status);
            }
            Err(e) => {
                tracing::debug!(token = %self.token, "disconnect request error: {e}");
            }
        }
    }
}

/// Drains the outbound queue, one `POST /push` per chunk.
async fn uplink<H: HttpClient>(pump: Pump<H>) {
    let url = pump.url(PUSH_PATH);
    let headers = [(AUTHORIZATION_HEADER, &*pump.credential)];

    while let Some(chunk) = pump.session.pull_outbound().await {
        let len = chunk.len();
        match pump.http.post(&url, &headers, chunk).await {
            Ok(resp) if resp.status == 200 => {
                tracing::trace!(token = %pump.token, "pushed {len} bytes");
            }
            Ok(resp) => {
                pump.fail("uplink", PumpError::from_status(resp.status)).await;
                return;
            }
            Err(e) => {
                pump.fail("uplink", PumpError::Request(e.to_string())).await;
                return;
            }
        }
    }

    tracing::debug!(token = %pump.token, "session closed, uplink finishing");
    pump.disconnect().await;
    pump.sessions.remove(&pump.token).await;
}

/// Repeatedly long-polls `GET /poll`, feeding every body range into the
/// inbound queue.
async fn downlink<H: HttpClient>(pump: Pump<H>) {
    let url = pump.url(POLL_PATH);
    let headers = [(AUTHORIZATION_HEADER, &*pump.credential)];

    loop {
        let resp = tokio::select! {
            biased;
            () = pump.session.closed() => break,
            resp = pump.http.get_streaming(&url, &headers) => resp,
        };

        let mut body = match resp {
            Ok(resp) if resp.status == 200 => resp.body,
            Ok(resp) => {
                pump.fail("downlink", PumpError::from_status(resp.status)).await;
                return;
            }
            Err(e) => {
                pump.fail("downlink", PumpError::Request(e.to_string())).await;
                return;
            }
        };

        tracing::trace!(token = %pump.token, "poll cycle started");

        loop {
            let next = tokio::select! {
                biased;
                () = pump.session.closed() => None,
                next = body.next() => Some(next),
            };

            let Some(next) = next else {
                tracing::debug!(token = %pump.token, "session closed, downlink finishing");
                pump.sessions.remove(&pump.token).await;
                return;
            };

            match next {
                Some(Ok(bytes)) if bytes.is_empty() => {}
                Some(Ok(bytes)) => {
                    match pump
                        .session
                        .deliver_inbound(bytes, pump.delivery_watchdog)
                        .await
                    {
                        Ok(()) => {}
                        Err(DeliveryError::Closed) => {
                            pump.sessions.remove(&pump.token).await;
                            return;
                        }
                        Err(DeliveryError::TimedOut) => {
                            pump.fail("downlink", PumpError::Stalled).await;
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    tracing::debug!(token = %pump.token, "poll body ended early: {e}");
                    break;
                }
                None => break,
            }
        }
    }

    tracing::debug!(token = %pump.token, "session closed, downlink finishing");
    pump.sessions.remove(&pump.token).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_from_authority() {
        assert_eq!(base_url("127.0.0.1:8080"), "http://127.0.0.1:8080");
        assert_eq!(base_url("example.com/"), "http://example.com");
    }

    #[test]
    fn base_url_keeps_explicit_scheme() {
        assert_eq!(base_url("https://example.com/"), "https://example.com");
        assert_eq!(base_url("http://10.0.0.1:80"), "http://10.0.0.1:80");
    }
}
