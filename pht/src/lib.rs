//! # PHT: Polling HTTP Tunnel
//!
//! A full-duplex byte stream carried over plain HTTP request-response
//! traffic, for networks where nothing but HTTP gets through (restrictive
//! proxies, corporate firewalls, load balancers that cut idle sockets).
//!
//! # Protocol
//!
//! Upstream bytes travel as push request bodies; downstream bytes travel on
//! a long-poll response that the server streams until its poll cycle ends.
//! Every request after the handshake carries the same opaque token.
//!
//! ```text
//! ┌──────────┐                          ┌──────────┐
//! │  Client   │                          │  Server   │
//! └────┬─────┘                          └────┬─────┘
//!      │                                     │
//!      │  POST /token                        │
//!      │  Authorization: key=<key>           │
//!      │ ──────────────────────────────────►  │
//!      │  200 + "token=<token>"              │
//!      │ ◄──────────────────────────────────  │
//!      │                                     │
//!      │  POST /push                         │
//!      │  Authorization: key=<k>; token=<t>  │
//!      │  Body: raw bytes                    │
//!      │ ──────────────────────────────────►  │
//!      │  200                                │
//!      │ ◄──────────────────────────────────  │
//!      │                                     │
//!      │  GET /poll                          │
//!      │  Authorization: key=<k>; token=<t>  │
//!      │ ──────────────────────────────────►  │
//!      │  200 + streamed raw bytes ...       │
//!      │ ◄──────────────────────────────────  │
//!      │       (ends after an idle cycle)    │
//!      │                                     │
//!      │  POST /close                        │
//!      │ ──────────────────────────────────►  │
//!      │  200                                │
//!      │ ◄──────────────────────────────────  │
//! ```
//!
//! # Architecture
//!
//! Each side of a tunnel owns a [`Session`](session::Session): two bounded
//! queues and a closed-signal. The application talks to the session through a
//! [`TunnelConnection`](connection::TunnelConnection), which implements
//! [`tokio::io::AsyncRead`] and [`tokio::io::AsyncWrite`].
//!
//! ```text
//! client                                             server
//! write() ──► outbound ──► uplink pump ── POST /push ──► inbound ──► read()
//! read()  ◄── inbound  ◄── downlink pump ◄── GET /poll ── outbound ◄── write()
//! ```

pub mod auth;
pub mod client;
pub mod connection;
pub mod error;
pub mod http_client;
pub mod session;
pub mod token;

#[cfg(feature = "server")]
pub mod server;

/// Token issuance endpoint.
pub const TOKEN_PATH: &str = "/token";

/// Client-to-server delivery endpoint.
pub const PUSH_PATH: &str = "/push";

/// Server-to-client long-poll endpoint.
pub const POLL_PATH: &str = "/poll";

/// Session teardown endpoint.
pub const CLOSE_PATH: &str = "/close";

/// Header carrying the `key=...; token=...` credential.
pub const AUTHORIZATION_HEADER: &str = "authorization";

/// Maximum time a received chunk may wait to enter a full inbound queue
/// before the session is considered stalled.
pub const DEFAULT_DELIVERY_WATCHDOG_SECS: u64 = 90;

/// Idle bound on a single `/poll` response.
///
/// If no outbound chunk becomes available within this duration the response
/// ends and the client polls again.
pub const DEFAULT_POLL_CYCLE_SECS: u64 = 25;

/// Server sessions not touched by any request for this long are reaped.
pub const DEFAULT_SESSION_TIMEOUT_SECS: u64 = 5 * 60;

/// Default maximum `/push` request body size (50 MB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 50 * 1024 * 1024;
