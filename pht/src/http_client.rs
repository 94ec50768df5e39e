//! Generic HTTP client trait for the client-side pumps.
//!
//! The pumps need two kinds of exchange: a plain request whose whole
//! response body is collected (token, push, close), and a `GET` whose body is
//! streamed as it arrives (poll). Implementations handle TLS, pooling and the
//! like; this trait exposes only what the tunnel needs.

use bytes::Bytes;
use futures::{future::BoxFuture, stream::BoxStream};

#[cfg(feature = "reqwest")]
mod reqwest_client;

#[cfg(feature = "reqwest")]
pub use reqwest_client::{ReqwestHttpClient, ReqwestHttpError};

/// A minimal async HTTP client.
pub trait HttpClient: Clone + Send + Sync + 'static {
    /// The error type for HTTP operations.
    type Error: core::error::Error + Send + Sync + 'static;

    /// Send a `POST` request and collect the full response.
    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>>;

    /// Send a `GET` request and return as soon as the response head arrives.
    fn get_streaming(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> BoxFuture<'_, Result<StreamingResponse<Self::Error>, Self::Error>>;
}

/// A minimal HTTP response with a collected body.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: u16,

    /// The response body bytes.
    pub body: Bytes,
}

/// A response whose body is still arriving.
pub struct StreamingResponse<E> {
    /// The HTTP status code.
    pub status: u16,

    /// Body byte ranges in arrival order. Range boundaries carry no meaning.
    pub body: BoxStream<'static, Result<Bytes, E>>,
}

impl<E> core::fmt::Debug for StreamingResponse<E> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("StreamingResponse")
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
