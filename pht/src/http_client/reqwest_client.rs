//! [`reqwest`]-backed implementation of [`HttpClient`].

use core::time::Duration;

use bytes::Bytes;
use futures::{future::BoxFuture, FutureExt, StreamExt, TryStreamExt};

use super::{HttpClient, HttpResponse, StreamingResponse};

/// Error type for the reqwest-based HTTP client.
#[derive(Debug, thiserror::Error)]
#[error("HTTP request failed: {0}")]
pub struct ReqwestHttpError(#[from] reqwest::Error);

/// A [`reqwest`]-backed implementation of [`HttpClient`].
#[derive(Debug, Clone)]
pub struct ReqwestHttpClient {
    inner: reqwest::Client,
}

impl ReqwestHttpClient {
    /// Create a new reqwest-backed HTTP client with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: reqwest::Client::new(),
        }
    }

    /// Create a client that gives up on connecting after `timeout`.
    ///
    /// Only the connect phase is bounded: poll responses legitimately stay
    /// open for a whole poll cycle.
    #[must_use]
    pub fn with_connect_timeout(timeout: Duration) -> Self {
        Self {
            inner: reqwest::Client::builder()
                .connect_timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    /// Wrap an existing [`reqwest::Client`].
    #[must_use]
    pub const fn from_client(inner: reqwest::Client) -> Self {
        Self { inner }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClient for ReqwestHttpClient {
    type Error = ReqwestHttpError;

    fn post(
        &self,
        url: &str,
        headers: &[(&str, &str)],
        body: Bytes,
    ) -> BoxFuture<'_, Result<HttpResponse, Self::Error>> {
        let mut builder = self.inner.post(url);
        for &(name, value) in headers {
            builder = builder.header(name, value);
        }
        builder = builder.body(body);

        async move {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes().await?;

            Ok(HttpResponse { status, body })
        }
        .boxed()
    }

    fn get_streaming(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> BoxFuture<'_, Result<StreamingResponse<Self::Error>, Self::Error>> {
        let mut builder = self.inner.get(url);
        for &(name, value) in headers {
            builder = builder.header(name, value);
        }

        async move {
            let resp = builder.send().await?;
            let status = resp.status().as_u16();
            let body = resp.bytes_stream().map_err(ReqwestHttpError).boxed();

            Ok(StreamingResponse { status, body })
        }
        .boxed()
    }
}
