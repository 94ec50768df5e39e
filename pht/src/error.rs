//! Error types for the polling HTTP tunnel.

use thiserror::Error;

/// Failure of a read or write on a [`TunnelConnection`](crate::connection::TunnelConnection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StreamError {
    /// The connection was closed, locally or by a teardown of its session.
    #[error("use of closed tunnel connection")]
    Closed,

    /// The read or write deadline passed before the operation could complete.
    #[error("tunnel i/o deadline exceeded")]
    TimedOut,
}

impl From<StreamError> for std::io::Error {
    fn from(err: StreamError) -> Self {
        let kind = match err {
            StreamError::Closed => std::io::ErrorKind::NotConnected,
            StreamError::TimedOut => std::io::ErrorKind::TimedOut,
        };
        Self::new(kind, err)
    }
}

/// A chunk could not be handed to a session's inbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session closed while the chunk was waiting.
    #[error("session closed during delivery")]
    Closed,

    /// The inbound queue stayed full for the whole watchdog period.
    #[error("inbound delivery stalled")]
    TimedOut,
}

/// The operating system RNG could not produce a session token.
#[derive(Debug, Error)]
#[error("failed to generate session token: {0}")]
pub struct TokenError(#[from] pub rand::Error);

/// A token string received from a peer is not usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session token {0:?}")]
pub struct InvalidToken(pub String);

/// Errors while dialing a tunnel.
#[derive(Debug, Error)]
pub enum DialError {
    /// The token request could not be sent or its response not read.
    #[error("HTTP request error: {0}")]
    Request(String),

    /// The server rejected the shared key.
    #[error("server rejected the tunnel key")]
    Forbidden,

    /// Server returned an unexpected status code.
    #[error("unexpected status {status}: {body}")]
    UnexpectedStatus {
        /// The HTTP status code.
        status: u16,
        /// The response body as a string.
        body: String,
    },

    /// The token response was empty or malformed.
    #[error(transparent)]
    InvalidToken(#[from] InvalidToken),
}

/// Why a client pump stopped.
///
/// Pumps run in background tasks, so these are only logged; the application
/// sees the resulting teardown as a closed connection.
#[derive(Debug, Error)]
pub enum PumpError {
    /// The HTTP request failed in transit.
    #[error("HTTP request error: {0}")]
    Request(String),

    /// The server no longer knows the token.
    #[error("session unknown to server")]
    UnknownSession,

    /// The server rejected the shared key.
    #[error("server rejected the tunnel key")]
    Forbidden,

    /// Any other non-success status.
    #[error("unexpected status {0}")]
    UnexpectedStatus(u16),

    /// A received chunk could not be delivered within the watchdog period.
    #[error("inbound delivery stalled")]
    Stalled,
}

impl PumpError {
    pub(crate) const fn from_status(status: u16) -> Self {
        match status {
            401 => Self::UnknownSession,
            403 => Self::Forbidden,
            other => Self::UnexpectedStatus(other),
        }
    }
}

/// Errors while processing a tunnel request on the server.
#[cfg(feature = "server")]
#[derive(Debug, Error)]
pub enum ServerError {
    /// The endpoint does not accept this HTTP method.
    #[error("method not allowed")]
    MethodNotAllowed,

    /// The credential's key does not match the server's key.
    #[error("invalid tunnel key")]
    Forbidden,

    /// No live session for the credential's token.
    #[error("unknown session")]
    UnknownSession,

    /// The request body could not be read, or exceeded the size limit.
    #[error("failed to read request body: {0}")]
    BodyRead(String),

    /// The inbound queue stayed full for the whole watchdog period.
    #[error("inbound delivery stalled")]
    DeliveryTimeout,

    /// A token could not be generated.
    #[error(transparent)]
    TokenAllocation(#[from] TokenError),
}

#[cfg(feature = "server")]
impl ServerError {
    /// The HTTP status code reported for this error.
    #[must_use]
    pub const fn status(&self) -> hyper::StatusCode {
        use hyper::StatusCode;

        match self {
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::UnknownSession => StatusCode::UNAUTHORIZED,
            Self::BodyRead(_) | Self::TokenAllocation(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::DeliveryTimeout => StatusCode::REQUEST_TIMEOUT,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_error_maps_to_io_kinds() {
        let closed: std::io::Error = StreamError::Closed.into();
        assert_eq!(closed.kind(), std::io::ErrorKind::NotConnected);

        let timed_out: std::io::Error = StreamError::TimedOut.into();
        assert_eq!(timed_out.kind(), std::io::ErrorKind::TimedOut);
    }

    #[test]
    fn pump_error_from_status() {
        assert!(matches!(PumpError::from_status(401), PumpError::UnknownSession));
        assert!(matches!(PumpError::from_status(403), PumpError::Forbidden));
        assert!(matches!(
            PumpError::from_status(502),
            PumpError::UnexpectedStatus(502)
        ));
    }

    #[cfg(feature = "server")]
    #[test]
    fn server_error_status_codes() {
        assert_eq!(ServerError::MethodNotAllowed.status().as_u16(), 405);
        assert_eq!(ServerError::Forbidden.status().as_u16(), 403);
        assert_eq!(ServerError::UnknownSession.status().as_u16(), 401);
        assert_eq!(ServerError::BodyRead("eof".into()).status().as_u16(), 500);
        assert_eq!(ServerError::DeliveryTimeout.status().as_u16(), 408);
    }

    #[test]
    fn dial_error_displays() {
        let err = DialError::UnexpectedStatus {
            status: 502,
            body: "bad gateway".into(),
        };
        assert_eq!(format!("{err}"), "unexpected status 502: bad gateway");
    }
}
