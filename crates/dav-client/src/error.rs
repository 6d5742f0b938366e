//! Error taxonomy for the WebDAV client.
//!
//! Errors stay typed all the way up the stack; conversion to a POSIX errno
//! happens once, at the FUSE boundary, via [`DavError::errno`].

use http::{HeaderMap, StatusCode};
use thiserror::Error;

/// A failure inside the HTTP backend, before any status code existed.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The request exceeded the per-request timeout.
    #[error("request timed out")]
    Timeout,

    /// Connection-level failure (refused, reset, DNS, TLS).
    #[error("connection failed: {0}")]
    Connection(String),

    /// Any other backend failure.
    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

/// An error from a WebDAV operation.
#[derive(Debug, Error)]
pub enum DavError {
    /// The server answered with a non-2xx status. Redirects land here
    /// too, carrying `Location`, so callers can implement the
    /// trailing-slash PROPFIND retry.
    #[error("{status}")]
    Remote {
        status: StatusCode,
        location: Option<String>,
    },

    /// The request timed out in the transport.
    #[error("request timed out")]
    Timeout,

    /// Transport failure with no HTTP status.
    #[error("transport error: {0}")]
    Transport(String),

    /// The server supports neither partial-write dialect.
    #[error("server supports no partial-write dialect")]
    CapabilityMissing,

    /// Malformed request or response (bad path, undecodable multistatus).
    #[error("{0}")]
    Invalid(String),
}

impl From<TransportError> for DavError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout => Self::Timeout,
            TransportError::Connection(msg) => Self::Transport(msg),
            TransportError::Other(err) => Self::Transport(err.to_string()),
        }
    }
}

impl DavError {
    /// Build a `Remote` error from a response status, capturing `Location`.
    pub(crate) fn remote(status: StatusCode, headers: &HeaderMap) -> Self {
        let location = headers
            .get(http::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        Self::Remote { status, location }
    }

    /// Synthesize a `Remote` error for a status the server implied rather
    /// than sent (e.g. a 200 answer to a ranged GET is treated as a 416).
    pub(crate) fn status(status: StatusCode) -> Self {
        Self::Remote {
            status,
            location: None,
        }
    }

    /// The redirect target, when this error is a 3xx response.
    pub fn redirect_location(&self) -> Option<&str> {
        match self {
            Self::Remote { status, location } if status.is_redirection() => location.as_deref(),
            _ => None,
        }
    }

    /// Map to a POSIX errno. Called at the FUSE boundary only.
    pub fn errno(&self) -> i32 {
        match self {
            Self::Remote { status, .. } => match status.as_u16() {
                403 | 405 => libc::EACCES,
                404 | 409 => libc::ENOENT,
                408 | 504 => libc::ETIMEDOUT,
                416 => libc::ERANGE,
                _ => libc::EIO,
            },
            Self::Timeout => libc::ETIMEDOUT,
            Self::Transport(_) => libc::EIO,
            Self::CapabilityMissing => libc::EACCES,
            Self::Invalid(_) => libc::EIO,
        }
    }
}
