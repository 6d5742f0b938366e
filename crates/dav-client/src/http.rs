//! The HTTP transport seam.
//!
//! The DAV layer describes every exchange up front as an [`HttpRequest`]
//! value and hands it to whatever [`HttpClient`] the process was built
//! with: the reqwest backend in the daemon, a scripted fake in tests.
//! WebDAV's extension methods (PROPFIND, MKCOL, MOVE, ...) ride in
//! [`Method`] like any standard method.

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode};
use std::future::Future;

use crate::error::TransportError;

/// One HTTP exchange, fully described before it is handed to the backend.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// The HTTP method.
    pub method: Method,
    /// The fully-qualified, already-escaped URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMap,
    /// Request body; `None` sends no body at all (distinct from an empty
    /// one, which a zero-length PUT needs).
    pub body: Option<Bytes>,
}

impl HttpRequest {
    /// A bodyless, headerless request for `url`.
    pub fn new(method: Method, url: String) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: None,
        }
    }

    /// Set a header, replacing any previous value under the same name.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Attach a body.
    #[must_use]
    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }

    /// Number of body bytes this exchange will send.
    pub fn content_length(&self) -> usize {
        self.body.as_ref().map_or(0, Bytes::len)
    }
}

/// What came back from the server, body fully drained.
#[derive(Debug)]
pub struct HttpResponse {
    /// The HTTP status code.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body bytes.
    pub body: Bytes,
}

impl HttpResponse {
    /// A header value as text, when present and valid UTF-8.
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// The pluggable backend. Native `impl Future` in traits (RPITIT), so no
/// `async-trait` macro is involved.
pub trait HttpClient: Send + Sync {
    /// Perform one exchange and drain the response body.
    ///
    /// Implementations must not follow redirects: 3xx responses come back
    /// to the DAV layer, which needs the `Location` header for the
    /// PROPFIND trailing-slash retry.
    fn execute(
        &self,
        request: HttpRequest,
    ) -> impl Future<Output = Result<HttpResponse, TransportError>> + Send;
}
