//! Reqwest-based HTTP backend.

use std::time::Duration;

use crate::error::TransportError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};

/// Per-request timeout. DAV servers behind slow storage can take a while;
/// anything beyond this is reported as ETIMEDOUT.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// An [`HttpClient`] implementation backed by [`reqwest`].
///
/// Compression is disabled (ranged GETs and Content-Length handling do not
/// mix with transfer encodings) and redirects are never followed; the DAV
/// layer needs to see 3xx responses itself.
#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    /// Create a backend with up to `max_idle` pooled idle connections.
    pub fn new(max_idle: u32) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(max_idle as usize)
            .no_gzip()
            .no_brotli()
            .no_deflate()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| TransportError::Other(Box::new(e)))?;
        Ok(Self { client })
    }

    /// Wrap an existing [`reqwest::Client`].
    #[must_use]
    pub fn from_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl HttpClient for ReqwestClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        // The request was described in full by the DAV layer; assemble a
        // wire request directly instead of going through the builder.
        let url = reqwest::Url::parse(&url)
            .map_err(|e| TransportError::Connection(format!("bad url {url}: {e}")))?;
        let mut wire = reqwest::Request::new(method, url);
        *wire.headers_mut() = headers;
        *wire.body_mut() = body.map(reqwest::Body::from);

        let response = self.client.execute(wire).await.map_err(classify)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(classify)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

/// Sort a reqwest failure into the transport taxonomy. Timeouts keep their
/// identity (they map to ETIMEDOUT); everything else is connection-level
/// or opaque.
fn classify(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        return TransportError::Timeout;
    }
    if err.is_connect() {
        return TransportError::Connection(err.to_string());
    }
    TransportError::Other(Box::new(err))
}
