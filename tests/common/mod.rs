//! Scripted HTTP backend and fixtures shared by the integration tests.
#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use dav_client::{
    DavClient, DavConfig, HttpClient, HttpRequest, HttpResponse, TransportError,
};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use webdavfs::fs::{FsConfig, WebdavFs};

/// One request as seen by the fake server.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: String,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn path(&self) -> &str {
        self.url
            .strip_prefix("http://server.example")
            .unwrap_or(&self.url)
    }
}

type Responder = dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync;

/// An [`HttpClient`] that answers from a closure and records every request.
#[derive(Clone)]
pub struct MockHttpClient {
    responder: Arc<Responder>,
    log: Arc<Mutex<Vec<Recorded>>>,
}

impl MockHttpClient {
    pub fn new(responder: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Self {
        Self {
            responder: Arc::new(responder),
            log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.log.lock().unwrap().clone()
    }

    /// Requests with the given method, as (method, path) pairs.
    pub fn requests_with_method(&self, method: &str) -> Vec<Recorded> {
        self.requests()
            .into_iter()
            .filter(|r| r.method == method)
            .collect()
    }

    pub fn count(&self, method: &str) -> usize {
        self.requests_with_method(method).len()
    }

    pub fn clear(&self) {
        self.log.lock().unwrap().clear();
    }
}

impl HttpClient for MockHttpClient {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let response = (self.responder)(&request);
        self.log.lock().unwrap().push(Recorded {
            method: request.method.to_string(),
            url: request.url.clone(),
            headers: request.headers.clone(),
            body: request.body.clone().unwrap_or_default(),
        });
        Ok(response)
    }
}

pub fn response(status: u16, headers: &[(&str, &str)], body: impl Into<Bytes>) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: body.into(),
    }
}

/// An `OPTIONS /` answer advertising the SabreDAV partial-update dialect.
pub fn sabre_options() -> HttpResponse {
    response(
        200,
        &[
            ("dav", "1, 3, sabredav-partialupdate"),
            ("allow", "OPTIONS, GET, PUT, PATCH, PROPFIND, MKCOL, MOVE, DELETE"),
            ("server", "sabre/dav"),
        ],
        "",
    )
}

/// An `OPTIONS /` answer for a class-1 server with no write dialect.
pub fn plain_options() -> HttpResponse {
    response(200, &[("dav", "1, 2"), ("server", "nginx")], "")
}

/// One entry of a multistatus fixture.
#[derive(Debug, Clone)]
pub struct Entry {
    pub href: String,
    pub is_dir: bool,
    pub size: u64,
}

impl Entry {
    pub fn dir(href: &str) -> Self {
        Self {
            href: href.to_owned(),
            is_dir: true,
            size: 0,
        }
    }

    pub fn file(href: &str, size: u64) -> Self {
        Self {
            href: href.to_owned(),
            is_dir: false,
            size,
        }
    }
}

/// Render a `multistatus` body for the given entries.
pub fn multistatus(entries: &[Entry]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:">"#);
    for entry in entries {
        xml.push_str("<D:response><D:href>");
        xml.push_str(&entry.href);
        xml.push_str("</D:href><D:propstat><D:prop>");
        if entry.is_dir {
            xml.push_str("<D:resourcetype><D:collection/></D:resourcetype>");
        } else {
            xml.push_str("<D:resourcetype/>");
            xml.push_str(&format!(
                "<D:getcontentlength>{}</D:getcontentlength>",
                entry.size
            ));
        }
        xml.push_str("<D:getlastmodified>Thu, 01 Jun 2023 12:00:00 GMT</D:getlastmodified>");
        xml.push_str("<D:creationdate>2023-06-01T12:00:00Z</D:creationdate>");
        xml.push_str("</D:prop><D:status>HTTP/1.1 200 OK</D:status></D:propstat></D:response>");
    }
    xml.push_str("</D:multistatus>");
    xml
}

pub fn propfind_response(entries: &[Entry]) -> HttpResponse {
    response(207, &[("content-type", "text/xml")], multistatus(entries))
}

pub fn fs_config() -> FsConfig {
    FsConfig {
        uid: 1000,
        gid: 1000,
        file_mode: 0o600,
        dir_mode: 0o700,
        read_only: false,
        block_size: 4096,
    }
}

/// Connect a [`WebdavFs`] to a scripted backend: runs the handshake and
/// clears the request log so tests only see their own traffic.
pub async fn mount_fs(
    mock: MockHttpClient,
    config: FsConfig,
) -> (Arc<WebdavFs<MockHttpClient>>, MockHttpClient) {
    let mut dav = DavClient::new(
        mock.clone(),
        DavConfig {
            url: "http://server.example/dav".to_owned(),
            max_conns: 8,
            ..DavConfig::default()
        },
    )
    .unwrap();
    dav.handshake().await.expect("handshake should succeed");
    mock.clear();
    (Arc::new(WebdavFs::new(Arc::new(dav), config)), mock)
}
