//! The WebDAV client: capability detection and the operation set the
//! filesystem layer is built on.

use std::collections::HashSet;
use std::time::UNIX_EPOCH;

use base64::Engine as _;
use bytes::Bytes;
use http::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE, COOKIE, RANGE,
    USER_AGENT,
};
use http::{Method, StatusCode};
use tokio::sync::Semaphore;
use url::Url;

use crate::dnode::Dnode;
use crate::error::DavError;
use crate::http::{HttpClient, HttpRequest, HttpResponse};
use crate::propfind::{self, Depth, PropEntry, PropSet};

/// Which partial-write dialect the server speaks, discovered at handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RangeDialect {
    /// Neither dialect: every write fails, the mount falls back to
    /// read-only.
    #[default]
    None,
    /// Apache mod_dav: `PUT` with a `Content-Range` header.
    Apache,
    /// SabreDAV: `PATCH` with `X-Update-Range`.
    Sabre,
}

/// Server capabilities parsed from the `OPTIONS /` response.
///
/// Written once during [`DavClient::handshake`], read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct Capabilities {
    /// Methods advertised in `Allow`.
    pub methods: HashSet<String>,
    /// Compliance classes and extensions advertised in `Dav`.
    pub dav: HashSet<String>,
    /// Partial-write dialect.
    pub dialect: RangeDialect,
    /// The server advertises redirect references.
    pub redirectrefs: bool,
}

/// Construction parameters for [`DavClient`].
#[derive(Debug, Clone, Default)]
pub struct DavConfig {
    /// Base URL of the collection to mount.
    pub url: String,
    /// HTTP Basic username.
    pub username: Option<String>,
    /// HTTP Basic password.
    pub password: Option<String>,
    /// Session cookie sent verbatim in a `Cookie` header.
    pub cookie: Option<String>,
    /// System-wide cap on in-flight requests; 0 disables the limit.
    pub max_conns: u32,
    /// Refuse all writes even if the server supports them.
    pub put_disabled: bool,
}

/// Result of probing a removal target: its own metadata plus how many
/// direct children the depth-1 listing revealed.
#[derive(Debug)]
pub struct TargetInfo {
    pub entry: Dnode,
    pub children: usize,
}

/// A WebDAV client bound to one base URL.
///
/// Generic over the HTTP backend so the protocol layer can be driven by a
/// scripted fake in tests.
pub struct DavClient<C> {
    backend: C,
    base_url: Url,
    base_path: String,
    auth: Option<HeaderValue>,
    cookie: Option<HeaderValue>,
    user_agent: HeaderValue,
    limit: Option<Semaphore>,
    put_disabled: bool,
    caps: Capabilities,
}

fn dav_method(name: &'static str) -> Method {
    Method::from_bytes(name.as_bytes())
        .unwrap_or_else(|_| unreachable!("static method name {name}"))
}

fn header_set(headers: &HeaderMap, name: &str) -> HashSet<String> {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

fn with_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_owned()
    } else {
        format!("{path}/")
    }
}

fn last_component(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(i) => trimmed[i + 1..].to_owned(),
        None => trimmed.to_owned(),
    }
}

impl<C: HttpClient> DavClient<C> {
    /// Create a client for `config.url`. No request is made until
    /// [`handshake`](Self::handshake).
    pub fn new(backend: C, config: DavConfig) -> Result<Self, DavError> {
        let stripped = config.url.trim_end_matches('/');
        let base_url = Url::parse(stripped)
            .map_err(|e| DavError::Invalid(format!("bad url {stripped}: {e}")))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(DavError::Invalid(format!(
                "unsupported url scheme: {}",
                base_url.scheme()
            )));
        }
        let base_path = base_url.path().trim_end_matches('/').to_owned();

        let auth = match (&config.username, &config.password) {
            (None, None) => None,
            (user, pass) => {
                let raw = format!(
                    "{}:{}",
                    user.as_deref().unwrap_or_default(),
                    pass.as_deref().unwrap_or_default()
                );
                let encoded = base64::engine::general_purpose::STANDARD.encode(raw);
                Some(
                    HeaderValue::from_str(&format!("Basic {encoded}"))
                        .map_err(|_| DavError::Invalid("bad credentials".to_owned()))?,
                )
            }
        };
        let cookie = config
            .cookie
            .as_deref()
            .map(|c| {
                HeaderValue::from_str(c).map_err(|_| DavError::Invalid("bad cookie".to_owned()))
            })
            .transpose()?;

        let user_agent = HeaderValue::from_str(&format!(
            "webdavfs/{} (rust; {})",
            env!("CARGO_PKG_VERSION"),
            std::env::consts::OS
        ))
        .unwrap_or_else(|_| HeaderValue::from_static("webdavfs"));

        let limit = (config.max_conns > 0).then(|| Semaphore::new(config.max_conns as usize));

        Ok(Self {
            backend,
            base_url,
            base_path,
            auth,
            cookie,
            user_agent,
            limit,
            put_disabled: config.put_disabled,
            caps: Capabilities::default(),
        })
    }

    /// Server capabilities. Meaningful after [`handshake`](Self::handshake).
    pub fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    /// Whether writes can succeed at all on this server.
    pub fn can_put_range(&self) -> bool {
        self.caps.dialect != RangeDialect::None && !self.put_disabled
    }

    /// The base URL this client is bound to.
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Probe the server: `OPTIONS /`, then a stat of the collection root.
    ///
    /// Fails when the server does not advertise DAV compliance class 1, or
    /// when the base URL is not a collection.
    pub async fn handshake(&mut self) -> Result<(), DavError> {
        let mut req = self.request(Method::OPTIONS, "/", None)?;
        req.headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
        let resp = self.roundtrip(req).await?;

        let methods = header_set(&resp.headers, "allow");
        let dav = header_set(&resp.headers, "dav");
        let server = resp.header_str("server").unwrap_or_default();

        if !dav.contains("1") {
            return Err(DavError::Invalid("not a webdav server".to_owned()));
        }

        let is_apache =
            server.contains("Apache") && dav.contains("<http://apache.org/dav/propset/fs/1>");
        let is_sabre = dav.contains("sabredav-partialupdate");
        let dialect = if is_sabre {
            RangeDialect::Sabre
        } else if is_apache {
            RangeDialect::Apache
        } else {
            RangeDialect::None
        };
        let redirectrefs = dav.contains("redirectrefs");
        self.caps = Capabilities {
            methods,
            dav,
            dialect,
            redirectrefs,
        };

        let root = self.stat("/").await?;
        if !root.is_dir {
            return Err(DavError::Invalid(format!(
                "{} is not a directory",
                self.base_url
            )));
        }
        Ok(())
    }

    /// PROPFIND depth 0, following the directory trailing-slash redirect.
    pub async fn stat(&self, path: &str) -> Result<Dnode, DavError> {
        tracing::debug!(target: "webdav", path, "stat");
        let entries = self
            .propfind_with_redirect(path, Depth::Zero, PropSet::Default)
            .await?;
        if entries.len() != 1 {
            return Err(DavError::Invalid(format!(
                "propfind returned {} entries for {path}",
                entries.len()
            )));
        }
        let entry = &entries[0];
        Ok(dnode_from(entry, last_component(&entry.href), true))
    }

    /// PROPFIND depth 1 on `path + "/"`, mapped to directory entries.
    ///
    /// The listing's own entry is named `"."`. `detail` controls whether
    /// times and sizes are filled in (readdir does not need them, lookup
    /// caches do).
    pub async fn readdir(&self, path: &str, detail: bool) -> Result<Vec<Dnode>, DavError> {
        tracing::debug!(target: "webdav", path, detail, "readdir");
        let dir = with_slash(path);
        let entries = self.propfind(&dir, Depth::One, PropSet::Default).await?;
        let prefix = format!("{}{}", self.base_path, dir);

        let mut out = Vec::new();
        for entry in &entries {
            let Some(rel) = propfind::relative_name(&entry.href, &prefix) else {
                continue;
            };
            let mut name = rel.trim_end_matches('/').to_owned();
            if name.is_empty() {
                name = ".".to_owned();
            }
            if name.contains('/') {
                continue;
            }
            // Finder droppings that macOS DAV clients scatter everywhere.
            if name == "._.DS_Store" || name == ".DS_Store" {
                continue;
            }
            out.push(dnode_from(entry, name, detail));
        }
        Ok(out)
    }

    /// PROPFIND depth 1 classifying the target itself against its direct
    /// children, for remove's EISDIR/ENOTDIR/ENOTEMPTY discrimination.
    pub async fn stat_with_children(&self, path: &str) -> Result<TargetInfo, DavError> {
        tracing::debug!(target: "webdav", path, "stat_with_children");
        let entries = self
            .propfind_with_redirect(path, Depth::One, PropSet::Default)
            .await?;

        let full = format!("{}{}", self.base_path, path);
        let full = full.trim_end_matches('/').to_owned();
        let child_prefix = format!("{full}/");

        let mut target: Option<Dnode> = None;
        let mut children = 0usize;
        for entry in &entries {
            if entry.href.trim_end_matches('/') == full {
                target = Some(dnode_from(entry, last_component(&entry.href), true));
            } else if entry.href.starts_with(&child_prefix) {
                children += 1;
            }
        }
        let entry =
            target.ok_or_else(|| DavError::Invalid(format!("no propfind entry for {path}")))?;
        Ok(TargetInfo { entry, children })
    }

    /// Ranged GET. The server must honour the range: a 200 answer to a
    /// partial request is reported as a range error, not silently
    /// reassembled.
    pub async fn get_range(&self, path: &str, offset: u64, len: u32) -> Result<Bytes, DavError> {
        if len == 0 {
            return Ok(Bytes::new());
        }
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", path, offset, len, "get_range");

        let mut req = self.request(Method::GET, path, None)?;
        let end = offset + u64::from(len) - 1;
        req.headers.insert(
            RANGE,
            HeaderValue::from_str(&format!("bytes={offset}-{end}"))
                .map_err(|_| DavError::Invalid("bad range".to_owned()))?,
        );
        let resp = self.roundtrip(req).await?;
        if resp.status != StatusCode::PARTIAL_CONTENT {
            return Err(DavError::status(StatusCode::RANGE_NOT_SATISFIABLE));
        }
        let mut body = resp.body;
        body.truncate(len as usize);
        Ok(body)
    }

    /// Whole-file PUT. Returns whether the server created the entry (201).
    pub async fn put(
        &self,
        path: &str,
        data: Bytes,
        create: bool,
        excl: bool,
    ) -> Result<bool, DavError> {
        if !self.can_put_range() {
            return Err(DavError::CapabilityMissing);
        }
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", path, len = data.len(), create, excl, "put");

        let mut req = self.request(Method::PUT, path, Some(data))?;
        apply_conditionals(&mut req.headers, create, excl);
        let resp = self.roundtrip(req).await?;
        Ok(resp.status == StatusCode::CREATED)
    }

    /// Partial write at `offset`, dispatched on the dialect discovered at
    /// handshake. Returns whether the server created the entry.
    pub async fn put_range(
        &self,
        path: &str,
        data: Bytes,
        offset: u64,
        create: bool,
        excl: bool,
    ) -> Result<bool, DavError> {
        if !self.can_put_range() {
            return Err(DavError::CapabilityMissing);
        }
        let _permit = self.throttle().await;
        tracing::debug!(
            target: "webdav",
            path, len = data.len(), offset, create, excl, dialect = ?self.caps.dialect,
            "put_range"
        );

        let mut req = match self.caps.dialect {
            RangeDialect::Sabre => {
                let mut req = self.request(Method::PATCH, path, Some(data))?;
                req.headers.insert(
                    CONTENT_TYPE,
                    HeaderValue::from_static("application/x-sabredav-partialupdate"),
                );
                req.headers.insert(
                    HeaderName::from_static("x-update-range"),
                    HeaderValue::from_str(&format!("bytes={offset}-"))
                        .map_err(|_| DavError::Invalid("bad offset".to_owned()))?,
                );
                req
            }
            RangeDialect::Apache => {
                let end = offset + (data.len() as u64).saturating_sub(1);
                let mut req = self.request(Method::PUT, path, Some(data))?;
                req.headers.insert(
                    HeaderName::from_static("content-range"),
                    HeaderValue::from_str(&format!("bytes {offset}-{end}/*"))
                        .map_err(|_| DavError::Invalid("bad offset".to_owned()))?,
                );
                req
            }
            RangeDialect::None => return Err(DavError::CapabilityMissing),
        };
        apply_conditionals(&mut req.headers, create, excl);
        let resp = self.roundtrip(req).await?;
        Ok(resp.status == StatusCode::CREATED)
    }

    /// MKCOL. The collection path always gets a trailing slash.
    pub async fn mkcol(&self, path: &str) -> Result<(), DavError> {
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", path, "mkcol");
        let req = self.request(dav_method("MKCOL"), &with_slash(path), None)?;
        self.roundtrip(req).await?;
        Ok(())
    }

    /// DELETE. Callers pass collection paths with a trailing slash.
    pub async fn delete(&self, path: &str) -> Result<(), DavError> {
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", path, "delete");
        let req = self.request(dav_method("DELETE"), path, None)?;
        self.roundtrip(req).await?;
        Ok(())
    }

    /// MOVE `old` to `new`. Collections (trailing slash) are never allowed
    /// to overwrite; files are. A 207 answer means partial failure and is
    /// reported as an error.
    pub async fn move_to(&self, old: &str, new: &str) -> Result<(), DavError> {
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", old, new, "move");

        let mut req = self.request(dav_method("MOVE"), old, None)?;
        let overwrite = if old.ends_with('/') { "F" } else { "T" };
        req.headers.insert(
            HeaderName::from_static("overwrite"),
            HeaderValue::from_static(overwrite),
        );
        let dest = self.url_for(new);
        req.headers.insert(
            HeaderName::from_static("destination"),
            HeaderValue::from_str(&dest).map_err(|_| DavError::Invalid("bad path".to_owned()))?,
        );
        let resp = self.roundtrip(req).await?;
        if resp.status == StatusCode::MULTI_STATUS {
            return Err(DavError::Invalid(
                "unexpected multistatus response to MOVE".to_owned(),
            ));
        }
        Ok(())
    }

    /// Quota properties of the collection root, for statfs.
    pub async fn quota(&self) -> Result<(Option<u64>, Option<u64>), DavError> {
        let entries = self
            .propfind(
                "/",
                Depth::Zero,
                PropSet::Named(&["quota-used-bytes", "quota-available-bytes"]),
            )
            .await?;
        let entry = entries
            .first()
            .ok_or_else(|| DavError::Invalid("no propfind entry for /".to_owned()))?;
        Ok((entry.quota_used, entry.quota_available))
    }

    /// Raw PROPFIND.
    pub async fn propfind(
        &self,
        path: &str,
        depth: Depth,
        props: PropSet<'_>,
    ) -> Result<Vec<PropEntry>, DavError> {
        let _permit = self.throttle().await;
        tracing::debug!(target: "webdav", path, depth = depth.header_value(), "propfind");

        let body = propfind::request_body(props, self.caps.redirectrefs);
        let mut req = self.request(dav_method("PROPFIND"), path, Some(Bytes::from(body)))?;
        req.headers
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/xml"));
        req.headers.insert(
            HeaderName::from_static("depth"),
            HeaderValue::from_static(depth.header_value()),
        );
        if self.caps.redirectrefs {
            req.headers.insert(
                HeaderName::from_static("apply-to-redirect-ref"),
                HeaderValue::from_static("T"),
            );
        }

        let resp = self.roundtrip(req).await?;
        let text = std::str::from_utf8(&resp.body)
            .map_err(|_| DavError::Invalid("multistatus body is not utf-8".to_owned()))?;
        let mut entries = propfind::parse_multistatus(text)?;
        // Redirect references without a target are unusable; drop them the
        // way the entry-less responses are dropped.
        entries.retain(|e| !(e.is_redirect && e.target.is_none()));
        Ok(entries)
    }

    /// PROPFIND that retries once when the server answers a "this is a
    /// directory" redirect: a 3xx whose `Location` differs from the request
    /// path only by a trailing slash.
    pub async fn propfind_with_redirect(
        &self,
        path: &str,
        depth: Depth,
        props: PropSet<'_>,
    ) -> Result<Vec<PropEntry>, DavError> {
        let first = self.propfind(path, depth, props).await;
        let Err(err) = &first else {
            return first;
        };
        let Some(location) = err.redirect_location() else {
            return first;
        };
        let location_path = match crate::propfind::decode_location_path(location) {
            Some(p) => p,
            None => return first,
        };
        if location_path == format!("{}{}/", self.base_path, path) {
            return self.propfind(&format!("{path}/"), depth, props).await;
        }
        first
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Bytes>,
    ) -> Result<HttpRequest, DavError> {
        if !path.starts_with('/') {
            return Err(DavError::Invalid(format!(
                "path does not start with /: {path}"
            )));
        }
        let mut req = HttpRequest::new(method, self.url_for(path))
            .header(USER_AGENT, self.user_agent.clone());
        if let Some(auth) = &self.auth {
            req = req.header(AUTHORIZATION, auth.clone());
        }
        if let Some(cookie) = &self.cookie {
            req = req.header(COOKIE, cookie.clone());
        }
        if let Some(body) = body {
            req = req.with_body(body);
        }
        Ok(req)
    }

    /// Join a collection-relative path onto the base URL, percent-escaping
    /// as needed.
    fn url_for(&self, path: &str) -> String {
        let mut url = self.base_url.clone();
        url.set_path(&format!("{}{}", self.base_path, path));
        url.to_string()
    }

    async fn throttle(&self) -> Option<tokio::sync::SemaphorePermit<'_>> {
        match &self.limit {
            Some(sem) => sem.acquire().await.ok(),
            None => None,
        }
    }

    async fn roundtrip(&self, req: HttpRequest) -> Result<HttpResponse, DavError> {
        tracing::debug!(
            target: "httpreq",
            method = %req.method, url = %req.url, len = req.content_length(),
            "request"
        );
        tracing::trace!(target: "httphdr", headers = ?req.headers);

        let resp = self.backend.execute(req).await.map_err(DavError::from)?;

        tracing::debug!(target: "httpreq", status = %resp.status, "response");
        tracing::trace!(target: "httphdr", headers = ?resp.headers);

        if !resp.status.is_success() {
            return Err(DavError::remote(resp.status, &resp.headers));
        }
        Ok(resp)
    }
}

fn apply_conditionals(headers: &mut HeaderMap, create: bool, excl: bool) {
    if create {
        if excl {
            headers.insert(
                HeaderName::from_static("if-none-match"),
                HeaderValue::from_static("*"),
            );
        }
    } else {
        headers.insert(
            HeaderName::from_static("if-match"),
            HeaderValue::from_static("*"),
        );
    }
}

fn dnode_from(entry: &PropEntry, name: String, detail: bool) -> Dnode {
    let is_link = entry.is_redirect && entry.target.is_some();
    let mut dnode = Dnode {
        name,
        target: entry.target.clone().filter(|_| is_link),
        is_dir: entry.is_collection,
        is_link,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        size: 0,
    };
    if detail {
        dnode.mtime = entry.mtime.unwrap_or(UNIX_EPOCH);
        dnode.ctime = entry.ctime.unwrap_or(UNIX_EPOCH);
        dnode.size = if is_link {
            dnode.target.as_ref().map_or(0, |t| t.len() as u64)
        } else {
            entry.size.unwrap_or(0)
        };
    }
    dnode
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use std::sync::Mutex;

    type Responder = Box<dyn Fn(&HttpRequest) -> HttpResponse + Send + Sync>;

    struct ScriptedBackend {
        responder: Responder,
        log: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedBackend {
        fn new(responder: impl Fn(&HttpRequest) -> HttpResponse + Send + Sync + 'static) -> Self {
            Self {
                responder: Box::new(responder),
                log: Mutex::new(Vec::new()),
            }
        }
    }

    impl HttpClient for &ScriptedBackend {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            let resp = (self.responder)(&request);
            self.log.lock().unwrap().push(request);
            Ok(resp)
        }
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> HttpResponse {
        let mut map = HeaderMap::new();
        for (k, v) in headers {
            map.append(
                HeaderName::from_bytes(k.as_bytes()).unwrap(),
                HeaderValue::from_str(v).unwrap(),
            );
        }
        HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: map,
            body: Bytes::from(body.to_owned()),
        }
    }

    fn root_multistatus() -> String {
        r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#
            .to_owned()
    }

    fn config() -> DavConfig {
        DavConfig {
            url: "http://server.example/dav/".to_owned(),
            max_conns: 4,
            ..DavConfig::default()
        }
    }

    async fn handshaken(backend: &ScriptedBackend) -> DavClient<&ScriptedBackend> {
        let mut client = DavClient::new(backend, config()).unwrap();
        client.handshake().await.unwrap();
        client
    }

    fn sabre_options_responder(req: &HttpRequest) -> HttpResponse {
        match req.method.as_str() {
            "OPTIONS" => response(
                200,
                &[
                    ("dav", "1, 3, sabredav-partialupdate"),
                    ("allow", "OPTIONS, GET, PUT, PATCH, PROPFIND"),
                    ("server", "sabre/dav"),
                ],
                "",
            ),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            _ => response(204, &[], ""),
        }
    }

    #[tokio::test]
    async fn handshake_detects_sabre() {
        let backend = ScriptedBackend::new(sabre_options_responder);
        let client = handshaken(&backend).await;
        assert_eq!(client.capabilities().dialect, RangeDialect::Sabre);
        assert!(client.can_put_range());
        assert!(client.capabilities().methods.contains("PATCH"));
    }

    #[tokio::test]
    async fn handshake_detects_apache() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(
                200,
                &[
                    ("dav", "1,2,<http://apache.org/dav/propset/fs/1>"),
                    ("server", "Apache/2.4.57 (Unix)"),
                ],
                "",
            ),
            _ => response(207, &[], &root_multistatus()),
        });
        let client = handshaken(&backend).await;
        assert_eq!(client.capabilities().dialect, RangeDialect::Apache);
    }

    #[tokio::test]
    async fn handshake_rejects_non_dav_server() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("allow", "GET, HEAD")], ""),
            _ => response(207, &[], &root_multistatus()),
        });
        let mut client = DavClient::new(&backend, config()).unwrap();
        let err = client.handshake().await.unwrap_err();
        assert!(err.to_string().contains("not a webdav server"));
    }

    #[tokio::test]
    async fn plain_server_yields_no_dialect() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1, 2"), ("server", "nginx")], ""),
            _ => response(207, &[], &root_multistatus()),
        });
        let client = handshaken(&backend).await;
        assert_eq!(client.capabilities().dialect, RangeDialect::None);
        assert!(!client.can_put_range());
        let err = client
            .put_range("/f", Bytes::from_static(b"x"), 0, false, false)
            .await
            .unwrap_err();
        assert!(matches!(err, DavError::CapabilityMissing));
    }

    #[tokio::test]
    async fn sabre_put_range_uses_patch_with_update_range() {
        let backend = ScriptedBackend::new(sabre_options_responder);
        let client = handshaken(&backend).await;
        backend.log.lock().unwrap().clear();

        let created = client
            .put_range("/f.txt", Bytes::from_static(b"data"), 100, false, false)
            .await
            .unwrap();
        assert!(!created);

        let log = backend.log.lock().unwrap();
        assert_eq!(log.len(), 1);
        assert_eq!(log[0].method.as_str(), "PATCH");
        assert_eq!(log[0].headers["x-update-range"], "bytes=100-");
        assert_eq!(
            log[0].headers[CONTENT_TYPE],
            "application/x-sabredav-partialupdate"
        );
        assert_eq!(log[0].headers["if-match"], "*");
    }

    #[tokio::test]
    async fn apache_put_range_uses_content_range() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(
                200,
                &[
                    ("dav", "1,<http://apache.org/dav/propset/fs/1>"),
                    ("server", "Apache"),
                ],
                "",
            ),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            _ => response(204, &[], ""),
        });
        let client = handshaken(&backend).await;
        backend.log.lock().unwrap().clear();

        client
            .put_range("/f.txt", Bytes::from_static(b"abcd"), 10, true, true)
            .await
            .unwrap();

        let log = backend.log.lock().unwrap();
        assert_eq!(log[0].method.as_str(), "PUT");
        assert_eq!(log[0].headers["content-range"], "bytes 10-13/*");
        assert_eq!(log[0].headers["if-none-match"], "*");
        assert!(!log[0].headers.contains_key("if-match"));
    }

    #[tokio::test]
    async fn get_range_requires_partial_content() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1, sabredav-partialupdate")], ""),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            // Server ignores the Range header and sends the whole body.
            _ => response(200, &[], "whole file contents"),
        });
        let client = handshaken(&backend).await;
        let err = client.get_range("/f", 5, 4).await.unwrap_err();
        assert_eq!(err.errno(), libc::ERANGE);
    }

    #[tokio::test]
    async fn get_range_truncates_oversized_body() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1")], ""),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            _ => response(206, &[], "0123456789"),
        });
        let client = handshaken(&backend).await;
        let body = client.get_range("/f", 0, 4).await.unwrap();
        assert_eq!(&body[..], b"0123");

        let log = backend.log.lock().unwrap();
        let get = log.iter().find(|r| r.method == Method::GET).unwrap();
        assert_eq!(get.headers[RANGE], "bytes=0-3");
    }

    #[tokio::test]
    async fn move_reports_multistatus_as_error() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1")], ""),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            "MOVE" => response(207, &[], ""),
            _ => response(200, &[], ""),
        });
        let client = handshaken(&backend).await;
        let err = client.move_to("/a", "/b").await.unwrap_err();
        assert_eq!(err.errno(), libc::EIO);
    }

    #[tokio::test]
    async fn move_headers_for_collections_and_files() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1")], ""),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            _ => response(201, &[], ""),
        });
        let client = handshaken(&backend).await;
        backend.log.lock().unwrap().clear();

        client.move_to("/a/", "/b/").await.unwrap();
        client.move_to("/x", "/y").await.unwrap();

        let log = backend.log.lock().unwrap();
        assert_eq!(log[0].headers["overwrite"], "F");
        assert_eq!(
            log[0].headers["destination"],
            "http://server.example/dav/b/"
        );
        assert_eq!(log[1].headers["overwrite"], "T");
    }

    #[tokio::test]
    async fn propfind_retries_trailing_slash_redirect() {
        let backend = ScriptedBackend::new(|req| {
            if req.method.as_str() == "OPTIONS" {
                return response(200, &[("dav", "1")], "");
            }
            if req.url.ends_with("/dav/d") {
                return response(
                    301,
                    &[("location", "http://server.example/dav/d/")],
                    "",
                );
            }
            response(
                207,
                &[],
                r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/d/</D:href>
    <D:propstat><D:prop>
      <D:resourcetype><D:collection/></D:resourcetype>
    </D:prop></D:propstat>
  </D:response>
</D:multistatus>"#,
            )
        });
        let client = handshaken(&backend).await;
        backend.log.lock().unwrap().clear();

        let dnode = client.stat("/d").await.unwrap();
        assert!(dnode.is_dir);

        let log = backend.log.lock().unwrap();
        assert_eq!(log.len(), 2);
        assert!(log[0].url.ends_with("/dav/d"));
        assert!(log[1].url.ends_with("/dav/d/"));
    }

    #[tokio::test]
    async fn paths_are_percent_escaped() {
        let backend = ScriptedBackend::new(|req| match req.method.as_str() {
            "OPTIONS" => response(200, &[("dav", "1")], ""),
            "PROPFIND" => response(207, &[], &root_multistatus()),
            _ => response(206, &[], "x"),
        });
        let client = handshaken(&backend).await;
        backend.log.lock().unwrap().clear();

        let _ = client.get_range("/hello world.txt", 0, 1).await;
        let log = backend.log.lock().unwrap();
        assert_eq!(
            log[0].url,
            "http://server.example/dav/hello%20world.txt"
        );
    }

    #[tokio::test]
    async fn basic_auth_and_cookie_headers() {
        let backend = ScriptedBackend::new(|_| response(200, &[("dav", "1")], ""));
        let client = DavClient::new(
            &backend,
            DavConfig {
                url: "http://server.example/dav".to_owned(),
                username: Some("alice".to_owned()),
                password: Some("secret".to_owned()),
                cookie: Some("session=abc".to_owned()),
                ..DavConfig::default()
            },
        )
        .unwrap();

        let req = client.request(Method::GET, "/f", None).unwrap();
        assert_eq!(req.headers[AUTHORIZATION], "Basic YWxpY2U6c2VjcmV0");
        assert_eq!(req.headers[COOKIE], "session=abc");
        assert!(req.headers[USER_AGENT]
            .to_str()
            .unwrap()
            .starts_with("webdavfs/"));
    }

    #[test]
    fn rejects_relative_paths() {
        let backend = ScriptedBackend::new(|_| response(200, &[], ""));
        let client = DavClient::new(&backend, config()).unwrap();
        assert!(client.request(Method::GET, "no-slash", None).is_err());
    }
}
