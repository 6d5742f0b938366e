//! PROPFIND request bodies and `multistatus` response decoding.
//!
//! The decoder is deliberately shallow: it extracts exactly the property
//! shape the filesystem needs and ignores everything else. Element names
//! are matched by local name, because servers disagree about namespace
//! prefixes (`D:`, `d:`, `lp1:`, or a default namespace).

use std::time::SystemTime;

use percent_encoding::percent_decode_str;
use quick_xml::Reader;
use quick_xml::events::Event;

use crate::dnode::parse_dav_time;
use crate::error::DavError;

/// PROPFIND depth header value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    /// The entry itself.
    Zero,
    /// The entry and its direct children.
    One,
}

impl Depth {
    pub(crate) fn header_value(self) -> &'static str {
        match self {
            Self::Zero => "0",
            Self::One => "1",
        }
    }
}

/// Which properties a PROPFIND asks for.
#[derive(Debug, Clone, Copy)]
pub enum PropSet<'a> {
    /// `resourcetype, creationdate, getlastmodified, getetag,
    /// getcontentlength`, plus `reftarget` when the server advertises
    /// redirect references.
    Default,
    /// `<D:allprop/>`.
    AllProp,
    /// An explicit list of DAV property names.
    Named(&'a [&'a str]),
}

const DEFAULT_PROPS: &str =
    "<D:resourcetype/><D:creationdate/><D:getlastmodified/><D:getetag/><D:getcontentlength/>";

/// Render the PROPFIND request body.
pub(crate) fn request_body(props: PropSet<'_>, redirectrefs: bool) -> String {
    let mut body =
        String::from(r#"<?xml version="1.0" encoding="utf-8" ?><D:propfind xmlns:D='DAV:'>"#);
    match props {
        PropSet::Default => {
            body.push_str("<D:prop>");
            body.push_str(DEFAULT_PROPS);
            if redirectrefs {
                body.push_str("<D:reftarget/>");
            }
            body.push_str("</D:prop>");
        }
        PropSet::AllProp => body.push_str("<D:allprop/>"),
        PropSet::Named(names) => {
            body.push_str("<D:prop>");
            for name in names {
                body.push_str("<D:");
                body.push_str(name);
                body.push_str("/>");
            }
            body.push_str("</D:prop>");
        }
    }
    body.push_str("</D:propfind>");
    body
}

/// One decoded `response` element of a `multistatus` body.
#[derive(Debug, Clone, Default)]
pub struct PropEntry {
    /// Decoded URL path of the entry. Collections always carry a trailing
    /// slash here, whether or not the server sent one.
    pub href: String,
    /// `resourcetype/collection` was present.
    pub is_collection: bool,
    /// `resourcetype/redirectref` was present.
    pub is_redirect: bool,
    /// `reftarget/href`, for redirect references.
    pub target: Option<String>,
    /// `getetag`, with surrounding quotes stripped.
    pub etag: Option<String>,
    /// `creationdate`.
    pub ctime: Option<SystemTime>,
    /// `getlastmodified`.
    pub mtime: Option<SystemTime>,
    /// `getcontentlength`.
    pub size: Option<u64>,
    /// `quota-used-bytes`.
    pub quota_used: Option<u64>,
    /// `quota-available-bytes`.
    pub quota_available: Option<u64>,
}

#[derive(Default)]
struct PendingEntry {
    href: Option<String>,
    is_collection: bool,
    is_redirect: bool,
    target: Option<String>,
    etag: Option<String>,
    ctime: Option<SystemTime>,
    mtime: Option<SystemTime>,
    size: Option<u64>,
    quota_used: Option<u64>,
    quota_available: Option<u64>,
}

impl PendingEntry {
    fn finish(self) -> Option<PropEntry> {
        let href = self.href?;
        let mut href = decode_href_path(&href)?;
        // Make sure collection hrefs end in '/': prefix stripping and
        // self/child classification both rely on it.
        if self.is_collection && !href.ends_with('/') {
            href.push('/');
        }
        Some(PropEntry {
            href,
            is_collection: self.is_collection,
            is_redirect: self.is_redirect,
            target: self.target,
            etag: self.etag.map(|e| strip_quotes(&e).to_owned()),
            ctime: self.ctime,
            mtime: self.mtime,
            size: self.size,
            quota_used: self.quota_used,
            quota_available: self.quota_available,
        })
    }
}

/// Extract the percent-decoded path from an href, which may be an absolute
/// URL or an absolute path. Relative hrefs are rejected.
fn decode_href_path(href: &str) -> Option<String> {
    let path = if href.starts_with('/') {
        href
    } else {
        let url = url::Url::parse(href).ok()?;
        // Borrow trick: Url::path borrows from url, copy out.
        return Some(
            percent_decode_str(url.path())
                .decode_utf8_lossy()
                .into_owned(),
        );
    };
    Some(percent_decode_str(path).decode_utf8_lossy().into_owned())
}

/// Percent-decoded path of a redirect `Location`, which may be an absolute
/// URL or a bare path.
pub(crate) fn decode_location_path(location: &str) -> Option<String> {
    decode_href_path(location)
}

fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(s)
}

fn local_name(qname: &[u8]) -> Vec<u8> {
    match qname.iter().rposition(|&b| b == b':') {
        Some(i) => qname[i + 1..].to_vec(),
        None => qname.to_vec(),
    }
}

/// Decode a `multistatus` body into its response entries.
///
/// Responses without an href and hrefs that cannot be parsed are dropped,
/// matching how lenient real-world clients have to be with DAV servers.
pub(crate) fn parse_multistatus(xml: &str) -> Result<Vec<PropEntry>, DavError> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text_start = true;
    reader.config_mut().trim_text_end = true;

    let mut entries = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut current: Option<PendingEntry> = None;
    let mut text = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(e.name().as_ref());
                mark_empty_element(&name, &stack, current.as_mut());
                if name == b"response" {
                    current = Some(PendingEntry::default());
                }
                stack.push(name);
                text.clear();
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(e.name().as_ref());
                mark_empty_element(&name, &stack, current.as_mut());
            }
            Ok(Event::Text(t)) => {
                let chunk = t
                    .unescape()
                    .map_err(|e| DavError::Invalid(format!("multistatus decode: {e}")))?;
                text.push_str(&chunk);
            }
            Ok(Event::End(e)) => {
                let name = local_name(e.name().as_ref());
                if let Some(entry) = current.as_mut() {
                    store_text(entry, &name, &stack, &text);
                }
                text.clear();
                stack.pop();
                if name == b"response" {
                    if let Some(done) = current.take().and_then(PendingEntry::finish) {
                        entries.push(done);
                    }
                }
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(DavError::Invalid(format!("multistatus decode: {e}"))),
        }
    }

    if entries.is_empty() {
        return Err(DavError::Invalid("empty multistatus response".to_owned()));
    }
    Ok(entries)
}

/// Flag-style elements: `<collection/>` and `<redirectref/>` under
/// `resourcetype`. They may arrive as `Empty` or as a `Start`/`End` pair.
fn mark_empty_element(name: &[u8], stack: &[Vec<u8>], entry: Option<&mut PendingEntry>) {
    let Some(entry) = entry else { return };
    let in_resourcetype = stack.last().is_some_and(|p| p == b"resourcetype");
    if !in_resourcetype {
        return;
    }
    match name {
        b"collection" => entry.is_collection = true,
        b"redirectref" => entry.is_redirect = true,
        _ => {}
    }
}

fn store_text(entry: &mut PendingEntry, name: &[u8], stack: &[Vec<u8>], text: &str) {
    if text.is_empty() {
        return;
    }
    match name {
        b"href" => {
            // `response/href` names the entry; `reftarget/href` names a
            // link target. Disambiguate by the enclosing element.
            match stack.last().map(|p| p.as_slice()) {
                Some(b"href") => {
                    // stack top is the element being closed; look beneath.
                    let parent = stack.len().checked_sub(2).and_then(|i| stack.get(i));
                    match parent.map(|p| p.as_slice()) {
                        Some(b"reftarget") => entry.target = Some(text.to_owned()),
                        _ => {
                            if entry.href.is_none() {
                                entry.href = Some(text.to_owned());
                            }
                        }
                    }
                }
                _ => {}
            }
        }
        b"creationdate" => entry.ctime = parse_dav_time(text),
        b"getlastmodified" => entry.mtime = parse_dav_time(text),
        b"getetag" => entry.etag = Some(text.to_owned()),
        b"getcontentlength" => entry.size = text.parse().ok(),
        b"quota-used-bytes" => entry.quota_used = text.parse().ok(),
        b"quota-available-bytes" => entry.quota_available = text.parse().ok(),
        _ => {}
    }
}

/// Strip `prefix` from an entry path and reject names that still contain an
/// interior slash (entries deeper than one level, which depth-1 PROPFIND
/// should not return but some servers do).
pub(crate) fn relative_name(path: &str, prefix: &str) -> Option<String> {
    let name = path.strip_prefix(prefix).unwrap_or(path);
    match name.find('/') {
        Some(i) if i + 1 < name.len() => None,
        _ => Some(name.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, UNIX_EPOCH};

    const LISTING: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>/dav/dir/</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
        <D:creationdate>2023-06-01T12:00:00Z</D:creationdate>
        <D:getlastmodified>Thu, 01 Jun 2023 12:00:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/dir/hello%20world.txt</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype/>
        <D:getetag>"abc123"</D:getetag>
        <D:getcontentlength>42</D:getcontentlength>
        <D:getlastmodified>Thu, 01 Jun 2023 13:00:00 GMT</D:getlastmodified>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
  <D:response>
    <D:href>/dav/dir/sub</D:href>
    <D:propstat>
      <D:prop>
        <D:resourcetype><D:collection/></D:resourcetype>
      </D:prop>
      <D:status>HTTP/1.1 200 OK</D:status>
    </D:propstat>
  </D:response>
</D:multistatus>"#;

    #[test]
    fn decodes_listing() {
        let entries = parse_multistatus(LISTING).unwrap();
        assert_eq!(entries.len(), 3);

        assert_eq!(entries[0].href, "/dav/dir/");
        assert!(entries[0].is_collection);
        assert_eq!(
            entries[0].ctime,
            Some(UNIX_EPOCH + Duration::from_secs(1_685_620_800))
        );

        assert_eq!(entries[1].href, "/dav/dir/hello world.txt");
        assert!(!entries[1].is_collection);
        assert_eq!(entries[1].size, Some(42));
        assert_eq!(entries[1].etag.as_deref(), Some("abc123"));
    }

    #[test]
    fn restores_collection_trailing_slash() {
        let entries = parse_multistatus(LISTING).unwrap();
        assert_eq!(entries[2].href, "/dav/dir/sub/");
    }

    #[test]
    fn decodes_redirectref_link() {
        let xml = r#"<?xml version="1.0"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/dav/link</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:redirectref/></d:resourcetype>
        <d:reftarget><d:href>/dav/real-file</d:href></d:reftarget>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].is_redirect);
        assert_eq!(entries[0].target.as_deref(), Some("/dav/real-file"));
    }

    #[test]
    fn absolute_url_hrefs_are_reduced_to_paths() {
        let xml = r#"<?xml version="1.0"?>
<D:multistatus xmlns:D="DAV:">
  <D:response>
    <D:href>http://server.example/dav/f.txt</D:href>
    <D:propstat><D:prop><D:resourcetype/></D:prop></D:propstat>
  </D:response>
</D:multistatus>"#;
        let entries = parse_multistatus(xml).unwrap();
        assert_eq!(entries[0].href, "/dav/f.txt");
    }

    #[test]
    fn empty_multistatus_is_an_error() {
        let xml = r#"<?xml version="1.0"?><D:multistatus xmlns:D="DAV:"></D:multistatus>"#;
        assert!(parse_multistatus(xml).is_err());
    }

    #[test]
    fn relative_name_rules() {
        assert_eq!(relative_name("/dav/d/x", "/dav/d/"), Some("x".to_owned()));
        assert_eq!(relative_name("/dav/d/s/", "/dav/d/"), Some("s/".to_owned()));
        assert_eq!(relative_name("/dav/d/", "/dav/d/"), Some(String::new()));
        // deeper than one level: skipped
        assert_eq!(relative_name("/dav/d/s/x", "/dav/d/"), None);
    }

    #[test]
    fn request_body_shapes() {
        let body = request_body(PropSet::Default, false);
        assert!(body.contains("<D:getcontentlength/>"));
        assert!(!body.contains("reftarget"));

        let body = request_body(PropSet::Default, true);
        assert!(body.contains("<D:reftarget/>"));

        let body = request_body(PropSet::AllProp, false);
        assert!(body.contains("<D:allprop/>"));

        let body = request_body(PropSet::Named(&["quota-used-bytes"]), false);
        assert!(body.contains("<D:quota-used-bytes/>"));
    }
}
