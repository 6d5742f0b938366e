//! Immutable snapshots of remote entries.

use std::time::SystemTime;

/// Metadata of one remote entry, as decoded from a PROPFIND response.
///
/// A `Dnode` is a value: the node tree copies it into live nodes and
/// refreshes it wholesale on every successful stat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dnode {
    /// Entry name (final path component; `.` for a listing's own entry).
    pub name: String,
    /// Redirect-ref target, when this entry is a link.
    pub target: Option<String>,
    /// True for WebDAV collections.
    pub is_dir: bool,
    /// True for redirect references (reported as symlinks, never followed).
    pub is_link: bool,
    /// Last modification time (`getlastmodified`).
    pub mtime: SystemTime,
    /// Creation time (`creationdate`).
    pub ctime: SystemTime,
    /// Size in bytes; for links, the length of the target string.
    pub size: u64,
}

impl Dnode {
    /// A directory entry with the given name and times.
    pub fn directory(name: impl Into<String>, mtime: SystemTime, ctime: SystemTime) -> Self {
        Self {
            name: name.into(),
            target: None,
            is_dir: true,
            is_link: false,
            mtime,
            ctime,
            size: 0,
        }
    }
}

/// Parse a DAV timestamp.
///
/// `creationdate` is RFC 3339 (`2006-01-02T15:04:05Z`); `getlastmodified`
/// is an HTTP date (RFC 1123). Servers are not consistent, so the format is
/// chosen by the leading character, like the original protocol users do:
/// digits mean RFC 3339, anything else an HTTP date.
pub(crate) fn parse_dav_time(s: &str) -> Option<SystemTime> {
    let s = s.trim();
    let first = s.chars().next()?;
    let parsed = if first.is_ascii_digit() {
        chrono::DateTime::parse_from_rfc3339(s).ok()?
    } else {
        chrono::DateTime::parse_from_rfc2822(s).ok()?
    };
    Some(SystemTime::from(parsed))
}
