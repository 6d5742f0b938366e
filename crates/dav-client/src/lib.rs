//! WebDAV client for the webdavfs mount daemon.
//!
//! The client speaks the subset of RFC 4918 that a filesystem needs:
//! PROPFIND for stat/readdir, ranged GET for reads, PUT/PATCH for writes
//! (including the Apache and SabreDAV partial-update dialects), MKCOL,
//! MOVE and DELETE. The HTTP backend is pluggable through [`HttpClient`]
//! so the whole protocol layer can be exercised against a scripted fake.

pub mod backends;
mod client;
mod dnode;
mod error;
mod http;
mod propfind;

pub use client::{Capabilities, DavClient, DavConfig, RangeDialect, TargetInfo};
pub use dnode::Dnode;
pub use error::{DavError, TransportError};
pub use http::{HttpClient, HttpRequest, HttpResponse};
pub use propfind::{Depth, PropEntry, PropSet};
