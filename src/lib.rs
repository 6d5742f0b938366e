//! Mount a remote WebDAV collection as a local POSIX filesystem.

pub mod daemon;
pub mod fs;
pub mod mount_opts;
pub mod trc;
