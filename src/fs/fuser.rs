//! Adapter between the kernel FUSE session and the async handlers.
//!
//! `fuser` delivers requests on its own threads; every operation is handed
//! to the tokio runtime so handlers may block on HTTP without stalling the
//! kernel queue, and the reply object travels into the spawned task. No
//! error and no panic crosses back over the FUSE boundary: handler errors
//! become errno replies here.

use std::ffi::OsStr;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;

use dav_client::HttpClient;
use fuser::{
    ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen,
    ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use tracing::Instrument as _;
use tracing::debug;

use super::cache::{ATTR_VALID_TIME, ENTRY_VALID_TIME};
use super::webdav_fs::{EntryKind, NodeAttr, OpenFlags, SetattrRequest, WebdavFs};

impl From<NodeAttr> for fuser::FileAttr {
    fn from(attr: NodeAttr) -> Self {
        let kind = match attr.kind {
            EntryKind::File => fuser::FileType::RegularFile,
            EntryKind::Directory => fuser::FileType::Directory,
            EntryKind::Symlink => fuser::FileType::Symlink,
        };
        fuser::FileAttr {
            ino: attr.ino,
            size: attr.size,
            blocks: attr.blocks,
            atime: attr.atime,
            mtime: attr.mtime,
            ctime: attr.ctime,
            crtime: attr.crtime,
            kind,
            perm: attr.perm,
            nlink: attr.nlink,
            uid: attr.uid,
            gid: attr.gid,
            rdev: 0,
            blksize: attr.blksize,
            flags: 0,
        }
    }
}

impl From<EntryKind> for fuser::FileType {
    fn from(kind: EntryKind) -> Self {
        match kind {
            EntryKind::File => Self::RegularFile,
            EntryKind::Directory => Self::Directory,
            EntryKind::Symlink => Self::Symlink,
        }
    }
}

fn time_or_now(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// Decode a kernel-supplied name; DAV paths are UTF-8 or nothing.
fn utf8_name(name: &OsStr) -> Option<&str> {
    name.to_str()
}

/// The `fuser::Filesystem` implementation driving [`WebdavFs`].
pub struct WebdavFuse<C: HttpClient + 'static> {
    fs: Arc<WebdavFs<C>>,
    runtime: tokio::runtime::Handle,
}

impl<C: HttpClient + 'static> WebdavFuse<C> {
    pub fn new(fs: Arc<WebdavFs<C>>, runtime: tokio::runtime::Handle) -> Self {
        Self { fs, runtime }
    }

    fn spawn<Fut>(
        &self,
        span: tracing::Span,
        f: impl FnOnce(Arc<WebdavFs<C>>) -> Fut + Send + 'static,
    ) where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let fs = Arc::clone(&self.fs);
        self.runtime.spawn(f(fs).instrument(span));
    }
}

impl<C: HttpClient + 'static> fuser::Filesystem for WebdavFuse<C> {
    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let Some(name) = utf8_name(name).map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!(target: "fuse", "lookup", parent, name);
        self.spawn(span, move |fs| async move {
            match fs.lookup(parent, &name).await {
                Ok(attr) => reply.entry(&ENTRY_VALID_TIME, &attr.into(), 0),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "lookup failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        let span = tracing::debug_span!(target: "fuse", "getattr", ino);
        self.spawn(span, move |fs| async move {
            match fs.getattr(ino).await {
                Ok(attr) => reply.attr(&ATTR_VALID_TIME, &attr.into()),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "getattr failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        crtime: Option<SystemTime>,
        chgtime: Option<SystemTime>,
        bkuptime: Option<SystemTime>,
        flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let request = SetattrRequest {
            mode,
            uid,
            gid,
            size,
            atime: atime.map(time_or_now),
            mtime: mtime.map(time_or_now),
            crtime,
            chgtime,
            bkuptime,
            flags,
        };
        let span = tracing::debug_span!(target: "fuse", "setattr", ino, ?size);
        self.spawn(span, move |fs| async move {
            match fs.setattr(ino, request).await {
                Ok(attr) => reply.attr(&ATTR_VALID_TIME, &attr.into()),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "setattr failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let span = tracing::debug_span!(target: "fuse", "readlink", ino);
        self.spawn(span, move |fs| async move {
            match fs.readlink(ino).await {
                Ok(target) => reply.data(&target),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let Some(name) = utf8_name(name).map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!(target: "fuse", "mkdir", parent, name);
        self.spawn(span, move |fs| async move {
            match fs.mkdir(parent, &name).await {
                Ok(attr) => reply.entry(&ENTRY_VALID_TIME, &attr.into(), 0),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "mkdir failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name).map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!(target: "fuse", "unlink", parent, name);
        self.spawn(span, move |fs| async move {
            match fs.remove(parent, &name, false).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "unlink failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let Some(name) = utf8_name(name).map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!(target: "fuse", "rmdir", parent, name);
        self.spawn(span, move |fs| async move {
            match fs.remove(parent, &name, true).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "rmdir failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        let (Some(old), Some(new)) = (
            utf8_name(name).map(str::to_owned),
            utf8_name(newname).map(str::to_owned),
        ) else {
            reply.error(libc::EINVAL);
            return;
        };
        let span = tracing::debug_span!(target: "fuse", "rename", parent, old, newparent, new);
        self.spawn(span, move |fs| async move {
            match fs.rename(parent, &old, newparent, &new).await {
                Ok(()) => reply.ok(),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "rename failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let flags: OpenFlags = flags.into();
        let span = tracing::debug_span!(target: "fuse", "open", ino, ?flags);
        self.spawn(span, move |fs| async move {
            match fs.open(ino, flags).await {
                Ok(opened) => {
                    let mut reply_flags = 0;
                    if opened.keep_cache {
                        reply_flags |= fuser::consts::FOPEN_KEEP_CACHE;
                    }
                    reply.opened(opened.fh, reply_flags);
                }
                Err(e) => {
                    debug!(target: "fuse", error = %e, "open failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        let offset = offset.max(0) as u64;
        let span = tracing::debug_span!(target: "fuse", "read", ino, offset, size);
        self.spawn(span, move |fs| async move {
            match fs.read(ino, offset, size).await {
                Ok(data) => reply.data(&data),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "read failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        let offset = offset.max(0) as u64;
        let data = bytes::Bytes::copy_from_slice(data);
        let span = tracing::debug_span!(target: "fuse", "write", ino, offset, len = data.len());
        self.spawn(span, move |fs| async move {
            match fs.write(ino, offset, data).await {
                Ok(written) => reply.written(written),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "write failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn flush(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _lock_owner: u64,
        reply: ReplyEmpty,
    ) {
        // Writes go straight to the server; there is nothing to flush.
        reply.ok();
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn fsync(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _datasync: bool,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let flags: OpenFlags = flags.into();
        let span = tracing::debug_span!(target: "fuse", "opendir", ino);
        self.spawn(span, move |fs| async move {
            match fs.open(ino, flags).await {
                Ok(opened) => reply.opened(opened.fh, 0),
                Err(e) => reply.error(e.errno()),
            }
        });
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let span = tracing::debug_span!(target: "fuse", "readdir", ino, offset);
        self.spawn(span, move |fs| async move {
            let entries = match fs.readdir(ino).await {
                Ok(entries) => entries,
                Err(e) => {
                    debug!(target: "fuse", error = %e, "readdir failed");
                    reply.error(e.errno());
                    return;
                }
            };

            let offset = offset.max(0) as usize;
            for (i, entry) in entries.iter().enumerate().skip(offset) {
                let Ok(next): Result<i64, _> = (i + 1).try_into() else {
                    reply.error(libc::EIO);
                    return;
                };
                if reply.add(entry.ino, next, entry.kind.into(), &entry.name) {
                    break;
                }
            }
            reply.ok();
        });
    }

    fn releasedir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _fh: u64,
        _flags: i32,
        reply: ReplyEmpty,
    ) {
        reply.ok();
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, _nlookup: u64) {
        self.fs.forget(ino);
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        let span = tracing::debug_span!(target: "fuse", "statfs");
        self.spawn(span, move |fs| async move {
            match fs.statfs().await {
                Ok(stats) => reply.statfs(
                    stats.blocks,
                    stats.bfree,
                    stats.bavail,
                    stats.files,
                    stats.ffree,
                    stats.bsize,
                    stats.namelen,
                    stats.frsize,
                ),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "statfs failed");
                    reply.error(e.errno());
                }
            }
        });
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        _mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let Some(name) = utf8_name(name).map(str::to_owned) else {
            reply.error(libc::EINVAL);
            return;
        };
        let flags: OpenFlags = flags.into();
        let span = tracing::debug_span!(target: "fuse", "create", parent, name, ?flags);
        self.spawn(span, move |fs| async move {
            match fs.create(parent, &name, flags).await {
                Ok((attr, fh)) => reply.created(&ENTRY_VALID_TIME, &attr.into(), 0, fh, 0),
                Err(e) => {
                    debug!(target: "fuse", error = %e, "create failed");
                    reply.error(e.errno());
                }
            }
        });
    }
}
