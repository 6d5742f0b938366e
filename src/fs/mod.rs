//! The filesystem core: node tree, caches, handlers and the FUSE adapter.

pub mod cache;
pub mod fuser;
pub mod node;
pub mod webdav_fs;

pub use node::{Ino, NodeTree, ROOT_INO};
pub use webdav_fs::{
    DirEntry, EntryKind, FsConfig, FsError, FsStats, NodeAttr, OpenFlags, OpenedFile,
    SetattrRequest, WebdavFs,
};
