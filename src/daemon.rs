//! The mount loop: connect to the server, mount the FUSE session, serve
//! until a signal arrives.

use std::path::PathBuf;
use std::sync::Arc;

use dav_client::backends::ReqwestClient;
use dav_client::{DavClient, DavConfig, DavError};
use thiserror::Error;
use tokio::select;
use tracing::{debug, info, warn};

use crate::fs::fuser::WebdavFuse;
use crate::fs::{FsConfig, WebdavFs};
use crate::mount_opts::MountOptions;

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("webdav: {0}")]
    Dav(#[from] DavError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Everything needed to mount: target URL, mountpoint, parsed options.
pub struct MountSetup {
    pub url: String,
    pub mountpoint: PathBuf,
    pub options: MountOptions,
}

/// Build the tokio runtime and serve until shutdown.
pub fn run(setup: MountSetup) -> Result<(), DaemonError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let handle = runtime.handle().clone();
    runtime.block_on(serve(setup, handle))
}

async fn serve(setup: MountSetup, handle: tokio::runtime::Handle) -> Result<(), DaemonError> {
    let backend = ReqwestClient::new(setup.options.max_idle_conns)
        .map_err(|e| DaemonError::Dav(DavError::from(e)))?;
    let mut dav = DavClient::new(
        backend,
        DavConfig {
            url: setup.url.clone(),
            username: setup.options.username.clone(),
            password: setup.options.password_value(),
            cookie: setup.options.cookie_value(),
            max_conns: setup.options.max_conns,
            put_disabled: false,
        },
    )?;
    dav.handshake().await?;
    info!(url = %setup.url, dialect = ?dav.capabilities().dialect, "connected");

    // A server with no partial-write dialect cannot take writes; fall back
    // to a read-only mount rather than handing EACCES to every writer.
    let mut read_only = setup.options.read_only;
    if !dav.can_put_range() && !read_only {
        if setup.options.read_write {
            warn!("server supports no partial-write dialect; writes will fail");
        } else {
            warn!("server supports no partial-write dialect; mounting read-only");
            read_only = true;
        }
    }

    let config = FsConfig {
        uid: setup.options.effective_uid(),
        gid: setup.options.effective_gid(),
        file_mode: setup.options.file_mode(),
        dir_mode: setup.options.dir_mode(),
        read_only,
        block_size: 4096,
    };
    let fs = Arc::new(WebdavFs::new(Arc::new(dav), config));
    let adapter = WebdavFuse::new(fs, handle);

    let mount_options = mount_options(&setup, read_only);
    let session = fuser::spawn_mount2(adapter, &setup.mountpoint, &mount_options)?;
    info!(mountpoint = %setup.mountpoint.display(), read_only, "mounted");

    wait_for_exit().await?;
    info!("unmounting");
    drop(session);
    Ok(())
}

fn mount_options(setup: &MountSetup, read_only: bool) -> Vec<fuser::MountOption> {
    let mut options = vec![
        fuser::MountOption::FSName(setup.url.clone()),
        fuser::MountOption::Subtype("webdavfs".to_owned()),
        if read_only {
            fuser::MountOption::RO
        } else {
            fuser::MountOption::RW
        },
    ];
    if setup.options.allow_root {
        options.push(fuser::MountOption::AllowRoot);
    }
    if setup.options.allow_other {
        options.push(fuser::MountOption::AllowOther);
    }
    if setup.options.effective_default_permissions() {
        options.push(fuser::MountOption::DefaultPermissions);
    }
    if setup.options.async_read {
        options.push(fuser::MountOption::CUSTOM("async_read".to_owned()));
    }
    if setup.options.nonempty {
        options.push(fuser::MountOption::CUSTOM("nonempty".to_owned()));
    }
    options
}

async fn wait_for_exit() -> Result<(), std::io::Error> {
    use tokio::signal;
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
    let mut sighup = signal::unix::signal(signal::unix::SignalKind::hangup())?;
    select! {
        _ = signal::ctrl_c() => {
            debug!("received interrupt, shutting down");
        },
        _ = sigterm.recv() => {
            debug!("received termination signal, shutting down");
        },
        _ = sighup.recv() => {
            debug!("received hangup signal, shutting down");
        },
    }
    Ok(())
}
