//! Mount a remote WebDAV collection as a local filesystem.
use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use webdavfs::daemon::{self, MountSetup};
use webdavfs::mount_opts::MountOptions;
use webdavfs::trc::{Trc, TraceCategories};

/// Environment variables that may carry credentials. They are removed from
/// the environment before serving so they never leak into child state.
const ENV_USERNAME: &str = "WEBDAV_USERNAME";
const ENV_PASSWORD: &str = "WEBDAV_PASSWORD";
const ENV_COOKIE: &str = "WEBDAV_COOKIE";

#[derive(Parser)]
#[command(
    name = "webdavfs",
    version,
    about = "Mount a remote WebDAV collection as a local filesystem."
)]
struct Args {
    /// Ignore unknown mount options (fstab compatibility).
    #[arg(short = 's')]
    sloppy: bool,

    /// Fake: validate everything, do not mount.
    #[arg(short = 'f')]
    fake: bool,

    /// Accepted and ignored (mount(8) passes it for /etc/mtab handling).
    #[arg(short = 'n')]
    #[allow(dead_code)]
    no_mtab: bool,

    /// Verbose logging.
    #[arg(short = 'v')]
    verbose: bool,

    /// Enable all trace categories at debug level.
    #[arg(short = 'D')]
    debug: bool,

    /// Filesystem type; accepted and ignored (fstab compatibility).
    #[arg(short = 't', value_name = "TYPE")]
    #[allow(dead_code)]
    fs_type: Option<String>,

    /// Trace categories: webdav,httpreq,httphdr,fuse.
    #[arg(short = 'T', value_name = "OPTS")]
    trace: Option<String>,

    /// Write trace output to FILE instead of stdout.
    #[arg(short = 'F', value_name = "FILE")]
    trace_file: Option<PathBuf>,

    /// Mount options, comma-separated.
    #[arg(short = 'o', value_name = "OPTS")]
    options: Option<String>,

    /// WebDAV collection URL.
    url: String,

    /// Where to mount it.
    mountpoint: PathBuf,
}

/// When invoked as `mount.webdavfs` (fstab, mount(8)) the process puts
/// itself in the background by default.
fn invoked_as_mount_helper() -> bool {
    std::env::args()
        .next()
        .map(PathBuf::from)
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .is_some_and(|name| name.starts_with("mount."))
}

fn credentials_from_env(options: &mut MountOptions) {
    if options.username.is_none() {
        if let Ok(username) = std::env::var(ENV_USERNAME) {
            options.username = Some(username);
        }
    }
    if options.password.is_none() {
        if let Ok(password) = std::env::var(ENV_PASSWORD) {
            options.password = Some(password.into());
        }
    }
    if options.cookie.is_none() {
        if let Ok(cookie) = std::env::var(ENV_COOKIE) {
            options.cookie = Some(cookie.into());
        }
    }
    for var in [ENV_USERNAME, ENV_PASSWORD, ENV_COOKIE] {
        std::env::remove_var(var);
    }
}

#[expect(
    clippy::exit,
    reason = "top-level entry point that reports and terminates"
)]
fn main() {
    let args = Args::parse();

    // Option handling happens before tracing exists; report with eprintln.
    let mut options =
        match MountOptions::parse(args.options.as_deref().unwrap_or(""), args.sloppy) {
            Ok(options) => options,
            Err(e) => {
                eprintln!("webdavfs: {e}");
                std::process::exit(1);
            }
        };
    credentials_from_env(&mut options);
    if let Err(e) = options.check_privilege() {
        eprintln!("webdavfs: {e}");
        std::process::exit(1);
    }
    if options.read_only && options.read_write {
        eprintln!("webdavfs: both 'ro' and 'rw' given");
        std::process::exit(1);
    }

    if args.fake {
        std::process::exit(0);
    }

    let categories = if args.debug {
        TraceCategories::all()
    } else {
        match TraceCategories::parse(args.trace.as_deref().unwrap_or("")) {
            Ok(categories) => categories,
            Err(e) => {
                eprintln!("webdavfs: {e}");
                std::process::exit(1);
            }
        }
    };

    // Daemonize before tracing and before the runtime exists: forked
    // threads would not survive.
    if invoked_as_mount_helper() {
        let daemonize = daemonize::Daemonize::new().working_directory("/");
        if let Err(e) = daemonize.start() {
            eprintln!("webdavfs: failed to daemonize: {e}");
            std::process::exit(1);
        }
    }

    if let Err(e) = Trc::default()
        .with_categories(categories)
        .with_verbose(args.verbose)
        .with_file(args.trace_file.clone())
        .init()
    {
        eprintln!("webdavfs: {e}");
        std::process::exit(1);
    }

    let setup = MountSetup {
        url: args.url,
        mountpoint: args.mountpoint,
        options,
    };
    if let Err(e) = daemon::run(setup) {
        error!("{e}");
        std::process::exit(1);
    }
}
