//! Tracing configuration and initialization.
//!
//! The `-T` trace categories map onto per-target filter directives: the
//! DAV client emits under `webdav`, `httpreq` and `httphdr`, the FUSE
//! adapter under `fuse`. A `WEBDAVFS_LOG` environment filter overrides the
//! category selection entirely.

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Error)]
pub enum TrcError {
    #[error("unknown trace option: {0}")]
    UnknownCategory(String),

    #[error("failed to open trace file: {0}")]
    TraceFile(#[from] std::io::Error),

    #[error("failed to initialize tracing: {0}")]
    Init(String),
}

/// Which trace categories are enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceCategories {
    /// DAV operations (stat, readdir, put_range, ...).
    pub webdav: bool,
    /// One line per HTTP request and response status.
    pub httpreq: bool,
    /// Request and response headers.
    pub httphdr: bool,
    /// FUSE operations as dispatched by the kernel.
    pub fuse: bool,
}

impl TraceCategories {
    /// Parse a `-T` list: `webdav,httpreq,httphdr,fuse`.
    pub fn parse(options: &str) -> Result<Self, TrcError> {
        let mut categories = Self::default();
        for option in options.split(',') {
            match option {
                "webdav" => categories.webdav = true,
                "httpreq" => categories.httpreq = true,
                "httphdr" => categories.httphdr = true,
                "fuse" => categories.fuse = true,
                "" => {}
                unknown => return Err(TrcError::UnknownCategory(unknown.to_owned())),
            }
        }
        Ok(categories)
    }

    /// Everything, for `-D`.
    pub fn all() -> Self {
        Self {
            webdav: true,
            httpreq: true,
            httphdr: true,
            fuse: true,
        }
    }

    fn filter(self, verbose: bool) -> EnvFilter {
        let mut directives = vec![if verbose { "info" } else { "warn" }.to_owned()];
        if self.webdav {
            directives.push("webdav=debug".to_owned());
        }
        if self.httpreq {
            directives.push("httpreq=debug".to_owned());
        }
        if self.httphdr {
            directives.push("httphdr=trace".to_owned());
        }
        if self.fuse {
            directives.push("fuse=debug".to_owned());
        }
        EnvFilter::new(directives.join(","))
    }
}

/// Tracing setup: categories, verbosity, optional output file.
#[derive(Debug, Default)]
pub struct Trc {
    categories: TraceCategories,
    verbose: bool,
    file: Option<PathBuf>,
}

impl Trc {
    pub fn with_categories(mut self, categories: TraceCategories) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn with_file(mut self, file: Option<PathBuf>) -> Self {
        self.file = file;
        self
    }

    /// Install the global subscriber. When `WEBDAVFS_LOG` is set it wins
    /// over the category selection.
    pub fn init(self) -> Result<(), TrcError> {
        let filter = EnvFilter::try_from_env("WEBDAVFS_LOG")
            .unwrap_or_else(|_| self.categories.filter(self.verbose));
        let timer = ChronoLocal::new(TIME_FORMAT.to_owned());

        match self.file {
            Some(path) => {
                let file = std::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)?;
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_timer(timer)
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .try_init()
                    .map_err(|e| TrcError::Init(e.to_string()))
            }
            None => tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_timer(timer)
                .try_init()
                .map_err(|e| TrcError::Init(e.to_string())),
        }
    }
}
