//! The `-o` mount option model.
//!
//! A comma-separated option string is parsed into a typed struct; derived
//! values (permission modes, the effective `default_permissions` state)
//! are computed here so the rest of the program never re-reads raw
//! options. Credentials are held in [`SecretString`] and only exposed at
//! the point the HTTP client is constructed.

use secrecy::{ExposeSecret as _, SecretString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MountOptionError {
    #[error("{0}: unknown option")]
    Unknown(String),

    #[error("{name}: invalid value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("option '{0}' requires root privileges")]
    NeedsPrivilege(&'static str),
}

/// Recognised mount options.
#[derive(Debug, Clone)]
pub struct MountOptions {
    pub allow_root: bool,
    pub allow_other: bool,
    pub default_permissions: bool,
    pub no_default_permissions: bool,
    pub read_only: bool,
    pub read_write: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub mode: Option<u32>,
    pub async_read: bool,
    pub nonempty: bool,
    pub username: Option<String>,
    pub password: Option<SecretString>,
    pub cookie: Option<SecretString>,
    pub max_conns: u32,
    pub max_idle_conns: u32,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            allow_root: false,
            allow_other: false,
            default_permissions: false,
            no_default_permissions: false,
            read_only: false,
            read_write: false,
            uid: None,
            gid: None,
            mode: None,
            async_read: false,
            nonempty: false,
            username: None,
            password: None,
            cookie: None,
            max_conns: 8,
            max_idle_conns: 8,
        }
    }
}

fn parse_u32(name: &'static str, value: &str, radix: u32) -> Result<u32, MountOptionError> {
    u32::from_str_radix(value, radix).map_err(|_| MountOptionError::Invalid {
        name,
        value: value.to_owned(),
    })
}

impl MountOptions {
    /// Parse a comma-separated `-o` option list. Unknown options are fatal
    /// unless `sloppy` (mount(8) passes `-s` when the fstab says so).
    pub fn parse(options: &str, sloppy: bool) -> Result<Self, MountOptionError> {
        let mut parsed = Self::default();
        if options.is_empty() {
            return Ok(parsed);
        }

        for option in options.split(',') {
            let (key, value) = match option.split_once('=') {
                Some((k, v)) => (k, v),
                None => (option, ""),
            };
            match key {
                "allow_root" => parsed.allow_root = true,
                "allow_other" => parsed.allow_other = true,
                "default_permissions" => parsed.default_permissions = true,
                "no_default_permissions" => parsed.no_default_permissions = true,
                "ro" => parsed.read_only = true,
                "rw" => parsed.read_write = true,
                "uid" => parsed.uid = Some(parse_u32("uid", value, 10)?),
                "gid" => parsed.gid = Some(parse_u32("gid", value, 10)?),
                "mode" => parsed.mode = Some(parse_u32("mode", value, 8)?),
                "async_read" => parsed.async_read = true,
                "nonempty" => parsed.nonempty = true,
                "username" => parsed.username = Some(value.to_owned()),
                "password" => parsed.password = Some(SecretString::from(value.to_owned())),
                "cookie" => parsed.cookie = Some(SecretString::from(value.to_owned())),
                "maxconns" => parsed.max_conns = parse_u32("maxconns", value, 10)?,
                "maxidleconns" => parsed.max_idle_conns = parse_u32("maxidleconns", value, 10)?,
                unknown => {
                    if !sloppy {
                        return Err(MountOptionError::Unknown(unknown.to_owned()));
                    }
                }
            }
        }
        Ok(parsed)
    }

    /// uid/gid overrides are only honoured for the owner themselves or for
    /// root.
    pub fn check_privilege(&self) -> Result<(), MountOptionError> {
        let privileged = nix::unistd::Uid::effective().is_root();
        if let Some(uid) = self.uid {
            if uid != nix::unistd::Uid::current().as_raw() && !privileged {
                return Err(MountOptionError::NeedsPrivilege("uid"));
            }
        }
        if let Some(gid) = self.gid {
            if gid != nix::unistd::Gid::current().as_raw() && !privileged {
                return Err(MountOptionError::NeedsPrivilege("gid"));
            }
        }
        Ok(())
    }

    fn base_mode(&self) -> u32 {
        if let Some(mode) = self.mode {
            return mode & 0o777;
        }
        if self.allow_other {
            if self.no_default_permissions {
                0o777
            } else {
                0o755
            }
        } else {
            0o700
        }
    }

    /// Mode reported for files: the base mode with execute bits cleared.
    pub fn file_mode(&self) -> u32 {
        self.base_mode() & !0o111
    }

    /// Mode reported for directories: the file mode with execute bits
    /// mirrored from the read bits.
    pub fn dir_mode(&self) -> u32 {
        let mode = self.file_mode();
        let mut out = mode;
        if mode & 0o400 != 0 {
            out |= 0o100;
        }
        if mode & 0o040 != 0 {
            out |= 0o010;
        }
        if mode & 0o004 != 0 {
            out |= 0o001;
        }
        out
    }

    /// `allow_other` switches `default_permissions` on, unless explicitly
    /// suppressed.
    pub fn effective_default_permissions(&self) -> bool {
        self.default_permissions || (self.allow_other && !self.no_default_permissions)
    }

    /// The uid reported for every entry.
    pub fn effective_uid(&self) -> u32 {
        self.uid
            .unwrap_or_else(|| nix::unistd::Uid::current().as_raw())
    }

    /// The gid reported for every entry.
    pub fn effective_gid(&self) -> u32 {
        self.gid
            .unwrap_or_else(|| nix::unistd::Gid::current().as_raw())
    }

    /// Password as a plain string, for client construction only.
    pub fn password_value(&self) -> Option<String> {
        self.password
            .as_ref()
            .map(|p| p.expose_secret().to_owned())
    }

    /// Cookie as a plain string, for client construction only.
    pub fn cookie_value(&self) -> Option<String> {
        self.cookie.as_ref().map(|c| c.expose_secret().to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_option_set() {
        let opts = MountOptions::parse(
            "allow_other,ro,uid=1000,gid=100,mode=0750,username=alice,password=s3cret,\
             cookie=session=xyz,maxconns=4,maxidleconns=2,async_read,nonempty",
            false,
        )
        .unwrap();
        assert!(opts.allow_other);
        assert!(opts.read_only);
        assert_eq!(opts.uid, Some(1000));
        assert_eq!(opts.gid, Some(100));
        assert_eq!(opts.mode, Some(0o750));
        assert_eq!(opts.username.as_deref(), Some("alice"));
        assert_eq!(opts.password_value().as_deref(), Some("s3cret"));
        assert_eq!(opts.cookie_value().as_deref(), Some("session=xyz"));
        assert_eq!(opts.max_conns, 4);
        assert_eq!(opts.max_idle_conns, 2);
        assert!(opts.async_read);
        assert!(opts.nonempty);
    }

    #[test]
    fn unknown_options_are_fatal_unless_sloppy() {
        assert!(matches!(
            MountOptions::parse("frobnicate", false),
            Err(MountOptionError::Unknown(o)) if o == "frobnicate"
        ));
        assert!(MountOptions::parse("frobnicate,ro", true).unwrap().read_only);
    }

    #[test]
    fn mode_is_octal() {
        let opts = MountOptions::parse("mode=644", false).unwrap();
        assert_eq!(opts.mode, Some(0o644));
        assert!(MountOptions::parse("mode=9z9", false).is_err());
    }

    #[test]
    fn connection_defaults() {
        let opts = MountOptions::parse("", false).unwrap();
        assert_eq!(opts.max_conns, 8);
        assert_eq!(opts.max_idle_conns, 8);
    }

    #[test]
    fn file_mode_clears_execute_bits() {
        let opts = MountOptions::parse("mode=0755", false).unwrap();
        assert_eq!(opts.file_mode(), 0o644);
    }

    #[test]
    fn dir_mode_mirrors_read_into_execute() {
        let opts = MountOptions::parse("mode=0640", false).unwrap();
        assert_eq!(opts.file_mode(), 0o640);
        assert_eq!(opts.dir_mode(), 0o750);
    }

    #[test]
    fn allow_other_picks_default_modes() {
        let opts = MountOptions::parse("allow_other", false).unwrap();
        assert_eq!(opts.file_mode(), 0o644);
        assert_eq!(opts.dir_mode(), 0o755);
        assert!(opts.effective_default_permissions());

        let opts = MountOptions::parse("allow_other,no_default_permissions", false).unwrap();
        assert_eq!(opts.file_mode(), 0o666);
        assert_eq!(opts.dir_mode(), 0o777);
        assert!(!opts.effective_default_permissions());

        let opts = MountOptions::parse("", false).unwrap();
        assert_eq!(opts.file_mode(), 0o600);
        assert_eq!(opts.dir_mode(), 0o700);
    }
}
