//! Admin-users collaborator: the passwd file read by the administrative
//! interface.
//!
//! Pinned for compatibility: records are `username:crypted_password` lines in
//! `<base>/etc/passwd`, with the base taken from `MAXSCALE_HOME`. When the
//! file does not exist, a single default credential applies. Verifying a
//! password against the crypt(3) hash stays with the admin CLI collaborator.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::warn;

/// Credential implied by an absent passwd file
pub const DEFAULT_ADMIN_USER: &str = "admin";
pub const DEFAULT_ADMIN_PASSWORD: &str = "skysql";

const HOME_ENV: &str = "MAXSCALE_HOME";
const DEFAULT_HOME: &str = "/usr/local/skysql/MaxScale";

/// Location of the passwd file under the configured home directory
pub fn passwd_path() -> PathBuf {
    let home = std::env::var(HOME_ENV).unwrap_or_else(|_| DEFAULT_HOME.to_string());
    PathBuf::from(home).join("etc").join("passwd")
}

/// The administrative user table
#[derive(Debug, Clone)]
pub struct AdminUsers {
    users: HashMap<String, String>,
    default_credentials: bool,
}

impl AdminUsers {
    /// Load from the `MAXSCALE_HOME`-derived path
    pub fn load() -> std::io::Result<Self> {
        Self::from_path(passwd_path())
    }

    /// Load from an explicit path; an absent file yields the default
    /// credential table
    pub fn from_path(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        match std::fs::read_to_string(path.into()) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default_table()),
            Err(e) => Err(e),
        }
    }

    /// Parse newline-delimited `username:crypted_password` records
    pub fn parse(content: &str) -> Self {
        let mut users = HashMap::new();

        for line in content.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            match line.split_once(':') {
                Some((user, crypted)) if !user.is_empty() => {
                    users.insert(user.to_string(), crypted.to_string());
                }
                _ => warn!(record = %line, "Skipping malformed passwd record"),
            }
        }

        Self {
            users,
            default_credentials: false,
        }
    }

    fn default_table() -> Self {
        Self {
            users: HashMap::new(),
            default_credentials: true,
        }
    }

    /// The crypt(3) hash stored for a user, if any
    pub fn crypted_password(&self, user: &str) -> Option<&str> {
        self.users.get(user).map(String::as_str)
    }

    pub fn contains(&self, user: &str) -> bool {
        if self.default_credentials {
            user == DEFAULT_ADMIN_USER
        } else {
            self.users.contains_key(user)
        }
    }

    /// True when no passwd file existed and the default credential applies
    pub fn uses_default_credentials(&self) -> bool {
        self.default_credentials
    }

    pub fn len(&self) -> usize {
        if self.default_credentials {
            1
        } else {
            self.users.len()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
