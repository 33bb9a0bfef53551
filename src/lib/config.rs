//! Configuration from environment variables

use std::env;
use std::path::PathBuf;

/// Parent of the synthesized HOME used when a user cannot be looked up
pub const DEFAULT_HOME_PARENT: &str = "/home";

/// Name that stands for "no impersonation target"
pub const SYSTEM_USER: &str = "system";

/// Library configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Log merged environments key by key
    pub debug: bool,
    /// Parent directory for the fallback HOME (`<home_parent>/<user>`)
    pub home_parent: PathBuf,
    /// Default impersonation target
    pub rbenv_user: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            debug: false,
            home_parent: PathBuf::from(DEFAULT_HOME_PARENT),
            rbenv_user: None,
        }
    }
}

impl Config {
    /// Read `RBENV_SHELLOUT_DEBUG`, `RBENV_SHELLOUT_HOME_PARENT` and `RBENV_USER`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let home_parent = lookup("RBENV_SHELLOUT_HOME_PARENT")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_HOME_PARENT));

        Self {
            debug: lookup("RBENV_SHELLOUT_DEBUG").is_some_and(|v| is_truthy(&v)),
            home_parent,
            rbenv_user: normalize_user(lookup("RBENV_USER").as_deref()),
        }
    }

    /// Synthesized home directory for a user missing from the user database
    pub fn fallback_home(&self, username: &str) -> PathBuf {
        self.home_parent.join(username)
    }
}

/// Map `None`, `""` and `system` to no target; any other name is kept as given
pub fn normalize_user(user: Option<&str>) -> Option<String> {
    match user {
        None | Some("") | Some(SYSTEM_USER) => None,
        Some(u) => Some(u.to_string()),
    }
}

fn is_truthy(value: &str) -> bool {
    value == "1" || value == "true"
}
