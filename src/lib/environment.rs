//! Environment resolution for an impersonated user
//!
//! Builds the `USER`/`HOME` overrides a command needs to run as another
//! account, and abstracts where environment variables are read from and
//! written to so callers can thread an explicit context instead of touching
//! the process environment.

use std::cell::RefCell;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{normalize_user, Config};
use crate::error::Result;
use crate::user_db::UserDatabase;

pub const USER_VAR: &str = "USER";
pub const HOME_VAR: &str = "HOME";
/// Slot holding the pre-window HOME while a HOME window is open
pub const OLD_HOME_VAR: &str = "OLD_HOME";

/// The account a command or provisioning window should assume
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ImpersonationTarget(Option<String>);

impl ImpersonationTarget {
    /// No impersonation; run as the current (system) user
    pub fn system() -> Self {
        Self(None)
    }

    pub fn user(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self::from_option(Some(&name))
    }

    /// `None`, `""` and `"system"` all mean no target
    pub fn from_option(user: Option<&str>) -> Self {
        Self(normalize_user(user))
    }

    pub fn username(&self) -> Option<&str> {
        self.0.as_deref()
    }

    pub fn is_system(&self) -> bool {
        self.0.is_none()
    }
}

impl From<Option<String>> for ImpersonationTarget {
    fn from(user: Option<String>) -> Self {
        Self::from_option(user.as_deref())
    }
}

impl From<&str> for ImpersonationTarget {
    fn from(user: &str) -> Self {
        Self::from_option(Some(user))
    }
}

/// Environment variables to overlay on a command's environment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct EnvironmentOverride(BTreeMap<String, String>);

impl EnvironmentOverride {
    pub fn new() -> Self {
        Self::default()
    }

    /// `{USER, HOME}` for a target user, empty for no target
    ///
    /// An unknown user is an error here; see [`resolve_home_or_fallback`]
    /// for the lenient variant.
    pub fn resolve<D>(target: &ImpersonationTarget, users: &D) -> Result<Self>
    where
        D: UserDatabase + ?Sized,
    {
        let mut vars = BTreeMap::new();
        if let Some(username) = target.username() {
            let home = users.home_dir(username)?;
            vars.insert(USER_VAR.to_string(), username.to_string());
            vars.insert(HOME_VAR.to_string(), home.to_string_lossy().into_owned());
        }
        debug!(target_user = ?target.username(), vars = vars.len(), "resolved shell environment");
        Ok(Self(vars))
    }

    /// Layer `overlay` on top of `self`; overlay values win on collision
    pub fn merge<I, K, V>(&self, overlay: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged = self.0.clone();
        for (key, value) in overlay {
            merged.insert(key.into(), value.into());
        }
        Self(merged)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> BTreeMap<String, String> {
        self.0
    }
}

impl<'a> IntoIterator for &'a EnvironmentOverride {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl IntoIterator for EnvironmentOverride {
    type Item = (String, String);
    type IntoIter = btree_map::IntoIter<String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

impl FromIterator<(String, String)> for EnvironmentOverride {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Home directory of `username`, or `<home_parent>/<username>` if the lookup fails
pub fn resolve_home_or_fallback<D>(username: &str, users: &D, config: &Config) -> PathBuf
where
    D: UserDatabase + ?Sized,
{
    match users.home_dir(username) {
        Ok(home) => home,
        Err(e) => {
            let fallback = config.fallback_home(username);
            warn!(
                user = username,
                error = %e,
                fallback = %fallback.display(),
                "user lookup failed, using synthesized home"
            );
            fallback
        }
    }
}

/// A place environment variables live
pub trait EnvironmentStore {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn remove(&self, key: &str);

    /// Set `key` to `value`, or remove it when `value` is `None`
    fn put(&self, key: &str, value: Option<&str>) {
        match value {
            Some(v) => self.set(key, v),
            None => self.remove(key),
        }
    }
}

impl<T: EnvironmentStore + ?Sized> EnvironmentStore for &T {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }
}

impl<T: EnvironmentStore + ?Sized> EnvironmentStore for std::sync::Arc<T> {
    fn get(&self, key: &str) -> Option<String> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) {
        (**self).remove(key)
    }
}

/// The real, process-wide environment
///
/// Mutations are visible to every thread in the process. Nothing here
/// synchronizes them.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl EnvironmentStore for ProcessEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        env::var(key).ok()
    }

    fn set(&self, key: &str, value: &str) {
        env::set_var(key, value);
    }

    fn remove(&self, key: &str) {
        env::remove_var(key);
    }
}

/// An environment held as a plain value
#[derive(Debug, Default, Clone)]
pub struct MemoryEnvironment {
    vars: RefCell<BTreeMap<String, String>>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current process environment (non-UTF-8 entries skipped)
    pub fn snapshot() -> Self {
        env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect()
    }

    pub fn with_var(self, key: &str, value: &str) -> Self {
        self.set(key, value);
        self
    }

    pub fn vars(&self) -> BTreeMap<String, String> {
        self.vars.borrow().clone()
    }
}

impl FromIterator<(String, String)> for MemoryEnvironment {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self {
            vars: RefCell::new(iter.into_iter().collect()),
        }
    }
}

impl EnvironmentStore for MemoryEnvironment {
    fn get(&self, key: &str) -> Option<String> {
        self.vars.borrow().get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) {
        self.vars
            .borrow_mut()
            .insert(key.to_string(), value.to_string());
    }

    fn remove(&self, key: &str) {
        self.vars.borrow_mut().remove(key);
    }
}
