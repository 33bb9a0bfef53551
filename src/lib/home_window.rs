//! Scoped HOME override
//!
//! Some tools (git in particular) misbehave when `HOME` does not point at
//! the account they run as. A [`HomeGuard`] points `HOME` at a target
//! user's home directory and puts the previous value back when it is
//! restored or dropped, whichever comes first.
//!
//! While a window is open the previous `HOME` is also kept in `OLD_HOME`.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::config::Config;
use crate::environment::{resolve_home_or_fallback, EnvironmentStore, HOME_VAR, OLD_HOME_VAR};
use crate::user_db::UserDatabase;

/// State captured when a HOME window opens
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScopedHomeWindow {
    /// HOME before the window opened, `None` if it was unset
    pub previous_home: Option<String>,
    /// OLD_HOME before the window opened
    pub previous_old_home: Option<String>,
    pub user: String,
    /// Correlates the set and restore steps of one window
    pub token: String,
    /// HOME while the window is open
    pub home: PathBuf,
}

/// Keeps HOME pointed at a user's home directory until restored or dropped
#[must_use = "HOME is restored as soon as the guard is dropped"]
pub struct HomeGuard<'a> {
    env: &'a dyn EnvironmentStore,
    window: ScopedHomeWindow,
    restored: bool,
}

impl<'a> HomeGuard<'a> {
    /// Open a window for `username`
    ///
    /// Unknown users do not fail: HOME falls back to
    /// `<config.home_parent>/<username>`.
    pub fn acquire<D>(
        env: &'a dyn EnvironmentStore,
        username: &str,
        users: &D,
        config: &Config,
        token: impl Into<String>,
    ) -> Self
    where
        D: UserDatabase + ?Sized,
    {
        let home = resolve_home_or_fallback(username, users, config);
        Self::acquire_at(env, username, &home, token)
    }

    /// Open a window for `username` with an already-resolved home directory
    pub fn acquire_at(
        env: &'a dyn EnvironmentStore,
        username: &str,
        home: &Path,
        token: impl Into<String>,
    ) -> Self {
        let previous_home = env.get(HOME_VAR);
        let previous_old_home = env.get(OLD_HOME_VAR);

        env.put(OLD_HOME_VAR, previous_home.as_deref());
        env.set(HOME_VAR, &home.to_string_lossy());

        let window = ScopedHomeWindow {
            previous_home,
            previous_old_home,
            user: username.to_string(),
            token: token.into(),
            home: home.to_path_buf(),
        };
        info!(
            user = %window.user,
            token = %window.token,
            home = %window.home.display(),
            "set HOME"
        );

        Self {
            env,
            window,
            restored: false,
        }
    }

    /// Run `f` with HOME set for `username`, restoring it on every exit path
    pub fn with_home<D, F, T>(
        env: &'a dyn EnvironmentStore,
        username: &str,
        users: &D,
        config: &Config,
        f: F,
    ) -> T
    where
        D: UserDatabase + ?Sized,
        F: FnOnce(&ScopedHomeWindow) -> T,
    {
        let token = chrono::Utc::now().timestamp().to_string();
        let guard = Self::acquire(env, username, users, config, token);
        f(guard.window())
    }

    pub fn window(&self) -> &ScopedHomeWindow {
        &self.window
    }

    pub fn token(&self) -> &str {
        &self.window.token
    }

    pub fn is_restored(&self) -> bool {
        self.restored
    }

    /// Put HOME and OLD_HOME back; later calls and the drop are no-ops
    pub fn restore(&mut self) -> bool {
        if self.restored {
            return false;
        }
        self.restored = true;

        self.env
            .put(HOME_VAR, self.window.previous_home.as_deref());
        self.env
            .put(OLD_HOME_VAR, self.window.previous_old_home.as_deref());
        info!(user = %self.window.user, token = %self.window.token, "restored HOME");
        true
    }
}

impl std::fmt::Debug for HomeGuard<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeGuard")
            .field("window", &self.window)
            .field("restored", &self.restored)
            .finish()
    }
}

impl Drop for HomeGuard<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}
