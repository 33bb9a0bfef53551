//! Deferred provisioning steps
//!
//! Steps are registered by name and run later, strictly in registration
//! order. [`StepQueue::with_home_for_user`] brackets the steps a caller
//! registers with a pair of steps that open and close a HOME window.
//!
//! Every window opened while draining the queue is closed again, whether
//! the run finishes, a step returns an error, or a step panics.

use std::collections::VecDeque;
use std::fmt;

use tracing::{debug, warn};

use crate::config::Config;
use crate::environment::{EnvironmentOverride, EnvironmentStore, HOME_VAR};
use crate::error::{Error, Result};
use crate::home_window::{HomeGuard, ScopedHomeWindow};
use crate::shell_out::{CommandOutput, CommandRunner, ShellOut, ShellOutOptions};
use crate::user_db::UserDatabase;

/// Body of a deferred step
pub type StepAction = Box<dyn FnOnce(&mut ProvisionContext<'_>) -> Result<()>>;

/// A named unit of deferred work
pub struct Step {
    name: String,
    action: StepAction,
}

impl Step {
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step").field("name", &self.name).finish()
    }
}

/// What a completed run did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Names of the steps that ran, in order
    pub executed: Vec<String>,
    /// Windows still open after the last step, closed by the run itself
    pub unwound: Vec<ScopedHomeWindow>,
}

/// State shared by the steps of one run
pub struct ProvisionContext<'a> {
    env: &'a dyn EnvironmentStore,
    users: &'a dyn UserDatabase,
    config: Config,
    windows: Vec<HomeGuard<'a>>,
}

impl<'a> ProvisionContext<'a> {
    pub fn new(env: &'a dyn EnvironmentStore, users: &'a dyn UserDatabase) -> Self {
        Self {
            env,
            users,
            config: Config::default(),
            windows: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn env(&self) -> &'a dyn EnvironmentStore {
        self.env
    }

    pub fn users(&self) -> &'a dyn UserDatabase {
        self.users
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Point HOME at `username`'s home directory until the matching close
    pub fn open_window(&mut self, username: &str, token: &str) -> &ScopedHomeWindow {
        let guard = HomeGuard::acquire(self.env, username, self.users, &self.config, token);
        self.windows.push(guard);
        let last = self.windows.len() - 1;
        self.windows[last].window()
    }

    /// Close the window opened with `token`; false if no such window is open
    ///
    /// Windows opened after it are closed first, innermost first, so HOME
    /// ends up at the value it had before `token` was opened.
    pub fn close_window(&mut self, token: &str) -> bool {
        match self.windows.iter().rposition(|g| g.token() == token) {
            Some(pos) => {
                for mut inner in self.windows.split_off(pos + 1).into_iter().rev() {
                    warn!(
                        user = %inner.window().user,
                        token = %inner.token(),
                        closing = token,
                        "closing a nested HOME window early"
                    );
                    inner.restore();
                }
                match self.windows.pop() {
                    Some(mut guard) => guard.restore(),
                    None => false,
                }
            }
            None => {
                warn!(token, "no open HOME window to close");
                false
            }
        }
    }

    /// Currently open windows, outermost first
    pub fn open_windows(&self) -> Vec<&ScopedHomeWindow> {
        self.windows.iter().map(HomeGuard::window).collect()
    }

    /// Close every open window, innermost first
    pub fn unwind(&mut self) -> Vec<ScopedHomeWindow> {
        let mut closed = Vec::with_capacity(self.windows.len());
        while let Some(mut guard) = self.windows.pop() {
            warn!(
                user = %guard.window().user,
                token = %guard.token(),
                "restoring HOME for a window left open"
            );
            guard.restore();
            closed.push(guard.window().clone());
        }
        closed
    }

    /// Variables a command inherits from the open windows
    pub fn ambient_environment(&self) -> EnvironmentOverride {
        let mut vars = EnvironmentOverride::new();
        if let Some(guard) = self.windows.last() {
            vars.insert(HOME_VAR, guard.window().home.to_string_lossy());
        }
        vars
    }

    /// `ShellOut::shell_out` with the innermost window's HOME underneath
    ///
    /// The rbenv user's environment and the caller's `env` still take
    /// precedence over the window.
    pub fn shell_out<R, D, S>(
        &self,
        shell: &ShellOut<R, D>,
        command: &[S],
        options: Option<ShellOutOptions>,
    ) -> Result<CommandOutput>
    where
        R: CommandRunner,
        D: UserDatabase,
        S: AsRef<str>,
    {
        shell.shell_out_with(command, options, &self.ambient_environment())
    }
}

impl fmt::Debug for ProvisionContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProvisionContext")
            .field("config", &self.config)
            .field("windows", &self.open_windows())
            .finish()
    }
}

impl Drop for ProvisionContext<'_> {
    fn drop(&mut self) {
        self.unwind();
    }
}

/// FIFO queue of deferred steps
#[derive(Debug, Default)]
pub struct StepQueue {
    steps: VecDeque<Step>,
    windows: u64,
}

impl StepQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step to run after every step registered before it
    pub fn enqueue<F>(&mut self, name: impl Into<String>, action: F) -> &mut Self
    where
        F: FnOnce(&mut ProvisionContext<'_>) -> Result<()> + 'static,
    {
        let name = name.into();
        if self.contains(&name) {
            warn!(step = %name, "a step with this name is already queued");
        }
        debug!(step = %name, "queued");
        self.steps.push_back(Step {
            name,
            action: Box::new(action),
        });
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.steps.iter().any(|s| s.name == name)
    }

    /// Names of the queued steps, in run order
    pub fn names(&self) -> Vec<&str> {
        self.steps.iter().map(Step::name).collect()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Token for the next HOME window: Unix seconds plus a per-queue sequence
    fn next_window_token(&mut self) -> String {
        let token = format!("{}.{}", chrono::Utc::now().timestamp(), self.windows);
        self.windows += 1;
        token
    }

    /// Bracket the steps `block` registers with a HOME window for `username`
    ///
    /// Queues `set HOME for <user> at <token>`, then whatever `block`
    /// queues, then `unset HOME for <user> <token>`. Nothing runs until
    /// [`StepQueue::run`].
    pub fn with_home_for_user<F, T>(&mut self, username: &str, block: F) -> T
    where
        F: FnOnce(&mut StepQueue) -> T,
    {
        let token = self.next_window_token();

        let (user, open_token) = (username.to_string(), token.clone());
        self.enqueue(
            format!("set HOME for {} at {}", username, token),
            move |ctx| {
                ctx.open_window(&user, &open_token);
                Ok(())
            },
        );

        let result = block(self);

        self.enqueue(
            format!("unset HOME for {} {}", username, token),
            move |ctx| {
                ctx.close_window(&token);
                Ok(())
            },
        );

        result
    }

    /// Run queued steps in order until the queue is empty or a step fails
    ///
    /// On failure every open window is closed and the remaining steps are
    /// discarded before the error is returned. Those steps may belong to a
    /// window whose opening step already ran, so a failed queue cannot be
    /// resumed. A panicking step discards them too.
    pub fn run(&mut self, ctx: &mut ProvisionContext<'_>) -> Result<RunReport> {
        let mut report = RunReport::default();
        let mut pending = ClearOnPanic(&mut self.steps);

        while let Some(step) = pending.0.pop_front() {
            debug!(step = %step.name, "running step");
            let Step { name, action } = step;
            if let Err(source) = action(&mut *ctx) {
                let restored = ctx.unwind();
                let skipped: Vec<String> = pending.0.drain(..).map(|s| s.name).collect();
                warn!(
                    step = %name,
                    error = %source,
                    windows_restored = restored.len(),
                    skipped = ?skipped,
                    "step failed"
                );
                return Err(Error::Step {
                    step: name,
                    source: Box::new(source),
                });
            }
            report.executed.push(name);
        }

        report.unwound = ctx.unwind();
        Ok(report)
    }
}

/// Empties the borrowed queue if dropped during a panic
struct ClearOnPanic<'q>(&'q mut VecDeque<Step>);

impl Drop for ClearOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.clear();
        }
    }
}
