//! Command execution as an impersonated user
//!
//! [`ShellOut`] prepares a command for the configured rbenv user: it
//! resolves that user's `USER`/`HOME`, layers the caller's `env` option on
//! top (caller wins on collisions) and hands the result to a
//! [`CommandRunner`]. The merged variables are applied to the child only;
//! the process environment is never touched.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};

use serde::Serialize;
use tracing::debug;

use crate::config::Config;
use crate::environment::{EnvironmentOverride, ImpersonationTarget};
use crate::error::{Error, Result};
use crate::user_db::{SystemUserDatabase, UserDatabase};

/// Options accepted by [`ShellOut::shell_out`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellOutOptions {
    /// Extra environment variables for the child
    pub env: BTreeMap<String, String>,
    /// Working directory of the child
    pub cwd: Option<PathBuf>,
    /// Run the child with this account's uid and gid
    pub user: Option<String>,
    /// Exit codes treated as success
    pub returns: Vec<i32>,
    /// Written to the child's stdin
    pub input: Option<String>,
}

impl Default for ShellOutOptions {
    fn default() -> Self {
        Self {
            env: BTreeMap::new(),
            cwd: None,
            user: None,
            returns: vec![0],
            input: None,
        }
    }
}

impl ShellOutOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }

    pub fn returns(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.returns = codes.into_iter().collect();
        self
    }

    pub fn input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }
}

/// A fully prepared command, ready for a [`CommandRunner`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandInvocation {
    pub program: String,
    pub args: Vec<String>,
    /// Options with `env` already merged
    pub options: ShellOutOptions,
}

impl CommandInvocation {
    /// Program and arguments joined with spaces, for messages
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What a finished command produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// Fail with `Error::CommandFailed` unless the exit code is in `returns`
    pub fn check(self, invocation: &CommandInvocation) -> Result<Self> {
        match self.exit_code {
            Some(code) if invocation.options.returns.contains(&code) => Ok(self),
            exit_code => Err(Error::CommandFailed {
                command: invocation.command_line(),
                exit_code,
                stderr: self.stderr,
            }),
        }
    }
}

/// The primitive that actually runs a prepared command
pub trait CommandRunner {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput>;
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        (**self).run(invocation)
    }
}

/// Runs commands with `std::process::Command`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandRunner<D = SystemUserDatabase> {
    users: D,
}

impl SystemCommandRunner {
    pub fn new() -> Self {
        Self {
            users: SystemUserDatabase,
        }
    }
}

impl<D: UserDatabase> SystemCommandRunner<D> {
    /// Use `users` to resolve the `user` option to a uid and gid
    pub fn with_user_database(users: D) -> Self {
        Self { users }
    }

    fn build(&self, invocation: &CommandInvocation) -> Result<Command> {
        let mut cmd = Command::new(&invocation.program);
        cmd.args(&invocation.args)
            .envs(&invocation.options.env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if invocation.options.input.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });

        if let Some(ref cwd) = invocation.options.cwd {
            cmd.current_dir(cwd);
        }

        if let Some(ref user) = invocation.options.user {
            self.run_as(&mut cmd, user)?;
        }

        Ok(cmd)
    }

    #[cfg(unix)]
    fn run_as(&self, cmd: &mut Command, user: &str) -> Result<()> {
        use std::os::unix::process::CommandExt;

        let record = self.users.lookup(user)?;
        cmd.uid(record.uid).gid(record.gid);
        Ok(())
    }

    #[cfg(not(unix))]
    fn run_as(&self, _cmd: &mut Command, _user: &str) -> Result<()> {
        Err(Error::Unsupported("running a command as another user"))
    }
}

impl<D: UserDatabase> CommandRunner for SystemCommandRunner<D> {
    fn run(&self, invocation: &CommandInvocation) -> Result<CommandOutput> {
        let command_line = invocation.command_line();
        let spawn_error = |source: io::Error| Error::Spawn {
            command: command_line.clone(),
            source,
        };

        let mut cmd = self.build(invocation)?;
        debug!(command = %command_line, cwd = ?invocation.options.cwd, "spawning");

        let mut child = cmd.spawn().map_err(spawn_error)?;

        // Feed stdin on its own thread while the output pipes are drained
        let writer = match (invocation.options.input.clone(), child.stdin.take()) {
            (Some(input), Some(stdin)) => {
                Some(std::thread::spawn(move || write_input(stdin, &input)))
            }
            _ => None,
        };
        let output = child.wait_with_output().map_err(spawn_error)?;
        if let Some(writer) = writer {
            let written = writer.join().unwrap_or_else(|_| {
                Err(io::Error::new(io::ErrorKind::Other, "stdin writer panicked"))
            });
            written.map_err(spawn_error)?;
        }

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Write `input` and close the pipe
///
/// A child that exits without reading all of its input is judged by its
/// exit status, so a broken pipe is not an error here.
fn write_input(mut stdin: ChildStdin, input: &str) -> io::Result<()> {
    match stdin.write_all(input.as_bytes()) {
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
            debug!("child closed stdin before reading all input");
            Ok(())
        }
        result => result,
    }
}

/// Runs commands with the rbenv user's environment merged in
#[derive(Debug, Clone)]
pub struct ShellOut<R = SystemCommandRunner, D = SystemUserDatabase> {
    rbenv_user: ImpersonationTarget,
    runner: R,
    users: D,
    config: Config,
}

impl ShellOut {
    /// System runner and user database, target from `Config::from_env`
    pub fn from_env() -> Self {
        let config = Config::from_env();
        Self::new(
            config.rbenv_user.clone(),
            SystemCommandRunner::new(),
            SystemUserDatabase,
        )
        .with_config(config)
    }
}

impl<R: CommandRunner, D: UserDatabase> ShellOut<R, D> {
    pub fn new(rbenv_user: Option<String>, runner: R, users: D) -> Self {
        Self {
            rbenv_user: rbenv_user.into(),
            runner,
            users,
            config: Config::default(),
        }
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Current impersonation target, if any
    pub fn rbenv_user(&self) -> Option<&str> {
        self.rbenv_user.username()
    }

    pub fn set_rbenv_user(&mut self, user: Option<&str>) {
        self.rbenv_user = ImpersonationTarget::from_option(user);
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn users(&self) -> &D {
        &self.users
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `{USER, HOME}` of the rbenv user, or empty without one
    pub fn shell_environment(&self) -> Result<EnvironmentOverride> {
        EnvironmentOverride::resolve(&self.rbenv_user, &self.users)
    }

    /// Merge the shell environment into `options` and split off the program
    pub fn prepare<S: AsRef<str>>(
        &self,
        command: &[S],
        options: Option<ShellOutOptions>,
    ) -> Result<CommandInvocation> {
        self.prepare_with(command, options, &EnvironmentOverride::new())
    }

    /// Like [`ShellOut::prepare`], with `ambient` as the lowest layer
    ///
    /// Layers, lowest first: `ambient`, the shell environment, the
    /// caller's `env` option.
    pub fn prepare_with<S: AsRef<str>>(
        &self,
        command: &[S],
        options: Option<ShellOutOptions>,
        ambient: &EnvironmentOverride,
    ) -> Result<CommandInvocation> {
        let (program, args) = command.split_first().ok_or(Error::EmptyCommand)?;
        let mut options = options.unwrap_or_default();

        let merged = ambient
            .merge(self.shell_environment()?)
            .merge(std::mem::take(&mut options.env));
        if self.config.debug {
            for (key, value) in &merged {
                debug!(key = %key, value = %value, "command environment");
            }
        }
        options.env = merged.into_inner();

        Ok(CommandInvocation {
            program: program.as_ref().to_string(),
            args: args.iter().map(|a| a.as_ref().to_string()).collect(),
            options,
        })
    }

    /// Run without checking the exit code
    pub fn run_command<S: AsRef<str>>(
        &self,
        command: &[S],
        options: Option<ShellOutOptions>,
    ) -> Result<CommandOutput> {
        let invocation = self.prepare(command, options)?;
        self.runner.run(&invocation)
    }

    /// Run and fail unless the exit code is one of `options.returns`
    pub fn shell_out<S: AsRef<str>>(
        &self,
        command: &[S],
        options: Option<ShellOutOptions>,
    ) -> Result<CommandOutput> {
        self.shell_out_with(command, options, &EnvironmentOverride::new())
    }

    /// [`ShellOut::shell_out`] on top of an ambient environment
    pub fn shell_out_with<S: AsRef<str>>(
        &self,
        command: &[S],
        options: Option<ShellOutOptions>,
        ambient: &EnvironmentOverride,
    ) -> Result<CommandOutput> {
        let invocation = self.prepare_with(command, options, ambient)?;
        self.runner.run(&invocation)?.check(&invocation)
    }
}
