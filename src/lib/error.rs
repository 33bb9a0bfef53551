//! Error types for rbenv-shellout

use std::io;

use thiserror::Error;

/// Errors raised while resolving users, running commands or draining steps
#[derive(Debug, Error)]
pub enum Error {
    /// The user database has no entry for this name
    #[error("user \"{0}\" does not exist in the user database")]
    UnknownUser(String),

    /// The user database itself could not be queried
    #[error("user database lookup for \"{username}\" failed: {source}")]
    UserLookup {
        username: String,
        #[source]
        source: io::Error,
    },

    #[error("no command given")]
    EmptyCommand,

    /// The process could not be started at all
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    /// The process ran but its exit status was not accepted
    #[error("`{command}` returned {}{}", describe_exit(.exit_code), describe_stderr(.stderr))]
    CommandFailed {
        command: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// A deferred provisioning step failed
    #[error("step \"{step}\" failed: {source}")]
    Step {
        step: String,
        #[source]
        source: Box<Error>,
    },

    #[error("{0} is not supported on this platform")]
    Unsupported(&'static str),
}

impl Error {
    /// True when the error means "no such user", whatever the cause
    pub fn is_user_lookup(&self) -> bool {
        matches!(self, Error::UnknownUser(_) | Error::UserLookup { .. })
    }
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {}", code),
        None => "no exit code (terminated by signal)".to_string(),
    }
}

fn describe_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!(": {}", trimmed)
    }
}
