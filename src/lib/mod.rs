//! rbenv-shellout library
//!
//! Runs provisioning commands as an rbenv user with that user's `USER` and
//! `HOME`, opens scoped HOME windows around deferred provisioning steps,
//! and formats display names for provisioning resources.

pub mod config;
pub mod environment;
pub mod error;
pub mod home_window;
pub mod resource_string;
pub mod shell_out;
pub mod step_queue;
pub mod user_db;

// Re-export commonly used items
pub use config::{normalize_user, Config, DEFAULT_HOME_PARENT, SYSTEM_USER};
pub use environment::{
    resolve_home_or_fallback, EnvironmentOverride, EnvironmentStore, ImpersonationTarget,
    MemoryEnvironment, ProcessEnvironment, HOME_VAR, OLD_HOME_VAR, USER_VAR,
};
pub use error::{Error, Result};
pub use home_window::{HomeGuard, ScopedHomeWindow};
pub use resource_string::{format_resource, RbenvResource, ResourceIdentity, GLOBAL_VERSION};
pub use shell_out::{
    CommandInvocation, CommandOutput, CommandRunner, ShellOut, ShellOutOptions,
    SystemCommandRunner,
};
pub use step_queue::{ProvisionContext, RunReport, Step, StepAction, StepQueue};
pub use user_db::{StaticUserDatabase, SystemUserDatabase, UserDatabase, UserRecord};
