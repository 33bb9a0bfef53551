//! Display names for rbenv provisioning resources
//!
//! Resources render as `Kind[version::name] (user)`, with `global` standing
//! in for a missing version and `system` for a missing user.

use std::fmt;

use serde::Serialize;

use crate::config::SYSTEM_USER;

/// Shown in place of a missing version
pub const GLOBAL_VERSION: &str = "global";

/// Identity of a resource, as shown in logs and reports
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ResourceIdentity {
    pub kind: String,
    pub version: Option<String>,
    pub name: String,
    pub user: Option<String>,
}

impl ResourceIdentity {
    pub fn new(
        kind: impl Into<String>,
        version: Option<&str>,
        name: impl Into<String>,
        user: Option<&str>,
    ) -> Self {
        Self {
            kind: kind.into(),
            version: version.map(String::from),
            name: name.into(),
            user: user.map(String::from),
        }
    }

    pub fn version_or_global(&self) -> &str {
        self.version.as_deref().unwrap_or(GLOBAL_VERSION)
    }

    pub fn user_or_system(&self) -> &str {
        self.user.as_deref().unwrap_or(SYSTEM_USER)
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": self.kind,
            "version": self.version_or_global(),
            "name": self.name,
            "user": self.user_or_system(),
            "display": self.to_string(),
        })
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}::{}] ({})",
            self.kind,
            self.version_or_global(),
            self.name,
            self.user_or_system()
        )
    }
}

/// `Kind[version::name] (user)`
pub fn format_resource(kind: &str, version: Option<&str>, name: &str, user: Option<&str>) -> String {
    ResourceIdentity::new(kind, version, name, user).to_string()
}

/// A provisioning resource that can name itself
pub trait RbenvResource {
    /// Resource kind, e.g. `rbenv_ruby`
    fn resource_name(&self) -> &str;
    fn rbenv_version(&self) -> Option<&str>;
    fn name(&self) -> &str;
    fn user(&self) -> Option<&str>;

    fn identity(&self) -> ResourceIdentity {
        ResourceIdentity::new(
            self.resource_name(),
            self.rbenv_version(),
            self.name(),
            self.user(),
        )
    }

    fn to_resource_string(&self) -> String {
        self.identity().to_string()
    }
}
