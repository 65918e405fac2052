//! # Instance Connection Group
//!
//! A tagged set of identical connections to one instance. Groups are plain
//! configuration: built once, never mutated by the pool.

use serde::{Deserialize, Serialize};

use crate::error::{ClientError, ClientResult};

/// Default user for unauthenticated sessions.
pub const GUEST_USER: &str = "guest";

/// Immutable descriptor of one instance and the connections kept to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConnectionGroup {
    /// Logical name used for tag-scoped selection and in diagnostics.
    pub tag: String,
    pub host: String,
    pub port: u16,
    /// Number of connections the pool keeps for this group.
    #[serde(default = "default_size")]
    pub size: usize,
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default)]
    pub password: String,
}

fn default_size() -> usize {
    1
}

fn default_user() -> String {
    GUEST_USER.to_string()
}

impl InstanceConnectionGroup {
    /// Creates a single-connection guest group.
    pub fn new(tag: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        InstanceConnectionGroup {
            tag: tag.into(),
            host: host.into(),
            port,
            size: default_size(),
            user: default_user(),
            password: String::new(),
        }
    }

    /// Parses `host:port` into a group.
    pub fn from_addr(tag: impl Into<String>, addr: &str) -> ClientResult<Self> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| ClientError::InvalidAddress(addr.to_string()))?;
        let port = port
            .parse()
            .map_err(|_| ClientError::InvalidAddress(addr.to_string()))?;
        Ok(InstanceConnectionGroup::new(tag, host, port))
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = user.into();
        self.password = password.into();
        self
    }

    /// `host:port` string used for connecting.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Guest with an empty password never sends `AUTH`.
    pub fn needs_auth(&self) -> bool {
        !(self.user == GUEST_USER && self.password.is_empty())
    }
}
