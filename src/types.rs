//! Data structures shared by the topology, spec builder and lifecycle
//! manager.
//!
//! Specs are built once per member and never mutated afterwards.  The
//! mutable part of a member (its engine id and state) lives in
//! [`ContainerRecord`], which only the lifecycle manager touches.  The
//! serde derives exist so the console can dump a member as JSON.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Container port the database serves Bolt on.
pub const BOLT_PORT: u16 = 7687;
/// Container port for plain HTTP.
pub const HTTP_PORT: u16 = 7474;
/// Container port for HTTPS.
pub const HTTPS_PORT: u16 = 7473;

/// A `HOST:PORT` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub host: String,
    pub port: u16,
}

impl Address {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn localhost(port: u16) -> Self {
        Self::new("localhost", port)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for Address {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| ConfigError::InvalidAddress(s.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidAddress(s.to_string()))?;
        let host = if host.is_empty() { "localhost" } else { host };
        Ok(Address::new(host, port))
    }
}

/// Bootstrap credentials for the service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Auth {
    pub user: String,
    pub password: String,
}

impl fmt::Display for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.user, self.password)
    }
}

/// What a member does inside the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Standalone,
    Core,
    ReadReplica,
}

impl Role {
    /// Value of the server's mode setting for this role.
    pub fn mode(&self) -> &'static str {
        match self {
            Role::Standalone => "SINGLE",
            Role::Core => "CORE",
            Role::ReadReplica => "READ_REPLICA",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Standalone => "standalone",
            Role::Core => "core",
            Role::ReadReplica => "read-replica",
        };
        f.write_str(name)
    }
}

/// Host ports published for one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberPorts {
    pub bolt: u16,
    pub http: u16,
    pub https: u16,
}

/// Whether the attachment network belongs to this service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NetworkOwnership {
    /// Created by us, removed on teardown.
    AutoCreated,
    /// Existed before we started, never removed.
    UserProvided,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkRef {
    pub name: String,
    pub ownership: NetworkOwnership,
}

/// Immutable launch description for one member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// `<member>.<service>`; used as container name and hostname.
    pub name: String,
    pub image: String,
    pub role: Role,
    pub ports: MemberPorts,
    pub env: BTreeMap<String, String>,
    pub config: BTreeMap<String, String>,
    pub network: String,
}

impl ContainerSpec {
    /// Environment handed to the engine. Config entries are translated to
    /// the image's env convention first; explicit env entries win.
    pub fn env_list(&self) -> Vec<String> {
        let mut merged: BTreeMap<String, String> = self
            .config
            .iter()
            .map(|(k, v)| (config_env_key(k), v.clone()))
            .collect();
        for (k, v) in &self.env {
            merged.insert(k.clone(), v.clone());
        }
        merged
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect()
    }

    /// (container port, host port) pairs to publish.
    pub fn port_bindings(&self) -> [(u16, u16); 3] {
        [
            (BOLT_PORT, self.ports.bolt),
            (HTTP_PORT, self.ports.http),
            (HTTPS_PORT, self.ports.https),
        ]
    }

    pub fn bolt_address(&self) -> Address {
        Address::localhost(self.ports.bolt)
    }

    pub fn http_address(&self) -> Address {
        Address::localhost(self.ports.http)
    }
}

/// `dbms.memory.pagecache.size` -> `NEO4J_dbms_memory_pagecache_size`, and
/// `dbms.tx_log.rotation` -> `NEO4J_dbms_tx__log_rotation`
pub fn config_env_key(key: &str) -> String {
    format!("NEO4J_{}", key.replace('_', "__").replace('.', "_"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerState {
    Created,
    Starting,
    Ready,
    Failed,
    Stopped,
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A provisioned member as tracked by the lifecycle manager.
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRecord {
    pub id: String,
    pub spec: ContainerSpec,
    pub state: ContainerState,
}
