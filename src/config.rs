use std::collections::BTreeMap;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::types::Auth;

/// Tunables that rarely change between runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    pub ready_timeout_secs: u64,
    pub poll_interval_ms: u64,
    pub stop_timeout_secs: i64,
    pub bolt_port: u16,
    pub http_port: u16,
    pub https_port: u16,
    /// Distance between the host ports of consecutive members.
    pub port_stride: u16,
    pub discovery_port: u16,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ready_timeout_secs: 120,
            poll_interval_ms: 500,
            stop_timeout_secs: 10,
            bolt_port: 7687,
            http_port: 7474,
            https_port: 7473,
            port_stride: 100,
            discovery_port: 5000,
        }
    }
}

impl Settings {
    pub fn load() -> anyhow::Result<Self> {
        Self::figment()
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Settings::default()))
            .merge(Toml::file("neodock.toml"))
            .merge(Json::file("neodock.json"))
            .merge(Env::prefixed("NEODOCK_"))
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Validated `NAME=VALUE` overrides. A later duplicate name wins.
pub type Overrides = BTreeMap<String, String>;

/// Splits each item at the first `=`. An item without one is rejected.
pub fn parse_overrides<I, S>(items: I) -> Result<Overrides, ConfigError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut parsed = Overrides::new();
    for item in items {
        let item = item.as_ref();
        match item.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                parsed.insert(name.trim().to_string(), value.to_string());
            }
            _ => return Err(ConfigError::MalformedOverride(item.to_string())),
        }
    }
    Ok(parsed)
}

/// Parses `user:password`. Either half may be empty: the user defaults to
/// `neo4j` and the password to a random hex string.
pub fn parse_auth(value: Option<&str>) -> Result<Auth, ConfigError> {
    let value = value.unwrap_or_default();
    let (user, password) = value.split_once(':').unwrap_or((value, ""));
    let user = if user.is_empty() { "neo4j" } else { user };
    if user != "neo4j" {
        return Err(ConfigError::InvalidAuth(value.to_string()));
    }
    let password = if password.is_empty() {
        uuid::Uuid::new_v4().simple().to_string()
    } else {
        password.to_string()
    };
    Ok(Auth {
        user: user.to_string(),
        password,
    })
}

pub fn log_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Everything one run needs, built once from the command line and settings.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub image: String,
    pub auth: Auth,
    pub config: Overrides,
    pub env: Overrides,
    pub network_name: Option<String>,
    pub instance_count: usize,
    pub read_replicas: usize,
    pub log_level: LevelFilter,
    pub command: Vec<String>,
    pub settings: Settings,
}
