use clap::{ArgAction, Parser};

use crate::config::{log_level, parse_auth, parse_overrides, RunConfig, Settings};
use crate::error::ConfigError;

/// Run a throwaway Neo4j service in local Docker containers.
#[derive(Parser, Debug, Clone)]
#[command(name = "neodock", version)]
pub struct Cli {
    /// Bootstrap credentials; a missing password is generated
    #[arg(short, long, env = "NEO4J_AUTH", value_name = "USER:PASSWORD")]
    pub auth: Option<String>,

    /// Server setting for every member (repeatable)
    #[arg(short = 'C', long = "config", value_name = "NAME=VALUE")]
    pub config: Vec<String>,

    /// Container environment variable for every member (repeatable)
    #[arg(short, long = "env", value_name = "NAME=VALUE")]
    pub env: Vec<String>,

    /// Service and network name; an existing network is reused
    #[arg(short, long, value_name = "NETWORK_NAME")]
    pub name: Option<String>,

    /// Number of members; more than one forms a cluster
    #[arg(short, long, default_value_t = 1)]
    pub instances: usize,

    /// How many of the members are read replicas
    #[arg(short, long, default_value_t = 0)]
    pub read_replicas: usize,

    /// Seconds to wait for every member to become available
    #[arg(short, long, value_name = "SECS")]
    pub timeout: Option<u64>,

    /// More log detail (repeatable)
    #[arg(short, long, action = ArgAction::Count)]
    pub verbose: u8,

    /// Remove containers and network left behind by service --name, then exit
    #[arg(long, requires = "name")]
    pub cleanup: bool,

    /// Image tag (`4.0`, `neo4j:4.0-enterprise`) or `file:PATH` to a saved image
    #[arg(required_unless_present = "cleanup")]
    pub image: Option<String>,

    /// Command to run against the service instead of the console
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

impl Cli {
    pub fn from_args() -> Self {
        Cli::parse()
    }

    /// Validates everything that can be checked without touching Docker.
    pub fn into_run_config(self, mut settings: Settings) -> Result<RunConfig, ConfigError> {
        let image = self
            .image
            .ok_or_else(|| ConfigError::InvalidImage(String::new()))?;
        if let Some(secs) = self.timeout {
            settings.ready_timeout_secs = secs;
        }
        Ok(RunConfig {
            image,
            auth: parse_auth(self.auth.as_deref())?,
            config: parse_overrides(&self.config)?,
            env: parse_overrides(&self.env)?,
            network_name: self.name,
            instance_count: self.instances,
            read_replicas: self.read_replicas,
            log_level: log_level(self.verbose),
            command: self.command,
            settings,
        })
    }
}
