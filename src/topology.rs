//! Service topology: how many members, what each one does, and how they
//! find each other.
//!
//! All cluster discovery information is decided here, before any container
//! exists, so every member can be handed the full peer list at creation.

use std::collections::BTreeMap;

use crate::config::{Overrides, Settings};
use crate::error::ConfigError;
use crate::types::{config_env_key, Address, MemberPorts, Role};

/// Settings the topology computes per member. Users may not override them.
pub const RESERVED_CONFIG_KEYS: &[&str] = &[
    "dbms.mode",
    "dbms.default_advertised_address",
    "dbms.connector.bolt.advertised_address",
    "dbms.connector.http.advertised_address",
    "causal_clustering.discovery_advertised_address",
    "causal_clustering.initial_discovery_members",
    "causal_clustering.minimum_core_cluster_size_at_formation",
];

/// Env values derived from the credentials.
pub const RESERVED_ENV_KEYS: &[&str] = &["NEO4J_AUTH"];

#[derive(Debug, Clone)]
pub struct TopologyRequest {
    pub service_name: String,
    pub instance_count: usize,
    pub read_replicas: usize,
    pub config: Overrides,
    pub env: Overrides,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub index: usize,
    /// Short name: `a`, `b`, `c`, ...
    pub name: String,
    /// `<name>.<service>`; container name and hostname on the network.
    pub fq_name: String,
    pub role: Role,
    pub ports: MemberPorts,
}

impl Member {
    pub fn bolt_address(&self) -> Address {
        Address::localhost(self.ports.bolt)
    }
}

#[derive(Debug, Clone)]
pub struct ServiceTopology {
    pub service_name: String,
    pub members: Vec<Member>,
    /// Internal address each member advertises for discovery, by index.
    pub discovery_addresses: BTreeMap<usize, Address>,
    /// Entry point for clients outside the attachment network.
    pub client_address: Address,
}

impl ServiceTopology {
    pub fn instance_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_cluster(&self) -> bool {
        self.members.len() > 1
    }

    pub fn roles(&self) -> Vec<Role> {
        self.members.iter().map(|m| m.role).collect()
    }

    fn core_discovery_members(&self) -> Vec<String> {
        self.members
            .iter()
            .filter(|m| m.role == Role::Core)
            .filter_map(|m| self.discovery_addresses.get(&m.index))
            .map(|a| a.to_string())
            .collect()
    }

    /// Address and discovery settings for one member. These take precedence
    /// over anything the user supplied.
    pub fn managed_config(&self, member: &Member) -> Overrides {
        let mut config = Overrides::new();
        config.insert(
            "dbms.connector.bolt.advertised_address".into(),
            Address::localhost(member.ports.bolt).to_string(),
        );
        config.insert(
            "dbms.connector.http.advertised_address".into(),
            Address::localhost(member.ports.http).to_string(),
        );
        if !self.is_cluster() {
            return config;
        }

        let cores = self.core_discovery_members();
        config.insert("dbms.mode".into(), member.role.mode().into());
        config.insert(
            "dbms.default_advertised_address".into(),
            member.fq_name.clone(),
        );
        if let Some(address) = self.discovery_addresses.get(&member.index) {
            config.insert(
                "causal_clustering.discovery_advertised_address".into(),
                address.to_string(),
            );
        }
        config.insert(
            "causal_clustering.initial_discovery_members".into(),
            cores.join(","),
        );
        if member.role == Role::Core {
            config.insert(
                "causal_clustering.minimum_core_cluster_size_at_formation".into(),
                cores.len().to_string(),
            );
        }
        config
    }
}

/// `a`..`z`, then `m26`, `m27`, ...
pub fn member_name(index: usize) -> String {
    if index < 26 {
        ((b'a' + index as u8) as char).to_string()
    } else {
        format!("m{}", index)
    }
}

fn member_ports(index: usize, settings: &Settings) -> Result<MemberPorts, ConfigError> {
    let offset = u16::try_from(index)
        .ok()
        .and_then(|i| i.checked_mul(settings.port_stride))
        .ok_or(ConfigError::PortOverflow { member: index })?;
    let shift = |base: u16| {
        base.checked_add(offset)
            .ok_or(ConfigError::PortOverflow { member: index })
    };
    Ok(MemberPorts {
        bolt: shift(settings.bolt_port)?,
        http: shift(settings.http_port)?,
        https: shift(settings.https_port)?,
    })
}

fn check_reserved(request: &TopologyRequest) -> Result<(), ConfigError> {
    for key in request.config.keys() {
        if RESERVED_CONFIG_KEYS.contains(&key.as_str()) {
            return Err(ConfigError::ReservedKey { key: key.clone() });
        }
    }
    for key in request.env.keys() {
        let reserved = RESERVED_ENV_KEYS.contains(&key.as_str())
            || RESERVED_CONFIG_KEYS
                .iter()
                .any(|k| config_env_key(k) == *key);
        if reserved {
            return Err(ConfigError::ReservedKey { key: key.clone() });
        }
    }
    Ok(())
}

pub fn build_topology(
    request: &TopologyRequest,
    settings: &Settings,
) -> Result<ServiceTopology, ConfigError> {
    let count = request.instance_count;
    if count < 1 {
        return Err(ConfigError::InstanceCount(count));
    }
    if request.read_replicas >= count && request.read_replicas > 0 {
        return Err(ConfigError::ReadReplicas {
            replicas: request.read_replicas,
            instances: count,
        });
    }
    check_reserved(request)?;

    let core_count = count - request.read_replicas;
    let mut members = Vec::with_capacity(count);
    let mut discovery_addresses = BTreeMap::new();
    for index in 0..count {
        let role = if count == 1 {
            Role::Standalone
        } else if index < core_count {
            Role::Core
        } else {
            Role::ReadReplica
        };
        let name = member_name(index);
        let fq_name = format!("{}.{}", name, request.service_name);
        if count > 1 {
            discovery_addresses.insert(
                index,
                Address::new(fq_name.clone(), settings.discovery_port),
            );
        }
        members.push(Member {
            index,
            name,
            fq_name,
            role,
            ports: member_ports(index, settings)?,
        });
    }

    let client_address = members[0].bolt_address();
    Ok(ServiceTopology {
        service_name: request.service_name.clone(),
        members,
        discovery_addresses,
        client_address,
    })
}
