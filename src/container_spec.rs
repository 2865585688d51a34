use crate::config::Overrides;
use crate::topology::{Member, ServiceTopology};
use crate::types::{Auth, ContainerSpec};

/// Server settings every member starts from. Sized for a laptop.
pub const DEFAULT_CONFIG: &[(&str, &str)] = &[
    ("dbms.backup.enabled", "false"),
    ("dbms.memory.heap.initial_size", "300m"),
    ("dbms.memory.heap.max_size", "500m"),
    ("dbms.memory.pagecache.size", "50m"),
    ("dbms.transaction.bookmark_ready_timeout", "5s"),
];

/// Builds the launch spec for one member.
///
/// Layers, lowest first: defaults, user overrides, then the address and
/// discovery settings computed by the topology.
pub fn build_spec(
    member: &Member,
    topology: &ServiceTopology,
    image: &str,
    auth: &Auth,
    config_overrides: &Overrides,
    env_overrides: &Overrides,
) -> ContainerSpec {
    let mut config: Overrides = DEFAULT_CONFIG
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    config.extend(config_overrides.clone());
    config.extend(topology.managed_config(member));

    let mut env = Overrides::new();
    env.insert("NEO4J_ACCEPT_LICENSE_AGREEMENT".into(), "yes".into());
    env.extend(env_overrides.clone());
    env.insert(
        "NEO4J_AUTH".into(),
        format!("{}/{}", auth.user, auth.password),
    );

    ContainerSpec {
        name: member.fq_name.clone(),
        image: image.to_string(),
        role: member.role,
        ports: member.ports,
        env,
        config,
        network: topology.service_name.clone(),
    }
}

/// One spec per member, in member order.
pub fn build_specs(
    topology: &ServiceTopology,
    image: &str,
    auth: &Auth,
    config_overrides: &Overrides,
    env_overrides: &Overrides,
) -> Vec<ContainerSpec> {
    topology
        .members
        .iter()
        .map(|m| build_spec(m, topology, image, auth, config_overrides, env_overrides))
        .collect()
}
