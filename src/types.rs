//! Data structures shared between the registry and the dispatchers.
//!
//! Inventory records ([`ContainerInfo`], [`PortMapping`]) describe what the
//! container runtime reported.  [`BackendEndpoint`] and [`Snapshot`] are the
//! registry's view of that inventory: which public ports can serve which
//! private port, in failover order.

use std::cmp::Ordering;
use std::collections::HashMap;

/// Transport protocol of a published port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Sctp,
    /// Anything the runtime reported that we do not recognise.
    Other,
}

/// One port table entry of a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub protocol: Protocol,
    /// Port the service listens on inside the container.
    pub private_port: u16,
    /// Host port published for `private_port`, if any.
    pub public_port: Option<u16>,
}

impl PortMapping {
    pub fn tcp(private_port: u16, public_port: u16) -> Self {
        Self {
            protocol: Protocol::Tcp,
            private_port,
            public_port: Some(public_port),
        }
    }
}

/// A container as reported by the inventory provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    /// Creation time in unix seconds.
    pub created: i64,
    pub ports: Vec<PortMapping>,
}

impl ContainerInfo {
    /// Private ports this container exposes over TCP, in port table order.
    pub fn tcp_private_ports(&self) -> Vec<u16> {
        let mut ports = Vec::new();
        for mapping in &self.ports {
            if mapping.protocol == Protocol::Tcp && !ports.contains(&mapping.private_port) {
                ports.push(mapping.private_port);
            }
        }
        ports
    }

    /// Public port mapped to `private_port` over TCP.
    ///
    /// When several bindings exist for the same private port (IPv4 and IPv6
    /// bindings are reported separately) the last published one wins.
    pub fn tcp_public_port(&self, private_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .filter(|m| m.protocol == Protocol::Tcp && m.private_port == private_port)
            .filter_map(|m| m.public_port)
            .filter(|&p| p > 0)
            .last()
    }
}

/// Failover order: newest container first, container id ascending on ties.
pub fn failover_order(a_id: &str, a_created: i64, b_id: &str, b_created: i64) -> Ordering {
    b_created.cmp(&a_created).then_with(|| a_id.cmp(b_id))
}

/// Sort containers into failover order.
pub fn sort_containers(containers: &mut [ContainerInfo]) {
    containers.sort_by(|a, b| failover_order(&a.id, a.created, &b.id, b.created));
}

/// A reachable instance behind one private port.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BackendEndpoint {
    pub container_id: String,
    pub created: i64,
    pub public_port: u16,
}

impl BackendEndpoint {
    pub fn new(container_id: impl Into<String>, created: i64, public_port: u16) -> Self {
        Self {
            container_id: container_id.into(),
            created,
            public_port,
        }
    }

    /// Short form of the container id, as `docker ps` prints it.
    pub fn short_id(&self) -> &str {
        let end = self
            .container_id
            .char_indices()
            .nth(12)
            .map(|(i, _)| i)
            .unwrap_or(self.container_id.len());
        &self.container_id[..end]
    }
}

/// Immutable mapping from private port to endpoints in failover order.
///
/// Built in one piece by a refresh and published as a whole; never mutated
/// after construction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    backends: HashMap<u16, Vec<BackendEndpoint>>,
}

impl Snapshot {
    /// Build a snapshot for `private_ports` from an inventory listing.
    ///
    /// Only ports in `private_ports` become keys, and a container appears
    /// under a port only if it publishes a TCP mapping for it.
    pub fn build(private_ports: &[u16], mut containers: Vec<ContainerInfo>) -> Self {
        sort_containers(&mut containers);

        let mut backends = HashMap::with_capacity(private_ports.len());
        for &private_port in private_ports {
            let endpoints: Vec<BackendEndpoint> = containers
                .iter()
                .filter_map(|c| {
                    c.tcp_public_port(private_port)
                        .map(|public_port| BackendEndpoint::new(c.id.clone(), c.created, public_port))
                })
                .collect();
            backends.insert(private_port, endpoints);
        }

        Self { backends }
    }

    /// Endpoints for `private_port`, or `None` if the port is not a key.
    pub fn get(&self, private_port: u16) -> Option<&[BackendEndpoint]> {
        self.backends.get(&private_port).map(Vec::as_slice)
    }

    /// Total number of endpoints across all ports.
    pub fn endpoint_count(&self) -> usize {
        self.backends.values().map(Vec::len).sum()
    }
}
