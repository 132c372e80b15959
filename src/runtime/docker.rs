use super::Inventory;
use crate::types::{ContainerInfo, PortMapping, Protocol};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::{ContainerSummary, Port, PortTypeEnum};
use bollard::Docker;
use log::{debug, info};
use std::collections::HashMap;

/// [`Inventory`] backed by the local Docker daemon.
pub struct DockerInventory {
    docker: Docker,
}

impl DockerInventory {
    /// Connect to the Docker daemon.
    ///
    /// Uses the unix socket on Linux unless `DOCKER_HOST` says otherwise,
    /// then negotiates the API version with the daemon.
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?
            .negotiate_version()
            .await?;
        info!("Connected to Docker daemon");
        Ok(Self { docker })
    }
}

#[async_trait]
impl Inventory for DockerInventory {
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), vec![label.to_string()]);
        let opts = ListContainersOptions::<String> {
            all: false,
            filters,
            ..Default::default()
        };

        let summaries = self
            .docker
            .list_containers(Some(opts))
            .await
            .map_err(|e| anyhow!("listing containers with label {}: {}", label, e))?;
        debug!("Docker reported {} containers for {}", summaries.len(), label);

        Ok(summaries.into_iter().filter_map(container_from_summary).collect())
    }
}

/// Convert a Docker container summary; summaries without an id are dropped.
fn container_from_summary(summary: ContainerSummary) -> Option<ContainerInfo> {
    let id = summary.id.filter(|id| !id.is_empty())?;
    let ports = summary
        .ports
        .unwrap_or_default()
        .into_iter()
        .map(port_mapping)
        .collect();

    Some(ContainerInfo {
        id,
        created: summary.created.unwrap_or_default(),
        ports,
    })
}

fn port_mapping(port: Port) -> PortMapping {
    let protocol = match port.typ {
        Some(PortTypeEnum::TCP) => Protocol::Tcp,
        Some(PortTypeEnum::UDP) => Protocol::Udp,
        Some(PortTypeEnum::SCTP) => Protocol::Sctp,
        _ => Protocol::Other,
    };

    PortMapping {
        protocol,
        private_port: port.private_port,
        public_port: port.public_port.filter(|&p| p > 0),
    }
}
