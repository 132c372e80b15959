use crate::types::ContainerInfo;
use anyhow::Result;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerInventory;

/// Source of truth for which containers currently exist.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// List running containers carrying `label` (`key=value` or bare `key`),
    /// with their port tables.
    async fn list_containers(&self, label: &str) -> Result<Vec<ContainerInfo>>;
}
