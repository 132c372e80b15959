//! In-memory inventory shared by the unit and integration tests.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::runtime::Inventory;
use crate::types::{ContainerInfo, PortMapping};

#[derive(Default)]
pub struct FakeInventory {
    containers: Mutex<Vec<ContainerInfo>>,
    failing: AtomicBool,
    calls: AtomicUsize,
}

impl FakeInventory {
    pub fn with(containers: Vec<ContainerInfo>) -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(containers),
            ..Default::default()
        })
    }

    pub fn set(&self, containers: Vec<ContainerInfo>) {
        *self.containers.lock().unwrap() = containers;
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Number of `list_containers` calls so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn list_containers(&self, _label: &str) -> anyhow::Result<Vec<ContainerInfo>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            anyhow::bail!("daemon unavailable");
        }
        Ok(self.containers.lock().unwrap().clone())
    }
}

/// A container record with the given port table.
pub fn container(id: &str, created: i64, ports: Vec<PortMapping>) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        created,
        ports,
    }
}
