//! Backend registry.
//!
//! The registry keeps one [`Snapshot`] of the containers matching a label,
//! keyed by the private ports this process forwards.  Dispatchers read it on
//! every accepted connection; a background task replaces it on a fixed
//! period.  A lookup that finds no endpoint for its port triggers one
//! synchronous refresh before giving up, so a container that appeared since
//! the last tick is still found.
//!
//! The snapshot is replaced, never mutated: readers clone the `Arc` under a
//! read lock and work on a consistent view while a refresh builds the next
//! one.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::{Mutex, RwLock};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::error::DiscoveryError;
use crate::runtime::Inventory;
use crate::types::{sort_containers, BackendEndpoint, Snapshot};

/// Default period of the background refresh.
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(1);

pub struct Registry {
    inventory: Arc<dyn Inventory>,
    label: String,
    private_ports: Vec<u16>,
    snapshot: RwLock<Arc<Snapshot>>,
    /// Serialises refreshes so snapshots are published in query order.
    refresh_lock: Mutex<()>,
}

impl Registry {
    /// Create a registry for containers carrying `label`.
    ///
    /// Without explicit ports, the private ports are taken from a reference
    /// container: the newest match (lowest id on ties), all of its TCP
    /// ports.  The registry starts with an empty snapshot.
    pub async fn new(
        inventory: Arc<dyn Inventory>,
        label: impl Into<String>,
        explicit_ports: Option<Vec<u16>>,
    ) -> Result<Self, DiscoveryError> {
        let label = label.into();

        let private_ports = match explicit_ports.filter(|p| !p.is_empty()) {
            Some(ports) => {
                let mut unique = Vec::with_capacity(ports.len());
                for port in ports {
                    if !unique.contains(&port) {
                        unique.push(port);
                    }
                }
                unique
            }
            None => Self::infer_private_ports(inventory.as_ref(), &label).await?,
        };

        info!(
            "Forwarding private ports {:?} for containers with label {}",
            private_ports, label
        );

        Ok(Self {
            inventory,
            label,
            private_ports,
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            refresh_lock: Mutex::new(()),
        })
    }

    async fn infer_private_ports(
        inventory: &dyn Inventory,
        label: &str,
    ) -> Result<Vec<u16>, DiscoveryError> {
        let mut containers = inventory
            .list_containers(label)
            .await
            .map_err(DiscoveryError::InventoryQueryFailed)?;
        sort_containers(&mut containers);

        let reference = containers
            .first()
            .ok_or_else(|| DiscoveryError::NoMatchingContainers {
                label: label.to_string(),
            })?;

        let ports = reference.tcp_private_ports();
        if ports.is_empty() {
            return Err(DiscoveryError::NoExposedPorts {
                container_id: reference.id.clone(),
            });
        }
        debug!("Reference container {} exposes {:?}", reference.id, ports);
        Ok(ports)
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// The private ports this registry tracks.
    pub fn private_ports(&self) -> &[u16] {
        &self.private_ports
    }

    /// The currently published snapshot.
    pub async fn snapshot(&self) -> Arc<Snapshot> {
        Arc::clone(&*self.snapshot.read().await)
    }

    /// Query the inventory and publish a new snapshot.
    ///
    /// On failure the previous snapshot stays in place.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>, DiscoveryError> {
        let _guard = self.refresh_lock.lock().await;

        let containers = self
            .inventory
            .list_containers(&self.label)
            .await
            .map_err(DiscoveryError::InventoryQueryFailed)?;
        let snapshot = Arc::new(Snapshot::build(&self.private_ports, containers));

        *self.snapshot.write().await = Arc::clone(&snapshot);
        debug!(
            "Published snapshot with {} endpoints across {} ports",
            snapshot.endpoint_count(),
            self.private_ports.len()
        );
        Ok(snapshot)
    }

    /// Endpoints for `private_port` in failover order.
    ///
    /// Served from the cached snapshot when it has any endpoint for the
    /// port; otherwise refreshes once and reads again.
    pub async fn lookup(&self, private_port: u16) -> Result<Vec<BackendEndpoint>, DiscoveryError> {
        {
            let snapshot = self.snapshot.read().await;
            if let Some(endpoints) = snapshot.get(private_port).filter(|e| !e.is_empty()) {
                return Ok(endpoints.to_vec());
            }
        }

        debug!("No cached backends for port {}, refreshing", private_port);
        let snapshot = self.refresh().await?;
        match snapshot.get(private_port) {
            Some(endpoints) if !endpoints.is_empty() => Ok(endpoints.to_vec()),
            _ => Err(DiscoveryError::NoBackendsAvailable { port: private_port }),
        }
    }

    /// Refresh every `period` until `cancel` fires.
    ///
    /// Failures are logged and the last good snapshot keeps serving.
    pub async fn run(&self, period: Duration, cancel: CancellationToken) {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Background refresh stopped");
                    return;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!("Periodic refresh failed: {}", e);
                    }
                }
            }
        }
    }
}
