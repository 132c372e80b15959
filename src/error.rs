//! Error types for the registry and the dispatchers.

use thiserror::Error;

/// Failures of the backend registry.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// No container matched the label while inferring the private ports.
    #[error("could not find containers with label: {label}")]
    NoMatchingContainers { label: String },

    /// The reference container publishes no TCP port.
    #[error("containers were found, but container {container_id} exposes no TCP port")]
    NoExposedPorts { container_id: String },

    /// The inventory provider failed to answer.
    #[error("inventory query failed: {0}")]
    InventoryQueryFailed(#[source] anyhow::Error),

    /// No endpoint serves the private port, even after a refresh.
    #[error("could not find backends for private port: {port}")]
    NoBackendsAvailable { port: u16 },
}

/// Per-connection failures of a dispatcher.
///
/// None of these are fatal to the process; they end one connection.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Lookup(#[from] DiscoveryError),

    /// Every candidate refused or timed out.
    #[error("gave up connecting to {attempts} backend(s) for private port {port}")]
    BackendsExhausted { port: u16, attempts: usize },
}
