//! motarei: forward TCP ports to the newest reachable Docker container
//! carrying a label, failing over to older ones.

pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod proxy;
pub mod runtime;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use discovery::Registry;
pub use error::{DiscoveryError, ProxyError};
pub use proxy::{Dispatcher, DispatcherConfig};
pub use runtime::{DockerInventory, Inventory};
