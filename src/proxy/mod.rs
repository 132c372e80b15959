//! TCP forwarding.
//!
//! ```text
//! Client -> Listener -> Dispatcher -> Registry lookup -> failover dial -> Relay -> Upstream
//! ```
//!
//! One [`Dispatcher`] runs per private port, all sharing one
//! [`Registry`](crate::discovery::Registry).

mod dispatcher;
pub mod listener;
mod relay;

pub use dispatcher::{Dispatcher, DispatcherConfig, DispatcherStats, DEFAULT_CONNECT_TIMEOUT};
pub use listener::{obtain_listener, parse_server_starter_port, InheritedSocket};
pub use relay::{relay, Direction, RelayOutcome, RELAY_BUFFER_SIZE};
