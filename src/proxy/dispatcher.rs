//! Connection dispatcher.
//!
//! One dispatcher serves one private port.  For every accepted connection it
//! asks the registry for the current endpoints, dials them in order until
//! one accepts, and relays bytes until either side stops.
//!
//! ```text
//! Accepted -> BackendsResolved -> Connected -> Relaying -> Closed
//!                  |                  |
//!                  +-- no backends ---+-- all dials failed --> Closed
//! ```

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::listener::obtain_listener;
use super::relay::{relay, RelayOutcome};
use crate::discovery::Registry;
use crate::error::ProxyError;
use crate::types::BackendEndpoint;

/// Default timeout for a single upstream connect attempt.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Timeout for each connect attempt.
    pub connect_timeout: Duration,
    /// Host the public ports are published on.
    pub upstream_ip: IpAddr,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            upstream_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }
}

/// Counters for one dispatcher.
#[derive(Debug, Default)]
pub struct DispatcherStats {
    /// Connections accepted.
    pub connections_accepted: AtomicU64,
    /// Connections currently being handled.
    pub connections_active: AtomicU64,
    /// Connections fully handled.
    pub connections_closed: AtomicU64,
    /// Connections dropped because the registry had no endpoint.
    pub lookup_failures: AtomicU64,
    /// Individual upstream connect attempts that failed or timed out.
    pub backend_connect_failures: AtomicU64,
    /// Connections dropped because every candidate failed.
    pub backends_exhausted: AtomicU64,
    /// Connections that reached the relay stage.
    pub connections_established: AtomicU64,
    /// Relays ended by an I/O error rather than EOF.
    pub relay_errors: AtomicU64,
    pub bytes_to_upstream: AtomicU64,
    pub bytes_to_client: AtomicU64,
}

pub struct Dispatcher {
    private_port: u16,
    registry: Arc<Registry>,
    config: DispatcherConfig,
    stats: Arc<DispatcherStats>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(private_port: u16, registry: Arc<Registry>, config: DispatcherConfig) -> Self {
        Self {
            private_port,
            registry,
            config,
            stats: Arc::new(DispatcherStats::default()),
            tracker: TaskTracker::new(),
        }
    }

    pub fn private_port(&self) -> u16 {
        self.private_port
    }

    pub fn stats(&self) -> &DispatcherStats {
        &self.stats
    }

    /// Tracker of in-flight connections.
    ///
    /// Closed once the accept loop exits, so `wait()` resolves when the
    /// last relay finishes.
    pub fn tracker(&self) -> TaskTracker {
        self.tracker.clone()
    }

    /// Obtain a listener for `listen_addr` and serve it until `cancel` fires.
    pub async fn start(
        self: Arc<Self>,
        listen_addr: SocketAddr,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let listener = match obtain_listener(listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.tracker.close();
                return Err(e);
            }
        };
        self.serve(listener, cancel).await
    }

    /// Accept connections on `listener` until `cancel` fires.
    ///
    /// Each connection is handled on its own task.  Cancellation closes the
    /// listener but leaves in-flight relays running.  An accept error ends
    /// the loop and is returned.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> io::Result<()> {
        let local_addr = listener.local_addr()?;
        info!("Forwarding {} to private port {}", local_addr, self.private_port);

        let result = loop {
            let (stream, peer_addr) = tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => break Err(e),
                },
            };

            self.stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
            self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

            let dispatcher = Arc::clone(&self);
            self.tracker.spawn(async move {
                // Already reported by handle_connection.
                let _ = dispatcher.handle_connection(stream, peer_addr).await;

                dispatcher.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
                dispatcher.stats.connections_closed.fetch_add(1, Ordering::Relaxed);
            });
        };

        drop(listener);
        self.tracker.close();
        match &result {
            Ok(()) => info!("Stopped listening on {}", local_addr),
            Err(e) => warn!("Accept on {} failed: {}", local_addr, e),
        }
        result
    }

    /// Forward one client connection.
    ///
    /// The client is closed on every path out of this function.
    pub async fn handle_connection(
        &self,
        client: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<RelayOutcome, ProxyError> {
        let port = self.private_port;
        debug!("[{}] {} accepted", port, peer_addr);

        let endpoints = match self.registry.lookup(port).await {
            Ok(endpoints) => endpoints,
            Err(e) => {
                self.stats.lookup_failures.fetch_add(1, Ordering::Relaxed);
                warn!("[{}] {} failed to get backends: {}", port, peer_addr, e);
                return Err(e.into());
            }
        };

        let (upstream, endpoint) = match self.connect_upstream(&endpoints, peer_addr).await {
            Ok(connected) => connected,
            Err(e) => {
                warn!("[{}] {} {}", port, peer_addr, e);
                return Err(e);
            }
        };
        self.stats.connections_established.fetch_add(1, Ordering::Relaxed);
        debug!(
            "[{}] {} connected to {} on public port {}",
            port,
            peer_addr,
            endpoint.short_id(),
            endpoint.public_port
        );

        if let Err(e) = client.set_nodelay(true) {
            debug!("[{}] {} set_nodelay on client: {}", port, peer_addr, e);
        }

        let outcome = relay(client, upstream).await;
        self.stats
            .bytes_to_upstream
            .fetch_add(outcome.bytes_to_upstream, Ordering::Relaxed);
        self.stats
            .bytes_to_client
            .fetch_add(outcome.bytes_to_client, Ordering::Relaxed);
        if let Some((direction, e)) = &outcome.error {
            self.stats.relay_errors.fetch_add(1, Ordering::Relaxed);
            warn!("[{}] {} copy {}: {}", port, peer_addr, direction, e);
        }
        if let Some((direction, e)) = &outcome.error_after_close {
            debug!("[{}] {} copy {} after close: {}", port, peer_addr, direction, e);
        }

        debug!(
            "[{}] {} closed ({} bytes up, {} bytes down)",
            port, peer_addr, outcome.bytes_to_upstream, outcome.bytes_to_client
        );
        Ok(outcome)
    }

    /// Dial `endpoints` in order and return the first that accepts.
    pub async fn connect_upstream(
        &self,
        endpoints: &[BackendEndpoint],
        peer_addr: SocketAddr,
    ) -> Result<(TcpStream, BackendEndpoint), ProxyError> {
        for endpoint in endpoints {
            let addr = SocketAddr::new(self.config.upstream_ip, endpoint.public_port);
            let error = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
                Ok(Ok(stream)) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("[{}] set_nodelay on {}: {}", self.private_port, addr, e);
                    }
                    return Ok((stream, endpoint.clone()));
                }
                Ok(Err(e)) => e,
                Err(_) => io::Error::new(io::ErrorKind::TimedOut, "connect timeout"),
            };

            self.stats
                .backend_connect_failures
                .fetch_add(1, Ordering::Relaxed);
            warn!(
                "[{}] {} failed to connect backend {} at {}: {}",
                self.private_port,
                peer_addr,
                endpoint.short_id(),
                addr,
                error
            );
        }

        self.stats.backends_exhausted.fetch_add(1, Ordering::Relaxed);
        Err(ProxyError::BackendsExhausted {
            port: self.private_port,
            attempts: endpoints.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{container, FakeInventory};
    use crate::types::PortMapping;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// A port nothing listens on.
    async fn refused_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    async fn dispatcher(inventory: Arc<FakeInventory>, port: u16) -> Dispatcher {
        let registry = Registry::new(inventory, "app=test", Some(vec![port]))
            .await
            .unwrap();
        let config = DispatcherConfig {
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        };
        Dispatcher::new(port, Arc::new(registry), config)
    }

    #[test]
    fn test_config_defaults() {
        let config = DispatcherConfig::default();
        assert_eq!(config.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.upstream_ip, IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[tokio::test]
    async fn test_failover_skips_refused_candidates() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = live.local_addr().unwrap().port();
        let dead = [refused_port().await, refused_port().await];

        let d = dispatcher(FakeInventory::with(Vec::new()), 8080).await;
        let endpoints = vec![
            BackendEndpoint::new("c", 300, dead[0]),
            BackendEndpoint::new("b", 200, dead[1]),
            BackendEndpoint::new("a", 100, live_port),
        ];

        let peer = "127.0.0.1:1".parse().unwrap();
        let (_stream, endpoint) = d.connect_upstream(&endpoints, peer).await.unwrap();
        assert_eq!(endpoint.container_id, "a");
        assert_eq!(d.stats().backend_connect_failures.load(Ordering::Relaxed), 2);
        assert_eq!(d.stats().backends_exhausted.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_all_candidates_refused() {
        let d = dispatcher(FakeInventory::with(Vec::new()), 8080).await;
        let endpoints = vec![
            BackendEndpoint::new("b", 200, refused_port().await),
            BackendEndpoint::new("a", 100, refused_port().await),
        ];

        let peer = "127.0.0.1:1".parse().unwrap();
        let err = d.connect_upstream(&endpoints, peer).await.err().unwrap();
        assert!(matches!(
            err,
            ProxyError::BackendsExhausted {
                port: 8080,
                attempts: 2
            }
        ));
        assert_eq!(d.stats().backend_connect_failures.load(Ordering::Relaxed), 2);
        assert_eq!(d.stats().backends_exhausted.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_lookup_failure_closes_client() {
        let inventory = FakeInventory::with(Vec::new());
        let d = dispatcher(inventory.clone(), 8080).await;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let (server_side, peer) = accepted.unwrap();

        let err = d.handle_connection(server_side, peer).await.err().unwrap();
        assert!(matches!(err, ProxyError::Lookup(_)));
        assert_eq!(d.stats().lookup_failures.load(Ordering::Relaxed), 1);
        assert_eq!(d.stats().backend_connect_failures.load(Ordering::Relaxed), 0);
        assert_eq!(inventory.calls(), 1);

        let mut buf = Vec::new();
        client.read_to_end(&mut buf).await.unwrap();
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn test_handle_connection_fails_over_and_relays() {
        let upstream = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_port = upstream.local_addr().unwrap().port();
        let dead_port = refused_port().await;

        let inventory = FakeInventory::with(vec![
            container("a", 100, vec![PortMapping::tcp(8080, live_port)]),
            container("b", 200, vec![PortMapping::tcp(8080, dead_port)]),
        ]);
        let d = Arc::new(dispatcher(inventory, 8080).await);

        let echo = tokio::spawn(async move {
            let (mut stream, _) = upstream.accept().await.unwrap();
            let mut buf = [0u8; 5];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = front.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), front.accept());
        let mut client = client.unwrap();
        let (server_side, peer) = accepted.unwrap();

        let handler = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.handle_connection(server_side, peer).await }
        });

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        echo.await.unwrap();

        let outcome = handler.await.unwrap().unwrap();
        assert_eq!(outcome.bytes_to_upstream, 5);
        assert_eq!(outcome.bytes_to_client, 5);
        assert!(outcome.error.is_none());
        assert!(outcome.error_after_close.is_none());
        assert_eq!(d.stats().backend_connect_failures.load(Ordering::Relaxed), 1);
        assert_eq!(d.stats().connections_established.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_serve_stops_on_cancel() {
        let d = Arc::new(dispatcher(FakeInventory::with(Vec::new()), 8080).await);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();

        let serve = tokio::spawn(Arc::clone(&d).serve(listener, cancel.clone()));
        cancel.cancel();
        serve.await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
        d.tracker().wait().await;
    }
}
