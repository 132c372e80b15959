//! Listening socket provider.
//!
//! A dispatcher either binds its address itself or, when running under the
//! server-starter process manager, adopts a socket the manager already
//! opened.  server-starter hands sockets down through the environment:
//!
//! ```text
//! SERVER_STARTER_PORT=0.0.0.0:80=3;8443=4
//! ```
//!
//! Each entry is `address=fd`, where the address is `host:port` or just a
//! port.  A socket is adopted when its port matches the port being served.

use std::io;
use std::net::SocketAddr;

use log::{info, warn};
use tokio::net::TcpListener;

/// Environment variable server-starter uses to pass listening sockets.
pub const SERVER_STARTER_ENV: &str = "SERVER_STARTER_PORT";

/// A listening socket passed down by the process manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedSocket {
    pub addr: String,
    pub fd: i32,
}

impl InheritedSocket {
    /// Port part of the address.
    pub fn port(&self) -> Option<u16> {
        self.addr.rsplit(':').next()?.parse().ok()
    }
}

/// Parse a `SERVER_STARTER_PORT` value; malformed entries are skipped.
pub fn parse_server_starter_port(value: &str) -> Vec<InheritedSocket> {
    value
        .split(';')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .filter_map(|entry| {
            let parsed = entry.rsplit_once('=').and_then(|(addr, fd)| {
                let fd = fd.trim().parse::<i32>().ok().filter(|fd| *fd >= 0)?;
                let addr = addr.trim();
                (!addr.is_empty()).then(|| InheritedSocket {
                    addr: addr.to_string(),
                    fd,
                })
            });
            if parsed.is_none() {
                warn!("Ignoring malformed {} entry: {:?}", SERVER_STARTER_ENV, entry);
            }
            parsed
        })
        .collect()
}

/// Get a listening socket for `addr`, adopting an inherited one if present.
pub async fn obtain_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let inherited = std::env::var(SERVER_STARTER_ENV).ok();
    listen_or_adopt(addr, inherited.as_deref()).await
}

/// Adopt the socket in `inherited` whose port matches `addr`, else bind.
async fn listen_or_adopt(addr: SocketAddr, inherited: Option<&str>) -> io::Result<TcpListener> {
    if let Some(socket) = inherited.and_then(|value| find_inherited(value, addr.port())) {
        return adopt(socket);
    }

    let listener = TcpListener::bind(addr).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

fn find_inherited(value: &str, port: u16) -> Option<InheritedSocket> {
    parse_server_starter_port(value)
        .into_iter()
        .find(|socket| socket.port() == Some(port))
}

#[cfg(unix)]
fn adopt(socket: InheritedSocket) -> io::Result<TcpListener> {
    use std::os::unix::io::FromRawFd;

    // SAFETY: server-starter opened this descriptor as a listening TCP
    // socket for us and nothing else in the process owns it.
    let std_listener = unsafe { std::net::TcpListener::from_raw_fd(socket.fd) };
    std_listener.set_nonblocking(true)?;
    let listener = TcpListener::from_std(std_listener)?;
    info!(
        "Listening on {} (inherited fd {} for {})",
        listener.local_addr()?,
        socket.fd,
        socket.addr
    );
    Ok(listener)
}

#[cfg(not(unix))]
fn adopt(socket: InheritedSocket) -> io::Result<TcpListener> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        format!("cannot adopt inherited socket {} on this platform", socket.addr),
    ))
}
