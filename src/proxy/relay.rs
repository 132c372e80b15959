//! Bidirectional byte relay between a client and its upstream.
//!
//! Each direction runs in its own task.  The relay ends as soon as either
//! direction stops (EOF or error): the other direction is told to stop, and
//! the relay returns only after both tasks have finished and dropped their
//! socket halves, so both connections are fully closed by then.  An error
//! the second direction hits after the first one stopped is expected; it is
//! kept apart from the error that ended the relay.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

/// Copy buffer per direction.
pub const RELAY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToUpstream,
    UpstreamToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToUpstream => f.write_str("client => upstream"),
            Direction::UpstreamToClient => f.write_str("upstream => client"),
        }
    }
}

/// How one direction stopped.
#[derive(Debug)]
enum PumpEnd {
    Eof,
    Closed,
    Failed(io::Error),
}

impl PumpEnd {
    fn into_error(self, direction: Direction) -> Option<(Direction, io::Error)> {
        match self {
            PumpEnd::Failed(e) => Some((direction, e)),
            PumpEnd::Eof | PumpEnd::Closed => None,
        }
    }
}

#[derive(Debug)]
struct Pumped {
    bytes: u64,
    end: PumpEnd,
}

/// Result of a finished relay.
#[derive(Debug)]
pub struct RelayOutcome {
    pub bytes_to_upstream: u64,
    pub bytes_to_client: u64,
    /// Direction that stopped first.
    pub first_done: Direction,
    /// Error that ended the relay, if it did not end with EOF.
    pub error: Option<(Direction, io::Error)>,
    /// Error the other direction hit while being torn down.
    pub error_after_close: Option<(Direction, io::Error)>,
}

/// Relay bytes between `client` and `upstream` until either side stops.
pub async fn relay(client: TcpStream, upstream: TcpStream) -> RelayOutcome {
    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();

    let close = CancellationToken::new();
    // Stops both pumps if this future is dropped mid-relay.
    let _close_on_drop = close.clone().drop_guard();

    let mut to_upstream = tokio::spawn(pump(client_read, upstream_write, close.clone()));
    let mut to_client = tokio::spawn(pump(upstream_read, client_write, close.clone()));

    let (first_done, first, second) = tokio::select! {
        done = &mut to_upstream => {
            close.cancel();
            (Direction::ClientToUpstream, done, to_client.await)
        }
        done = &mut to_client => {
            close.cancel();
            (Direction::UpstreamToClient, done, to_upstream.await)
        }
    };
    let second_done = match first_done {
        Direction::ClientToUpstream => Direction::UpstreamToClient,
        Direction::UpstreamToClient => Direction::ClientToUpstream,
    };

    let first = joined(first);
    let second = joined(second);

    let (bytes_to_upstream, bytes_to_client) = match first_done {
        Direction::ClientToUpstream => (first.bytes, second.bytes),
        Direction::UpstreamToClient => (second.bytes, first.bytes),
    };

    RelayOutcome {
        bytes_to_upstream,
        bytes_to_client,
        first_done,
        error: first.end.into_error(first_done),
        error_after_close: second.end.into_error(second_done),
    }
}

fn joined(result: Result<Pumped, tokio::task::JoinError>) -> Pumped {
    result.unwrap_or_else(|e| Pumped {
        bytes: 0,
        end: PumpEnd::Failed(io::Error::other(e.to_string())),
    })
}

/// Copy from `reader` to `writer` until EOF, an error, or `close` fires.
async fn pump<R, W>(mut reader: R, mut writer: W, close: CancellationToken) -> Pumped
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut bytes = 0u64;

    loop {
        let read = tokio::select! {
            biased;
            _ = close.cancelled() => return Pumped { bytes, end: PumpEnd::Closed },
            read = reader.read(&mut buf) => read,
        };
        let n = match read {
            Ok(0) => return Pumped { bytes, end: PumpEnd::Eof },
            Ok(n) => n,
            Err(e) => return Pumped { bytes, end: PumpEnd::Failed(e) },
        };

        let written = tokio::select! {
            biased;
            _ = close.cancelled() => return Pumped { bytes, end: PumpEnd::Closed },
            written = writer.write_all(&buf[..n]) => written,
        };
        if let Err(e) = written {
            return Pumped {
                bytes,
                end: PumpEnd::Failed(e),
            };
        }
        bytes += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    /// A connected pair of loopback streams.
    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (connected, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        (connected.unwrap(), accepted.unwrap().0)
    }

    async fn read_to_eof(stream: &mut TcpStream) -> Vec<u8> {
        let mut buf = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut buf))
            .await
            .expect("peer was not closed")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_relays_both_directions() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let relay = tokio::spawn(relay(client_side, upstream_side));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        drop(client);
        let outcome = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(outcome.bytes_to_upstream, 4);
        assert_eq!(outcome.bytes_to_client, 5);
        assert_eq!(outcome.first_done, Direction::ClientToUpstream);
        assert!(outcome.error.is_none());
        assert!(outcome.error_after_close.is_none());
        assert!(read_to_eof(&mut upstream).await.is_empty());
    }

    #[tokio::test]
    async fn test_upstream_close_tears_down_client() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let relay = tokio::spawn(relay(client_side, upstream_side));

        upstream.write_all(b"partial").await.unwrap();
        let mut buf = [0u8; 7];
        client.read_exact(&mut buf).await.unwrap();
        drop(upstream);

        // The client never sends anything; its direction is parked on a
        // read and must be unblocked by the teardown.
        let outcome = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_done, Direction::UpstreamToClient);
        assert_eq!(outcome.bytes_to_client, 7);
        assert_eq!(outcome.bytes_to_upstream, 0);
        assert!(outcome.error.is_none());
        assert!(outcome.error_after_close.is_none());
        assert!(read_to_eof(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn test_client_half_close_ends_relay() {
        let (mut client, client_side) = pair().await;
        let (upstream_side, mut upstream) = pair().await;
        let relay = tokio::spawn(relay(client_side, upstream_side));

        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        let outcome = timeout(Duration::from_secs(5), relay).await.unwrap().unwrap();
        assert_eq!(outcome.first_done, Direction::ClientToUpstream);
        assert_eq!(read_to_eof(&mut upstream).await, b"last words");
        assert!(read_to_eof(&mut client).await.is_empty());
    }

    #[tokio::test]
    async fn test_pump_stops_on_close() {
        let (reader, _writer) = tokio::io::duplex(64);
        let close = CancellationToken::new();
        let task = tokio::spawn(pump(reader, tokio::io::sink(), close.clone()));

        close.cancel();
        let pumped = timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
        assert!(matches!(pumped.end, PumpEnd::Closed));
        assert_eq!(pumped.bytes, 0);
    }
}
