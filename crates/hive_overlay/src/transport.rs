//! TCP transport — listener, outbound dialing and the connection registry.
//!
//! Inbound and outbound sockets are handled identically once established.
//! Each registered connection gets a fresh [`ConnectionId`], its own
//! [`FrameDecoder`], a reader task that forwards decoded frames to the node's
//! event loop, and a writer task that drains an unbounded queue of encoded
//! frames into the socket. Writes are fire-and-forget: a stalled peer lets
//! its queue grow without limit.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::NetworkError;
use crate::framing::{self, FrameDecoder};
use crate::identity::ConnectionId;
use crate::message::WireMessage;

const READ_BUFFER_SIZE: usize = 8 * 1024;

/// An event raised by the transport towards the node's event loop.
#[derive(Debug)]
pub enum TransportEvent {
    /// The listener accepted a new socket.
    Accepted { stream: TcpStream, addr: SocketAddr },
    /// A frame (or an undecodable fragment) arrived on a connection.
    Frame {
        connection: ConnectionId,
        frame: Result<Value, NetworkError>,
    },
    /// The connection's socket closed or failed.
    Closed { connection: ConnectionId },
}

/// One live connection.
struct Connection {
    addr: SocketAddr,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    reader: JoinHandle<()>,
}

/// Registry of every live connection, keyed by connection id.
pub struct ConnectionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    events: mpsc::Sender<TransportEvent>,
    max_frame_bytes: usize,
}

impl ConnectionRegistry {
    /// Create an empty registry whose connections report to `events`.
    pub fn new(events: mpsc::Sender<TransportEvent>, max_frame_bytes: usize) -> Self {
        Self {
            connections: HashMap::new(),
            events,
            max_frame_bytes,
        }
    }

    /// Take ownership of an established socket and start its I/O tasks.
    pub fn register(&mut self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let id = ConnectionId::generate();
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {addr}: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(write_loop(
            id.clone(),
            write_half,
            outbound_rx,
            self.events.clone(),
        ));
        let reader = tokio::spawn(read_loop(
            id.clone(),
            read_half,
            self.events.clone(),
            self.max_frame_bytes,
        ));

        debug!("Registered connection {id} ({addr})");
        self.connections.insert(
            id.clone(),
            Connection {
                addr,
                outbound: outbound_tx,
                reader,
            },
        );
        id
    }

    /// Serialize `message` and queue it on the named connection.
    pub fn send(&self, id: &ConnectionId, message: &WireMessage) -> Result<(), NetworkError> {
        let conn = self
            .connections
            .get(id)
            .ok_or_else(|| NetworkError::UnknownConnection(id.clone()))?;
        let bytes = framing::encode(message)?;
        conn.outbound
            .send(bytes)
            .map_err(|_| NetworkError::Transport(format!("Writer for {} has stopped", conn.addr)))
    }

    /// Drop a connection. Queued writes are still flushed; no further frames
    /// are read. Returns the remote address if the connection was live.
    pub fn remove(&mut self, id: &ConnectionId) -> Option<SocketAddr> {
        let conn = self.connections.remove(id)?;
        conn.reader.abort();
        debug!("Removed connection {id} ({})", conn.addr);
        Some(conn.addr)
    }

    /// Drop every connection.
    pub fn close_all(&mut self) {
        for (id, conn) in self.connections.drain() {
            debug!("Closing connection {id} ({})", conn.addr);
            conn.reader.abort();
        }
    }

    /// Whether `id` names a live connection.
    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.contains_key(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Whether there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// Read loop — decode frames until the socket closes.
async fn read_loop(
    id: ConnectionId,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<TransportEvent>,
    max_frame_bytes: usize,
) {
    let mut decoder = FrameDecoder::new(max_frame_bytes);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                debug!("Connection {id} reached EOF");
                break;
            }
            Ok(n) => {
                decoder.feed(&buf[..n]);
                for frame in decoder.by_ref() {
                    let event = TransportEvent::Frame {
                        connection: id.clone(),
                        frame,
                    };
                    if events.send(event).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                debug!("Read error on {id}: {e}");
                break;
            }
        }
    }

    if decoder.buffered() > 0 {
        debug!("Connection {id} closed with {} undecoded bytes", decoder.buffered());
    }
    let _ = events.send(TransportEvent::Closed { connection: id }).await;
}

/// Write loop — drain queued frames into the socket, then half-close it.
async fn write_loop(
    id: ConnectionId,
    mut writer: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Vec<u8>>,
    events: mpsc::Sender<TransportEvent>,
) {
    while let Some(bytes) = outbound.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            warn!("Write to {id} failed: {e}");
            let _ = events.send(TransportEvent::Closed { connection: id }).await;
            return;
        }
    }
    let _ = writer.shutdown().await;
}

/// Accept loop — hand every inbound socket to the event loop until shutdown.
pub async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<TransportEvent>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, addr)) => {
                        debug!("Accepted connection from {addr}");
                        if events.send(TransportEvent::Accepted { stream, addr }).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!("TCP accept failed: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                info!("Listener shutting down");
                break;
            }
        }
    }
}

/// Bind a listener on `host:port`.
pub async fn bind(host: IpAddr, port: u16) -> Result<TcpListener, NetworkError> {
    let listener = TcpListener::bind((host, port)).await?;
    info!("Listening on {}", listener.local_addr()?);
    Ok(listener)
}

/// Open an outbound connection, failing after `timeout`.
pub async fn dial(ip: &str, port: u16, timeout: Duration) -> Result<TcpStream, NetworkError> {
    let target = format!("{ip}:{port}");
    match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(stream)) => {
            info!("Connected to {target}");
            Ok(stream)
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
            Err(NetworkError::ConnectionRefused(target))
        }
        Ok(Err(e)) => Err(NetworkError::Transport(format!("Connect to {target} failed: {e}"))),
        Err(_) => Err(NetworkError::Timeout(timeout)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::NodeId;
    use crate::message::Handshake;

    async fn socket_pair() -> (TcpStream, TcpStream, SocketAddr) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server, addr)
    }

    async fn next_event(rx: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for transport event")
            .expect("transport channel closed")
    }

    #[tokio::test]
    async fn test_send_to_unknown_connection_fails() {
        let (tx, _rx) = mpsc::channel(8);
        let registry = ConnectionRegistry::new(tx, 1024);
        let msg = WireMessage::Handshake(Handshake {
            node_id: NodeId::generate(),
        });

        let result = registry.send(&ConnectionId::generate(), &msg);
        assert!(matches!(result, Err(NetworkError::UnknownConnection(_))));
    }

    #[tokio::test]
    async fn test_frames_flow_between_registries() {
        let (client, server, addr) = socket_pair().await;

        let (tx_a, _rx_a) = mpsc::channel(8);
        let mut a = ConnectionRegistry::new(tx_a, 1024);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut b = ConnectionRegistry::new(tx_b, 1024);

        let conn_a = a.register(client, addr);
        let conn_b = b.register(server, addr);
        assert!(a.contains(&conn_a));
        assert_eq!(b.len(), 1);

        let node_id = NodeId::generate();
        let msg = WireMessage::Handshake(Handshake {
            node_id: node_id.clone(),
        });
        a.send(&conn_a, &msg).unwrap();
        a.send(&conn_a, &msg).unwrap();

        for _ in 0..2 {
            match next_event(&mut rx_b).await {
                TransportEvent::Frame { connection, frame } => {
                    assert_eq!(connection, conn_b);
                    let parsed = WireMessage::from_value(frame.unwrap()).unwrap();
                    assert_eq!(parsed, msg);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn test_remove_closes_remote_side() {
        let (client, server, addr) = socket_pair().await;

        let (tx_a, _rx_a) = mpsc::channel(8);
        let mut a = ConnectionRegistry::new(tx_a, 1024);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        let mut b = ConnectionRegistry::new(tx_b, 1024);

        let conn_a = a.register(client, addr);
        let conn_b = b.register(server, addr);

        assert_eq!(a.remove(&conn_a), Some(addr));
        assert!(a.remove(&conn_a).is_none());
        assert!(a.is_empty());

        match next_event(&mut rx_b).await {
            TransportEvent::Closed { connection } => assert_eq!(connection, conn_b),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dial_refused() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let result = dial("127.0.0.1", port, Duration::from_secs(2)).await;
        assert!(matches!(result, Err(NetworkError::ConnectionRefused(_))));
    }

    #[tokio::test]
    async fn test_accept_loop_forwards_sockets_and_stops() {
        let listener = bind("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, mut rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(accept_loop(listener, tx, shutdown_rx));

        let _client = dial("127.0.0.1", addr.port(), Duration::from_secs(2))
            .await
            .unwrap();
        assert!(matches!(
            next_event(&mut rx).await,
            TransportEvent::Accepted { .. }
        ));

        shutdown_tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
