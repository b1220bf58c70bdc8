//! OverlayNode — the public face of the overlay.
//!
//! [`OverlayNode`] is a cheap handle. All node state (connection registry,
//! neighbor table, seen-packet cache) is owned by a single event-loop task
//! spawned in [`OverlayNode::new`]. The handle talks to it over a command
//! channel, and transport tasks feed it over an event channel, so state is
//! only ever mutated from one place and no locks are needed.
//!
//! Layering inside the loop:
//! - transport events (`Accepted`, `Frame`, `Closed`) come in from sockets;
//! - the identity layer turns frames into handshakes or node messages;
//! - the router decides what to deliver locally and what to re-flood.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::NetworkError;
use crate::event::{FaultKind, NodeEvent};
use crate::identity::{ConnectionId, NodeId, PacketId};
use crate::message::{Handshake, RoutedPacket, WireMessage};
use crate::neighbor::{Handshaken, NeighborInfo, NeighborTable, Neighbors};
use crate::router::Router;
use crate::transport::{self, ConnectionRegistry, TransportEvent};

/// Requests from the handle to the event loop.
enum Command {
    Listen {
        listener: TcpListener,
        reply: oneshot::Sender<Result<SocketAddr, NetworkError>>,
    },
    Register {
        stream: TcpStream,
        addr: SocketAddr,
        reply: oneshot::Sender<ConnectionId>,
    },
    Broadcast {
        message: Value,
        reply: oneshot::Sender<PacketId>,
    },
    Direct {
        destination: NodeId,
        message: Value,
        reply: oneshot::Sender<PacketId>,
    },
    Disconnect {
        node_id: NodeId,
        reply: oneshot::Sender<Result<(), NetworkError>>,
    },
    StopListening {
        reply: oneshot::Sender<Option<SocketAddr>>,
    },
    Neighbors {
        reply: oneshot::Sender<Neighbors>,
    },
    NeighborInfo {
        reply: oneshot::Sender<Vec<NeighborInfo>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// A node in the overlay network.
///
/// Must be created from within a Tokio runtime.
pub struct OverlayNode {
    id: NodeId,
    config: NodeConfig,
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<NodeEvent>,
}

impl OverlayNode {
    /// Create a node with a fresh identity and start its event loop.
    pub fn new(config: NodeConfig) -> Self {
        let id = NodeId::generate();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let event_loop = EventLoop::new(id.clone(), &config, events_tx.clone());
        tokio::spawn(event_loop.run(commands_rx));

        info!("Overlay node {id} started");
        Self {
            id,
            config,
            commands: commands_tx,
            events: events_tx,
        }
    }

    /// Create a node with default config.
    pub fn with_defaults() -> Self {
        Self::new(NodeConfig::default())
    }

    /// This node's identity.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// The node's configuration.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Whether the node has not been closed.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Subscribe to node events. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> broadcast::Receiver<NodeEvent> {
        self.events.subscribe()
    }

    /// Start accepting connections on `listen_host:port`. Returns the bound
    /// address, so port 0 picks a free port.
    pub async fn listen(&self, port: u16) -> Result<SocketAddr, NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let listener = transport::bind(self.config.listen_host, port).await?;
        self.request(|reply| Command::Listen { listener, reply })
            .await?
    }

    /// Open a connection to another node. Resolves once the link is
    /// registered; the `Connect` event follows when the peer's handshake
    /// arrives.
    pub async fn connect(&self, ip: &str, port: u16) -> Result<(), NetworkError> {
        if !self.is_running() {
            return Err(NetworkError::NotRunning);
        }
        let stream = transport::dial(ip, port, self.config.connect_timeout).await?;
        let addr = stream.peer_addr()?;
        let connection = self
            .request(|reply| Command::Register {
                stream,
                addr,
                reply,
            })
            .await?;
        debug!("Outbound connection {connection} to {addr} registered");
        Ok(())
    }

    /// Flood `message` to every node in the overlay.
    pub async fn broadcast(&self, message: Value) -> Result<PacketId, NetworkError> {
        self.request(|reply| Command::Broadcast { message, reply })
            .await
    }

    /// Send `message` to `destination`, flooding until it gets there.
    pub async fn direct(
        &self,
        destination: NodeId,
        message: Value,
    ) -> Result<PacketId, NetworkError> {
        self.request(|reply| Command::Direct {
            destination,
            message,
            reply,
        })
        .await
    }

    /// Drop every connection to the neighbor `node_id`. A `Disconnect`
    /// event is raised locally; the peer sees EOF and raises its own.
    pub async fn disconnect(&self, node_id: &NodeId) -> Result<(), NetworkError> {
        let node_id = node_id.clone();
        self.request(|reply| Command::Disconnect { node_id, reply })
            .await?
    }

    /// Stop accepting new connections. Existing links stay up, and
    /// [`listen`](Self::listen) may be called again. Returns the address
    /// that was being listened on, if any.
    pub async fn stop_listening(&self) -> Result<Option<SocketAddr>, NetworkError> {
        self.request(|reply| Command::StopListening { reply }).await
    }

    /// Identities of the current neighbors.
    pub async fn neighbors(&self) -> Result<Neighbors, NetworkError> {
        self.request(|reply| Command::Neighbors { reply }).await
    }

    /// Current neighbors with connection timestamps.
    pub async fn neighbor_info(&self) -> Result<Vec<NeighborInfo>, NetworkError> {
        self.request(|reply| Command::NeighborInfo { reply }).await
    }

    /// Stop the listener and drop every connection. Safe to call twice.
    pub async fn close(&self) {
        if self.request(|reply| Command::Close { reply }).await.is_ok() {
            info!("Overlay node {} closed", self.id);
        }
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, NetworkError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(make(reply_tx))
            .map_err(|_| NetworkError::NotRunning)?;
        reply_rx.await.map_err(|_| NetworkError::NotRunning)
    }
}

// ---------------------------------------------------------------------------
// Event loop
// ---------------------------------------------------------------------------

struct EventLoop {
    id: NodeId,
    config: NodeConfig,
    connections: ConnectionRegistry,
    neighbors: NeighborTable,
    router: Router,
    events: broadcast::Sender<NodeEvent>,
    transport_tx: mpsc::Sender<TransportEvent>,
    transport_rx: mpsc::Receiver<TransportEvent>,
    listener: Option<(SocketAddr, broadcast::Sender<()>)>,
}

impl EventLoop {
    fn new(id: NodeId, config: &NodeConfig, events: broadcast::Sender<NodeEvent>) -> Self {
        let (transport_tx, transport_rx) = mpsc::channel(256);
        Self {
            router: Router::new(id.clone(), config.max_ttl, config.seen_ttl),
            connections: ConnectionRegistry::new(transport_tx.clone(), config.max_frame_bytes),
            neighbors: NeighborTable::new(),
            id,
            config: config.clone(),
            events,
            transport_tx,
            transport_rx,
            listener: None,
        }
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut prune =
            tokio::time::interval(self.config.prune_interval.max(Duration::from_secs(1)));

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Close { reply }) => {
                        self.shutdown();
                        commands.close();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        debug!("All handles dropped");
                        self.shutdown();
                        break;
                    }
                },

                Some(event) = self.transport_rx.recv() => self.handle_transport(event),

                _ = prune.tick() => {
                    self.router.prune(Instant::now());
                }
            }
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Listen { listener, reply } => {
                let _ = reply.send(self.start_listener(listener));
            }
            Command::Register {
                stream,
                addr,
                reply,
            } => {
                let _ = reply.send(self.new_connection(stream, addr));
            }
            Command::Broadcast { message, reply } => {
                let packet = self.router.originate_broadcast(message);
                self.flood(&packet);
                let _ = reply.send(packet.id);
            }
            Command::Direct {
                destination,
                message,
                reply,
            } => {
                if destination == self.id {
                    self.publish(NodeEvent::Direct {
                        origin: self.id.clone(),
                        message,
                    });
                    let _ = reply.send(PacketId::generate());
                    return;
                }
                let packet = self.router.originate_direct(destination, message);
                self.flood(&packet);
                let _ = reply.send(packet.id);
            }
            Command::Disconnect { node_id, reply } => {
                let _ = reply.send(self.disconnect(node_id));
            }
            Command::StopListening { reply } => {
                let _ = reply.send(self.stop_listener());
            }
            Command::Neighbors { reply } => {
                let _ = reply.send(self.neighbors.ids());
            }
            Command::NeighborInfo { reply } => {
                let _ = reply.send(self.neighbors.list());
            }
            Command::Close { reply } => {
                // Handled in `run`.
                let _ = reply.send(());
            }
        }
    }

    fn start_listener(&mut self, listener: TcpListener) -> Result<SocketAddr, NetworkError> {
        if let Some((addr, _)) = &self.listener {
            return Err(NetworkError::AlreadyListening(*addr));
        }
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(transport::accept_loop(
            listener,
            self.transport_tx.clone(),
            shutdown_rx,
        ));
        self.listener = Some((addr, shutdown_tx));
        Ok(addr)
    }

    fn stop_listener(&mut self) -> Option<SocketAddr> {
        let (addr, shutdown_tx) = self.listener.take()?;
        debug!("Stopping listener on {addr}");
        let _ = shutdown_tx.send(());
        Some(addr)
    }

    fn shutdown(&mut self) {
        self.stop_listener();
        self.connections.close_all();
        self.neighbors.clear();
    }

    // -- Transport layer ----------------------------------------------------

    fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Accepted { stream, addr } => {
                self.new_connection(stream, addr);
            }
            TransportEvent::Frame { connection, frame } => match frame {
                Ok(value) => self.handle_frame(connection, value),
                Err(e) => {
                    self.fault(FaultKind::Decode, format!("connection {connection}: {e}"));
                }
            },
            TransportEvent::Closed { connection } => self.connection_closed(connection),
        }
    }

    /// Register a socket and greet the peer with our identity.
    fn new_connection(&mut self, stream: TcpStream, addr: SocketAddr) -> ConnectionId {
        let connection = self.connections.register(stream, addr);
        let handshake = WireMessage::Handshake(Handshake {
            node_id: self.id.clone(),
        });
        if let Err(e) = self.connections.send(&connection, &handshake) {
            self.fault(FaultKind::Transport, format!("handshake to {addr}: {e}"));
        }
        connection
    }

    fn connection_closed(&mut self, connection: ConnectionId) {
        // Resolve the identity before the registry forgets the connection.
        let lost = self.neighbors.connection_closed(&connection);
        if let Some(addr) = self.connections.remove(&connection) {
            debug!("Connection {connection} to {addr} closed");
        }
        if let Some(node_id) = lost {
            info!("Neighbor {node_id} disconnected");
            self.publish(NodeEvent::Disconnect { node_id });
        }
    }

    fn disconnect(&mut self, node_id: NodeId) -> Result<(), NetworkError> {
        if !self.neighbors.contains(&node_id) {
            return Err(NetworkError::PeerNotFound(node_id));
        }
        let mut lost = None;
        for connection in self.neighbors.connections_of(&node_id) {
            lost = lost.or(self.neighbors.connection_closed(&connection));
            self.connections.remove(&connection);
        }
        if let Some(node_id) = lost {
            info!("Disconnected from neighbor {node_id}");
            self.publish(NodeEvent::Disconnect { node_id });
        }
        Ok(())
    }

    // -- Identity layer -----------------------------------------------------

    fn handle_frame(&mut self, connection: ConnectionId, value: Value) {
        let message = match WireMessage::from_value(value) {
            Ok(message) => message,
            Err(e) => {
                self.fault(
                    FaultKind::Protocol,
                    format!("connection {connection} sent an unknown frame: {e}"),
                );
                return;
            }
        };

        match message {
            WireMessage::Handshake(Handshake { node_id }) => {
                self.handle_handshake(connection, node_id)
            }
            WireMessage::Message(packet) => match self.neighbors.resolve(&connection).cloned() {
                Some(from) => {
                    self.neighbors.touch(&from);
                    self.handle_packet(from, packet);
                }
                None => {
                    let err = NetworkError::UnrecognizedConnection(connection);
                    self.fault(FaultKind::Protocol, err.to_string());
                }
            },
        }
    }

    fn handle_handshake(&mut self, connection: ConnectionId, node_id: NodeId) {
        if node_id == self.id {
            warn!("Connection {connection} leads back to this node, dropping it");
            self.connections.remove(&connection);
            self.fault(FaultKind::Protocol, "connected to self".to_string());
            return;
        }

        match self.neighbors.handshake(node_id.clone(), connection) {
            Ok(Handshaken::New) => {
                info!("Neighbor {node_id} connected");
                self.publish(NodeEvent::Connect { node_id });
            }
            Ok(Handshaken::Replaced(old)) => {
                debug!("Neighbor {node_id} moved off connection {old}");
            }
            Ok(Handshaken::Unchanged) => {}
            Err(e) => self.fault(FaultKind::Protocol, e.to_string()),
        }
    }

    /// Send a routed packet to one neighbor.
    fn send_to_node(&self, node_id: &NodeId, packet: &RoutedPacket) -> Result<(), NetworkError> {
        let connection = self.neighbors.connection_for(node_id)?;
        self.connections
            .send(connection, &WireMessage::Message(packet.clone()))
    }

    // -- Routing layer ------------------------------------------------------

    fn handle_packet(&mut self, from: NodeId, packet: RoutedPacket) {
        debug!("Packet {} from neighbor {from}", packet.id);
        let verdict = self.router.handle(packet, Instant::now());
        if let Some(event) = verdict.deliver {
            self.publish(event);
        }
        if let Some(packet) = verdict.forward {
            self.flood(&packet);
        }
    }

    /// Send `packet` to every neighbor. Returns how many sends were queued.
    fn flood(&self, packet: &RoutedPacket) -> usize {
        let mut sent = 0;
        for node_id in &self.neighbors.ids() {
            match self.send_to_node(node_id, packet) {
                Ok(()) => sent += 1,
                Err(e) => {
                    self.fault(FaultKind::Transport, format!("send to {node_id}: {e}"));
                }
            }
        }
        debug!("Packet {} (ttl {}) sent to {sent} neighbors", packet.id, packet.ttl);
        sent
    }

    fn publish(&self, event: NodeEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn fault(&self, kind: FaultKind, detail: String) {
        warn!("{kind:?} fault: {detail}");
        self.publish(NodeEvent::Fault { kind, detail });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
