//! The dispatcher: one UDP socket, a connection table keyed by peer
//! endpoint, per-connection retransmit deadlines, and a fan-out observer
//! for `rrq`/`wrq`/`finish`/`error` events.

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

use crate::config::ServerConfig;
use crate::connection::{Connection, Kind, Outcome};
use crate::error::Result;
use crate::options::{self, MAX_BLOCK_SIZE};
use crate::packet::Packet;

/// Largest datagram we ever expect: 4-byte header + max blksize.
const MAX_PACKET: usize = 4 + MAX_BLOCK_SIZE;

type RequestCallback = Box<dyn FnMut(&mut Connection) + Send + Sync>;
type FinishCallback = Box<dyn FnMut(&Connection, &str) + Send + Sync>;
type ErrorCallback = Box<dyn FnMut(&str) + Send + Sync>;

/// The TFTP server dispatcher. Owns the single listening socket and the
/// connection table; runs as a single cooperative task.
pub struct Server {
    socket: UdpSocket,
    config: ServerConfig,
    connections: HashMap<SocketAddr, Connection>,
    deadlines: HashMap<SocketAddr, Instant>,
    on_rrq: Vec<RequestCallback>,
    on_wrq: Vec<RequestCallback>,
    on_finish: Vec<FinishCallback>,
    on_error: Vec<ErrorCallback>,
}

impl Server {
    /// Bind the UDP socket described by `config.listen`. Does not start
    /// the event loop; call [`Server::run`] for that.
    pub async fn bind(config: ServerConfig) -> Result<Self> {
        let addr = config.bind_addr()?;
        let socket = UdpSocket::bind(addr).await?;
        debug!(%addr, "tftp socket bound");
        Ok(Self {
            socket,
            config,
            connections: HashMap::new(),
            deadlines: HashMap::new(),
            on_rrq: Vec::new(),
            on_wrq: Vec::new(),
            on_finish: Vec::new(),
            on_error: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Register a callback invoked for every RRQ once a `Connection` has
    /// been constructed; the callback should call
    /// [`Connection::attach_handle`] (and optionally
    /// [`Connection::set_filesize`]) to serve the request.
    pub fn on_rrq(&mut self, callback: impl FnMut(&mut Connection) + Send + Sync + 'static) {
        self.on_rrq.push(Box::new(callback));
    }

    /// Register a callback invoked for every WRQ; the callback should
    /// attach a write handle.
    pub fn on_wrq(&mut self, callback: impl FnMut(&mut Connection) + Send + Sync + 'static) {
        self.on_wrq.push(Box::new(callback));
    }

    /// Register a callback invoked exactly once per connection when it
    /// terminates. `error` is empty on success.
    pub fn on_finish(&mut self, callback: impl FnMut(&Connection, &str) + Send + Sync + 'static) {
        self.on_finish.push(Box::new(callback));
    }

    /// Register a callback invoked for server-level problems that aren't
    /// tied to a specific connection.
    pub fn on_error(&mut self, callback: impl FnMut(&str) + Send + Sync + 'static) {
        self.on_error.push(Box::new(callback));
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Run the event loop until `shutdown` is set to `true`.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut buf = vec![0u8; MAX_PACKET];
        loop {
            let next_deadline = self.deadlines.values().min().copied();
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    let (n, peer) = result?;
                    self.on_datagram(peer, &buf[..n]).await;
                }
                _ = sleep_until_or_pending(next_deadline) => {
                    self.on_timer_tick().await;
                }
                _ = shutdown.changed() => {
                    debug!("shutdown requested, closing tftp socket");
                    break;
                }
            }
        }
        Ok(())
    }

    /// Run forever (no shutdown signal). Convenience for simple binaries.
    pub async fn run_forever(self) -> Result<()> {
        let (_tx, rx) = watch::channel(false);
        self.run(rx).await
    }

    async fn on_datagram(&mut self, peer: SocketAddr, bytes: &[u8]) {
        let packet = match Packet::decode(bytes) {
            Ok(p) => p,
            Err(e) => {
                self.emit_error(&format!("{peer}: bad packet: {e}"));
                return;
            }
        };

        match packet {
            Packet::Rrq { filename, mode, options } => {
                self.new_request(Kind::Rrq, peer, filename, mode, options).await;
            }
            Packet::Wrq { filename, mode, options } => {
                self.new_request(Kind::Wrq, peer, filename, mode, options).await;
            }
            other => self.existing_connection_packet(peer, other).await,
        }
    }

    async fn new_request(
        &mut self,
        kind: Kind,
        peer: SocketAddr,
        filename: String,
        mode: String,
        options: HashMap<String, String>,
    ) {
        let has_subscriber = match kind {
            Kind::Rrq => !self.on_rrq.is_empty(),
            Kind::Wrq => !self.on_wrq.is_empty(),
        };
        if !has_subscriber {
            self.emit_error("Cannot handle");
            return;
        }
        if self.connections.len() >= self.config.max_connections {
            self.emit_error("Max connections reached");
            return;
        }
        if self.connections.contains_key(&peer) {
            // A live connection already owns this endpoint; the new
            // request is reported rather than displacing it.
            self.emit_error(&format!("{peer}: request for endpoint with an active connection"));
            return;
        }

        let negotiated = options::negotiate(&options, self.config.retransmit_timeout);
        debug!(
            %peer,
            ?kind,
            blocksize = negotiated.blocksize,
            timeout = ?negotiated.timeout,
            any_negotiated = negotiated.any_negotiated(),
            "connection created"
        );
        let mut connection = Connection::new(
            kind,
            peer,
            filename,
            mode,
            options,
            negotiated,
            self.config.retransmit_timeout,
            self.config.retries,
        );

        let callbacks = match kind {
            Kind::Rrq => &mut self.on_rrq,
            Kind::Wrq => &mut self.on_wrq,
        };
        for callback in callbacks.iter_mut() {
            callback(&mut connection);
        }

        let outcome = connection.start();
        self.finish_or_requeue(peer, connection, outcome).await;
    }

    async fn existing_connection_packet(&mut self, peer: SocketAddr, packet: Packet) {
        let Some(mut connection) = self.connections.remove(&peer) else {
            self.emit_error(&format!("{peer}: unknown transfer ID"));
            return;
        };
        // Every received datagram resets the timer before dispatch, so a
        // retransmit can never race with work that was just acknowledged.
        self.deadlines.remove(&peer);

        let outcome = match (connection.kind, packet) {
            (Kind::Rrq, Packet::Ack { block }) => connection.receive_ack(block),
            (Kind::Wrq, Packet::Data { block, payload }) => connection.receive_data(block, payload),
            (Kind::Rrq, Packet::Data { .. }) | (Kind::Wrq, Packet::Ack { .. }) => {
                Some(connection.protocol_violation())
            }
            (_, Packet::Error { code, message }) => Some(connection.receive_error(code, message)),
            _ => Some(connection.unknown_opcode()),
        };

        match outcome {
            Some(outcome) => self.finish_or_requeue(peer, connection, outcome).await,
            None => {
                // Stale/duplicate packet: retries were already decremented
                // in place; put the connection back with a fresh deadline.
                let deadline = Instant::now() + Duration::from_secs(connection.timeout as u64);
                self.deadlines.insert(peer, deadline);
                self.connections.insert(peer, connection);
            }
        }
    }

    /// Send whatever the outcome calls for, then either keep the
    /// connection alive (refreshing its deadline) or remove it and fire
    /// `finish`.
    async fn finish_or_requeue(&mut self, peer: SocketAddr, mut connection: Connection, outcome: Outcome) {
        match outcome {
            Outcome::Send(packet) => {
                self.send(peer, &packet).await;
                let deadline = Instant::now() + Duration::from_secs(connection.timeout as u64);
                self.deadlines.insert(peer, deadline);
                self.connections.insert(peer, connection);
            }
            Outcome::Close { packet, error } => {
                if let Some(packet) = &packet {
                    self.send(peer, packet).await;
                }
                self.deadlines.remove(&peer);
                if error.is_empty() {
                    trace!(%peer, file = %connection.file, "transfer finished");
                } else {
                    warn!(%peer, file = %connection.file, %error, "transfer failed");
                }
                connection.error = error.clone();
                self.emit_finish(&connection, &error);
            }
        }
    }

    async fn on_timer_tick(&mut self) {
        let now = Instant::now();
        let fired: Vec<SocketAddr> = self
            .deadlines
            .iter()
            .filter(|&(_, &deadline)| deadline <= now)
            .map(|(peer, _)| *peer)
            .collect();

        for peer in fired {
            self.deadlines.remove(&peer);
            if let Some(mut connection) = self.connections.remove(&peer) {
                debug!(%peer, retries_left = connection.retries, lastop = ?connection.lastop, "retransmit attempt");
                let outcome = connection.retransmit();
                self.finish_or_requeue(peer, connection, outcome).await;
            }
        }
    }

    async fn send(&self, peer: SocketAddr, packet: &Packet) {
        if let Err(e) = self.socket.send_to(&packet.encode(), peer).await {
            warn!(%peer, opcode = %packet.opcode(), error = %e, "send failed");
        }
    }

    fn emit_finish(&mut self, connection: &Connection, error: &str) {
        for callback in self.on_finish.iter_mut() {
            callback(connection, error);
        }
    }

    fn emit_error(&mut self, message: &str) {
        warn!(%message, "server-level error");
        for callback in self.on_error.iter_mut() {
            callback(message);
        }
    }
}

async fn sleep_until_or_pending(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}
