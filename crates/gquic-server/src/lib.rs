//! The gQUIC server.
//!
//! An acceptor task owns the UDP socket and routes inbound datagrams to
//! per-connection tasks by connection id. Each connection task owns its
//! [`Session`] exclusively; the shared pieces (server config, STK key) are
//! read-only behind an `Arc`.

mod alt_svc;
mod session;

pub use alt_svc::{quic_headers, AltSvcError, QuicHeaders};
pub use session::{CloseReason, Session};

use dashmap::DashMap;
use gquic_core::protocol::highest_supported_version;
use gquic_core::{ConnectionId, PublicHeader, VersionNumber};
use gquic_tls::ServerConfig;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, warn};

/// Inbound datagrams queued per connection before the task applies
/// backpressure by simply dropping (UDP semantics).
const CONNECTION_QUEUE_SIZE: usize = 32;

const MAX_DATAGRAM_SIZE: usize = 65_535;

struct InboundDatagram {
    peer: SocketAddr,
    payload: Vec<u8>,
}

/// UDP acceptor and connection router.
pub struct Server {
    socket: Arc<UdpSocket>,
    scfg: Arc<ServerConfig>,
    version: VersionNumber,
    connections: Arc<DashMap<ConnectionId, mpsc::Sender<InboundDatagram>>>,
}

impl Server {
    /// Bind the UDP socket and prepare to accept connections.
    pub async fn bind(addr: SocketAddr, scfg: Arc<ServerConfig>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(target: "gquic::server", addr = %socket.local_addr()?, "listening");
        Ok(Self {
            socket: Arc::new(socket),
            scfg,
            version: highest_supported_version(),
            connections: Arc::new(DashMap::new()),
        })
    }

    /// Override the version new connections are handled with.
    pub fn with_version(mut self, version: VersionNumber) -> Self {
        self.version = version;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Number of live connections, for observability.
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Receive datagrams forever, spawning a task per new connection id.
    pub async fn run(&self) -> io::Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, peer) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(err) => {
                    error!(target: "gquic::server", error = %err, "udp receive failed");
                    time::sleep(std::time::Duration::from_millis(50)).await;
                    continue;
                }
            };
            let payload = buf[..len].to_vec();

            let connection_id = match PublicHeader::peek_connection_id(&payload) {
                Ok(connection_id) => connection_id,
                Err(err) => {
                    debug!(target: "gquic::server", %peer, error = %err, "dropping undecodable datagram");
                    continue;
                }
            };

            let datagram = InboundDatagram { peer, payload };
            if let Some(sender) = self.connections.get(&connection_id) {
                if sender.try_send(datagram).is_err() {
                    debug!(
                        target: "gquic::server",
                        connection_id,
                        "connection queue full or task gone; dropping datagram"
                    );
                }
                continue;
            }

            self.spawn_connection(connection_id, datagram);
        }
    }

    fn spawn_connection(&self, connection_id: ConnectionId, first: InboundDatagram) {
        let (tx, rx) = mpsc::channel(CONNECTION_QUEUE_SIZE);
        let peer = first.peer;
        if tx.try_send(first).is_err() {
            return;
        }
        self.connections.insert(connection_id, tx);
        info!(target: "gquic::server", connection_id, %peer, "new connection");

        let session = Session::new(connection_id, peer.ip(), self.version, Arc::clone(&self.scfg));
        let socket = Arc::clone(&self.socket);
        let connections = Arc::clone(&self.connections);
        tokio::spawn(async move {
            connection_task(session, socket, rx).await;
            connections.remove(&connection_id);
        });
    }
}

async fn connection_task(
    mut session: Session,
    socket: Arc<UdpSocket>,
    mut inbox: mpsc::Receiver<InboundDatagram>,
) {
    let connection_id = session.connection_id();
    loop {
        let datagram = match time::timeout(session.idle_timeout(), inbox.recv()).await {
            Ok(Some(datagram)) => datagram,
            Ok(None) => break,
            Err(_) => {
                debug!(target: "gquic::server", connection_id, "idle timeout");
                break;
            }
        };

        let responses = session.handle_datagram(&datagram.payload);
        for response in responses {
            if let Err(err) = socket.send_to(&response, datagram.peer).await {
                warn!(target: "gquic::server", connection_id, error = %err, "send failed");
            }
        }

        if session.is_closed() {
            if let Some(reason) = session.close_reason() {
                info!(target: "gquic::server", connection_id, reason = %reason, "connection closed");
            }
            break;
        }
    }
    // Dropping the session releases the sorters and zeroizes key material.
}

#[cfg(test)]
mod tests {
    use super::*;
    use gquic_tls::{Curve25519KeyExchange, Ed25519ProofSigner};

    fn scfg() -> Arc<ServerConfig> {
        Arc::new(ServerConfig::new(
            Box::new(Curve25519KeyExchange::new()),
            Arc::new(Ed25519ProofSigner::new(b"chain".to_vec(), b"leaf".to_vec())),
        ))
    }

    #[tokio::test]
    async fn binds_to_an_ephemeral_port() {
        let server = Server::bind("127.0.0.1:0".parse().expect("addr"), scfg())
            .await
            .expect("bind");
        let addr = server.local_addr().expect("local addr");
        assert_ne!(addr.port(), 0);
        assert_eq!(server.connection_count(), 0);
    }
}
