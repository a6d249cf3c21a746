use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::{lookup_host, TcpStream, ToSocketAddrs};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::buffer::{BufferPools, Message};
use crate::network::{
    apply_stream_options, build_socket, Connection, HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED,
};
use crate::service::peer::{Peer, PeerCore};
use crate::service::{MessageHandler, TransportConfig};
use crate::{TransportError, TransportResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionStatus {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionStatus {
    fn from_u8(value: u8) -> ConnectionStatus {
        match value {
            1 => ConnectionStatus::Connecting,
            2 => ConnectionStatus::Connected,
            _ => ConnectionStatus::Disconnected,
        }
    }
}

/// The initiating side of the transport: one connection slot (ID 0), reused
/// across reconnects.
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    config: TransportConfig,
    core: PeerCore,
    conn: Arc<Connection>,
    status: AtomicU8,
}

impl Client {
    pub fn new(config: TransportConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self::with_pools(config, handler, BufferPools::new())
    }

    pub fn with_pools(
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
        pools: BufferPools,
    ) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                config,
                core: PeerCore::new(pools, handler),
                conn: Arc::new(Connection::new(0)),
                status: AtomicU8::new(ConnectionStatus::Disconnected as u8),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Pools backing this client, handy for popping messages to send.
    pub fn pools(&self) -> &BufferPools {
        self.inner.core.pools()
    }

    /// Connects, waits for the server's handshake byte and starts the
    /// session. A rejection byte surfaces as
    /// [`TransportError::ConnectionRejected`]; the slot stays reusable after
    /// any failure.
    pub async fn connect<A: ToSocketAddrs>(&self, addr: A) -> TransportResult<()> {
        if self
            .inner
            .status
            .compare_exchange(
                ConnectionStatus::Disconnected as u8,
                ConnectionStatus::Connecting as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(TransportError::IllegalState(
                "client is already connected or connecting".into(),
            ));
        }

        match self.connect_inner(addr).await {
            Ok((stream, remote)) => {
                debug!("connected to {}", remote);
                self.inner.core.handler().on_connected(self.inner.conn.id());
                self.inner
                    .core
                    .start_session(self.inner.conn.clone(), stream, remote);
                self.inner
                    .status
                    .store(ConnectionStatus::Connected as u8, Ordering::Release);

                // track remote-initiated teardown too; a watcher that fires
                // after a reconnect sees a live slot and leaves status alone
                let inner = self.inner.clone();
                let conn = self.inner.conn.clone();
                tokio::spawn(async move {
                    conn.gate().wait().await;
                    if !conn.is_connected() {
                        let _ = inner.status.compare_exchange(
                            ConnectionStatus::Connected as u8,
                            ConnectionStatus::Disconnected as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        );
                    }
                });
                Ok(())
            }
            Err(err) => {
                warn!("failed to connect: {}", err);
                self.inner
                    .status
                    .store(ConnectionStatus::Disconnected as u8, Ordering::Release);
                Err(err)
            }
        }
    }

    async fn connect_inner<A: ToSocketAddrs>(
        &self,
        addr: A,
    ) -> TransportResult<(TcpStream, SocketAddr)> {
        let remote = lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| TransportError::InvalidAddress("host resolved to nothing".into()))?;

        let connect_timeout = self.inner.config.connect_timeout();
        let socket = build_socket(&remote, &self.inner.config)?;
        let mut stream = timeout(connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        apply_stream_options(&stream, &self.inner.config)?;

        // the logical connection exists only after the accept byte
        let verdict = timeout(connect_timeout, stream.read_u8())
            .await
            .map_err(|_| TransportError::ConnectTimeout)??;
        match verdict {
            HANDSHAKE_ACCEPTED => Ok((stream, remote)),
            HANDSHAKE_REJECTED => Err(TransportError::ConnectionRejected),
            other => Err(TransportError::IllegalState(format!(
                "unexpected handshake byte: {}",
                other
            ))),
        }
    }

    /// Sends to the server. Same contract as [`Peer::send`].
    pub fn send(&self, message: Message) -> bool {
        self.inner.core.send_to(&self.inner.conn, message)
    }

    /// Tears the connection down and waits until both session tasks have
    /// exited; the one legitimate blocking wait in the API.
    pub async fn disconnect(&self) {
        self.inner.conn.teardown();
        self.inner.conn.gate().wait().await;
        self.inner
            .status
            .store(ConnectionStatus::Disconnected as u8, Ordering::Release);
    }
}

impl Peer for Client {
    /// A client has exactly one connection; any other ID is unknown and
    /// behaves like a missing connection.
    fn send(&self, connection_id: u32, message: Message) -> bool {
        if connection_id != self.inner.conn.id() {
            return false;
        }
        Client::send(self, message)
    }

    fn disconnect(&self, connection_id: u32) {
        if connection_id == self.inner.conn.id() {
            self.inner.conn.teardown();
        }
    }

    fn remote_address(&self, connection_id: u32) -> Option<SocketAddr> {
        if connection_id != self.inner.conn.id() {
            return None;
        }
        self.inner.conn.remote_addr()
    }
}
