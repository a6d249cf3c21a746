use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};
use tracing::{debug, error, info};

use crate::buffer::{BufferPools, Message};
use crate::network::{
    apply_stream_options, build_socket, Connection, HANDSHAKE_ACCEPTED, HANDSHAKE_REJECTED,
};
use crate::service::peer::{Peer, PeerCore};
use crate::service::{MessageHandler, TransportConfig};
use crate::{TransportError, TransportResult};

/// The accepting side of the transport.
///
/// Connection slots live in a grow-only list and their IDs (starting at 1)
/// are recycled through a free list once a slot quiesces, so churned
/// connections reuse slots instead of allocating new ones. Admission beyond
/// `max_connections` is answered with the handshake rejection byte.
pub struct Server {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    config: TransportConfig,
    core: PeerCore,
    // grow-only; slot for connection ID n lives at index n-1
    slots: Mutex<Vec<Arc<Connection>>>,
    free_ids: Mutex<VecDeque<u32>>,
    connection_count: AtomicUsize,
    running: AtomicBool,
    state: Mutex<Option<RunningState>>,
}

struct RunningState {
    notify_shutdown: broadcast::Sender<()>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl Server {
    pub fn new(config: TransportConfig, handler: Arc<dyn MessageHandler>) -> Self {
        Self::with_pools(config, handler, BufferPools::new())
    }

    /// Builds a server over caller-owned pools, e.g. to share them with a
    /// client in the same process or to instrument them in tests.
    pub fn with_pools(
        config: TransportConfig,
        handler: Arc<dyn MessageHandler>,
        pools: BufferPools,
    ) -> Self {
        Server {
            inner: Arc::new(ServerInner {
                config,
                core: PeerCore::new(pools, handler),
                slots: Mutex::new(Vec::new()),
                free_ids: Mutex::new(VecDeque::new()),
                connection_count: AtomicUsize::new(0),
                running: AtomicBool::new(false),
                state: Mutex::new(None),
            }),
        }
    }

    /// Binds the listen socket and spawns the accept loop. Returns the bound
    /// address, which is the way to learn the port when binding port 0.
    pub async fn start(&self, addr: SocketAddr) -> TransportResult<SocketAddr> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(TransportError::IllegalState(
                "server is already running".into(),
            ));
        }

        let socket = build_socket(&addr, &self.inner.config)?;
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let listener = socket.listen(self.inner.config.backlog)?;
        let local_addr = listener.local_addr()?;
        info!("server listening on {}", local_addr);

        let (notify_shutdown, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(run_accept_loop(self.inner.clone(), listener, shutdown_rx));
        *self.inner.state.lock() = Some(RunningState {
            notify_shutdown,
            local_addr,
            accept_task,
        });
        Ok(local_addr)
    }

    /// Stops accepting, tears down every live connection and waits for all
    /// of them to quiesce.
    pub async fn stop(&self) {
        if self
            .inner
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let state = self.inner.state.lock().take();
        if let Some(state) = state {
            // accept loop exits and drops the listener
            let _ = state.notify_shutdown.send(());
            // an admission already in flight finishes before the loop exits,
            // so the slot snapshot below cannot miss it
            let _ = state.accept_task.await;
        }

        let slots: Vec<Arc<Connection>> = self.inner.slots.lock().clone();
        for conn in &slots {
            conn.teardown();
        }
        for conn in &slots {
            conn.gate().wait().await;
        }
        info!("server stopped");
    }

    /// Pools backing this server, handy for popping messages to send.
    pub fn pools(&self) -> &BufferPools {
        self.inner.core.pools()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connection_count.load(Ordering::Acquire)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.state.lock().as_ref().map(|state| state.local_addr)
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    fn slot(&self, connection_id: u32) -> Option<Arc<Connection>> {
        if connection_id == 0 {
            return None;
        }
        self.inner
            .slots
            .lock()
            .get(connection_id as usize - 1)
            .cloned()
    }
}

impl Peer for Server {
    fn send(&self, connection_id: u32, message: Message) -> bool {
        match self.slot(connection_id) {
            Some(conn) => self.inner.core.send_to(&conn, message),
            None => false,
        }
    }

    fn disconnect(&self, connection_id: u32) {
        if let Some(conn) = self.slot(connection_id) {
            conn.teardown();
        }
    }

    fn remote_address(&self, connection_id: u32) -> Option<SocketAddr> {
        self.slot(connection_id)?.remote_addr()
    }
}

impl ServerInner {
    /// Answers the handshake and, when admitted, starts the session on a
    /// recycled or fresh slot.
    async fn admit(self: &Arc<Self>, mut stream: TcpStream, remote: SocketAddr) -> TransportResult<()> {
        if self.connection_count.load(Ordering::Acquire) >= self.config.max_connections {
            debug!("rejecting {}: at capacity", remote);
            stream.write_u8(HANDSHAKE_REJECTED).await?;
            return Ok(());
        }

        apply_stream_options(&stream, &self.config)?;
        stream.write_u8(HANDSHAKE_ACCEPTED).await?;

        let conn = self.checkout_slot();
        let count = self.connection_count.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(
            connection_id = conn.id(),
            "client {} connected, current count: {}", remote, count
        );

        self.core.handler().on_connected(conn.id());
        self.core.start_session(conn.clone(), stream, remote);

        // recycle the slot once both session tasks have exited
        let inner = self.clone();
        tokio::spawn(async move {
            conn.gate().wait().await;
            inner.recycle_slot(conn.id());
        });
        Ok(())
    }

    fn checkout_slot(&self) -> Arc<Connection> {
        if let Some(id) = self.free_ids.lock().pop_front() {
            return self.slots.lock()[id as usize - 1].clone();
        }
        let mut slots = self.slots.lock();
        let conn = Arc::new(Connection::new(slots.len() as u32 + 1));
        slots.push(conn.clone());
        conn
    }

    fn recycle_slot(&self, connection_id: u32) {
        self.free_ids.lock().push_back(connection_id);
        let count = self.connection_count.fetch_sub(1, Ordering::AcqRel) - 1;
        debug!(
            connection_id,
            "client disconnected, current count: {}", count
        );
    }
}

async fn run_accept_loop(
    inner: Arc<ServerInner>,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = shutdown_rx.recv() => {
                debug!("accept loop received shutdown signal");
                break;
            }
            result = accept_with_backoff(&listener) => result,
        };
        let (stream, remote) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                error!("accept failed permanently: {}", err);
                break;
            }
        };
        if let Err(err) = inner.admit(stream, remote).await {
            debug!("admission of {} failed: {}", remote, err);
        }
    }
    debug!("accept loop exited");
}

async fn accept_with_backoff(listener: &TcpListener) -> TransportResult<(TcpStream, SocketAddr)> {
    let mut backoff = 1;

    loop {
        match listener.accept().await {
            Ok(pair) => return Ok(pair),
            Err(err) => {
                if backoff > 64 {
                    return Err(err.into());
                }
            }
        }

        time::sleep(Duration::from_secs(backoff)).await;
        backoff *= 2;
    }
}
