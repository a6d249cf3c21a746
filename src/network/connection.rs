use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tracing::warn;

use crate::buffer::Message;
use crate::service::TransportConfig;
use crate::TransportResult;

/// Count-down over a connection's in-flight session tasks.
///
/// Seeded with the number of tasks a session spawns; each task releases one
/// count as it observes teardown and exits. `wait` resolves once the count
/// hits zero, which is the signal that the slot is quiescent and safe to
/// recycle or hand back to a blocking disconnect caller.
#[derive(Debug)]
pub(crate) struct QuiesceGate {
    count: AtomicUsize,
    notify: tokio::sync::Notify,
}

impl QuiesceGate {
    pub(crate) fn new() -> Self {
        QuiesceGate {
            count: AtomicUsize::new(0),
            notify: tokio::sync::Notify::new(),
        }
    }

    pub(crate) fn reset(&self, count: usize) {
        self.count.store(count, Ordering::Release);
        if count == 0 {
            self.notify.notify_waiters();
        }
    }

    /// Releases one count. Releasing below zero is a bug in the session
    /// bookkeeping; it panics in debug builds and saturates in release.
    pub(crate) fn release(&self) -> usize {
        let updated = self
            .count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| {
                count.checked_sub(1)
            });
        match updated {
            Ok(previous) => {
                if previous == 1 {
                    self.notify.notify_waiters();
                }
                previous - 1
            }
            Err(_) => {
                debug_assert!(false, "quiesce gate released below zero");
                warn!("quiesce gate released below zero");
                0
            }
        }
    }

    pub(crate) async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.count.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Per-session handles, replaced on every connect.
pub(crate) struct Session {
    pub(crate) send_tx: mpsc::UnboundedSender<Message>,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
    pub(crate) remote: SocketAddr,
}

/// One connection slot: the persistent per-peer state, reused across
/// reconnects so high reconnect rates do not churn slot allocations.
///
/// The slot owns no socket between sessions; tokio streams cannot be reset
/// in place, so each session builds a fresh socket with identical options
/// while the ID, gate and queues carry over.
pub(crate) struct Connection {
    id: u32,
    connected: AtomicBool,
    gate: QuiesceGate,
    session: Mutex<Option<Session>>,
}

impl Connection {
    pub(crate) fn new(id: u32) -> Self {
        Connection {
            id,
            connected: AtomicBool::new(false),
            gate: QuiesceGate::new(),
            session: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Installs the new session and seeds the gate with its task count.
    pub(crate) fn begin_session(&self, session: Session, task_count: usize) {
        self.gate.reset(task_count);
        *self.session.lock() = Some(session);
        self.connected.store(true, Ordering::Release);
    }

    /// The teardown compare-and-swap. Exactly one caller per session wins;
    /// the winner drops the send queue and signals the per-session shutdown,
    /// which ends the reader and the writer, including a write blocked on a
    /// peer that stopped reading. Everyone else observes an
    /// already-disconnected slot.
    pub(crate) fn teardown(&self) -> bool {
        if self
            .connected
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(session) = self.session.lock().take() {
            // receiver-less send just wakes the reader; it may already be gone
            let _ = session.shutdown_tx.send(());
        }
        true
    }

    /// Hands a retained message to the writer task. `false` means the slot
    /// is not connected; the handle is dropped (released) either way.
    pub(crate) fn enqueue_send(&self, message: Message) -> bool {
        if !self.is_connected() {
            return false;
        }
        let session = self.session.lock();
        match session.as_ref() {
            Some(session) => session.send_tx.send(message).is_ok(),
            None => false,
        }
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        if !self.is_connected() {
            return None;
        }
        self.session.lock().as_ref().map(|session| session.remote)
    }

    pub(crate) fn gate(&self) -> &QuiesceGate {
        &self.gate
    }
}

/// Builds a socket carrying the configured options. Used for both the listen
/// socket and each outbound connect.
pub(crate) fn build_socket(addr: &SocketAddr, config: &TransportConfig) -> TransportResult<TcpSocket> {
    let socket = match addr {
        SocketAddr::V4(_) => TcpSocket::new_v4()?,
        SocketAddr::V6(_) => TcpSocket::new_v6()?,
    };
    apply_socket_options(&socket, config)?;
    Ok(socket)
}

pub(crate) fn apply_socket_options(
    socket: &TcpSocket,
    config: &TransportConfig,
) -> TransportResult<()> {
    if config.keep_alive.enabled {
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(config.keep_alive.idle_secs as u64))
            .with_interval(Duration::from_secs(config.keep_alive.interval_secs as u64));
        socket2::SockRef::from(socket).set_tcp_keepalive(&keepalive)?;
    }
    socket.set_send_buffer_size(config.send_buffer_size)?;
    socket.set_recv_buffer_size(config.receive_buffer_size)?;
    Ok(())
}

pub(crate) fn apply_stream_options(
    stream: &TcpStream,
    config: &TransportConfig,
) -> TransportResult<()> {
    stream.set_nodelay(config.no_delay)?;
    Ok(())
}
