use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use crate::buffer::{BufferPools, Message};
use crate::network::{Connection, FrameDecoder, SendFrame, Session};
use crate::service::MessageHandler;
use crate::TransportResult;

/// Send/receive surface shared by [`Server`](crate::Server) and
/// [`Client`](crate::Client).
pub trait Peer {
    /// Queues `message` for delivery on one connection. Returns `false`
    /// when the connection is unknown, not connected, or the message is
    /// empty; the caller's handle is consumed (released) either way. A
    /// `true` return means the writer task owns the frame now; a write
    /// failure later surfaces as a `Disconnected` event, never as a retry.
    fn send(&self, connection_id: u32, message: Message) -> bool;

    /// Fans one message out to several connections without copying it:
    /// every recipient's frame shares the same pooled chunks. Returns
    /// `true` when at least one recipient accepted the message.
    fn send_multi(&self, connection_ids: &[u32], message: Message) -> bool {
        let mut accepted = false;
        for &connection_id in connection_ids {
            accepted |= self.send(connection_id, message.retain());
        }
        message.release();
        accepted
    }

    /// Begins teardown of one connection. Idempotent; completion is
    /// reported through the single `Disconnected` event.
    fn disconnect(&self, connection_id: u32);

    fn remote_address(&self, connection_id: u32) -> Option<SocketAddr>;
}

/// The orchestration shared by server and client: buffer pools, the event
/// handler, and the per-session reader/writer tasks.
pub(crate) struct PeerCore {
    pools: BufferPools,
    handler: Arc<dyn MessageHandler>,
}

impl PeerCore {
    pub(crate) fn new(pools: BufferPools, handler: Arc<dyn MessageHandler>) -> Self {
        PeerCore { pools, handler }
    }

    pub(crate) fn pools(&self) -> &BufferPools {
        &self.pools
    }

    pub(crate) fn handler(&self) -> &Arc<dyn MessageHandler> {
        &self.handler
    }

    /// Installs a session on `conn` and spawns its reader and writer tasks.
    /// The gate is seeded with one count per task; each task releases its
    /// count as it exits, so `conn.gate().wait()` is the quiescence point.
    pub(crate) fn start_session(&self, conn: Arc<Connection>, stream: TcpStream, remote: SocketAddr) {
        let (send_tx, send_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let writer_shutdown = shutdown_tx.subscribe();
        conn.begin_session(
            Session {
                send_tx,
                shutdown_tx,
                remote,
            },
            2,
        );
        let (reader, writer) = stream.into_split();

        let writer_conn = conn.clone();
        tokio::spawn(async move {
            if let Err(e) = write_loop(writer, send_rx, writer_shutdown).await {
                debug!(connection_id = writer_conn.id(), "send failed: {}", e);
                writer_conn.teardown();
            }
            writer_conn.gate().release();
        });

        let handler = self.handler.clone();
        let decoder = FrameDecoder::new(self.pools.clone());
        tokio::spawn(async move {
            if let Err(e) = read_loop(reader, decoder, &conn, handler.as_ref(), shutdown_rx).await {
                debug!(connection_id = conn.id(), "receive failed: {}", e);
            }
            conn.teardown();
            // the reader runs exactly once per session, so this fires the
            // one and only Disconnected for it no matter which side of the
            // race initiated teardown
            handler.on_disconnected(conn.id());
            conn.gate().release();
        });
    }

    /// Hands a message to a connection's writer. Empty messages are
    /// rejected; the handle is consumed regardless.
    pub(crate) fn send_to(&self, conn: &Connection, message: Message) -> bool {
        if message.position() == 0 {
            return false;
        }
        conn.enqueue_send(message)
    }
}

/// Closed receive loop: read into the decoder's next region, account for the
/// bytes, emit completed messages, re-arm. Fast synchronous completions just
/// go around the loop again.
async fn read_loop(
    mut reader: OwnedReadHalf,
    mut decoder: FrameDecoder,
    conn: &Connection,
    handler: &dyn MessageHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TransportResult<()> {
    loop {
        let region = decoder.next_region()?;
        let count = tokio::select! {
            result = reader.read(region) => result?,
            _ = shutdown_rx.recv() => return Ok(()),
        };
        if count == 0 {
            // peer closed the connection; a partial frame is abandoned and
            // its chunks return to the pool with the decoder
            return Ok(());
        }
        if let Some(message) = decoder.advance(count)? {
            handler.on_data_received(conn.id(), message);
        }
    }
}

/// Drains the send queue, one frame at a time, so writes on a connection
/// never interleave. Each message is released when its frame is dropped,
/// success or failure alike. The shutdown branch also covers a write stalled
/// on a peer that stopped reading; teardown ends it without waiting for the
/// OS retransmit timeout.
async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut send_rx: mpsc::UnboundedReceiver<Message>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> TransportResult<()> {
    loop {
        let message = tokio::select! {
            message = send_rx.recv() => match message {
                Some(message) => message,
                // queue closed by teardown; messages still queued are
                // dropped and released with the receiver
                None => return Ok(()),
            },
            _ = shutdown_rx.recv() => return Ok(()),
        };
        let mut frame = SendFrame::bind(message);
        tokio::select! {
            result = writer.write_all_buf(&mut frame) => result?,
            _ = shutdown_rx.recv() => return Ok(()),
        }
    }
}
