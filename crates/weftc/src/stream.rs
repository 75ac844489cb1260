//! Per-stream bridges between the overlay and local endpoints.
//!
//! A [`DeviceStream`] is the registry's view of one logical stream: the
//! node-assigned ref, the dialing device, and the local peer the bytes go
//! to. Inbound-accepted streams write into a local TCP socket; outbound
//! streams opened by this client write into an in-process pipe drained by
//! an [`OverlayStream`] handle.

use std::io;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Mutex;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::debug;

use weft_common::base58;
use weft_common::types::DeviceId;

use crate::session::Session;

const STATE_OPENING: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_CLOSING: u8 = 2;
const STATE_CLOSED: u8 = 3;

/// Where a stream's inbound bytes are written.
pub(crate) enum StreamPeer {
    /// A local TCP service we dialed on behalf of the remote device.
    Tcp(tokio::sync::Mutex<OwnedWriteHalf>),
    /// An in-process pipe drained by an [`OverlayStream`].
    Pipe(Mutex<Option<mpsc::Sender<Vec<u8>>>>),
}

/// One logical stream, owned by the port registry.
pub(crate) struct DeviceStream {
    /// Node-assigned stream reference, unique within the session.
    pub stream_ref: u64,
    /// Device id concatenated with the ref, for logs.
    pub client_id: String,
    /// The remote device.
    pub device_id: DeviceId,
    peer: StreamPeer,
    state: AtomicU8,
    pump: Mutex<Option<AbortHandle>>,
}

impl DeviceStream {
    /// A stream accepted from the overlay, bridged to a dialed local socket.
    pub fn new_tcp(stream_ref: u64, device_id: DeviceId, write_half: OwnedWriteHalf) -> Self {
        Self {
            stream_ref,
            client_id: client_id(&device_id, stream_ref),
            device_id,
            peer: StreamPeer::Tcp(tokio::sync::Mutex::new(write_half)),
            state: AtomicU8::new(STATE_OPEN),
            pump: Mutex::new(None),
        }
    }

    /// A stream opened by this client, bridged to an in-process pipe.
    pub fn new_pipe(stream_ref: u64, device_id: DeviceId, tx: mpsc::Sender<Vec<u8>>) -> Self {
        Self {
            stream_ref,
            client_id: client_id(&device_id, stream_ref),
            device_id,
            peer: StreamPeer::Pipe(Mutex::new(Some(tx))),
            state: AtomicU8::new(STATE_OPENING),
            pump: Mutex::new(None),
        }
    }

    /// Records the local→overlay pump so `close` can interrupt its read.
    pub fn set_pump(&self, handle: AbortHandle) {
        *self.pump.lock().expect("pump slot poisoned") = Some(handle);
    }

    /// Detaches the pump handle; the pump calls this before closing its
    /// own stream so the teardown does not abort itself.
    pub fn take_pump(&self) -> Option<AbortHandle> {
        self.pump.lock().expect("pump slot poisoned").take()
    }

    /// Marks an opening stream established.
    pub fn mark_open(&self) {
        let _ = self.state.compare_exchange(
            STATE_OPENING,
            STATE_OPEN,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub fn is_closed(&self) -> bool {
        self.state.load(Ordering::SeqCst) >= STATE_CLOSING
    }

    /// Writes inbound overlay bytes to the local peer, in arrival order.
    ///
    /// A failure here is fatal to the stream; the caller tears it down.
    pub async fn write_local(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closed() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed"));
        }
        match &self.peer {
            StreamPeer::Tcp(writer) => writer.lock().await.write_all(data).await,
            StreamPeer::Pipe(tx) => {
                let sender = tx.lock().expect("pipe sender poisoned").clone();
                match sender {
                    Some(sender) => sender.send(data.to_vec()).await.map_err(|_| {
                        io::Error::new(io::ErrorKind::BrokenPipe, "stream reader gone")
                    }),
                    None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")),
                }
            }
        }
    }

    /// Tears the local side down. Idempotent; casting `PortClose` to the
    /// peer is the registry owner's job, not the stream's.
    pub async fn close(&self) {
        if self.state.swap(STATE_CLOSING, Ordering::SeqCst) >= STATE_CLOSING {
            return;
        }
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
        match &self.peer {
            StreamPeer::Tcp(writer) => {
                let _ = writer.lock().await.shutdown().await;
            }
            StreamPeer::Pipe(tx) => {
                tx.lock().expect("pipe sender poisoned").take();
            }
        }
        self.state.store(STATE_CLOSED, Ordering::SeqCst);
        debug!(
            client_id = %self.client_id,
            device = %base58::encode(&self.device_id),
            "stream closed"
        );
    }
}

fn client_id(device_id: &DeviceId, stream_ref: u64) -> String {
    format!("{}{}", base58::encode(device_id), stream_ref)
}

/// A byte stream to a remote device's port, opened with
/// [`Session::open_stream`](crate::session::Session::open_stream).
///
/// Reads drain the frames the node forwards for this stream's ref; writes
/// are chunked to the per-frame payload limit and enqueued on the
/// session's writer. Dropping the handle without `close` leaves the
/// registry entry to session teardown.
pub struct OverlayStream {
    session: Session,
    stream_ref: u64,
    rx: mpsc::Receiver<Vec<u8>>,
    chunk_limit: usize,
}

impl OverlayStream {
    pub(crate) fn new(
        session: Session,
        stream_ref: u64,
        rx: mpsc::Receiver<Vec<u8>>,
        chunk_limit: usize,
    ) -> Self {
        Self {
            session,
            stream_ref,
            rx,
            chunk_limit,
        }
    }

    /// The node-assigned stream reference.
    #[must_use]
    pub fn stream_ref(&self) -> u64 {
        self.stream_ref
    }

    /// Receives the next chunk of inbound bytes; `None` means the stream
    /// was closed by the peer or the session.
    pub async fn read_chunk(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Sends bytes to the remote device, chunked to the payload limit.
    ///
    /// # Errors
    ///
    /// Returns `BrokenPipe` when the session is closing.
    pub async fn write_all(&self, data: &[u8]) -> io::Result<()> {
        for chunk in data.chunks(self.chunk_limit.max(1)) {
            if !self.session.cast_port_send(self.stream_ref, chunk).await {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "session is closing",
                ));
            }
        }
        Ok(())
    }

    /// Closes the stream: removes it from the registry and casts
    /// `PortClose` to the peer if the session is still up.
    pub async fn close(self) {
        self.session.close_stream(self.stream_ref, true).await;
    }
}
