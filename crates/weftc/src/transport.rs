//! Framed transport over a secure byte stream.
//!
//! Frames travel length-prefixed (u32 big-endian). Reads and writes are
//! each serialized behind their own async mutex so exactly one reader and
//! one writer touch the stream, while the two directions stay independent.
//! Reconnection swaps both halves in place under those locks.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio_rustls::rustls;
use tokio_rustls::rustls::pki_types::ServerName;

use weft_common::frame::MAX_PAYLOAD;

/// Bytes of length prefix preceding every frame on the wire.
pub const FRAME_HEADER_LEN: usize = 4;

/// An established secure byte stream the session tunnels frames over.
///
/// The cryptographic handshake happens inside the [`Connector`]; the
/// session only ever sees the plain byte-stream interface.
pub trait SecureStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SecureStream for T {}

/// A boxed secure stream.
pub type BoxedStream = Box<dyn SecureStream>;

/// Future returned by [`Connector::connect`].
pub type ConnectFuture<'a> = Pin<Box<dyn Future<Output = io::Result<BoxedStream>> + Send + 'a>>;

/// Dials the relay node and performs the secure handshake.
///
/// The session keeps the connector for the lifetime of the session and
/// calls it again on every reconnect attempt.
pub trait Connector: Send + Sync + 'static {
    /// Establish a fresh secure stream to the node.
    fn connect(&self) -> ConnectFuture<'_>;
}

/// Plain-TCP connector, for tests and trusted networks.
pub struct TcpConnector {
    addr: String,
    timeout: Duration,
}

impl TcpConnector {
    /// Creates a connector dialing `addr` with the given timeout.
    #[must_use]
    pub fn new(addr: String, timeout: Duration) -> Self {
        Self { addr, timeout }
    }
}

impl Connector for TcpConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = tokio::time::timeout(self.timeout, TcpStream::connect(&self.addr))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// TLS connector trusting a configured CA bundle.
pub struct TlsConnector {
    addr: String,
    domain: ServerName<'static>,
    timeout: Duration,
    tls: tokio_rustls::TlsConnector,
}

impl TlsConnector {
    /// Creates a TLS connector for `addr`, verifying the node certificate
    /// against the PEM bundle at `ca_file` and the given `domain`.
    ///
    /// # Errors
    ///
    /// Returns an error when the CA bundle cannot be read or contains no
    /// usable certificates, or when `domain` is not a valid server name.
    pub fn new(
        addr: String,
        domain: &str,
        ca_file: &Path,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let pem = std::fs::read(ca_file)?;
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert?)?;
        }
        if roots.is_empty() {
            anyhow::bail!("no certificates found in {}", ca_file.display());
        }
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let domain = ServerName::try_from(domain.to_string())
            .map_err(|_| anyhow::anyhow!("invalid TLS server name: {domain}"))?;
        Ok(Self {
            addr,
            domain,
            timeout,
            tls: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }
}

impl Connector for TlsConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let dial = async {
                let tcp = TcpStream::connect(&self.addr).await?;
                tcp.set_nodelay(true)?;
                self.tls.connect(self.domain.clone(), tcp).await
            };
            let stream = tokio::time::timeout(self.timeout, dial)
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;
            Ok(Box::new(stream) as BoxedStream)
        })
    }
}

/// Returns true for errors that mean the peer went away and the session
/// should attempt to reconnect rather than fail outright.
#[must_use]
pub fn is_disconnect(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
    )
}

/// Length-prefixed frame transport over a [`BoxedStream`].
pub struct FramedTransport {
    reader: tokio::sync::Mutex<ReadHalf<BoxedStream>>,
    writer: tokio::sync::Mutex<WriteHalf<BoxedStream>>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
    closed: AtomicBool,
}

impl FramedTransport {
    /// Wraps an established stream.
    #[must_use]
    pub fn new(stream: BoxedStream) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self {
            reader: tokio::sync::Mutex::new(r),
            writer: tokio::sync::Mutex::new(w),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Swaps in a freshly connected stream after a reconnect.
    pub async fn replace(&self, stream: BoxedStream) {
        let (r, w) = tokio::io::split(stream);
        *self.reader.lock().await = r;
        *self.writer.lock().await = w;
        self.closed.store(false, Ordering::SeqCst);
    }

    /// Reads one frame body off the wire.
    ///
    /// # Errors
    ///
    /// Propagates transport errors; an oversize length prefix is reported
    /// as [`io::ErrorKind::InvalidData`].
    pub async fn read_frame(&self) -> io::Result<Vec<u8>> {
        let mut reader = self.reader.lock().await;
        let mut header = [0u8; FRAME_HEADER_LEN];
        reader.read_exact(&mut header).await?;
        let len = u32::from_be_bytes(header) as usize;
        if len > MAX_PAYLOAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame length {len} exceeds maximum {MAX_PAYLOAD}"),
            ));
        }
        let mut body = vec![0u8; len];
        reader.read_exact(&mut body).await?;
        self.bytes_in
            .fetch_add((FRAME_HEADER_LEN + len) as u64, Ordering::Relaxed);
        Ok(body)
    }

    /// Writes one frame (prefix plus body) in a single write call.
    ///
    /// Returns the number of bytes accepted by the stream. Callers must
    /// treat `n < wire_len(body.len())` as a poisoned frame: it is not
    /// retried, and the resulting desync surfaces as a read error.
    ///
    /// # Errors
    ///
    /// Propagates transport errors.
    pub async fn write_frame(&self, body: &[u8]) -> io::Result<usize> {
        let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
        buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
        buf.extend_from_slice(body);
        let mut writer = self.writer.lock().await;
        let n = writer.write(&buf).await?;
        writer.flush().await?;
        self.bytes_out.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }

    /// Full wire size of a frame with the given body length.
    #[must_use]
    pub const fn wire_len(body_len: usize) -> usize {
        FRAME_HEADER_LEN + body_len
    }

    /// Shuts the write half down and marks the transport closed.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let mut writer = self.writer.lock().await;
        let _ = writer.shutdown().await;
    }

    /// Marks the transport closed without touching the stream.
    pub fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// True once EOF, reset, or a local shutdown has been observed.
    #[must_use]
    pub fn closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Total bytes read since the session started (survives reconnects).
    #[must_use]
    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    /// Total bytes written since the session started (survives reconnects).
    #[must_use]
    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    /// Total bytes in both directions.
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.bytes_in() + self.bytes_out()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (FramedTransport, FramedTransport) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            FramedTransport::new(Box::new(a)),
            FramedTransport::new(Box::new(b)),
        )
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let (client, server) = pair();
        let n = client.write_frame(b"hello frame").await.unwrap();
        assert_eq!(n, FramedTransport::wire_len(11));

        let body = server.read_frame().await.unwrap();
        assert_eq!(body, b"hello frame");
    }

    #[tokio::test]
    async fn empty_frame_round_trip() {
        let (client, server) = pair();
        client.write_frame(b"").await.unwrap();
        let body = server.read_frame().await.unwrap();
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn byte_counters_track_wire_bytes() {
        let (client, server) = pair();
        client.write_frame(b"12345").await.unwrap();
        server.read_frame().await.unwrap();

        assert_eq!(client.bytes_out(), 9);
        assert_eq!(server.bytes_in(), 9);
        assert_eq!(server.total_bytes(), 9);
    }

    #[tokio::test]
    async fn oversize_length_prefix_is_invalid_data() {
        let (a, b) = tokio::io::duplex(1024);
        let server = FramedTransport::new(Box::new(b));

        let (_, mut raw) = tokio::io::split(Box::new(a) as BoxedStream);
        raw.write_all(&(u32::MAX).to_be_bytes()).await.unwrap();

        let err = server.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn eof_surfaces_as_unexpected_eof() {
        let (a, b) = tokio::io::duplex(1024);
        let server = FramedTransport::new(Box::new(b));
        drop(a);

        let err = server.read_frame().await.unwrap_err();
        assert!(is_disconnect(&err));
    }

    #[tokio::test]
    async fn replace_swaps_the_stream_and_clears_closed() {
        let (a, _b) = tokio::io::duplex(1024);
        let transport = FramedTransport::new(Box::new(a));
        transport.mark_closed();
        assert!(transport.closed());

        let (c, d) = tokio::io::duplex(1024);
        transport.replace(Box::new(c)).await;
        assert!(!transport.closed());

        let peer = FramedTransport::new(Box::new(d));
        transport.write_frame(b"after swap").await.unwrap();
        assert_eq!(peer.read_frame().await.unwrap(), b"after swap");
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let (a, _b) = tokio::io::duplex(1024);
        let transport = FramedTransport::new(Box::new(a));
        transport.shutdown().await;
        transport.shutdown().await;
        assert!(transport.closed());
    }
}
