#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::timeout;

use weft_common::frame::Frame;
use weft_common::types::BlockHeader;

use weftc::blocks::MemoryBlockStore;
use weftc::session::{Session, SessionConfig};
use weftc::trace::ClientTrace;
use weftc::transport::{BoxedStream, ConnectFuture, Connector, FramedTransport};

/// How long a test waits for a frame before panicking.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// The node end of one duplex transport.
pub struct FakeRelay {
    transport: FramedTransport,
}

impl FakeRelay {
    pub fn new(stream: BoxedStream) -> Self {
        Self {
            transport: FramedTransport::new(stream),
        }
    }

    /// Receives and parses the next frame from the client.
    pub async fn recv(&self) -> Frame {
        let body = timeout(RECV_TIMEOUT, self.transport.read_frame())
            .await
            .expect("timed out waiting for a frame")
            .expect("transport failed");
        Frame::parse(&body).expect("client sent an unparseable frame")
    }

    /// Receives a frame and asserts it is a `Call` of the given method.
    /// Returns the request id and args.
    pub async fn expect_call(&self, method: &str) -> (u64, Vec<u8>) {
        match self.recv().await {
            Frame::Call {
                id,
                method: got,
                args,
            } => {
                assert_eq!(got, method, "unexpected rpc method");
                (id, args)
            }
            other => panic!("expected a {method} call, got {other:?}"),
        }
    }

    /// Sends a frame to the client.
    pub async fn send(&self, frame: &Frame) {
        self.transport
            .write_frame(&frame.serialize())
            .await
            .expect("relay write failed");
    }

    /// Answers a call with a success body.
    pub async fn respond(&self, id: u64, body: Vec<u8>) {
        self.send(&Frame::response(id, body)).await;
    }

    /// Answers a call with an error message.
    pub async fn respond_error(&self, id: u64, message: &str) {
        self.send(&Frame::error_response(id, message)).await;
    }
}

/// Hands out pre-created streams, one per connect call, then refuses.
pub struct ScriptedConnector {
    streams: Mutex<Vec<BoxedStream>>,
}

impl ScriptedConnector {
    pub fn new(streams: Vec<BoxedStream>) -> Self {
        let mut streams = streams;
        streams.reverse(); // pop from the back in connect order
        Self {
            streams: Mutex::new(streams),
        }
    }
}

impl Connector for ScriptedConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        let stream = self.streams.lock().expect("streams poisoned").pop();
        Box::pin(async move {
            stream.ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "no more relays")
            })
        })
    }
}

pub fn genesis() -> BlockHeader {
    BlockHeader {
        number: 0,
        hash: [0; 32],
        parent: [0; 32],
    }
}

/// A config with test-friendly timings.
pub fn test_config() -> SessionConfig {
    SessionConfig {
        reconnect_initial: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(100),
        max_reconnect_attempts: 5,
        block_tick: Duration::from_secs(3600),
        ticket_bytes: 0,
        ..SessionConfig::default()
    }
}

/// Builds a started session backed by `relays` scripted transports.
/// The first relay is connected immediately; the rest serve reconnects.
pub async fn start_session(relays: usize, config: SessionConfig) -> (Session, Vec<FakeRelay>) {
    let mut client_sides: Vec<BoxedStream> = Vec::new();
    let mut relay_sides = Vec::new();
    for _ in 0..relays {
        let (client, relay) = tokio::io::duplex(256 * 1024);
        client_sides.push(Box::new(client));
        relay_sides.push(FakeRelay::new(Box::new(relay)));
    }
    let session = Session::connect(
        config,
        Box::new(ScriptedConnector::new(client_sides)),
        Arc::new(MemoryBlockStore::new(genesis())),
        ClientTrace::default(),
    )
    .await
    .expect("session connect failed");
    session.start();
    (session, relay_sides)
}
