//! The RPC session runtime.
//!
//! One session owns one secure transport to a relay node and multiplexes
//! everything over it: outbound calls, inbound responses, and the
//! node-originated port traffic. Four long-lived tasks cooperate:
//!
//! - `reader` pulls frames off the wire and feeds the frame queue; it also
//!   owns the reconnect state machine, because transport loss manifests
//!   there first.
//! - `writer` drains the outbound queue; calls move into the call table
//!   when it observes them (after writing when connected, instead of
//!   writing when reconnecting).
//! - `dispatcher` classifies frames in arrival order: responses complete
//!   calls, requests go to the port/stream handlers.
//! - `block_follower` ticks the ledger forward (see [`crate::blocks`]).
//!
//! On transport loss every pending call is notified `Reconnecting` but
//! stays registered; after a successful reconnect the pending calls are
//! re-enqueued in ascending id order and their byte-identical frames are
//! written exactly once to the new transport.

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use weft_common::base58;
use weft_common::frame::Frame;
use weft_common::types::{method, Address, BlockHeader, DeviceId, DeviceTicket};

use crate::backoff::ExponentialBackoff;
use crate::blocks::{self, BlockStore, HeaderSource};
use crate::calls::{
    deliver, parse, Call, CallError, CallOutcome, CallTable, Outbound, ResponseParser, RpcValue,
};
use crate::metrics::{counters, histograms};
use crate::ports::{port_access, screen_device, PortAccess, PortRegistry, PublishedPort};
use crate::stream::{DeviceStream, OverlayStream};
use crate::trace::ClientTrace;
use crate::transport::{is_disconnect, Connector, FramedTransport};

const FRAME_QUEUE_CAPACITY: usize = 1024;
const OUTBOUND_QUEUE_CAPACITY: usize = 256;
const SLOT_CAPACITY: usize = 2;

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Initial transport dial in progress.
    Connecting,
    /// Admitted and serving traffic.
    Connected,
    /// Transport lost; reconnect attempts running.
    Reconnecting,
    /// Terminal.
    Closed,
}

/// Resolved runtime configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Fleet address consulted by the on-chain access predicate.
    pub fleet: Address,
    /// Devices refused outright. Wins over the allowlist when populated.
    pub blocklist: HashSet<DeviceId>,
    /// When the blocklist is empty and this is not, only these devices
    /// are admitted.
    pub allowlist: HashSet<DeviceId>,
    /// Timeout for dialing the local published service.
    pub dial_timeout: Duration,
    /// Timeout for enqueues into bounded queues and response slots.
    pub enqueue_timeout: Duration,
    /// Initial reconnect backoff delay.
    pub reconnect_initial: Duration,
    /// Reconnect backoff cap.
    pub reconnect_max: Duration,
    /// Reconnect backoff growth factor.
    pub reconnect_factor: f64,
    /// Reconnect attempts before the session gives up.
    pub max_reconnect_attempts: u32,
    /// Block follower tick interval.
    pub block_tick: Duration,
    /// Only headers at most `peak - confirmations` are ingested.
    pub confirmations: u64,
    /// Wire bytes between traffic tickets; 0 disables ticketing.
    pub ticket_bytes: u64,
    /// Per-frame payload limit for stream data.
    pub chunk_limit: usize,
    /// Record latency histograms and byte counters.
    pub enable_metrics: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            fleet: [0; 20],
            blocklist: HashSet::new(),
            allowlist: HashSet::new(),
            dial_timeout: Duration::from_secs(5),
            enqueue_timeout: Duration::from_millis(100),
            reconnect_initial: Duration::from_millis(100),
            reconnect_max: Duration::from_secs(30),
            reconnect_factor: 2.0,
            max_reconnect_attempts: 10,
            block_tick: Duration::from_secs(15),
            confirmations: 6,
            ticket_bytes: 1024 * 1024,
            chunk_limit: 16 * 1024,
            enable_metrics: false,
        }
    }
}

pub(crate) struct SessionInner {
    config: SessionConfig,
    connector: Box<dyn Connector>,
    transport: FramedTransport,
    calls: CallTable,
    registry: PortRegistry,
    outbound_tx: mpsc::Sender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
    frame_tx: mpsc::Sender<Vec<u8>>,
    frame_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    state_tx: watch::Sender<SessionState>,
    next_id: AtomicU64,
    backoff: Mutex<ExponentialBackoff>,
    goodbye_reason: Mutex<Option<String>>,
    trace: ClientTrace,
    store: Arc<dyn BlockStore>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    ticket_mark: AtomicU64,
    started: AtomicBool,
    closing: AtomicBool,
}

/// Handle to a running session. Cheap to clone.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Dials the node through `connector` and builds the session.
    ///
    /// The session is idle until [`start`](Self::start) spawns its tasks.
    ///
    /// # Errors
    ///
    /// Propagates the connector's dial error.
    pub async fn connect(
        config: SessionConfig,
        connector: Box<dyn Connector>,
        store: Arc<dyn BlockStore>,
        trace: ClientTrace,
    ) -> io::Result<Self> {
        let (state_tx, _) = watch::channel(SessionState::Connecting);
        let stream = connector.connect().await?;
        state_tx.send_replace(SessionState::Connected);
        info!("connected to node");

        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let backoff = ExponentialBackoff::new(
            config.reconnect_initial,
            config.reconnect_max,
            config.reconnect_factor,
        );

        Ok(Self {
            inner: Arc::new(SessionInner {
                config,
                connector,
                transport: FramedTransport::new(stream),
                calls: CallTable::new(),
                registry: PortRegistry::new(),
                outbound_tx,
                outbound_rx: Mutex::new(Some(outbound_rx)),
                frame_tx,
                frame_rx: Mutex::new(Some(frame_rx)),
                state_tx,
                next_id: AtomicU64::new(0),
                backoff: Mutex::new(backoff),
                goodbye_reason: Mutex::new(None),
                trace,
                store,
                tasks: Mutex::new(Vec::new()),
                ticket_mark: AtomicU64::new(0),
                started: AtomicBool::new(false),
                closing: AtomicBool::new(false),
            }),
        })
    }

    /// Spawns the reader, writer, dispatcher, and block follower tasks.
    /// Calling it again is a no-op.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let outbound_rx = self
            .inner
            .outbound_rx
            .lock()
            .expect("outbound receiver poisoned")
            .take()
            .expect("start called once");
        let frame_rx = self
            .inner
            .frame_rx
            .lock()
            .expect("frame receiver poisoned")
            .take()
            .expect("start called once");

        let mut tasks = self.inner.tasks.lock().expect("tasks poisoned");
        tasks.push(tokio::spawn(reader_loop(self.inner.clone())));
        tasks.push(tokio::spawn(writer_loop(self.inner.clone(), outbound_rx)));
        tasks.push(tokio::spawn(dispatcher_loop(self.inner.clone(), frame_rx)));
        tasks.push(tokio::spawn(blocks::watch_latest_block(
            self.clone(),
            self.inner.store.clone(),
            self.inner.config.block_tick,
            self.inner.config.confirmations,
            self.inner.state_tx.subscribe(),
        )));
    }

    /// Issues an RPC and blocks until its response slot is delivered.
    ///
    /// A `Reconnecting` signal is absorbed here: the call stays pending
    /// and the loop keeps waiting for the replayed call's response.
    ///
    /// # Errors
    ///
    /// - [`CallError::Rpc`] when the node answers with an error.
    /// - [`CallError::Parse`] when the response body does not decode.
    /// - [`CallError::Cancelled`] when the session closes first.
    pub async fn call(
        &self,
        method: &'static str,
        args: Vec<u8>,
        parser: ResponseParser,
    ) -> Result<RpcValue, CallError> {
        if self.closed() {
            return Err(CallError::Cancelled);
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let data: Arc<[u8]> = Frame::call(id, method, args).serialize().into();
        let (slot, mut outcome_rx) = mpsc::channel(SLOT_CAPACITY);
        let call = Call {
            id,
            method,
            data,
            parser,
            slot,
            enqueued_at: Instant::now(),
        };
        let started = Instant::now();
        if self.inner.outbound_tx.send(Outbound::Call(call)).await.is_err() {
            return Err(CallError::Cancelled);
        }
        let mut state_rx = self.inner.state_tx.subscribe();
        loop {
            tokio::select! {
                outcome = outcome_rx.recv() => match outcome {
                    Some(CallOutcome::Value(value)) => {
                        if self.inner.config.enable_metrics {
                            histograms::round_trip_seconds(started.elapsed().as_secs_f64());
                        }
                        return Ok(value);
                    }
                    Some(CallOutcome::Error(message)) => return Err(CallError::Rpc(message)),
                    Some(CallOutcome::ParseFailed(e)) => return Err(CallError::Parse(e)),
                    Some(CallOutcome::Cancelled) | None => return Err(CallError::Cancelled),
                    Some(CallOutcome::Reconnecting) => {
                        debug!(id, method, "transport lost, call will be replayed");
                    }
                },
                _ = wait_for_closed(&mut state_rx) => {
                    return Err(CallError::Cancelled);
                }
            }
        }
    }

    /// Enqueues a fire-and-forget frame. Returns false when the session
    /// is closing.
    pub(crate) async fn cast_raw(&self, frame: Vec<u8>) -> bool {
        if self.inner.closing.load(Ordering::SeqCst) {
            return false;
        }
        self.inner.outbound_tx.send(Outbound::Raw(frame)).await.is_ok()
    }

    /// Enqueues stream payload bytes for a ref.
    pub(crate) async fn cast_port_send(&self, stream_ref: u64, data: &[u8]) -> bool {
        self.cast_raw(Frame::serialize_port_send(stream_ref, data)).await
    }

    /// Latest block height known to the node.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn get_block_peak(&self) -> Result<u64, CallError> {
        match self
            .call(method::GET_BLOCK_PEAK, Vec::new(), parse::block_peak)
            .await?
        {
            RpcValue::BlockPeak(peak) => Ok(peak),
            _ => Err(CallError::Unexpected(method::GET_BLOCK_PEAK)),
        }
    }

    /// Fetches a block header by number. The node does not verify it; the
    /// ledger store's contiguity check is the safety net.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn get_block_header_unsafe(&self, number: u64) -> Result<BlockHeader, CallError> {
        let args = number.to_be_bytes().to_vec();
        match self
            .call(method::GET_BLOCK_HEADER, args, parse::block_header)
            .await?
        {
            RpcValue::Header(header) => Ok(header),
            _ => Err(CallError::Unexpected(method::GET_BLOCK_HEADER)),
        }
    }

    /// Evaluates the on-chain access predicate for a fleet/device pair.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn is_access_whitelisted(
        &self,
        fleet: Address,
        device: DeviceId,
    ) -> Result<bool, CallError> {
        let mut args = Vec::with_capacity(40);
        args.extend_from_slice(&fleet);
        args.extend_from_slice(&device);
        match self
            .call(method::IS_ACCESS_WHITELISTED, args, parse::boolean)
            .await?
        {
            RpcValue::Bool(admitted) => Ok(admitted),
            _ => Err(CallError::Unexpected(method::IS_ACCESS_WHITELISTED)),
        }
    }

    /// Resolves an overlay name to device tickets and fires the
    /// `bns_done` trace hook.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call).
    pub async fn resolve_bns(&self, name: &str) -> Result<Vec<DeviceTicket>, CallError> {
        let args = name.as_bytes().to_vec();
        match self.call(method::RESOLVE_BNS, args, parse::tickets).await? {
            RpcValue::Tickets(tickets) => {
                self.inner.trace.fire_bns_done(&tickets);
                Ok(tickets)
            }
            _ => Err(CallError::Unexpected(method::RESOLVE_BNS)),
        }
    }

    /// Opens a logical stream to `device:port` through the node.
    ///
    /// # Errors
    ///
    /// See [`call`](Self::call); additionally fails when the node hands
    /// out a ref that is already live.
    pub async fn open_stream(
        &self,
        device_id: DeviceId,
        port: u16,
    ) -> Result<OverlayStream, CallError> {
        self.inner.trace.fire_e2e_start(&device_id);
        let mut args = Vec::with_capacity(22);
        args.extend_from_slice(&device_id);
        args.extend_from_slice(&port.to_be_bytes());
        let result = self.call(method::PORT_OPEN, args, parse::stream_ref).await;
        match &result {
            Ok(_) => self.inner.trace.fire_e2e_done(&device_id, None),
            Err(e) => {
                let message = e.to_string();
                self.inner.trace.fire_e2e_done(&device_id, Some(&message));
            }
        }
        let RpcValue::StreamRef(stream_ref) = result? else {
            return Err(CallError::Unexpected(method::PORT_OPEN));
        };
        let (tx, rx) = mpsc::channel(64);
        let stream = Arc::new(DeviceStream::new_pipe(stream_ref, device_id, tx));
        stream.mark_open();
        if !self.inner.registry.insert_stream(stream.clone()) {
            warn!(stream_ref, "node reused a live stream ref");
            return Err(CallError::Unexpected(method::PORT_OPEN));
        }
        self.inner.trace.fire_got_conn(&device_id, port);
        info!(client_id = %stream.client_id, port, "overlay stream open");
        Ok(OverlayStream::new(
            self.clone(),
            stream_ref,
            rx,
            self.inner.config.chunk_limit,
        ))
    }

    /// Announces a local service to the overlay.
    pub fn publish(&self, port: PublishedPort) {
        info!(port = port.port, source = port.source, mode = ?port.mode, "publishing port");
        self.inner.registry.publish(port);
    }

    /// Withdraws a published port.
    pub fn unpublish(&self, port: u16) {
        if self.inner.registry.unpublish(port) {
            info!(port, "unpublished port");
        }
    }

    /// Closes the session. Idempotent: pending calls receive `Cancelled`,
    /// live streams are torn down, the transport is shut.
    pub async fn close(&self) {
        shutdown_inner(&self.inner).await;
    }

    /// True once the session reached its terminal state.
    #[must_use]
    pub fn closed(&self) -> bool {
        *self.inner.state_tx.borrow() == SessionState::Closed
    }

    /// True while reconnect attempts are running.
    #[must_use]
    pub fn reconnecting(&self) -> bool {
        *self.inner.state_tx.borrow() == SessionState::Reconnecting
    }

    /// Subscribes to session state transitions.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// The goodbye reason, when the node terminated the session.
    #[must_use]
    pub fn goodbye_reason(&self) -> Option<String> {
        self.inner
            .goodbye_reason
            .lock()
            .expect("goodbye reason poisoned")
            .clone()
    }

    /// Waits for every session task (workers and stream pumps) to finish.
    pub async fn wait(&self) {
        loop {
            let handle = self.inner.tasks.lock().expect("tasks poisoned").pop();
            match handle {
                Some(handle) => {
                    let _ = handle.await;
                }
                None => break,
            }
        }
    }

    /// Removes a stream from the registry and tears it down, casting
    /// `PortClose` to the peer when asked and the session is still up.
    pub(crate) async fn close_stream(&self, stream_ref: u64, cast: bool) -> bool {
        close_stream_inner(&self.inner, stream_ref, cast).await
    }
}

impl HeaderSource for Session {
    fn block_peak(&self) -> impl std::future::Future<Output = Result<u64, CallError>> + Send {
        self.get_block_peak()
    }

    fn block_header(
        &self,
        number: u64,
    ) -> impl std::future::Future<Output = Result<BlockHeader, CallError>> + Send {
        self.get_block_header_unsafe(number)
    }
}

/// Awaits session closure without holding the watch channel's read guard
/// across an `.await` point, which would make the enclosing future non-`Send`.
pub(crate) async fn wait_for_closed(state_rx: &mut watch::Receiver<SessionState>) {
    let _ = state_rx.wait_for(|state| *state == SessionState::Closed).await;
}

async fn shutdown_inner(inner: &Arc<SessionInner>) {
    if inner.closing.swap(true, Ordering::SeqCst) {
        return;
    }
    info!("closing session");
    inner.state_tx.send_replace(SessionState::Closed);
    inner.transport.shutdown().await;
    for call in inner.calls.drain() {
        deliver(
            &call.slot,
            CallOutcome::Cancelled,
            inner.config.enqueue_timeout,
            call.id,
            call.method,
        )
        .await;
    }
    for stream in inner.registry.drain_streams() {
        stream.close().await;
    }
}

async fn close_stream_inner(inner: &Arc<SessionInner>, stream_ref: u64, cast: bool) -> bool {
    let Some(stream) = inner.registry.remove_stream(stream_ref) else {
        return false;
    };
    stream.close().await;
    if cast && !inner.closing.load(Ordering::SeqCst) {
        let frame = Frame::port_close(stream_ref).serialize();
        let _ = inner.outbound_tx.send(Outbound::Raw(frame)).await;
    }
    true
}

// ── Reader & reconnect supervisor ───────────────────────────────────

async fn reader_loop(inner: Arc<SessionInner>) {
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        tokio::select! {
            _ = wait_for_closed(&mut state_rx) => {
                break;
            }
            result = inner.transport.read_frame() => match result {
                Ok(body) => {
                    if body.is_empty() {
                        continue;
                    }
                    debug!(len = body.len(), "received frame");
                    if inner.config.enable_metrics {
                        counters::wire_bytes_total("in", FramedTransport::wire_len(body.len()) as u64);
                    }
                    if let Err(e) = inner
                        .frame_tx
                        .send_timeout(body, inner.config.enqueue_timeout)
                        .await
                    {
                        warn!(error = %e, "frame queue congested, dropping frame");
                    }
                }
                Err(e) => {
                    if !handle_transport_loss(&inner, &e).await {
                        break;
                    }
                }
            }
        }
    }
}

/// Runs the reconnect state machine after a read error. Returns true when
/// the session recovered and the reader should resume.
async fn handle_transport_loss(inner: &Arc<SessionInner>, err: &io::Error) -> bool {
    if inner.closing.load(Ordering::SeqCst) || inner.transport.closed() {
        return false;
    }
    if is_disconnect(err) {
        warn!(error = %err, pending = inner.calls.len(), "transport lost, reconnecting");
        inner.state_tx.send_replace(SessionState::Reconnecting);
        for (id, method, slot) in inner.calls.slots() {
            deliver(
                &slot,
                CallOutcome::Reconnecting,
                inner.config.enqueue_timeout,
                id,
                method,
            )
            .await;
        }
        for attempt in 1..=inner.config.max_reconnect_attempts {
            if inner.closing.load(Ordering::SeqCst) {
                return false;
            }
            let delay = inner.backoff.lock().expect("backoff poisoned").next_delay();
            tokio::time::sleep(delay).await;
            match inner.connector.connect().await {
                Ok(stream) => {
                    inner.transport.replace(stream).await;
                    inner.state_tx.send_replace(SessionState::Connected);
                    if inner.config.enable_metrics {
                        counters::reconnects_total();
                    }
                    let replayed = recall(inner).await;
                    info!(attempt, replayed, "reconnected to node");
                    return true;
                }
                Err(e) => {
                    warn!(attempt, error = %e, "reconnect attempt failed");
                }
            }
        }
        error!(
            attempts = inner.config.max_reconnect_attempts,
            "giving up on reconnect"
        );
    } else {
        error!(error = %err, "transport read failed");
    }
    shutdown_inner(inner).await;
    false
}

/// Re-enqueues every pending call in ascending id order. The writer then
/// re-sends the byte-identical frames exactly once.
async fn recall(inner: &Arc<SessionInner>) -> usize {
    let pending = inner.calls.drain();
    let count = pending.len();
    for call in pending {
        debug!(id = call.id, method = call.method, "replaying call");
        if inner.outbound_tx.send(Outbound::Call(call)).await.is_err() {
            break;
        }
    }
    if inner.config.enable_metrics && count > 0 {
        counters::calls_replayed_total(count as u64);
    }
    count
}

// ── Writer ──────────────────────────────────────────────────────────

async fn writer_loop(inner: Arc<SessionInner>, mut outbound_rx: mpsc::Receiver<Outbound>) {
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        tokio::select! {
            _ = wait_for_closed(&mut state_rx) => {
                break;
            }
            item = outbound_rx.recv() => {
                let Some(item) = item else { break };
                handle_outbound(&inner, item).await;
            }
        }
    }
    // Anything still queued will never be written.
    while let Ok(item) = outbound_rx.try_recv() {
        if let Outbound::Call(call) = item {
            deliver(
                &call.slot,
                CallOutcome::Cancelled,
                inner.config.enqueue_timeout,
                call.id,
                call.method,
            )
            .await;
        }
    }
}

async fn handle_outbound(inner: &Arc<SessionInner>, item: Outbound) {
    match item {
        Outbound::Call(call) => {
            if inner.closing.load(Ordering::SeqCst) {
                deliver(
                    &call.slot,
                    CallOutcome::Cancelled,
                    inner.config.enqueue_timeout,
                    call.id,
                    call.method,
                )
                .await;
                return;
            }
            let id = call.id;
            let call_method = call.method;
            if *inner.state_tx.borrow() == SessionState::Reconnecting {
                debug!(id, method = call_method, "queued for replay after reconnect");
                if !inner.calls.register(call) {
                    warn!(id, "duplicate call id in table");
                }
                return;
            }
            debug!(
                id,
                method = call_method,
                queued_ms = call.enqueued_at.elapsed().as_millis() as u64,
                "sending rpc"
            );
            let started = Instant::now();
            let expected = FramedTransport::wire_len(call.data.len());
            match inner.transport.write_frame(&call.data).await {
                Ok(n) if n < expected => {
                    // Not retried; the desync surfaces in the reader and the
                    // pending call is replayed on reconnect.
                    error!(
                        id,
                        method = call_method,
                        written = n,
                        expected,
                        "short write, leaving call pending"
                    );
                }
                Ok(_) => {
                    if inner.config.enable_metrics {
                        histograms::write_seconds(started.elapsed().as_secs_f64());
                        counters::wire_bytes_total("out", expected as u64);
                    }
                }
                Err(e) => {
                    // No reconnect from here: responses may still be buffered
                    // on the read side. The reader observes the failure next.
                    error!(id, method = call_method, error = %e, "failed to write to node");
                }
            }
            if !inner.calls.register(call) {
                warn!(id, "duplicate call id in table");
            }
        }
        Outbound::Raw(frame) => {
            if inner.closing.load(Ordering::SeqCst) {
                return;
            }
            if *inner.state_tx.borrow() == SessionState::Reconnecting {
                debug!("dropping cast during reconnect");
                return;
            }
            let expected = FramedTransport::wire_len(frame.len());
            match inner.transport.write_frame(&frame).await {
                Ok(n) if n < expected => {
                    error!(written = n, expected, "short write on cast");
                }
                Ok(_) => {
                    if inner.config.enable_metrics {
                        counters::wire_bytes_total("out", expected as u64);
                    }
                }
                Err(e) => {
                    error!(error = %e, "failed to write cast");
                }
            }
        }
    }
}

// ── Dispatcher ──────────────────────────────────────────────────────

async fn dispatcher_loop(inner: Arc<SessionInner>, mut frame_rx: mpsc::Receiver<Vec<u8>>) {
    let mut state_rx = inner.state_tx.subscribe();
    loop {
        tokio::select! {
            _ = wait_for_closed(&mut state_rx) => {
                break;
            }
            body = frame_rx.recv() => {
                let Some(body) = body else { break };
                handle_frame(&inner, &body).await;
            }
        }
    }
}

async fn handle_frame(inner: &Arc<SessionInner>, body: &[u8]) {
    let frame = match Frame::parse(body) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, len = body.len(), "dropping unparseable frame");
            return;
        }
    };
    maybe_submit_ticket(inner);
    match frame {
        Frame::Response { id, error, body } => {
            inner.backoff.lock().expect("backoff poisoned").step_back();
            let Some(call) = inner.calls.take(id) else {
                debug!(id, "no pending call for response");
                return;
            };
            let outcome = if error {
                CallOutcome::Error(String::from_utf8_lossy(&body).into_owned())
            } else {
                match (call.parser)(&body) {
                    Ok(value) => CallOutcome::Value(value),
                    Err(e) => {
                        error!(id, method = call.method, error = %e, "cannot decode response");
                        CallOutcome::ParseFailed(e)
                    }
                }
            };
            deliver(
                &call.slot,
                outcome,
                inner.config.enqueue_timeout,
                id,
                call.method,
            )
            .await;
        }
        Frame::PortOpen {
            device_id,
            port,
            stream_ref,
        } => {
            let handle = tokio::spawn(handle_port_open(inner.clone(), device_id, port, stream_ref));
            inner.tasks.lock().expect("tasks poisoned").push(handle);
        }
        Frame::PortSend { stream_ref, data } => match inner.registry.stream(stream_ref) {
            Some(stream) => {
                if let Err(e) = stream.write_local(&data).await {
                    warn!(client_id = %stream.client_id, error = %e, "local write failed, closing stream");
                    close_stream_inner(inner, stream_ref, true).await;
                }
            }
            None => {
                warn!(stream_ref, "no connected stream for port send");
                let frame = Frame::port_close(stream_ref).serialize();
                let _ = inner.outbound_tx.send(Outbound::Raw(frame)).await;
            }
        },
        Frame::PortClose { stream_ref } => {
            // The node already dropped the ref; no close is echoed back.
            if !close_stream_inner(inner, stream_ref, false).await {
                warn!(stream_ref, "no connected stream for port close");
            }
        }
        Frame::Goodbye { reason } => {
            warn!(%reason, "node terminated the session");
            *inner
                .goodbye_reason
                .lock()
                .expect("goodbye reason poisoned") = Some(reason);
            if !inner.closing.load(Ordering::SeqCst) {
                shutdown_inner(inner).await;
            }
        }
        Frame::Call { .. } | Frame::PortOpenAck { .. } => {
            warn!(frame_type = frame.frame_type(), "unexpected frame kind from node");
        }
    }
}

// ── Inbound port opens ──────────────────────────────────────────────

async fn ack_port_open(inner: &Arc<SessionInner>, stream_ref: u64, error: Option<String>) {
    let frame = Frame::port_open_ack(stream_ref, error).serialize();
    if inner.outbound_tx.send(Outbound::Raw(frame)).await.is_err() {
        debug!(stream_ref, "session closing, dropping port open response");
    }
}

/// Policy ladder for an inbound `PortOpen`. Every early exit sends the
/// (single) response before returning.
async fn handle_port_open(
    inner: Arc<SessionInner>,
    device_id: DeviceId,
    port: u16,
    stream_ref: u64,
) {
    if let Some(reason) = screen_device(&inner.config.blocklist, &inner.config.allowlist, &device_id)
    {
        warn!(stream_ref, %reason, "rejecting port open");
        ack_port_open(&inner, stream_ref, Some(reason)).await;
        return;
    }

    let Some(published) = inner.registry.published(port) else {
        info!(port, "port was not published");
        ack_port_open(&inner, stream_ref, Some("port was not published".to_string())).await;
        return;
    };

    match port_access(&published, &device_id) {
        PortAccess::Granted => {}
        PortAccess::NeedsLedger => {
            let session = Session {
                inner: inner.clone(),
            };
            let fleet = inner.config.fleet;
            match session.is_access_whitelisted(fleet, device_id).await {
                Ok(true) => {}
                Ok(false) | Err(_) => {
                    let reason = format!(
                        "device {} is not in the whitelist (1)",
                        base58::encode(&device_id)
                    );
                    ack_port_open(&inner, stream_ref, Some(reason)).await;
                    return;
                }
            }
        }
        PortAccess::Denied => {
            let reason = format!(
                "device {} is not in the whitelist (2)",
                base58::encode(&device_id)
            );
            ack_port_open(&inner, stream_ref, Some(reason)).await;
            return;
        }
    }

    let addr = format!("127.0.0.1:{}", published.source);
    let local = match tokio::time::timeout(inner.config.dial_timeout, TcpStream::connect(&addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            error!(addr, error = %e, "failed to connect local");
            ack_port_open(&inner, stream_ref, Some(e.to_string())).await;
            return;
        }
        Err(_) => {
            error!(addr, "local dial timed out");
            ack_port_open(&inner, stream_ref, Some(format!("dial {addr} timed out"))).await;
            return;
        }
    };

    let (read_half, write_half) = local.into_split();
    let stream = Arc::new(DeviceStream::new_tcp(stream_ref, device_id, write_half));
    if !inner.registry.insert_stream(stream.clone()) {
        warn!(stream_ref, "stream ref already in use");
        ack_port_open(&inner, stream_ref, Some("stream ref already in use".to_string())).await;
        return;
    }
    ack_port_open(&inner, stream_ref, None).await;

    let handle = tokio::spawn(pump_local(read_half, stream.clone(), inner.clone()));
    stream.set_pump(handle.abort_handle());
    inner.tasks.lock().expect("tasks poisoned").push(handle);
    info!(client_id = %stream.client_id, port, "device stream connected");
}

/// Local → overlay pump for one accepted stream.
async fn pump_local(
    mut read_half: OwnedReadHalf,
    stream: Arc<DeviceStream>,
    inner: Arc<SessionInner>,
) {
    let mut state_rx = inner.state_tx.subscribe();
    let mut buf = vec![0u8; inner.config.chunk_limit.max(1)];
    loop {
        tokio::select! {
            _ = wait_for_closed(&mut state_rx) => {
                break;
            }
            read = read_half.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    let frame = Frame::serialize_port_send(stream.stream_ref, &buf[..n]);
                    if inner.outbound_tx.send(Outbound::Raw(frame)).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!(client_id = %stream.client_id, error = %e, "local read failed");
                    break;
                }
            }
        }
    }
    // Detach before closing so the teardown does not abort this task.
    stream.take_pump();
    close_stream_inner(&inner, stream.stream_ref, true).await;
}

// ── Ticket accounting ───────────────────────────────────────────────

/// Casts a traffic ticket when enough wire bytes accumulated since the
/// last one. Called by the dispatcher on every inbound frame; cheap when
/// nothing is due.
fn maybe_submit_ticket(inner: &Arc<SessionInner>) {
    let threshold = inner.config.ticket_bytes;
    if threshold == 0 {
        return;
    }
    let total = inner.transport.total_bytes();
    let mark = inner.ticket_mark.load(Ordering::SeqCst);
    if total.saturating_sub(mark) < threshold {
        return;
    }
    if inner
        .ticket_mark
        .compare_exchange(mark, total, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return;
    }
    let session = Session {
        inner: inner.clone(),
    };
    let handle = tokio::spawn(async move {
        let last = session.inner.store.last().unwrap_or(0);
        let mut args = Vec::with_capacity(16);
        args.extend_from_slice(&last.to_be_bytes());
        args.extend_from_slice(&total.to_be_bytes());
        match session.call(method::TICKET, args, parse::accepted).await {
            Ok(_) => debug!(total, "ticket accepted"),
            Err(e) => debug!(error = %e, "ticket submission failed"),
        }
    });
    inner.tasks.lock().expect("tasks poisoned").push(handle);
}
