//! Outbound call bookkeeping: the in-flight call table, response slots,
//! and the per-method response parsers.
//!
//! A call lives either in the outbound queue or in this table, never both.
//! The writer moves it into the table when it observes it; a response,
//! drain, or recall takes it back out. The table is keyed by request id in
//! a `BTreeMap` so drains and recalls naturally iterate in ascending id
//! order, which is what the replay contract requires.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::warn;

use weft_common::frame::FrameError;
use weft_common::types::{BlockHeader, DeviceTicket};

/// A typed RPC result, produced by a [`ResponseParser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcValue {
    /// Latest block height (`getblockpeak`).
    BlockPeak(u64),
    /// A block header (`getblockheader`).
    Header(BlockHeader),
    /// A boolean predicate result (`isaccesswhitelisted`).
    Bool(bool),
    /// A node-assigned stream reference (`portopen`).
    StreamRef(u64),
    /// Resolved device tickets (`resolvebns`).
    Tickets(Vec<DeviceTicket>),
    /// An empty acknowledgement (`ticket`).
    Accepted,
}

/// Turns a successful response body into a typed value.
pub type ResponseParser = fn(&[u8]) -> Result<RpcValue, FrameError>;

/// Response body parsers, one per RPC method.
pub mod parse {
    use super::{BlockHeader, DeviceTicket, FrameError, RpcValue};

    fn read_u64(data: &[u8]) -> Result<u64, FrameError> {
        let bytes: [u8; 8] = data.try_into().map_err(|_| FrameError::TooShort {
            expected: 8,
            actual: data.len(),
        })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Parses a `getblockpeak` response body.
    pub fn block_peak(data: &[u8]) -> Result<RpcValue, FrameError> {
        Ok(RpcValue::BlockPeak(read_u64(data)?))
    }

    /// Parses a `getblockheader` response body.
    pub fn block_header(data: &[u8]) -> Result<RpcValue, FrameError> {
        Ok(RpcValue::Header(BlockHeader::parse(data)?))
    }

    /// Parses a one-byte boolean response body.
    pub fn boolean(data: &[u8]) -> Result<RpcValue, FrameError> {
        if data.is_empty() {
            return Err(FrameError::Empty);
        }
        Ok(RpcValue::Bool(data[0] != 0))
    }

    /// Parses a `portopen` response body.
    pub fn stream_ref(data: &[u8]) -> Result<RpcValue, FrameError> {
        Ok(RpcValue::StreamRef(read_u64(data)?))
    }

    /// Parses a `resolvebns` response body.
    pub fn tickets(data: &[u8]) -> Result<RpcValue, FrameError> {
        Ok(RpcValue::Tickets(DeviceTicket::parse_list(data)?))
    }

    /// Accepts any body as a bare acknowledgement.
    pub fn accepted(_data: &[u8]) -> Result<RpcValue, FrameError> {
        Ok(RpcValue::Accepted)
    }
}

/// What a response slot receives.
///
/// `Reconnecting` is the only non-terminal variant: the call stays pending
/// and the same slot later receives exactly one terminal outcome.
#[derive(Debug, Clone)]
pub enum CallOutcome {
    /// The parsed response value.
    Value(RpcValue),
    /// The node answered with an error.
    Error(String),
    /// The response body did not match the expected shape.
    ParseFailed(FrameError),
    /// The session is closing; the call will never complete.
    Cancelled,
    /// Transport lost; the call remains pending and will be replayed.
    Reconnecting,
}

/// Errors surfaced to callers of `Session::call`.
#[derive(Debug, Error)]
pub enum CallError {
    /// The node answered with an error message.
    #[error("rpc error: {0}")]
    Rpc(String),
    /// The response body did not parse as the expected type.
    #[error("cannot decode response: {0}")]
    Parse(#[from] FrameError),
    /// The session closed before the call completed.
    #[error("call cancelled: session is closing")]
    Cancelled,
    /// The response parsed, but into an unexpected variant.
    #[error("unexpected response value for {0}")]
    Unexpected(&'static str),
}

/// A pending outbound RPC.
pub(crate) struct Call {
    /// Request id, unique and ascending within the session.
    pub id: u64,
    /// Method name, for logs.
    pub method: &'static str,
    /// The full encoded frame body. Kept so a replay after reconnect is
    /// byte-identical and never re-assigns the id.
    pub data: Arc<[u8]>,
    /// Parser for the success response body.
    pub parser: ResponseParser,
    /// Single-delivery response channel.
    pub slot: mpsc::Sender<CallOutcome>,
    /// When the call entered the outbound queue.
    pub enqueued_at: Instant,
}

/// An entry in the outbound queue consumed by the writer task.
pub(crate) enum Outbound {
    /// An RPC call; the writer registers it into the call table.
    Call(Call),
    /// A fire-and-forget frame (acks, port traffic). Never replayed.
    Raw(Vec<u8>),
}

/// Delivers an outcome into a response slot, bounded by `enqueue_timeout`.
///
/// A slot that stays full past the timeout is considered unresponsive; the
/// outcome is dropped with a warning and the caller is expected to abandon
/// the call.
pub(crate) async fn deliver(
    slot: &mpsc::Sender<CallOutcome>,
    outcome: CallOutcome,
    enqueue_timeout: Duration,
    id: u64,
    method: &'static str,
) {
    match slot.send_timeout(outcome, enqueue_timeout).await {
        Ok(()) => {}
        Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
            warn!(id, method, "response slot unresponsive, abandoning call");
        }
        Err(mpsc::error::SendTimeoutError::Closed(_)) => {
            // Caller gave up on the call; nothing to deliver to.
        }
    }
}

/// The in-flight call table.
pub(crate) struct CallTable {
    inner: Mutex<BTreeMap<u64, Call>>,
}

impl CallTable {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BTreeMap::new()),
        }
    }

    /// Registers a pending call. Returns false (and drops nothing) when
    /// the id is already present, which would violate the unique-id
    /// invariant and is logged by the caller.
    pub fn register(&self, call: Call) -> bool {
        let mut inner = self.inner.lock().expect("call table poisoned");
        match inner.entry(call.id) {
            std::collections::btree_map::Entry::Occupied(_) => false,
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(call);
                true
            }
        }
    }

    /// Removes and returns the call with the given id.
    pub fn take(&self, id: u64) -> Option<Call> {
        self.inner.lock().expect("call table poisoned").remove(&id)
    }

    /// Removes every pending call, in ascending id order.
    pub fn drain(&self) -> Vec<Call> {
        let mut inner = self.inner.lock().expect("call table poisoned");
        let drained = std::mem::take(&mut *inner);
        drained.into_values().collect()
    }

    /// Clones the slot of every pending call, in ascending id order,
    /// without removing anything. Used to broadcast `Reconnecting`.
    pub fn slots(&self) -> Vec<(u64, &'static str, mpsc::Sender<CallOutcome>)> {
        let inner = self.inner.lock().expect("call table poisoned");
        inner
            .values()
            .map(|call| (call.id, call.method, call.slot.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("call table poisoned").len()
    }
}
