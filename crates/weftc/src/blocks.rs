//! Block header follower and the ledger store interface.
//!
//! The follower ticks on a fixed interval, asks the node for the latest
//! confirmed height, and appends the missing headers to the ledger store.
//! An append failure means the chain forked under us (an uncle was seen):
//! the cursor falls back to the store's last valid height and the next
//! tick retries from there.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{error, info, warn};

use weft_common::types::BlockHeader;

use crate::calls::CallError;
use crate::session::{wait_for_closed, SessionState};

/// Errors from the ledger store.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    /// The header does not extend the stored chain.
    #[error("block {number} does not extend the chain")]
    Mismatch {
        /// Height of the rejected header.
        number: u64,
    },
    /// The store holds no blocks.
    #[error("ledger store is empty")]
    Empty,
}

/// The rolling ledger of verified block headers.
///
/// Implementations must keep the chain contiguous: `add_block` rejects a
/// header whose parent is not the current tip.
pub trait BlockStore: Send + Sync {
    /// Height of the newest stored header.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Empty`] when nothing is stored.
    fn last(&self) -> Result<u64, LedgerError>;

    /// Appends a header to the chain.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Mismatch`] when the header does not link to
    /// the current tip.
    fn add_block(&self, header: &BlockHeader, finalized: bool) -> Result<(), LedgerError>;

    /// Persists the current tip as the last valid height.
    fn store_last_valid(&self);
}

/// In-memory [`BlockStore`] keeping a contiguous header chain.
pub struct MemoryBlockStore {
    chain: Mutex<Vec<BlockHeader>>,
    last_valid: AtomicU64,
}

impl MemoryBlockStore {
    /// Creates a store seeded with a genesis header.
    #[must_use]
    pub fn new(genesis: BlockHeader) -> Self {
        let number = genesis.number;
        Self {
            chain: Mutex::new(vec![genesis]),
            last_valid: AtomicU64::new(number),
        }
    }

    /// The height most recently persisted via `store_last_valid`.
    #[must_use]
    pub fn last_valid(&self) -> u64 {
        self.last_valid.load(Ordering::SeqCst)
    }

    /// Number of stored headers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.chain.lock().expect("chain poisoned").len()
    }

    /// True when no headers are stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlockStore for MemoryBlockStore {
    fn last(&self) -> Result<u64, LedgerError> {
        self.chain
            .lock()
            .expect("chain poisoned")
            .last()
            .map(|h| h.number)
            .ok_or(LedgerError::Empty)
    }

    fn add_block(&self, header: &BlockHeader, _finalized: bool) -> Result<(), LedgerError> {
        let mut chain = self.chain.lock().expect("chain poisoned");
        let tip = chain.last().ok_or(LedgerError::Empty)?;
        if header.number != tip.number + 1 || header.parent != tip.hash {
            return Err(LedgerError::Mismatch {
                number: header.number,
            });
        }
        chain.push(*header);
        Ok(())
    }

    fn store_last_valid(&self) {
        if let Ok(last) = self.last() {
            self.last_valid.store(last, Ordering::SeqCst);
        }
    }
}

/// Where the follower gets peaks and headers from. Implemented by the
/// session over RPC, and by fakes in tests.
pub trait HeaderSource: Send + Sync {
    /// Latest block height known to the node.
    fn block_peak(&self) -> impl Future<Output = Result<u64, CallError>> + Send;
    /// Header by number, unverified by the node.
    fn block_header(&self, number: u64) -> impl Future<Output = Result<BlockHeader, CallError>> + Send;
}

/// One follower tick. Returns the new cursor position; on any failure the
/// cursor does not advance past the last successfully appended header.
pub(crate) async fn run_tick<S: HeaderSource>(
    source: &S,
    store: &dyn BlockStore,
    cursor: u64,
    confirmations: u64,
) -> u64 {
    let mut cursor = cursor;
    if cursor == 0 {
        match store.last() {
            Ok(last) => cursor = last,
            Err(e) => {
                error!(error = %e, "cannot load ledger cursor");
                return 0;
            }
        }
    }
    let peak = match source.block_peak().await {
        Ok(peak) => peak,
        Err(e) => {
            error!(error = %e, "cannot get block peak");
            return cursor;
        }
    };
    let target = peak.saturating_sub(confirmations);
    if cursor >= target {
        return cursor;
    }
    for number in cursor + 1..=target {
        let header = match source.block_header(number).await {
            Ok(header) => header,
            Err(e) => {
                error!(number, error = %e, "couldn't download block header");
                return cursor;
            }
        };
        if let Err(e) = store.add_block(&header, false) {
            // Happens when an uncle was seen; fall back to the last
            // height the store still considers valid and retry next tick.
            warn!(number, error = %e, "couldn't add block");
            return store.last().unwrap_or(cursor);
        }
    }
    let last = store.last().unwrap_or(target);
    info!(from = cursor + 1, to = target, last_valid = last, "added blocks");
    store.store_last_valid();
    target
}

/// The follower task: ticks until the session closes.
pub(crate) async fn watch_latest_block<S: HeaderSource>(
    source: S,
    store: Arc<dyn BlockStore>,
    tick: Duration,
    confirmations: u64,
    mut state_rx: watch::Receiver<SessionState>,
) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first interval tick fires immediately; skip it so the session
    // finishes connecting before the first batch of header fetches.
    ticker.tick().await;
    let mut cursor = 0u64;
    loop {
        tokio::select! {
            _ = wait_for_closed(&mut state_rx) => {
                return;
            }
            _ = ticker.tick() => {
                cursor = run_tick(&source, store.as_ref(), cursor, confirmations).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn chain(len: u64) -> Vec<BlockHeader> {
        let mut headers = Vec::new();
        let mut parent = [0u8; 32];
        for number in 0..=len {
            let mut hash = [0u8; 32];
            hash[..8].copy_from_slice(&number.to_be_bytes());
            hash[8] = 0xCC;
            headers.push(BlockHeader {
                number,
                hash,
                parent,
            });
            parent = hash;
        }
        headers
    }

    struct FakeSource {
        peak: u64,
        headers: HashMap<u64, BlockHeader>,
        fail_at: Option<u64>,
    }

    impl FakeSource {
        fn from_chain(headers: &[BlockHeader], peak: u64) -> Self {
            Self {
                peak,
                headers: headers.iter().map(|h| (h.number, *h)).collect(),
                fail_at: None,
            }
        }
    }

    impl HeaderSource for FakeSource {
        async fn block_peak(&self) -> Result<u64, CallError> {
            Ok(self.peak)
        }

        async fn block_header(&self, number: u64) -> Result<BlockHeader, CallError> {
            if self.fail_at == Some(number) {
                return Err(CallError::Rpc("header unavailable".into()));
            }
            self.headers
                .get(&number)
                .copied()
                .ok_or_else(|| CallError::Rpc(format!("no header {number}")))
        }
    }

    #[test]
    fn memory_store_enforces_contiguity() {
        let headers = chain(3);
        let store = MemoryBlockStore::new(headers[0]);

        store.add_block(&headers[1], false).unwrap();
        store.add_block(&headers[2], false).unwrap();
        assert_eq!(store.last().unwrap(), 2);

        // Skipping a height is a mismatch
        let err = store.add_block(&headers[2], false).unwrap_err();
        assert_eq!(err, LedgerError::Mismatch { number: 2 });
    }

    #[tokio::test]
    async fn tick_advances_to_peak_minus_confirmations() {
        let headers = chain(110);
        let store = MemoryBlockStore::new(headers[0]);
        let source = FakeSource::from_chain(&headers, 110);

        let cursor = run_tick(&source, &store, 0, 2).await;
        assert_eq!(cursor, 108);
        assert_eq!(store.last().unwrap(), 108);
        assert_eq!(store.last_valid(), 108);
    }

    #[tokio::test]
    async fn tick_with_nothing_to_do_keeps_cursor() {
        let headers = chain(10);
        let store = MemoryBlockStore::new(headers[0]);
        for header in &headers[1..=8] {
            store.add_block(header, false).unwrap();
        }
        let source = FakeSource::from_chain(&headers, 10);

        let cursor = run_tick(&source, &store, 0, 2).await;
        assert_eq!(cursor, 8);
        assert_eq!(store.last().unwrap(), 8);
    }

    #[tokio::test]
    async fn header_failure_mid_tick_does_not_advance_cursor() {
        let headers = chain(110);
        let store = MemoryBlockStore::new(headers[0]);
        let mut source = FakeSource::from_chain(&headers, 110);
        source.fail_at = Some(105);

        let cursor = run_tick(&source, &store, 0, 2).await;
        // Headers 1..=104 were appended, but the cursor reports the value
        // from before the failed batch; the next tick resumes from Last().
        assert_eq!(cursor, 0);
        assert_eq!(store.last().unwrap(), 104);

        source.fail_at = None;
        let cursor = run_tick(&source, &store, cursor, 2).await;
        assert_eq!(cursor, 108);
        assert_eq!(store.last().unwrap(), 108);
    }

    #[tokio::test]
    async fn uncle_block_resets_cursor_to_last_valid() {
        let headers = chain(110);
        let store = MemoryBlockStore::new(headers[0]);
        // Store already holds 1..=100
        for header in &headers[1..=100] {
            store.add_block(header, false).unwrap();
        }

        // The source serves a forked header at 102: right number, wrong parent.
        let mut source = FakeSource::from_chain(&headers, 110);
        let mut uncle = headers[102];
        uncle.parent = [0xEE; 32];
        source.headers.insert(102, uncle);

        let cursor = run_tick(&source, &store, 100, 2).await;
        // 101 appended, 102 rejected: cursor resets to the store's tip.
        assert_eq!(cursor, 101);
        assert_eq!(store.last().unwrap(), 101);

        // Next tick with the fork healed catches up.
        source.headers.insert(102, headers[102]);
        let cursor = run_tick(&source, &store, cursor, 2).await;
        assert_eq!(cursor, 108);
        assert_eq!(store.last().unwrap(), 108);
    }

    #[tokio::test]
    async fn peak_failure_keeps_cursor() {
        struct FailingSource;
        impl HeaderSource for FailingSource {
            async fn block_peak(&self) -> Result<u64, CallError> {
                Err(CallError::Rpc("unreachable".into()))
            }
            async fn block_header(&self, _n: u64) -> Result<BlockHeader, CallError> {
                unreachable!("peak failed, no headers should be fetched")
            }
        }
        let store = MemoryBlockStore::new(chain(0)[0]);
        let cursor = run_tick(&FailingSource, &store, 5, 2).await;
        assert_eq!(cursor, 5);
    }
}
