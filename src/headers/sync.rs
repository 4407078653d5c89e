//! Per-connection header download
//!
//! The driver asks for headers with a block locator, checks what comes back
//! before it touches the tree, and keeps asking while the peer makes
//! progress.

use super::tree::{median, HeaderTree, MEDIAN_TIME_SPAN};
use crate::blockchain::pow::{bits_to_target, check_proof_of_work};
use crate::blockchain::{short_hash, BlockHeader, Hash256, ZERO_HASH};
use crate::config::NetworkConfig;
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, EventBus};
use crate::fetch::ConnectionId;
use crate::network::OutboundMessage;
use parking_lot::Mutex;
use primitive_types::U256;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Consecutive batches that do not attach to the tree before the peer is
/// considered to be feeding us garbage.
pub const MAX_UNCONNECTED_BATCHES: u32 = 8;

/// Disjoint runs of headers allowed in one message.
pub const MAX_BRANCHES_PER_BATCH: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Idle,
    AwaitingHeaders,
}

pub struct HeaderSyncDriver {
    connection: ConnectionId,
    tree: Arc<Mutex<HeaderTree>>,
    events: Arc<EventBus>,
    state: SyncState,
    unconnected_batches: u32,
    pow_limit: U256,
    max_headers: usize,
    max_future_drift: u64,
}

impl HeaderSyncDriver {
    pub fn new(
        connection: ConnectionId,
        tree: Arc<Mutex<HeaderTree>>,
        events: Arc<EventBus>,
        config: &NetworkConfig,
    ) -> Result<Self> {
        let pow_limit = bits_to_target(config.pow_limit_bits).ok_or_else(|| {
            ChainError::Config(format!("Invalid pow_limit_bits {:#010x}", config.pow_limit_bits))
        })?;
        Ok(HeaderSyncDriver {
            connection,
            tree,
            events,
            state: SyncState::Idle,
            unconnected_batches: 0,
            pow_limit,
            max_headers: config.max_headers_per_message,
            max_future_drift: config.max_future_drift.as_secs(),
        })
    }

    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Ask for whatever follows our best head.
    pub fn start(&mut self) -> OutboundMessage {
        let locator = {
            let tree = self.tree.lock();
            tree.locator(&tree.get_best_head().hash)
        };
        self.request(locator)
    }

    /// Handle a headers message. `now` is the local clock in unix seconds.
    ///
    /// Headers that arrive while idle are new-block announcements and go
    /// through the same checks.
    pub fn on_headers(&mut self, headers: &[BlockHeader], now: u64) -> Result<Option<OutboundMessage>> {
        if headers.len() > self.max_headers {
            return Err(ChainError::ProtocolViolation(format!(
                "{} headers in one message, limit is {}",
                headers.len(),
                self.max_headers
            )));
        }
        if headers.is_empty() {
            debug!("{}: peer has no more headers", self.connection);
            self.state = SyncState::Idle;
            self.unconnected_batches = 0;
            return Ok(None);
        }

        let hashes: Vec<Hash256> = headers.iter().map(|h| h.hash()).collect();
        let roots = branch_roots(headers, &hashes)?;

        let mut tree = self.tree.lock();

        let mut seen: HashSet<Hash256> = HashSet::new();
        let mut connected = true;
        for (i, hash) in hashes.iter().enumerate() {
            if roots.contains(&i) {
                let parent = headers[i].previous_hash;
                connected &= tree.contains(&parent) || seen.contains(&parent);
            }
            seen.insert(*hash);
        }

        if !connected {
            self.unconnected_batches += 1;
            if self.unconnected_batches > MAX_UNCONNECTED_BATCHES {
                return Err(ChainError::ProtocolViolation(format!(
                    "{} consecutive header batches do not connect",
                    self.unconnected_batches
                )));
            }
            debug!(
                "{}: unconnected header batch ({} in a row), asking again",
                self.connection, self.unconnected_batches
            );
            let locator = tree.locator(&tree.get_best_head().hash);
            drop(tree);
            return Ok(Some(self.request(locator)));
        }
        self.unconnected_batches = 0;

        let batch: HashMap<Hash256, &BlockHeader> =
            hashes.iter().copied().zip(headers.iter()).collect();
        for (header, hash) in headers.iter().zip(&hashes) {
            if tree.contains(hash) {
                continue;
            }
            self.check_header(&tree, &batch, header, now)?;
        }

        let before = tree.get_best_head().hash;
        let outcome = tree.add(headers)?;
        let best = tree.get_best_head().clone();
        let next_locator = if outcome.added.is_empty() {
            None
        } else {
            hashes.last().map(|last| tree.locator(last))
        };
        drop(tree);

        if best.hash != before {
            info!(
                "{}: best header {} at height {} ({} new)",
                self.connection,
                short_hash(&best.hash),
                best.height,
                outcome.added.len()
            );
            self.events.publish(ChainEvent::BestHeadChanged {
                hash: best.hash,
                height: best.height,
            });
        }

        match next_locator {
            Some(locator) => Ok(Some(self.request(locator))),
            None => {
                self.state = SyncState::Idle;
                Ok(None)
            }
        }
    }

    fn request(&mut self, locator: Vec<Hash256>) -> OutboundMessage {
        self.state = SyncState::AwaitingHeaders;
        OutboundMessage::GetHeaders {
            locator,
            stop: ZERO_HASH,
        }
    }

    fn check_header(
        &self,
        tree: &HeaderTree,
        batch: &HashMap<Hash256, &BlockHeader>,
        header: &BlockHeader,
        now: u64,
    ) -> Result<()> {
        check_proof_of_work(header, self.pow_limit)?;

        if u64::from(header.timestamp) > now + self.max_future_drift {
            return Err(ChainError::ProtocolViolation(format!(
                "Header {} is timestamped too far in the future",
                short_hash(&header.hash())
            )));
        }

        if let Some(mtp) = parent_median_time_past(tree, batch, header.previous_hash) {
            if header.timestamp <= mtp {
                return Err(ChainError::ProtocolViolation(format!(
                    "Header {} timestamp {} is not after median time past {}",
                    short_hash(&header.hash()),
                    header.timestamp,
                    mtp
                )));
            }
        }
        Ok(())
    }
}

/// Indices where a new branch starts. At most two are allowed.
fn branch_roots(headers: &[BlockHeader], hashes: &[Hash256]) -> Result<Vec<usize>> {
    let mut roots = vec![0];
    for i in 1..headers.len() {
        if headers[i].previous_hash != hashes[i - 1] {
            roots.push(i);
        }
    }
    if roots.len() > MAX_BRANCHES_PER_BATCH {
        return Err(ChainError::ProtocolViolation(format!(
            "Header batch holds {} disjoint branches",
            roots.len()
        )));
    }
    Ok(roots)
}

/// Median time past ending at `parent`, walking back through the current
/// batch first and then the tree.
fn parent_median_time_past(
    tree: &HeaderTree,
    batch: &HashMap<Hash256, &BlockHeader>,
    parent: Hash256,
) -> Option<u32> {
    let mut timestamps = Vec::with_capacity(MEDIAN_TIME_SPAN);
    let mut cursor = parent;
    while timestamps.len() < MEDIAN_TIME_SPAN {
        match batch.get(&cursor) {
            Some(header) if !tree.contains(&cursor) => {
                timestamps.push(header.timestamp);
                cursor = header.previous_hash;
            }
            _ => break,
        }
    }
    let remaining = MEDIAN_TIME_SPAN - timestamps.len();
    if remaining > 0 {
        timestamps.extend(tree.recent_timestamps(&cursor, remaining));
    }
    median(timestamps)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::store::InMemoryHeaderStore;
    use crate::testing;

    const NOW: u64 = 2_000_000_000;

    fn setup() -> (HeaderSyncDriver, Arc<Mutex<HeaderTree>>, crossbeam_channel::Receiver<ChainEvent>) {
        let tree = HeaderTree::open(Box::new(InMemoryHeaderStore::new()), testing::genesis_header()).unwrap();
        let tree = Arc::new(Mutex::new(tree));
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe(16);
        let driver = HeaderSyncDriver::new(
            ConnectionId::new(1),
            tree.clone(),
            events,
            &NetworkConfig::default(),
        )
        .unwrap();
        (driver, tree, rx)
    }

    fn locator_of(msg: &OutboundMessage) -> Vec<Hash256> {
        match msg {
            OutboundMessage::GetHeaders { locator, .. } => locator.clone(),
            other => panic!("expected GetHeaders, got {:?}", other),
        }
    }

    #[test]
    fn test_start_requests_from_genesis() {
        let (mut driver, tree, _rx) = setup();
        let msg = driver.start();
        assert_eq!(locator_of(&msg), vec![tree.lock().genesis().hash]);
        assert_eq!(driver.state(), SyncState::AwaitingHeaders);
    }

    #[test]
    fn test_progress_rerequests_and_publishes() {
        let (mut driver, tree, rx) = setup();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 5, 0);
        driver.start();

        let next = driver.on_headers(&chain, NOW).unwrap().unwrap();
        assert_eq!(locator_of(&next)[0], chain[4].hash());
        assert_eq!(tree.lock().get_best_head().height, 5);
        assert_eq!(
            rx.try_recv().unwrap(),
            ChainEvent::BestHeadChanged { hash: chain[4].hash(), height: 5 }
        );

        // Nothing new: the driver goes idle.
        assert!(driver.on_headers(&chain, NOW).unwrap().is_none());
        assert_eq!(driver.state(), SyncState::Idle);
        assert!(driver.on_headers(&[], NOW).unwrap().is_none());
    }

    #[test]
    fn test_two_branches_allowed_three_rejected() {
        let (mut driver, tree, _rx) = setup();
        let genesis = testing::genesis_header();
        let a = testing::header_chain(&genesis, 2, 1);
        let b = testing::header_chain(&genesis, 2, 2);
        let c = testing::header_chain(&genesis, 1, 3);

        let batch: Vec<BlockHeader> = a.iter().chain(b.iter()).copied().collect();
        driver.on_headers(&batch, NOW).unwrap();
        assert_eq!(tree.lock().len(), 5);

        let batch: Vec<BlockHeader> = a.iter().chain(b.iter()).chain(c.iter()).copied().collect();
        let result = driver.on_headers(&batch, NOW);
        assert!(matches!(result, Err(ChainError::ProtocolViolation(_))));
        assert_eq!(tree.lock().len(), 5);
    }

    #[test]
    fn test_too_many_headers_rejected() {
        let (mut driver, _tree, _rx) = setup();
        let genesis = testing::genesis_header();
        let header = testing::mine_child(&genesis, genesis.timestamp + 60, 0);
        let batch = vec![header; 2001];
        let result = driver.on_headers(&batch, NOW);
        assert!(matches!(result, Err(ChainError::ProtocolViolation(_))));
    }

    #[test]
    fn test_bad_pow_rejected_before_insertion() {
        let (mut driver, tree, _rx) = setup();
        let genesis = testing::genesis_header();
        let mut header = testing::mine_child(&genesis, genesis.timestamp + 60, 0);
        // A regtest-mined hash will not meet mainnet difficulty.
        header.bits = 0x1d00ffff;
        let result = driver.on_headers(&[header], NOW);
        assert!(matches!(result, Err(ChainError::ProtocolViolation(_))));
        assert_eq!(tree.lock().len(), 1);
    }

    #[test]
    fn test_timestamp_rules() {
        let (mut driver, tree, _rx) = setup();
        let genesis = testing::genesis_header();

        let future = testing::mine_child(&genesis, (NOW + 3 * 3600) as u32, 0);
        assert!(matches!(
            driver.on_headers(&[future], NOW),
            Err(ChainError::ProtocolViolation(_))
        ));

        // Not after the median of its ancestors (here: genesis alone).
        let stale = testing::mine_child(&genesis, genesis.timestamp, 0);
        assert!(matches!(
            driver.on_headers(&[stale], NOW),
            Err(ChainError::ProtocolViolation(_))
        ));

        // Same rule inside a batch: the second header looks back at the first.
        let first = testing::mine_child(&genesis, genesis.timestamp + 600, 1);
        let second = testing::mine_child(&first, genesis.timestamp + 300, 1);
        assert!(matches!(
            driver.on_headers(&[first, second], NOW),
            Err(ChainError::ProtocolViolation(_))
        ));
        assert_eq!(tree.lock().len(), 1);
    }

    #[test]
    fn test_unconnected_batches_limit() {
        let (mut driver, tree, _rx) = setup();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 3, 0);
        let orphan = &chain[2..];

        for _ in 0..MAX_UNCONNECTED_BATCHES {
            let msg = driver.on_headers(orphan, NOW).unwrap().unwrap();
            assert_eq!(locator_of(&msg), vec![tree.lock().genesis().hash]);
        }
        let result = driver.on_headers(orphan, NOW);
        assert!(matches!(result, Err(ChainError::ProtocolViolation(_))));
        assert_eq!(tree.lock().len(), 1);
    }

    #[test]
    fn test_connected_batch_resets_unconnected_counter() {
        let (mut driver, _tree, _rx) = setup();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 3, 0);

        for _ in 0..MAX_UNCONNECTED_BATCHES {
            driver.on_headers(&chain[2..], NOW).unwrap();
        }
        driver.on_headers(&chain[..2], NOW).unwrap();
        for _ in 0..MAX_UNCONNECTED_BATCHES {
            driver.on_headers(&[testing::header_chain(&chain[2], 2, 0)[1]], NOW).unwrap();
        }
        assert!(driver.on_headers(&chain[2..], NOW).unwrap().is_some());
    }
}
