//! Per-connection block download
//!
//! Each connection tracks what its peer advertised and what it asked for,
//! claims work from the shared coordinator, and hands verified bodies to the
//! block cache.

use super::coordinator::{BlockFetchCoordinator, ConnectionId};
use crate::blockchain::{short_hash, Block, Hash256, ZERO_HASH};
use crate::cache::BlockCache;
use crate::config::FetchConfig;
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, EventBus};
use crate::headers::HeaderTree;
use crate::network::OutboundMessage;
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, trace};

pub struct BlockFetchDriver {
    connection: ConnectionId,
    coordinator: Arc<BlockFetchCoordinator>,
    cache: Arc<BlockCache>,
    tree: Arc<Mutex<HeaderTree>>,
    events: Arc<EventBus>,
    config: FetchConfig,
    /// Hashes the peer announced, with the time of the announcement.
    inventory: LruCache<Hash256, Instant>,
    /// Hashes this connection has asked for.
    requested: LruCache<Hash256, Instant>,
    in_flight: HashMap<Hash256, Instant>,
    last_probe: Option<Instant>,
}

impl BlockFetchDriver {
    pub fn new(
        connection: ConnectionId,
        coordinator: Arc<BlockFetchCoordinator>,
        cache: Arc<BlockCache>,
        tree: Arc<Mutex<HeaderTree>>,
        events: Arc<EventBus>,
        config: FetchConfig,
    ) -> Self {
        let cap = NonZeroUsize::new(config.max_tracked_inventory).unwrap_or(NonZeroUsize::MIN);
        BlockFetchDriver {
            connection,
            coordinator,
            cache,
            tree,
            events,
            config,
            inventory: LruCache::new(cap),
            requested: LruCache::new(cap),
            in_flight: HashMap::new(),
            last_probe: None,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn on_inventory(&mut self, hashes: &[Hash256], now: Instant) {
        for hash in hashes {
            self.inventory.put(*hash, now);
        }
    }

    /// Expire stale state, then top up requests.
    pub fn on_tick(&mut self, now: Instant) -> Vec<OutboundMessage> {
        let timeout = self.config.request_timeout;
        let is_stale = |at: &Instant| now.saturating_duration_since(*at) >= timeout;

        expire(&mut self.inventory, is_stale);
        expire(&mut self.requested, is_stale);

        let timed_out: Vec<Hash256> = self
            .in_flight
            .iter()
            .filter(|(_, at)| is_stale(at))
            .map(|(hash, _)| *hash)
            .collect();
        for hash in timed_out {
            debug!("{}: request for {} timed out", self.connection, short_hash(&hash));
            self.in_flight.remove(&hash);
            self.coordinator.end_attempt(&hash, self.connection);
        }

        self.fill_requests(now)
    }

    /// Claim advertised blocks up to the in-flight limit. When there is
    /// nothing to claim and nothing outstanding, probe the peer with a
    /// locator so it announces what it has.
    pub fn fill_requests(&mut self, now: Instant) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        let free = self.config.max_in_flight.saturating_sub(self.in_flight.len());

        let inventory = &self.inventory;
        let requested = &self.requested;
        let selected = self.coordinator.select(
            self.connection,
            |hash| inventory.contains(hash),
            |hash| requested.contains(hash),
            free,
        );

        if !selected.is_empty() {
            let hashes: Vec<Hash256> = selected.iter().map(|w| w.hash).collect();
            for hash in &hashes {
                self.in_flight.insert(*hash, now);
                self.requested.put(*hash, now);
            }
            trace!("{}: requesting {} blocks", self.connection, hashes.len());
            out.push(OutboundMessage::GetData(hashes));
        } else if self.in_flight.is_empty() {
            if let Some(probe) = self.probe(now) {
                out.push(probe);
            }
        }
        out
    }

    fn probe(&mut self, now: Instant) -> Option<OutboundMessage> {
        if let Some(last) = self.last_probe {
            if now.saturating_duration_since(last) < self.config.probe_interval {
                return None;
            }
        }
        let first = self.coordinator.first_wanted()?;
        let locator = {
            let tree = self.tree.lock();
            let parent = tree.get(&first.hash)?.parent_hash();
            tree.locator(&parent)
        };
        self.last_probe = Some(now);
        debug!(
            "{}: probing for blocks after height {}",
            self.connection,
            first.height.saturating_sub(1)
        );
        Some(OutboundMessage::GetBlocks {
            locator,
            stop: ZERO_HASH,
        })
    }

    /// Accept a block body. Blocks nobody wants and whose header we do not
    /// know are dropped; a body that does not match its header is a
    /// protocol violation.
    pub fn on_block(&mut self, block: Block) -> Result<()> {
        let hash = block.hash();
        let was_requested = self.in_flight.remove(&hash).is_some();
        if was_requested {
            self.coordinator.end_attempt(&hash, self.connection);
        }

        if !was_requested && !self.coordinator.is_wanted(&hash) {
            trace!("{}: dropping unsolicited block {}", self.connection, short_hash(&hash));
            return Ok(());
        }
        if !self.tree.lock().contains(&hash) {
            if was_requested {
                return Err(ChainError::ProtocolViolation(format!(
                    "Block {} does not match any requested header",
                    short_hash(&hash)
                )));
            }
            return Ok(());
        }

        if block.transactions.is_empty() {
            return Err(ChainError::ProtocolViolation(format!(
                "Block {} has no transactions",
                short_hash(&hash)
            )));
        }
        if block.is_merkle_mutated() {
            return Err(ChainError::ProtocolViolation(format!(
                "Block {} carries a mutated transaction list",
                short_hash(&hash)
            )));
        }
        if !block.has_valid_merkle_root() {
            return Err(ChainError::ProtocolViolation(format!(
                "Block {} transactions do not match its merkle root",
                short_hash(&hash)
            )));
        }

        // Requested earlier, but every consumer has since moved on.
        if !self.coordinator.is_wanted(&hash) {
            trace!("{}: block {} no longer wanted", self.connection, short_hash(&hash));
            return Ok(());
        }
        // Another connection delivered it first.
        if self.coordinator.is_received(&hash) {
            return Ok(());
        }
        self.cache.put(hash, Arc::new(block));
        if self.coordinator.mark_received(&hash) {
            self.events.publish(ChainEvent::BlockDownloaded {
                hash,
                connection: self.connection,
            });
            self.events.publish(ChainEvent::BlockAvailable { hash });
        }
        Ok(())
    }

    /// Release everything this connection holds in the coordinator.
    pub fn close(&mut self) {
        self.in_flight.clear();
        self.coordinator.connection_closed(self.connection);
    }
}

fn expire(entries: &mut LruCache<Hash256, Instant>, is_stale: impl Fn(&Instant) -> bool) {
    let stale: Vec<Hash256> = entries
        .iter()
        .filter(|(_, at)| is_stale(at))
        .map(|(hash, _)| *hash)
        .collect();
    for hash in stale {
        entries.pop(&hash);
    }
}
