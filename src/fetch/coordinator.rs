//! Shared table of wanted blocks
//!
//! Internal consumers say which headers they want; connection drivers pick
//! from that list and record their attempts. Everything lives behind one
//! mutex, and drivers are woken through a [`Notify`] when the table changes.

use crate::blockchain::{short_hash, Hash256};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tokio::sync::Notify;
use tracing::debug;

/// Handle of an internal block consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerId(u32);

/// Handle of a peer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WantedHeader {
    pub hash: Hash256,
    pub height: u32,
}

struct WantedEntry {
    height: u32,
    owners: HashSet<ConsumerId>,
    attempts: HashSet<ConnectionId>,
    received: bool,
}

#[derive(Default)]
struct FetchTable {
    entries: HashMap<Hash256, WantedEntry>,
    /// Wanted and not yet received, lowest height first.
    pending: BTreeSet<(u32, Hash256)>,
    wants: HashMap<ConsumerId, Vec<Hash256>>,
    next_consumer: u32,
    next_connection: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FetchStats {
    pub wanted: usize,
    pub pending: usize,
    pub attempts: usize,
}

#[derive(Default)]
pub struct BlockFetchCoordinator {
    table: Mutex<FetchTable>,
    changed: Notify,
}

impl BlockFetchCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_consumer(&self) -> ConsumerId {
        let mut table = self.table.lock();
        table.next_consumer += 1;
        ConsumerId(table.next_consumer)
    }

    pub fn register_connection(&self) -> ConnectionId {
        let mut table = self.table.lock();
        table.next_connection += 1;
        ConnectionId(table.next_connection)
    }

    /// Replace `owner`'s want-list with `headers`.
    pub fn add_request(&self, owner: ConsumerId, headers: &[WantedHeader]) {
        let mut changed = false;
        {
            let mut table = self.table.lock();
            let table = &mut *table;
            let new_hashes: Vec<Hash256> = headers.iter().map(|h| h.hash).collect();
            let previous = table.wants.insert(owner, new_hashes).unwrap_or_default();

            for header in headers {
                if !table.entries.contains_key(&header.hash) {
                    table.pending.insert((header.height, header.hash));
                    changed = true;
                }
                table
                    .entries
                    .entry(header.hash)
                    .or_insert_with(|| WantedEntry {
                        height: header.height,
                        owners: HashSet::new(),
                        attempts: HashSet::new(),
                        received: false,
                    })
                    .owners
                    .insert(owner);
            }

            let keep: HashSet<Hash256> = headers.iter().map(|h| h.hash).collect();
            for hash in previous.iter().filter(|h| !keep.contains(*h)) {
                let orphaned = match table.entries.get_mut(hash) {
                    Some(entry) => {
                        entry.owners.remove(&owner);
                        entry.owners.is_empty()
                    }
                    None => false,
                };
                if orphaned {
                    if let Some(entry) = table.entries.remove(hash) {
                        table.pending.remove(&(entry.height, *hash));
                    }
                }
            }
        }
        if changed {
            self.changed.notify_waiters();
        }
    }

    /// Record arrival of a block. True if anyone wanted it.
    pub fn mark_received(&self, hash: &Hash256) -> bool {
        let mut table = self.table.lock();
        let table = &mut *table;
        match table.entries.get_mut(hash) {
            Some(entry) => {
                if !entry.received {
                    entry.received = true;
                    entry.attempts.clear();
                    table.pending.remove(&(entry.height, *hash));
                }
                true
            }
            None => false,
        }
    }

    /// Put a received block back on the wanted list, e.g. after it was
    /// evicted from the cache before use.
    pub fn mark_missing(&self, hash: &Hash256) {
        let requeued = {
            let mut table = self.table.lock();
            let table = &mut *table;
            match table.entries.get_mut(hash) {
                Some(entry) if entry.received => {
                    entry.received = false;
                    table.pending.insert((entry.height, *hash));
                    true
                }
                _ => false,
            }
        };
        if requeued {
            debug!("Block {} went missing, fetching again", short_hash(hash));
            self.changed.notify_waiters();
        }
    }

    pub fn is_wanted(&self, hash: &Hash256) -> bool {
        self.table.lock().entries.contains_key(hash)
    }

    pub fn is_received(&self, hash: &Hash256) -> bool {
        self.table
            .lock()
            .entries
            .get(hash)
            .is_some_and(|e| e.received)
    }

    /// Record that `connection` is fetching `hash`. False when the block is
    /// no longer pending.
    pub fn begin_attempt(&self, hash: &Hash256, connection: ConnectionId) -> bool {
        let mut table = self.table.lock();
        match table.entries.get_mut(hash) {
            Some(entry) if !entry.received => {
                entry.attempts.insert(connection);
                true
            }
            _ => false,
        }
    }

    pub fn end_attempt(&self, hash: &Hash256, connection: ConnectionId) {
        let released = {
            let mut table = self.table.lock();
            table
                .entries
                .get_mut(hash)
                .is_some_and(|e| e.attempts.remove(&connection) && !e.received)
        };
        if released {
            self.changed.notify_waiters();
        }
    }

    pub fn connection_closed(&self, connection: ConnectionId) {
        {
            let mut table = self.table.lock();
            for entry in table.entries.values_mut() {
                entry.attempts.remove(&connection);
            }
        }
        self.changed.notify_waiters();
    }

    /// Claim up to `limit` pending headers for `connection`. Headers this
    /// connection already attempts, that fail `advertised` or are
    /// `excluded`, are skipped. The lowest pending header comes first even
    /// when another connection attempts it; the rest are ordered by
    /// attempt count, then height.
    pub fn select(
        &self,
        connection: ConnectionId,
        advertised: impl Fn(&Hash256) -> bool,
        excluded: impl Fn(&Hash256) -> bool,
        limit: usize,
    ) -> Vec<WantedHeader> {
        if limit == 0 {
            return Vec::new();
        }
        let mut table = self.table.lock();
        let table = &mut *table;
        let lowest = table.pending.iter().next().map(|&(_, hash)| hash);

        let mut candidates: Vec<(bool, usize, u32, Hash256)> = table
            .pending
            .iter()
            .filter_map(|&(height, hash)| {
                let entry = table.entries.get(&hash)?;
                if entry.attempts.contains(&connection) || !advertised(&hash) || excluded(&hash) {
                    return None;
                }
                Some((Some(hash) != lowest, entry.attempts.len(), height, hash))
            })
            .collect();
        candidates.sort_unstable();
        candidates.truncate(limit);

        let mut selected = Vec::with_capacity(candidates.len());
        for (_, _, height, hash) in candidates {
            if let Some(entry) = table.entries.get_mut(&hash) {
                entry.attempts.insert(connection);
                selected.push(WantedHeader { hash, height });
            }
        }
        selected
    }

    /// Lowest wanted header that has not arrived.
    pub fn first_wanted(&self) -> Option<WantedHeader> {
        self.table
            .lock()
            .pending
            .iter()
            .next()
            .map(|&(height, hash)| WantedHeader { hash, height })
    }

    pub fn stats(&self) -> FetchStats {
        let table = self.table.lock();
        FetchStats {
            wanted: table.entries.len(),
            pending: table.pending.len(),
            attempts: table.entries.values().map(|e| e.attempts.len()).sum(),
        }
    }

    /// Resolves on the next change to the wanted set.
    pub async fn wait_for_change(&self) {
        self.changed.notified().await
    }
}
