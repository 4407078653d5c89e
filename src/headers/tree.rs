//! In-memory header tree mirrored to a [`HeaderStore`].
//!
//! Nodes live in an arena and refer to each other by index. The tree keeps
//! the set of valid heads (valid nodes without valid children) and caches the
//! best one: most cumulative work, then earlier timestamp, then whichever was
//! inserted first.

use super::store::{HeaderRecord, HeaderStore};
use super::subchain::{ChainLink, SubChain};
use crate::blockchain::pow::block_work;
use crate::blockchain::{short_hash, BlockHeader, Hash256};
use crate::error::{ChainError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info, warn};

/// Headers considered by the median-time-past rule.
pub const MEDIAN_TIME_SPAN: usize = 11;

/// Dense entries at the start of a locator before the step starts doubling.
const LOCATOR_DENSE_ENTRIES: usize = 10;

const ROOT: usize = 0;

struct Node {
    record: HeaderRecord,
    parent: Option<usize>,
    children: Vec<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddOutcome {
    /// Hashes of headers that were new to the tree, in insertion order.
    pub added: Vec<Hash256>,
    pub best_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidateOutcome {
    pub invalidated: Vec<Hash256>,
    pub best_changed: bool,
}

pub struct HeaderTree {
    nodes: Vec<Node>,
    index: HashMap<Hash256, usize>,
    valid_heads: HashSet<usize>,
    best: usize,
    version: u64,
    store: Box<dyn HeaderStore>,
}

impl HeaderTree {
    /// Rebuild the tree from `store`, seeding it with `genesis` when empty.
    pub fn open(store: Box<dyn HeaderStore>, genesis: BlockHeader) -> Result<Self> {
        let mut records = store.load()?;
        if records.is_empty() {
            let record = HeaderRecord {
                header: genesis,
                hash: genesis.hash(),
                height: 0,
                work: block_work(genesis.bits),
                valid: true,
            };
            store.append(std::slice::from_ref(&record))?;
            records.push(record);
        }

        let root = &records[0];
        if root.hash != genesis.hash() || root.height != 0 || !root.valid {
            return Err(ChainError::Integrity(format!(
                "Stored root {} does not match configured genesis {}",
                hex::encode(root.hash),
                hex::encode(genesis.hash())
            )));
        }

        let mut tree = HeaderTree {
            nodes: Vec::with_capacity(records.len()),
            index: HashMap::with_capacity(records.len()),
            valid_heads: HashSet::new(),
            best: ROOT,
            version: 0,
            store,
        };

        let mut records = records.into_iter();
        if let Some(root) = records.next() {
            tree.push_node(root, None);
        }
        for record in records {
            let parent = *tree.index.get(&record.parent_hash()).ok_or_else(|| {
                ChainError::Integrity(format!(
                    "Stored header {} has no stored parent",
                    hex::encode(record.hash)
                ))
            })?;
            let parent_record = &tree.nodes[parent].record;
            let expected_work = parent_record.work + block_work(record.header.bits);
            if record.height != parent_record.height + 1
                || record.work != expected_work
                || (record.valid && !parent_record.valid)
            {
                return Err(ChainError::Integrity(format!(
                    "Stored header {} is inconsistent with its parent",
                    hex::encode(record.hash)
                )));
            }
            tree.push_node(record, Some(parent));
        }

        tree.best = tree.rank_best(tree.valid_heads.iter().copied());
        let best = tree.get_best_head();
        info!(
            "Header tree loaded: {} headers, best {} at height {}",
            tree.nodes.len(),
            short_hash(&best.hash),
            best.height
        );
        Ok(tree)
    }

    /// Insert a batch of headers. Parents may appear earlier in the same
    /// batch; known headers are skipped. An unknown parent is an integrity
    /// error and leaves the tree untouched.
    pub fn add(&mut self, headers: &[BlockHeader]) -> Result<AddOutcome> {
        let mut pending: Vec<HeaderRecord> = Vec::new();
        let mut in_batch: HashMap<Hash256, usize> = HashMap::new();

        for header in headers {
            let hash = header.hash();
            if self.index.contains_key(&hash) || in_batch.contains_key(&hash) {
                continue;
            }

            let parent = if let Some(&i) = self.index.get(&header.previous_hash) {
                &self.nodes[i].record
            } else if let Some(&i) = in_batch.get(&header.previous_hash) {
                &pending[i]
            } else {
                return Err(ChainError::Integrity(format!(
                    "Header {} extends unknown parent {}",
                    hex::encode(hash),
                    hex::encode(header.previous_hash)
                )));
            };

            let record = HeaderRecord {
                header: *header,
                hash,
                height: parent.height + 1,
                work: parent.work + block_work(header.bits),
                valid: parent.valid,
            };
            in_batch.insert(hash, pending.len());
            pending.push(record);
        }

        if pending.is_empty() {
            return Ok(AddOutcome::default());
        }

        self.store.append(&pending)?;

        let previous_best = self.best;
        let mut added = Vec::with_capacity(pending.len());
        for record in pending {
            if !record.valid {
                debug!("Quarantining header {} below an invalid parent", short_hash(&record.hash));
            }
            let parent = self.index.get(&record.parent_hash()).copied();
            added.push(record.hash);
            let idx = self.push_node(record, parent);
            if self.nodes[idx].record.valid && self.ranks_higher(idx, self.best) {
                self.best = idx;
            }
        }

        let best_changed = self.best != previous_best;
        if best_changed {
            self.version += 1;
        }
        Ok(AddOutcome {
            added,
            best_changed,
        })
    }

    /// Invalidate `hash` and every valid descendant.
    pub fn mark_invalid(&mut self, hash: &Hash256) -> Result<InvalidateOutcome> {
        let start = *self.index.get(hash).ok_or_else(|| {
            ChainError::Integrity(format!("Cannot invalidate unknown header {}", hex::encode(hash)))
        })?;
        if start == ROOT {
            return Err(ChainError::Integrity("The genesis header cannot be invalidated".to_string()));
        }
        if !self.nodes[start].record.valid {
            return Ok(InvalidateOutcome::default());
        }

        let mut affected = Vec::new();
        let mut queue = VecDeque::from([start]);
        while let Some(i) = queue.pop_front() {
            affected.push(i);
            queue.extend(
                self.nodes[i]
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| self.nodes[c].record.valid),
            );
        }

        let hashes: Vec<Hash256> = affected.iter().map(|&i| self.nodes[i].record.hash).collect();
        self.store.mark_invalid(&hashes)?;

        let mut best_affected = false;
        for &i in &affected {
            self.nodes[i].record.valid = false;
            self.valid_heads.remove(&i);
            best_affected |= i == self.best;
        }

        if let Some(parent) = self.nodes[start].parent {
            let has_valid_child = self.nodes[parent]
                .children
                .iter()
                .any(|&c| self.nodes[c].record.valid);
            if !has_valid_child {
                self.valid_heads.insert(parent);
            }
        }

        if best_affected {
            self.best = self.rank_best(self.valid_heads.iter().copied());
            self.version += 1;
            let best = self.get_best_head();
            warn!(
                "Invalidated {} headers from {}; best head moved to {} at height {}",
                hashes.len(),
                short_hash(hash),
                short_hash(&best.hash),
                best.height
            );
        } else {
            warn!("Invalidated {} headers from {}", hashes.len(), short_hash(hash));
        }

        Ok(InvalidateOutcome {
            invalidated: hashes,
            best_changed: best_affected,
        })
    }

    pub fn get_best_head(&self) -> &HeaderRecord {
        &self.nodes[self.best].record
    }

    /// Best valid head among the descendants of `hash`, itself included.
    pub fn get_best_head_from(&self, hash: &Hash256) -> Option<&HeaderRecord> {
        let start = *self.index.get(hash)?;
        if !self.nodes[start].record.valid {
            return None;
        }

        let mut heads = Vec::new();
        let mut stack = vec![start];
        while let Some(i) = stack.pop() {
            if self.valid_heads.contains(&i) {
                heads.push(i);
            }
            stack.extend(
                self.nodes[i]
                    .children
                    .iter()
                    .copied()
                    .filter(|&c| self.nodes[c].record.valid),
            );
        }
        Some(&self.nodes[self.rank_best(heads.into_iter())].record)
    }

    /// Up to `length` headers ending at `hash`, lowest first. Shorter only
    /// when the walk reaches genesis.
    pub fn get_subchain(&self, hash: &Hash256, length: usize) -> Option<SubChain> {
        let mut cursor = Some(*self.index.get(hash)?);
        let mut links = Vec::with_capacity(length);
        while let Some(i) = cursor {
            if links.len() == length {
                break;
            }
            let record = &self.nodes[i].record;
            links.push(ChainLink {
                hash: record.hash,
                parent_hash: record.parent_hash(),
                height: record.height,
            });
            cursor = self.nodes[i].parent;
        }
        links.reverse();
        Some(SubChain::from_links(links))
    }

    pub fn get(&self, hash: &Hash256) -> Option<&HeaderRecord> {
        self.index.get(hash).map(|&i| &self.nodes[i].record)
    }

    pub fn contains(&self, hash: &Hash256) -> bool {
        self.index.contains_key(hash)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn genesis(&self) -> &HeaderRecord {
        &self.nodes[ROOT].record
    }

    pub fn valid_heads(&self) -> Vec<&HeaderRecord> {
        let mut heads: Vec<usize> = self.valid_heads.iter().copied().collect();
        heads.sort_unstable();
        heads.into_iter().map(|i| &self.nodes[i].record).collect()
    }

    /// Incremented whenever the best head changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Ancestor of `hash` (or `hash` itself) at `height`.
    pub fn ancestor_at(&self, hash: &Hash256, height: u32) -> Option<&HeaderRecord> {
        let mut i = *self.index.get(hash)?;
        if self.nodes[i].record.height < height {
            return None;
        }
        while self.nodes[i].record.height > height {
            i = self.nodes[i].parent?;
        }
        Some(&self.nodes[i].record)
    }

    /// True when `hash` lies on the chain ending at the best head.
    pub fn is_on_best_chain(&self, hash: &Hash256) -> bool {
        match self.get(hash) {
            Some(record) => self
                .ancestor_at(&self.get_best_head().hash, record.height)
                .is_some_and(|a| a.hash == *hash),
            None => false,
        }
    }

    /// Timestamps of `hash` and up to `count - 1` of its ancestors, newest first.
    pub fn recent_timestamps(&self, hash: &Hash256, count: usize) -> Vec<u32> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = self.index.get(hash).copied();
        while let Some(i) = cursor {
            if out.len() == count {
                break;
            }
            out.push(self.nodes[i].record.header.timestamp);
            cursor = self.nodes[i].parent;
        }
        out
    }

    /// Median timestamp of `hash` and its ten predecessors.
    pub fn median_time_past(&self, hash: &Hash256) -> Option<u32> {
        let timestamps = self.recent_timestamps(hash, MEDIAN_TIME_SPAN);
        median(timestamps)
    }

    /// Block locator for `hash`: ten dense entries back from the tip, then
    /// exponentially sparser, always ending at genesis.
    pub fn locator(&self, hash: &Hash256) -> Vec<Hash256> {
        let Some(&start) = self.index.get(hash) else {
            return vec![self.genesis().hash];
        };

        let mut out = Vec::new();
        let mut step = 1usize;
        let mut i = start;
        loop {
            out.push(self.nodes[i].record.hash);
            if i == ROOT {
                break;
            }
            if out.len() >= LOCATOR_DENSE_ENTRIES {
                step *= 2;
            }
            for _ in 0..step {
                match self.nodes[i].parent {
                    Some(p) => i = p,
                    None => break,
                }
            }
        }
        out
    }

    fn push_node(&mut self, record: HeaderRecord, parent: Option<usize>) -> usize {
        let idx = self.nodes.len();
        let valid = record.valid;
        self.index.insert(record.hash, idx);
        self.nodes.push(Node {
            record,
            parent,
            children: Vec::new(),
        });
        if let Some(p) = parent {
            self.nodes[p].children.push(idx);
        }
        if valid {
            if let Some(p) = parent {
                self.valid_heads.remove(&p);
            }
            self.valid_heads.insert(idx);
        }
        idx
    }

    fn ranks_higher(&self, a: usize, b: usize) -> bool {
        let (ra, rb) = (&self.nodes[a].record, &self.nodes[b].record);
        ra.work > rb.work
            || (ra.work == rb.work
                && (ra.header.timestamp < rb.header.timestamp
                    || (ra.header.timestamp == rb.header.timestamp && a < b)))
    }

    fn rank_best(&self, candidates: impl Iterator<Item = usize>) -> usize {
        candidates
            .reduce(|best, c| if self.ranks_higher(c, best) { c } else { best })
            .unwrap_or(ROOT)
    }
}

pub(crate) fn median(mut timestamps: Vec<u32>) -> Option<u32> {
    if timestamps.is_empty() {
        return None;
    }
    timestamps.sort_unstable();
    Some(timestamps[timestamps.len() / 2])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::headers::store::InMemoryHeaderStore;
    use crate::testing;

    fn new_tree() -> HeaderTree {
        HeaderTree::open(Box::new(InMemoryHeaderStore::new()), testing::genesis_header()).unwrap()
    }

    fn assert_chaining(tree: &HeaderTree, hashes: &[Hash256]) {
        for hash in hashes {
            let record = tree.get(hash).unwrap();
            let parent = tree.get(&record.parent_hash()).unwrap();
            assert_eq!(record.height, parent.height + 1);
            assert_eq!(record.work, parent.work + block_work(record.header.bits));
        }
    }

    fn assert_best_is_maximal(tree: &HeaderTree) {
        let best = tree.get_best_head();
        assert!(best.valid);
        let heads = tree.valid_heads();
        assert!(heads.iter().any(|h| h.hash == best.hash));
        for head in heads {
            let strictly_higher = head.work > best.work
                || (head.work == best.work && head.header.timestamp < best.header.timestamp);
            assert!(!strictly_higher, "valid head outranks the best head");
        }
    }

    #[test]
    fn test_genesis_only() {
        let tree = new_tree();
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.get_best_head().height, 0);
        assert_eq!(tree.valid_heads().len(), 1);
        assert_eq!(tree.locator(&tree.genesis().hash), vec![tree.genesis().hash]);
    }

    #[test]
    fn test_add_chain_with_parents_in_batch() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 5, 0);

        let outcome = tree.add(&chain).unwrap();
        assert_eq!(outcome.added.len(), 5);
        assert!(outcome.best_changed);
        assert_eq!(tree.get_best_head().height, 5);
        assert_eq!(tree.version(), 1);
        assert_chaining(&tree, &outcome.added);

        // Re-adding folds into the existing records.
        let again = tree.add(&chain).unwrap();
        assert!(again.added.is_empty());
        assert!(!again.best_changed);
        assert_eq!(tree.len(), 6);
    }

    #[test]
    fn test_unknown_parent_is_integrity_and_mutates_nothing() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 3, 0);

        let result = tree.add(&[chain[0], chain[2]]);
        assert!(matches!(result, Err(ChainError::Integrity(_))));
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(&chain[0].hash()));
    }

    #[test]
    fn test_two_genesis_children_tie_broken_by_timestamp() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let a = testing::mine_child(&genesis, genesis.timestamp + 120, 1);
        let b = testing::mine_child(&genesis, genesis.timestamp + 60, 2);

        let outcome = tree.add(&[a, b]).unwrap();
        assert_eq!(outcome.added.len(), 2);
        assert_eq!(tree.valid_heads().len(), 2);
        // Same work, so the earlier timestamp wins.
        assert_eq!(tree.get_best_head().hash, b.hash());
        assert_best_is_maximal(&tree);

        // More work on A's branch overtakes.
        let a2 = testing::mine_child(&a, a.timestamp + 60, 3);
        let outcome = tree.add(&[a2]).unwrap();
        assert!(outcome.best_changed);
        assert_eq!(tree.get_best_head().hash, a2.hash());
        assert_best_is_maximal(&tree);
    }

    #[test]
    fn test_mark_invalid_sole_child_of_best() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 3, 0);
        tree.add(&chain).unwrap();
        let a = chain[1].hash();
        let b = chain[2].hash();
        let version = tree.version();

        let outcome = tree.mark_invalid(&b).unwrap();
        assert_eq!(outcome.invalidated, vec![b]);
        assert!(outcome.best_changed);
        assert_eq!(tree.get_best_head().hash, a);
        assert_eq!(tree.version(), version + 1);
        assert!(tree.valid_heads().iter().any(|h| h.hash == a));
        assert!(!tree.get(&b).unwrap().valid);
    }

    #[test]
    fn test_mark_invalid_subtree_removes_exactly_descendants() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let trunk = testing::header_chain(&genesis, 2, 0);
        let left = testing::header_chain(&trunk[1], 3, 1);
        let right = testing::header_chain(&trunk[1], 2, 2);
        let side = testing::header_chain(&trunk[0], 1, 3);
        tree.add(&trunk).unwrap();
        tree.add(&left).unwrap();
        tree.add(&right).unwrap();
        tree.add(&side).unwrap();
        assert_eq!(tree.valid_heads().len(), 3);

        let outcome = tree.mark_invalid(&trunk[1].hash()).unwrap();
        assert_eq!(outcome.invalidated.len(), 1 + 3 + 2);
        let heads: Vec<Hash256> = tree.valid_heads().iter().map(|h| h.hash).collect();
        // trunk[0] still has the valid side child, so only the side head remains.
        assert_eq!(heads, vec![side[0].hash()]);
        assert_eq!(tree.get_best_head().hash, side[0].hash());
        assert_best_is_maximal(&tree);

        // Invalidating an already invalid header is a no-op.
        let again = tree.mark_invalid(&left[2].hash()).unwrap();
        assert!(again.invalidated.is_empty());
    }

    #[test]
    fn test_children_of_invalid_are_quarantined() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 2, 0);
        tree.add(&chain[..1]).unwrap();
        tree.mark_invalid(&chain[0].hash()).unwrap();

        let outcome = tree.add(&chain[1..]).unwrap();
        assert_eq!(outcome.added.len(), 1);
        assert!(!outcome.best_changed);
        assert!(!tree.get(&chain[1].hash()).unwrap().valid);
        assert_eq!(tree.get_best_head().height, 0);
    }

    #[test]
    fn test_root_and_unknown_cannot_be_invalidated() {
        let mut tree = new_tree();
        let genesis_hash = tree.genesis().hash;
        assert!(matches!(tree.mark_invalid(&genesis_hash), Err(ChainError::Integrity(_))));
        assert!(matches!(tree.mark_invalid(&[9; 32]), Err(ChainError::Integrity(_))));
    }

    #[test]
    fn test_best_head_from_and_subchain() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let trunk = testing::header_chain(&genesis, 2, 0);
        let long = testing::header_chain(&trunk[0], 4, 1);
        tree.add(&trunk).unwrap();
        tree.add(&long).unwrap();

        assert_eq!(
            tree.get_best_head_from(&trunk[1].hash()).map(|r| r.hash),
            Some(trunk[1].hash())
        );
        assert_eq!(
            tree.get_best_head_from(&trunk[0].hash()).map(|r| r.hash),
            Some(long[3].hash())
        );
        assert!(tree.get_best_head_from(&[1; 32]).is_none());

        let sub = tree.get_subchain(&long[3].hash(), 3).unwrap();
        assert_eq!(sub.len(), 3);
        assert_eq!(sub.first_height(), Some(3));
        assert_eq!(sub.head().map(|l| l.hash), Some(long[3].hash()));

        // Shorter only at the root.
        let whole = tree.get_subchain(&long[3].hash(), 100).unwrap();
        assert_eq!(whole.len(), 6);
        assert_eq!(whole.first_height(), Some(0));
        assert!(tree.get_subchain(&[1; 32], 3).is_none());

        assert!(tree.is_on_best_chain(&long[0].hash()));
        assert!(!tree.is_on_best_chain(&trunk[1].hash()));
    }

    #[test]
    fn test_best_head_from_invalid_subtree_is_none() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let trunk = testing::header_chain(&genesis, 2, 0);
        let side = testing::header_chain(&trunk[0], 3, 1);
        tree.add(&trunk).unwrap();
        tree.add(&side).unwrap();

        tree.mark_invalid(&side[0].hash()).unwrap();
        assert!(tree.get_best_head_from(&side[0].hash()).is_none());
        assert!(tree.get_best_head_from(&side[2].hash()).is_none());
        assert_eq!(
            tree.get_best_head_from(&trunk[0].hash()).map(|r| r.hash),
            Some(trunk[1].hash())
        );
    }

    #[test]
    fn test_locator_shape() {
        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 40, 0);
        tree.add(&chain).unwrap();

        let tip = chain[39].hash();
        let locator = tree.locator(&tip);
        let heights: Vec<u32> = locator.iter().map(|h| tree.get(h).unwrap().height).collect();
        assert_eq!(&heights[..10], &[40, 39, 38, 37, 36, 35, 34, 33, 32, 31]);
        assert_eq!(heights[10], 29);
        assert_eq!(heights[11], 25);
        assert_eq!(*heights.last().unwrap(), 0);
        assert!(heights.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn test_median_time_past() {
        assert_eq!(median(vec![5, 1, 3]), Some(3));
        assert_eq!(median(vec![]), None);

        let mut tree = new_tree();
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 12, 0);
        tree.add(&chain).unwrap();
        let tip = chain[11].hash();
        // Eleven newest timestamps are genesis+60*2 ..= genesis+60*12.
        assert_eq!(tree.median_time_past(&tip), Some(genesis.timestamp + 60 * 7));
    }

    #[test]
    fn test_reopen_replays_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headers.db");
        let genesis = testing::genesis_header();
        let chain = testing::header_chain(&genesis, 4, 0);
        let fork = testing::header_chain(&chain[1], 1, 1);
        {
            let store = crate::headers::store::SqliteHeaderStore::open(&path).unwrap();
            let mut tree = HeaderTree::open(Box::new(store), genesis).unwrap();
            tree.add(&chain).unwrap();
            tree.add(&fork).unwrap();
            tree.mark_invalid(&chain[3].hash()).unwrap();
        }

        let store = crate::headers::store::SqliteHeaderStore::open(&path).unwrap();
        let tree = HeaderTree::open(Box::new(store), genesis).unwrap();
        assert_eq!(tree.len(), 6);
        assert!(!tree.get(&chain[3].hash()).unwrap().valid);
        assert_eq!(tree.valid_heads().len(), 2);
        // chain[2] and fork[0] are both at height 3; the tie resolves by timestamp then order.
        assert_best_is_maximal(&tree);
    }

    #[test]
    fn test_reopen_with_other_genesis_fails() {
        let store = InMemoryHeaderStore::new();
        let genesis = testing::genesis_header();
        store
            .append(&[HeaderRecord {
                header: genesis,
                hash: genesis.hash(),
                height: 0,
                work: block_work(genesis.bits),
                valid: true,
            }])
            .unwrap();
        let other = testing::mine_child(&genesis, genesis.timestamp + 1, 9);
        let result = HeaderTree::open(Box::new(store), other);
        assert!(matches!(result, Err(ChainError::Integrity(_))));
    }
}
