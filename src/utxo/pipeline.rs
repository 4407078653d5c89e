//! UTXO update pipeline
//!
//! A single consumer that follows the best header chain, asks the fetch
//! coordinator for the bodies it needs, turns each body into a
//! [`UtxoUpdate`] and hands its signatures to the validator. Updates are
//! kept in memory until their signatures pass and are then committed to the
//! store in batches.
//!
//! The cursor is the last block with an update, durable or pending. When the
//! best chain moves away from the cursor the pipeline first drops pending
//! updates, and if that is not enough reverts the store to the fork point.

use super::store::UtxoStore;
use super::validation::{
    ScriptCheck, ScriptVerifier, SignatureValidator, ValidationRequest, ValidationResponse,
};
use super::{UtxoHead, UtxoOperation, UtxoOutput, UtxoUpdate, UtxoView};
use crate::blockchain::{short_hash, Block, Hash256, ZERO_HASH};
use crate::cache::BlockCache;
use crate::config::PipelineConfig;
use crate::error::{ChainError, Result, Severity};
use crate::events::{ChainEvent, EventBus};
use crate::fetch::{BlockFetchCoordinator, ConsumerId, WantedHeader};
use crate::headers::{HeaderTree, SubChain};
use crate::transaction::OutPoint;
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Wake-up period when nothing arrives, so retryable failures get retried.
const IDLE_RETRY: Duration = Duration::from_secs(1);

struct PendingUpdate {
    id: u64,
    update: UtxoUpdate,
    validated: bool,
}

/// Best-chain headers above the cursor, valid for one tree version.
struct Window {
    version: u64,
    chain: SubChain,
}

enum BlockOutcome {
    Applied(UtxoUpdate, Vec<ScriptCheck>),
    /// The header is fine but this body is not the one it commits to.
    Malformed(String),
    Invalid(String),
}

pub struct UtxoPipeline {
    tree: Arc<Mutex<HeaderTree>>,
    coordinator: Arc<BlockFetchCoordinator>,
    cache: Arc<BlockCache>,
    store: Arc<dyn UtxoStore>,
    events: Arc<EventBus>,
    config: PipelineConfig,
    validator: SignatureValidator,
    responses: Receiver<ValidationResponse>,
    notifications: Receiver<ChainEvent>,
    prefetch: ConsumerId,
    next: ConsumerId,
    durable: UtxoHead,
    pending: VecDeque<PendingUpdate>,
    /// Ids submitted to the validator, oldest first. Includes ids whose
    /// update has since been discarded.
    awaiting: VecDeque<u64>,
    next_id: u64,
    window: Option<Window>,
    last_request: Option<(u64, u32)>,
    /// Tree version at which a reorg could not be carried out.
    stalled_at: Option<u64>,
}

impl UtxoPipeline {
    /// Wire the pipeline to shared state. An empty store is seeded with the
    /// genesis block, whose outputs are never spendable.
    pub fn new(
        tree: Arc<Mutex<HeaderTree>>,
        coordinator: Arc<BlockFetchCoordinator>,
        cache: Arc<BlockCache>,
        store: Arc<dyn UtxoStore>,
        events: Arc<EventBus>,
        verifier: Arc<dyn ScriptVerifier>,
        config: PipelineConfig,
    ) -> Result<Self> {
        let genesis = tree.lock().genesis().hash;
        let durable = match store.head()? {
            Some(head) => {
                match store.header_at(0)? {
                    Some(root) if root.hash == genesis => {}
                    _ => {
                        return Err(ChainError::Integrity(
                            "UTXO store was built on a different genesis".to_string(),
                        ))
                    }
                }
                head
            }
            None => store.update(&[UtxoUpdate {
                height: 0,
                hash: genesis,
                parent_hash: ZERO_HASH,
                operations: vec![],
            }])?,
        };

        let (validator, responses) = SignatureValidator::spawn(
            verifier,
            config.validation_threads,
            config.max_pending_validation,
        )?;
        let notifications = events.subscribe(config.channel_capacity);
        let prefetch = coordinator.register_consumer();
        let next = coordinator.register_consumer();

        info!("UTXO set at {}", durable);
        Ok(UtxoPipeline {
            tree,
            coordinator,
            cache,
            store,
            events,
            config,
            validator,
            responses,
            notifications,
            prefetch,
            next,
            durable,
            pending: VecDeque::new(),
            awaiting: VecDeque::new(),
            next_id: 0,
            window: None,
            last_request: None,
            stalled_at: None,
        })
    }

    /// Last block with an update, durable or not.
    pub fn cursor(&self) -> UtxoHead {
        self.pending
            .back()
            .map(|p| p.update.head())
            .unwrap_or(self.durable)
    }

    pub fn durable_head(&self) -> UtxoHead {
        self.durable
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn awaiting_validation(&self) -> usize {
        self.awaiting.len()
    }

    /// Apply every block that is ready, then commit what can be committed.
    pub fn step(&mut self) -> Result<()> {
        loop {
            if !self.follow_best_chain()? {
                break;
            }
            self.request_blocks();
            let applied = self.try_apply_next()?;
            self.commit_ready()?;
            if !applied {
                break;
            }
        }
        self.commit_ready()
    }

    /// Bring the cursor back onto the best chain. False while stalled.
    fn follow_best_chain(&mut self) -> Result<bool> {
        let version = self.tree.lock().version();
        if self.stalled_at == Some(version) {
            return Ok(false);
        }
        self.stalled_at = None;

        {
            let tree = self.tree.lock();
            if tree.is_on_best_chain(&self.cursor().hash) {
                return Ok(true);
            }

            let mut dropped = 0;
            while let Some(last) = self.pending.back() {
                if tree.is_on_best_chain(&last.update.hash) {
                    break;
                }
                self.pending.pop_back();
                dropped += 1;
            }
            if dropped > 0 {
                info!("Discarded {} pending updates off the best chain", dropped);
                self.last_request = None;
            }
            if !self.pending.is_empty() || tree.is_on_best_chain(&self.durable.hash) {
                return Ok(true);
            }
        }

        let fork = self.find_fork()?;
        match self.store.revert_to(&fork.hash) {
            Ok(head) => {
                info!("Reorganized UTXO set from {} back to {}", self.durable, head);
                self.durable = head;
                self.window = None;
                self.last_request = None;
                self.events.publish(ChainEvent::UtxoChanged {
                    hash: head.hash,
                    height: head.height,
                });
                Ok(true)
            }
            Err(ChainError::HistoryPruned { height }) => {
                error!(
                    "Best chain forks from the UTXO set at height {}, below retained history; waiting for the header tree to change",
                    height
                );
                self.stalled_at = Some(version);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Highest stored block that is also on the best chain.
    fn find_fork(&self) -> Result<UtxoHead> {
        let (best_hash, best_height) = {
            let tree = self.tree.lock();
            let best = tree.get_best_head();
            (best.hash, best.height)
        };
        let mut height = self.durable.height.min(best_height);
        loop {
            let stored = self.store.header_at(height)?;
            let ancestor = self.tree.lock().ancestor_at(&best_hash, height).map(|r| r.hash);
            if let (Some(stored), Some(ancestor)) = (stored, ancestor) {
                if stored.hash == ancestor {
                    return Ok(stored);
                }
            }
            if height == 0 {
                return Err(ChainError::Integrity(
                    "UTXO store shares no block with the best chain".to_string(),
                ));
            }
            height -= 1;
        }
    }

    fn refresh_window(&mut self, cursor: UtxoHead) {
        let tree = self.tree.lock();
        let version = tree.version();
        let (best_hash, best_height) = {
            let best = tree.get_best_head();
            (best.hash, best.height)
        };
        let wanted_end = best_height.min(cursor.height.saturating_add(self.config.prefetch_window.max(1)));

        let fresh = self.window.as_ref().is_some_and(|w| {
            w.version == version
                && (wanted_end <= cursor.height
                    || (w.chain.contains_height(cursor.height + 1)
                        && w.chain.head().is_some_and(|h| h.height >= wanted_end)))
        });
        if fresh {
            return;
        }

        let span = self.config.prefetch_window.saturating_mul(2).max(1);
        let end = best_height.min(cursor.height.saturating_add(span));
        let chain = if end > cursor.height {
            tree.ancestor_at(&best_hash, end)
                .and_then(|a| tree.get_subchain(&a.hash, (end - cursor.height) as usize))
                .unwrap_or_default()
        } else {
            SubChain::default()
        };
        self.window = Some(Window { version, chain });
    }

    /// Ask for the next block and the prefetch window above it.
    fn request_blocks(&mut self) {
        if self.awaiting.len() >= self.config.max_pending_validation {
            return;
        }
        let cursor = self.cursor();
        let version = self.tree.lock().version();
        if self.last_request == Some((version, cursor.height)) {
            return;
        }
        self.refresh_window(cursor);

        let wanted: Vec<WantedHeader> = match &self.window {
            Some(window) => (cursor.height + 1..=cursor.height.saturating_add(self.config.prefetch_window.max(1)))
                .map_while(|h| window.chain.get_by_height(h))
                .map(|link| WantedHeader {
                    hash: link.hash,
                    height: link.height,
                })
                .collect(),
            None => Vec::new(),
        };

        self.coordinator.add_request(self.next, &wanted[..wanted.len().min(1)]);
        self.coordinator.add_request(self.prefetch, &wanted);
        self.last_request = Some((version, cursor.height));
        trace!("Requested {} blocks above {}", wanted.len(), cursor);
    }

    /// Turn the block after the cursor into a pending update if its body is
    /// in the cache. True when the cursor or the tree changed.
    fn try_apply_next(&mut self) -> Result<bool> {
        if self.awaiting.len() >= self.config.max_pending_validation {
            return Ok(false);
        }
        let cursor = self.cursor();
        let Some(next) = self
            .window
            .as_ref()
            .and_then(|w| w.chain.get_by_height(cursor.height + 1))
            .copied()
        else {
            return Ok(false);
        };
        if next.parent_hash != cursor.hash {
            self.window = None;
            self.last_request = None;
            return Ok(false);
        }

        let Some(block) = self.cache.get(&next.hash) else {
            if self.coordinator.is_received(&next.hash) {
                self.coordinator.mark_missing(&next.hash);
            }
            return Ok(false);
        };

        match self.connect_block(&block, next.height, cursor.hash)? {
            BlockOutcome::Malformed(reason) => {
                warn!(
                    "Dropping body of block {} at height {}: {}",
                    short_hash(&next.hash),
                    next.height,
                    reason
                );
                self.cache.remove(&next.hash);
                self.coordinator.mark_missing(&next.hash);
                return Ok(false);
            }
            BlockOutcome::Invalid(reason) => {
                warn!(
                    "Block {} at height {} is invalid: {}",
                    short_hash(&next.hash),
                    next.height,
                    reason
                );
                self.cache.remove(&next.hash);
                self.invalidate(&next.hash)?;
            }
            BlockOutcome::Applied(update, checks) => {
                let id = self.next_id;
                self.next_id += 1;
                let validated = checks.is_empty();
                if !validated {
                    debug!(
                        "Validating {} inputs of block {}",
                        checks.len(),
                        short_hash(&next.hash)
                    );
                    self.validator.submit(ValidationRequest {
                        id,
                        block_hash: next.hash,
                        checks,
                    })?;
                    self.awaiting.push_back(id);
                }
                self.pending.push_back(PendingUpdate {
                    id,
                    update,
                    validated,
                });
                self.cache.remove(&next.hash);
            }
        }
        Ok(true)
    }

    /// Derive the update for `block` against the stored set plus every
    /// pending update.
    fn connect_block(&self, block: &Block, height: u32, parent_hash: Hash256) -> Result<BlockOutcome> {
        let tx_hashes: Vec<Hash256> = block.transactions.iter().map(|tx| tx.hash()).collect();

        let mut involved: HashSet<Hash256> = tx_hashes.iter().copied().collect();
        if involved.len() != tx_hashes.len() {
            return Ok(BlockOutcome::Malformed("transaction listed twice".to_string()));
        }
        for tx in block.transactions.iter().filter(|tx| !tx.is_coinbase()) {
            involved.extend(tx.inputs.iter().map(|input| input.previous_output.tx_hash));
        }
        let lookup: Vec<Hash256> = involved.iter().copied().collect();

        let mut view = UtxoView::from_outputs(self.store.get_unspent_outputs(&lookup)?)?;
        for pending in self.pending.iter().filter(|p| p.update.touches(&involved)) {
            for operation in &pending.update.operations {
                if involved.contains(&operation.outpoint().tx_hash) {
                    view.apply(operation)?;
                }
            }
        }

        let mut operations = Vec::new();
        let mut checks = Vec::new();
        for (position, (tx, tx_hash)) in block.transactions.iter().zip(&tx_hashes).enumerate() {
            let coinbase = tx.is_coinbase();
            if position == 0 && !coinbase {
                return Ok(BlockOutcome::Invalid("first transaction is not a coinbase".to_string()));
            }
            if position > 0 && coinbase {
                return Ok(BlockOutcome::Invalid(format!("extra coinbase at position {}", position)));
            }
            if view.has_unspent_from(tx_hash) {
                return Ok(BlockOutcome::Invalid(format!(
                    "transaction {} duplicates one with unspent outputs",
                    short_hash(tx_hash)
                )));
            }

            if !coinbase {
                if tx.inputs.is_empty() {
                    return Ok(BlockOutcome::Invalid(format!(
                        "transaction {} has no inputs",
                        short_hash(tx_hash)
                    )));
                }
                let shared = Arc::new(tx.clone());
                let mut input_total: u64 = 0;
                for (input_index, input) in tx.inputs.iter().enumerate() {
                    let Ok(spent) = view.spend(&input.previous_output) else {
                        return Ok(BlockOutcome::Invalid(format!(
                            "input {} of {} spends missing output {}",
                            input_index,
                            short_hash(tx_hash),
                            input.previous_output
                        )));
                    };
                    let Some(total) = input_total.checked_add(spent.value) else {
                        return Ok(BlockOutcome::Invalid("input value overflow".to_string()));
                    };
                    input_total = total;
                    checks.push(ScriptCheck {
                        tx: shared.clone(),
                        input_index,
                        locking_script: spent.script.clone(),
                        value: spent.value,
                    });
                    operations.push(UtxoOperation::Spend(spent));
                }
                match tx.total_output_value() {
                    Some(total) if total <= input_total => {}
                    _ => {
                        return Ok(BlockOutcome::Invalid(format!(
                            "transaction {} spends more than its inputs",
                            short_hash(tx_hash)
                        )))
                    }
                }
            }

            for (index, out) in tx.outputs.iter().enumerate() {
                let output = UtxoOutput {
                    outpoint: OutPoint::new(*tx_hash, index as u32),
                    value: out.value,
                    script: out.locking_script.clone(),
                    height,
                };
                view.create(output.clone())?;
                operations.push(UtxoOperation::Create(output));
            }
        }

        Ok(BlockOutcome::Applied(
            UtxoUpdate {
                height,
                hash: block.hash(),
                parent_hash,
                operations,
            },
            checks,
        ))
    }

    fn invalidate(&mut self, hash: &Hash256) -> Result<()> {
        let (outcome, best) = {
            let mut tree = self.tree.lock();
            let outcome = tree.mark_invalid(hash)?;
            let best = tree.get_best_head();
            (outcome, (best.hash, best.height))
        };
        self.window = None;
        self.last_request = None;
        if outcome.best_changed {
            self.events.publish(ChainEvent::BestHeadChanged {
                hash: best.0,
                height: best.1,
            });
        }
        Ok(())
    }

    fn on_response(&mut self, response: ValidationResponse) -> Result<()> {
        match self.awaiting.pop_front() {
            Some(id) if id == response.id => {}
            expected => {
                return Err(ChainError::Integrity(format!(
                    "Validation response {} arrived out of order (expected {:?})",
                    response.id, expected
                )))
            }
        }

        let Some(position) = self.pending.iter().position(|p| p.id == response.id) else {
            trace!("Ignoring validation of discarded block {}", short_hash(&response.block_hash));
            return Ok(());
        };
        if self.pending[position].update.hash != response.block_hash {
            return Err(ChainError::Integrity(format!(
                "Validation response {} names block {} but was issued for {}",
                response.id,
                short_hash(&response.block_hash),
                short_hash(&self.pending[position].update.hash)
            )));
        }

        match response.result {
            Ok(()) => self.pending[position].validated = true,
            Err(e) => {
                warn!(
                    "Block {} failed signature validation: {}",
                    short_hash(&response.block_hash),
                    e
                );
                let discarded = self.pending.split_off(position);
                self.invalidate(&response.block_hash)?;
                info!(
                    "Rewound cursor to {}, discarding {} pending updates",
                    self.cursor(),
                    discarded.len()
                );
            }
        }
        Ok(())
    }

    /// Commit the validated prefix of pending updates once it is large
    /// enough or the pipeline has caught up with the best head.
    fn commit_ready(&mut self) -> Result<()> {
        let ready = self.pending.iter().take_while(|p| p.validated).count();
        if ready == 0 {
            return Ok(());
        }
        if ready < self.config.commit_interval {
            let caught_up = self.awaiting.is_empty()
                && ready == self.pending.len()
                && self.tree.lock().get_best_head().hash == self.cursor().hash;
            if !caught_up {
                return Ok(());
            }
        }

        let updates: Vec<UtxoUpdate> = self.pending.iter().take(ready).map(|p| p.update.clone()).collect();
        let head = self.store.update(&updates)?;
        self.pending.drain(..ready);
        self.durable = head;
        info!("UTXO set advanced to {} ({} blocks)", head, ready);
        self.events.publish(ChainEvent::UtxoChanged {
            hash: head.hash,
            height: head.height,
        });
        self.prune()
    }

    fn prune(&self) -> Result<()> {
        let Some(height) = self.durable.height.checked_sub(self.config.reorg_history_depth) else {
            return Ok(());
        };
        if let Some(head) = self.store.header_at(height)? {
            self.store.truncate(&head.hash)?;
        }
        Ok(())
    }

    /// Run on a dedicated thread until the handle stops it or a fatal error.
    pub fn spawn(self) -> Result<UtxoPipelineHandle> {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let thread = std::thread::Builder::new()
            .name("utxo-pipeline".to_string())
            .spawn(move || self.run(shutdown_rx))?;
        Ok(UtxoPipelineHandle {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    fn run(mut self, shutdown: Receiver<()>) -> Result<()> {
        let notifications = self.notifications.clone();
        let responses = self.responses.clone();

        loop {
            let stepped = self.step();
            absorb_retryable(stepped)?;

            select! {
                recv(shutdown) -> _ => break,
                recv(notifications) -> event => match event {
                    Ok(event) => {
                        trace!("Pipeline woke on {}", event);
                        for _ in notifications.try_iter() {}
                    }
                    Err(_) => break,
                },
                recv(responses) -> response => match response {
                    Ok(response) => absorb_retryable(self.on_response(response))?,
                    Err(_) => {
                        error!("Signature validator stopped unexpectedly");
                        return Err(ChainError::Integrity("Signature validator stopped".to_string()));
                    }
                },
                default(IDLE_RETRY) => {}
            }
        }

        self.coordinator.add_request(self.prefetch, &[]);
        self.coordinator.add_request(self.next, &[]);
        info!("UTXO pipeline stopped at {}", self.durable);
        Ok(())
    }
}

fn absorb_retryable(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.severity() == Severity::Retryable => {
            warn!("UTXO pipeline step failed, retrying: {}", e);
            Ok(())
        }
        Err(e) => {
            error!("UTXO pipeline stopping: {}", e);
            Err(e)
        }
    }
}

/// Owner of the pipeline thread.
pub struct UtxoPipelineHandle {
    shutdown: Option<Sender<()>>,
    thread: Option<JoinHandle<Result<()>>>,
}

impl UtxoPipelineHandle {
    pub fn stop(&mut self) {
        self.shutdown.take();
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, |t| t.is_finished())
    }

    /// Stop the thread and return how it ended.
    pub fn join(mut self) -> Result<()> {
        self.stop();
        self.join_thread()
    }

    fn join_thread(&mut self) -> Result<()> {
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| ChainError::Integrity("UTXO pipeline thread panicked".to_string()))?,
            None => Ok(()),
        }
    }
}

impl Drop for UtxoPipelineHandle {
    fn drop(&mut self) {
        self.stop();
        let _ = self.join_thread();
    }
}
