//! Node assembly
//!
//! Opens the header and UTXO databases, starts the UTXO pipeline and spawns
//! one task per attached connection. Everything stops on one watch signal.

use crate::blockchain::BlockHeader;
use crate::cache::BlockCache;
use crate::config::Config;
use crate::error::{ChainError, Result};
use crate::events::{ChainEvent, EventBus};
use crate::fetch::{BlockFetchCoordinator, ConnectionId};
use crate::headers::{HeaderStore, HeaderTree, InMemoryHeaderStore, SqliteHeaderStore};
use crate::network::{run_connection, InboundMessage, OutboundMessage};
use crate::utxo::pipeline::{UtxoPipeline, UtxoPipelineHandle};
use crate::utxo::store::{SqliteUtxoStore, UtxoStore};
use crate::utxo::validation::ScriptVerifier;
use crossbeam_channel::Receiver;
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub const HEADERS_DB: &str = "headers.db";
pub const UTXO_DB: &str = "utxo.db";

/// Capacity of each direction of a connection's message channels.
const PEER_CHANNEL_CAPACITY: usize = 256;

/// State shared by every connection task.
pub struct SyncContext {
    pub config: Config,
    pub tree: Arc<Mutex<HeaderTree>>,
    pub coordinator: Arc<BlockFetchCoordinator>,
    pub cache: Arc<BlockCache>,
    pub events: Arc<EventBus>,
}

impl SyncContext {
    pub fn new(config: Config, header_store: Box<dyn HeaderStore>) -> Result<Self> {
        let genesis = BlockHeader::from_hex(&config.network.genesis)
            .map_err(|e| ChainError::Config(format!("Invalid genesis header: {}", e)))?;
        let tree = HeaderTree::open(header_store, genesis)?;
        let cache = BlockCache::new(config.fetch.block_cache_capacity);
        Ok(SyncContext {
            config,
            tree: Arc::new(Mutex::new(tree)),
            coordinator: Arc::new(BlockFetchCoordinator::new()),
            cache: Arc::new(cache),
            events: Arc::new(EventBus::new()),
        })
    }

    pub fn in_memory(config: Config) -> Result<Self> {
        Self::new(config, Box::new(InMemoryHeaderStore::new()))
    }
}

/// The two ends of a connection the transport layer talks to.
pub struct PeerChannels {
    pub connection: ConnectionId,
    pub inbound: mpsc::Sender<InboundMessage>,
    pub outbound: mpsc::Receiver<OutboundMessage>,
}

/// Everything wired together: header tree, block download, UTXO pipeline.
pub struct SyncNode {
    context: Arc<SyncContext>,
    utxo_store: Arc<dyn UtxoStore>,
    pipeline: Option<UtxoPipelineHandle>,
    shutdown: watch::Sender<bool>,
    connections: Vec<JoinHandle<Result<()>>>,
}

impl SyncNode {
    /// Open (or create) the databases under `storage.data_dir` and start
    /// the pipeline.
    pub fn open(config: Config, verifier: Arc<dyn ScriptVerifier>) -> Result<Self> {
        config.validate()?;
        let data_dir = Path::new(&config.storage.data_dir);
        fs::create_dir_all(data_dir).map_err(|e| {
            ChainError::IoError(format!("Failed to create data dir {:?}: {}", data_dir, e))
        })?;

        let header_store = SqliteHeaderStore::open(data_dir.join(HEADERS_DB))?;
        let utxo_store = SqliteUtxoStore::open(data_dir.join(UTXO_DB))?;
        info!("Opened chain state in {}", data_dir.display());
        Self::assemble(config, Box::new(header_store), Arc::new(utxo_store), verifier)
    }

    pub fn open_in_memory(config: Config, verifier: Arc<dyn ScriptVerifier>) -> Result<Self> {
        config.validate()?;
        let utxo_store = SqliteUtxoStore::open_in_memory()?;
        Self::assemble(
            config,
            Box::new(InMemoryHeaderStore::new()),
            Arc::new(utxo_store),
            verifier,
        )
    }

    fn assemble(
        config: Config,
        header_store: Box<dyn HeaderStore>,
        utxo_store: Arc<dyn UtxoStore>,
        verifier: Arc<dyn ScriptVerifier>,
    ) -> Result<Self> {
        let pipeline_config = config.pipeline.clone();
        let context = Arc::new(SyncContext::new(config, header_store)?);
        let pipeline = UtxoPipeline::new(
            context.tree.clone(),
            context.coordinator.clone(),
            context.cache.clone(),
            utxo_store.clone(),
            context.events.clone(),
            verifier,
            pipeline_config,
        )?
        .spawn()?;
        let (shutdown, _) = watch::channel(false);

        Ok(SyncNode {
            context,
            utxo_store,
            pipeline: Some(pipeline),
            shutdown,
            connections: Vec::new(),
        })
    }

    pub fn context(&self) -> &Arc<SyncContext> {
        &self.context
    }

    pub fn tree(&self) -> Arc<Mutex<HeaderTree>> {
        self.context.tree.clone()
    }

    pub fn utxo_store(&self) -> Arc<dyn UtxoStore> {
        self.utxo_store.clone()
    }

    pub fn subscribe(&self, capacity: usize) -> Receiver<ChainEvent> {
        self.context.events.subscribe(capacity)
    }

    /// False once the pipeline thread has stopped on its own.
    pub fn is_pipeline_running(&self) -> bool {
        self.pipeline.as_ref().is_some_and(|p| !p.is_finished())
    }

    /// Start serving a new peer. Must be called inside a tokio runtime.
    pub fn attach_connection(&mut self) -> PeerChannels {
        let connection = self.context.coordinator.register_connection();
        let (inbound_tx, inbound_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let (outbound_tx, outbound_rx) = mpsc::channel(PEER_CHANNEL_CAPACITY);
        let task = tokio::spawn(run_connection(
            self.context.clone(),
            connection,
            inbound_rx,
            outbound_tx,
            self.shutdown.subscribe(),
        ));
        self.connections.retain(|t| !t.is_finished());
        self.connections.push(task);
        PeerChannels {
            connection,
            inbound: inbound_tx,
            outbound: outbound_rx,
        }
    }

    /// Stop every connection task and the pipeline. Returns the pipeline's
    /// own error if it had already failed.
    pub async fn shutdown(mut self) -> Result<()> {
        info!("Shutting down sync node");
        let _ = self.shutdown.send(true);
        for task in self.connections.drain(..) {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Connection ended with error: {}", e),
                Err(e) => error!("Connection task failed: {}", e),
            }
        }

        match self.pipeline.take() {
            Some(pipeline) => tokio::task::spawn_blocking(move || pipeline.join())
                .await
                .map_err(|e| ChainError::Integrity(format!("Pipeline join failed: {}", e)))?,
            None => Ok(()),
        }
    }
}

impl Drop for SyncNode {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::P2pkVerifier;
    use crate::testing;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_databases_and_seeds_genesis() {
        let dir = TempDir::new().unwrap();
        let data_dir = dir.path().join("node");
        let config = testing::regtest_config(data_dir.to_str().unwrap());

        let node = SyncNode::open(config.clone(), Arc::new(P2pkVerifier)).unwrap();
        assert!(data_dir.join(HEADERS_DB).exists());
        assert!(data_dir.join(UTXO_DB).exists());
        let genesis = node.tree().lock().genesis().hash;
        assert_eq!(node.utxo_store().head().unwrap().map(|h| h.hash), Some(genesis));
        drop(node);

        // Reopening finds the same state.
        let node = SyncNode::open(config, Arc::new(P2pkVerifier)).unwrap();
        assert_eq!(node.utxo_store().head().unwrap().map(|h| h.height), Some(0));
    }

    #[test]
    fn test_open_rejects_invalid_config() {
        let mut config = testing::regtest_config("unused");
        config.pipeline.commit_interval = 0;
        assert!(matches!(
            SyncNode::open_in_memory(config, Arc::new(P2pkVerifier)),
            Err(ChainError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_attach_and_shutdown() {
        tokio::time::timeout(Duration::from_secs(5), async {
            let config = testing::regtest_config("unused");
            let mut node = SyncNode::open_in_memory(config, Arc::new(P2pkVerifier)).unwrap();
            let mut peer = node.attach_connection();
            assert!(matches!(
                peer.outbound.recv().await,
                Some(OutboundMessage::GetHeaders { .. })
            ));
            assert!(node.is_pipeline_running());
            node.shutdown().await.unwrap();
        })
        .await
        .expect("test_attach_and_shutdown timed out");
    }
}
